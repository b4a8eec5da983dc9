//! Workload compilation and caching.
//!
//! Compiling the same source twice returns the same `Arc` — repeated
//! `discover → create_workload` passes over an unchanged file reuse the
//! cached compiled workflow instead of rebuilding it.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use streetrace_compiler::CompiledWorkflow;
use streetrace_syntax::DiagnosticBatch;

/// Cache of compiled workflows keyed by source text.
#[derive(Default)]
pub struct WorkloadCache {
    entries: Mutex<HashMap<String, Arc<CompiledWorkflow>>>,
}

impl WorkloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile the source, reusing the cached workflow when the text is
    /// unchanged.
    pub fn compile(&self, source: &str) -> Result<Arc<CompiledWorkflow>, DiagnosticBatch> {
        if let Some(workflow) = self.entries.lock().get(source) {
            return Ok(workflow.clone());
        }
        let workflow = Arc::new(streetrace_compiler::compile_source(source)?);
        self.entries
            .lock()
            .insert(source.to_string(), workflow.clone());
        Ok(workflow)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: &str = "model main = openai/gpt-4\n\nprompt p: \"\"\"x\"\"\"\n\nagent: instruction p\n";

    #[test]
    fn test_unchanged_source_reuses_cached_workflow() {
        let cache = WorkloadCache::new();
        let first = cache.compile(SOURCE).expect("compile");
        let second = cache.compile(SOURCE).expect("compile");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_changed_source_recompiles() {
        let cache = WorkloadCache::new();
        let first = cache.compile(SOURCE).expect("compile");
        let changed = SOURCE.replace("gpt-4", "gpt-4o");
        let second = cache.compile(&changed).expect("compile");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_compile_errors_are_not_cached() {
        let cache = WorkloadCache::new();
        assert!(cache.compile("model = broken\n").is_err());
        assert!(cache.is_empty());
    }
}
