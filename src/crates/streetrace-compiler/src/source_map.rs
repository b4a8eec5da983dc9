//! Source map: compiled-artifact positions back to source spans.
//!
//! Every runtime instruction and prompt spec carries a [`SpanId`] into this
//! table. The diagnostic reporter resolves ids back to spans when a runtime
//! failure needs to point at source.

use serde::{Deserialize, Serialize};
use streetrace_syntax::Span;

/// Index into a [`SourceMap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub u32);

/// Interning table of source spans, in first-recorded order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMap {
    spans: Vec<Span>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, span: Span) -> SpanId {
        let id = SpanId(self.spans.len() as u32);
        self.spans.push(span);
        id
    }

    pub fn resolve(&self, id: SpanId) -> Option<Span> {
        self.spans.get(id.0 as usize).copied()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// All interned spans, for totality checks.
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_and_resolve() {
        let mut map = SourceMap::new();
        let a = map.intern(Span::new(1, 1, 1, 5));
        let b = map.intern(Span::new(2, 3, 2, 9));
        assert_ne!(a, b);
        assert_eq!(map.resolve(a), Some(Span::new(1, 1, 1, 5)));
        assert_eq!(map.resolve(b), Some(Span::new(2, 3, 2, 9)));
        assert_eq!(map.resolve(SpanId(99)), None);
    }
}
