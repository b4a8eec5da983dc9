//! Runtime error taxonomy.
//!
//! Every failure surfaces as an `Error` event carrying an [`ErrorKind`];
//! fatal errors terminate the flow. JSON/schema failures are recoverable
//! (one retry inside the validator); LLM, tool and timeout failures can be
//! caught by a `failure` block on the enclosing statement.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Convenience result type using [`RuntimeError`].
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Stable error kinds, surfaced in `Error` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoEntryPoint,
    UnresolvedName,
    TypeMismatch,
    JsonParse,
    SchemaValidation,
    AbortError,
    ContextOverflow,
    Timeout,
    Cancelled,
    LlmError,
    ToolError,
    /// A bounded loop hit its iteration ceiling (warning, non-fatal).
    LoopLimit,
    /// An `on input`/`on output` guardrail blocked the flow.
    Blocked,
}

/// Main error type for workflow execution.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuntimeError {
    /// The workflow defines neither a runnable flow nor a usable agent.
    #[error("no entry point found in workflow")]
    NoEntryPoint,

    /// A runtime reference did not resolve (agent, flow, prompt, variable).
    #[error("cannot resolve {what} `{name}`")]
    Unresolved { what: &'static str, name: String },

    /// An operator was applied to the wrong value variant.
    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    /// Agent output could not be parsed as JSON.
    #[error("response is not valid JSON: {0}")]
    JsonParse(String),

    /// Parsed JSON did not match the declared schema.
    #[error("response does not match schema `{schema}`: {detail}")]
    SchemaValidation { schema: String, detail: String },

    /// An `on escalate abort` handler fired.
    #[error("aborted by escalation handler{}", fmt_opt_message(.0))]
    Abort(Option<String>),

    /// Conversation exceeds the model budget and no compaction is
    /// configured.
    #[error("conversation of ~{estimated} tokens exceeds input budget of {budget}")]
    ContextOverflow { estimated: usize, budget: usize },

    /// A scoped deadline expired.
    #[error("{scope} timed out after {seconds} seconds")]
    Timeout { scope: String, seconds: u64 },

    /// The event stream consumer went away.
    #[error("execution cancelled")]
    Cancelled,

    /// The LLM client reported a failure.
    #[error("llm error: {0}")]
    Llm(String),

    /// A tool invocation failed.
    #[error("tool error: {0}")]
    Tool(String),

    /// A guardrail `block if` condition matched.
    #[error("blocked by guardrail `{0}`")]
    Blocked(String),
}

fn fmt_opt_message(message: &Option<String>) -> String {
    match message {
        Some(m) => format!(": {m}"),
        None => String::new(),
    }
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::NoEntryPoint => ErrorKind::NoEntryPoint,
            RuntimeError::Unresolved { .. } => ErrorKind::UnresolvedName,
            RuntimeError::TypeMismatch(_) => ErrorKind::TypeMismatch,
            RuntimeError::JsonParse(_) => ErrorKind::JsonParse,
            RuntimeError::SchemaValidation { .. } => ErrorKind::SchemaValidation,
            RuntimeError::Abort(_) => ErrorKind::AbortError,
            RuntimeError::ContextOverflow { .. } => ErrorKind::ContextOverflow,
            RuntimeError::Timeout { .. } => ErrorKind::Timeout,
            RuntimeError::Cancelled => ErrorKind::Cancelled,
            RuntimeError::Llm(_) => ErrorKind::LlmError,
            RuntimeError::Tool(_) => ErrorKind::ToolError,
            RuntimeError::Blocked(_) => ErrorKind::Blocked,
        }
    }

    /// Errors a `failure` block on the enclosing statement may catch.
    pub fn is_catchable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Llm(_) | RuntimeError::Tool(_) | RuntimeError::Timeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RuntimeError::NoEntryPoint.kind(), ErrorKind::NoEntryPoint);
        assert_eq!(RuntimeError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(
            RuntimeError::Abort(None).kind(),
            ErrorKind::AbortError
        );
    }

    #[test]
    fn test_catchable_errors() {
        assert!(RuntimeError::Llm("rate limited".into()).is_catchable());
        assert!(RuntimeError::Tool("fs denied".into()).is_catchable());
        assert!(RuntimeError::Timeout {
            scope: "agent `a`".into(),
            seconds: 30
        }
        .is_catchable());
        assert!(!RuntimeError::Abort(None).is_catchable());
        assert!(!RuntimeError::Cancelled.is_catchable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = RuntimeError::Timeout {
            scope: "agent `worker`".into(),
            seconds: 120,
        };
        assert_eq!(err.to_string(), "agent `worker` timed out after 120 seconds");
    }
}
