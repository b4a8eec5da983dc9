//! Per-execution workflow context.

use std::collections::HashMap;

use serde_json::Value;

/// Variable the flow interpreter stores `return` results under.
pub const RETURN_VALUE_VAR: &str = "_return_value";

/// Builtin variable holding the user's message.
pub const INPUT_PROMPT_VAR: &str = "input_prompt";

/// Mutable state of one flow execution.
///
/// Owned by the single task driving the flow; children of a parallel block
/// receive a cloned snapshot and never write back directly.
#[derive(Debug, Clone, Default)]
pub struct WorkflowContext {
    pub vars: HashMap<String, Value>,
    /// Result of the most recent agent or LLM call.
    pub last_call_result: Value,
    /// Set when the last agent call matched its escalation condition.
    pub escalated: bool,
}

impl WorkflowContext {
    pub fn new(input_prompt: impl Into<String>) -> Self {
        let mut vars = HashMap::new();
        vars.insert(
            INPUT_PROMPT_VAR.to_string(),
            Value::String(input_prompt.into()),
        );
        Self {
            vars,
            last_call_result: Value::Null,
            escalated: false,
        }
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.vars.get(RETURN_VALUE_VAR)
    }

    pub fn set_return_value(&mut self, value: Value) {
        self.vars.insert(RETURN_VALUE_VAR.to_string(), value);
    }

    /// Snapshot for a parallel child: same bindings, fresh flags.
    pub fn snapshot(&self) -> WorkflowContext {
        WorkflowContext {
            vars: self.vars.clone(),
            last_call_result: Value::Null,
            escalated: false,
        }
    }
}
