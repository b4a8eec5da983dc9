//! Typed execution events and the sink they flow through.
//!
//! Every operation the runtime performs emits an [`Event`]. Events travel
//! over a bounded `tokio::sync::mpsc` channel; the consumer side is handed
//! out as a `ReceiverStream`. Dropping the receiver is the cancellation
//! signal: the next emit fails and the runtime unwinds with
//! `RuntimeError::Cancelled`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use streetrace_syntax::Span;
use tokio::sync::mpsc;

use crate::error::{ErrorKind, Result, RuntimeError};

/// An execution event with its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A direct LLM call is being dispatched.
    LlmCall {
        prompt: String,
        model: String,
        timestamp: i64,
    },
    /// A direct LLM call finished.
    LlmResponse { text: String, timestamp: i64 },
    /// An agent is being invoked.
    AgentCall {
        agent: String,
        input: String,
        timestamp: i64,
    },
    /// An agent produced its final (possibly parsed) result.
    AgentResult {
        agent: String,
        result: Value,
        timestamp: i64,
    },
    /// The model requested a tool invocation.
    ToolCall {
        id: String,
        name: String,
        args: Value,
        timestamp: i64,
    },
    /// A tool invocation finished.
    ToolResult {
        id: String,
        data: Value,
        timestamp: i64,
    },
    /// Terminal event of a successful run.
    FlowResult { result: Value, timestamp: i64 },
    /// Conversation history was compacted.
    HistoryCompaction {
        strategy: String,
        original_tokens: usize,
        compacted_tokens: usize,
        messages_removed: usize,
        timestamp: i64,
    },
    /// An agent's output matched its escalation condition.
    Escalated {
        agent: String,
        output: String,
        timestamp: i64,
    },
    /// A `log` statement fired.
    Log { message: String, timestamp: i64 },
    /// A `notify` statement fired.
    Notify { message: String, timestamp: i64 },
    /// A failure. `fatal: false` marks warning-level events (schema
    /// fallback, loop ceiling).
    Error {
        kind: ErrorKind,
        message: String,
        fatal: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        source_span: Option<Span>,
        timestamp: i64,
    },
}

impl Event {
    pub fn timestamp(&self) -> i64 {
        match self {
            Event::LlmCall { timestamp, .. }
            | Event::LlmResponse { timestamp, .. }
            | Event::AgentCall { timestamp, .. }
            | Event::AgentResult { timestamp, .. }
            | Event::ToolCall { timestamp, .. }
            | Event::ToolResult { timestamp, .. }
            | Event::FlowResult { timestamp, .. }
            | Event::HistoryCompaction { timestamp, .. }
            | Event::Escalated { timestamp, .. }
            | Event::Log { timestamp, .. }
            | Event::Notify { timestamp, .. }
            | Event::Error { timestamp, .. } => *timestamp,
        }
    }

    pub fn llm_call(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Event::LlmCall {
            prompt: prompt.into(),
            model: model.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn llm_response(text: impl Into<String>) -> Self {
        Event::LlmResponse {
            text: text.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn agent_call(agent: impl Into<String>, input: impl Into<String>) -> Self {
        Event::AgentCall {
            agent: agent.into(),
            input: input.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn agent_result(agent: impl Into<String>, result: Value) -> Self {
        Event::AgentResult {
            agent: agent.into(),
            result,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn tool_call(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Event::ToolCall {
            id: id.into(),
            name: name.into(),
            args,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn tool_result(id: impl Into<String>, data: Value) -> Self {
        Event::ToolResult {
            id: id.into(),
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn flow_result(result: Value) -> Self {
        Event::FlowResult {
            result,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn history_compaction(
        strategy: impl Into<String>,
        original_tokens: usize,
        compacted_tokens: usize,
        messages_removed: usize,
    ) -> Self {
        Event::HistoryCompaction {
            strategy: strategy.into(),
            original_tokens,
            compacted_tokens,
            messages_removed,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn escalated(agent: impl Into<String>, output: impl Into<String>) -> Self {
        Event::Escalated {
            agent: agent.into(),
            output: output.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Event::Log {
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn notify(message: impl Into<String>) -> Self {
        Event::Notify {
            message: message.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn error(error: &RuntimeError, source_span: Option<Span>) -> Self {
        Event::Error {
            kind: error.kind(),
            message: error.to_string(),
            fatal: true,
            source_span,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn warning(kind: ErrorKind, message: impl Into<String>, source_span: Option<Span>) -> Self {
        Event::Error {
            kind,
            message: message.into(),
            fatal: false,
            source_span,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Cloneable producer half of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    /// Create a sink plus its receiver with the given channel capacity.
    pub fn channel(capacity: usize) -> (EventSink, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (EventSink { tx }, rx)
    }

    /// Emit one event, waiting for channel space.
    ///
    /// A closed channel means the consumer dropped the stream: execution
    /// must stop, so this maps to `RuntimeError::Cancelled`.
    pub async fn emit(&self, event: Event) -> Result<()> {
        tracing::trace!(?event, "emit");
        self.tx
            .send(event)
            .await
            .map_err(|_| RuntimeError::Cancelled)
    }

    /// Best-effort emit for terminal events; a closed channel is ignored.
    pub async fn emit_final(&self, event: Event) {
        let _ = self.tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_emit_and_receive() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(Event::log("hello")).await.expect("emit");
        match rx.recv().await {
            Some(Event::Log { message, .. }) => assert_eq!(message, "hello"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_cancellation() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        let err = sink.emit(Event::log("x")).await.unwrap_err();
        assert_eq!(err, RuntimeError::Cancelled);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::agent_result("worker", json!({"ok": true}));
        let text = serde_json::to_string(&event).expect("serialize");
        assert!(text.contains("\"type\":\"agent_result\""));
        assert!(text.contains("\"agent\":\"worker\""));
        let back: Event = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, event);
    }

    #[test]
    fn test_warning_is_not_fatal() {
        let event = Event::warning(ErrorKind::SchemaValidation, "fell back to []", None);
        match event {
            Event::Error { fatal, kind, .. } => {
                assert!(!fatal);
                assert_eq!(kind, ErrorKind::SchemaValidation);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
