//! External capabilities consumed by the runtime.
//!
//! The core never talks to a provider, a filesystem or a database directly.
//! It consumes three narrow async traits — [`LlmClient`], [`ToolProvider`],
//! [`SessionStore`] — supplied by the embedding application. Authentication,
//! rate-limit retries and wire framing are all on the far side of these
//! seams.

use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::events::Event;

/// One message of an LLM conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Message {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Message {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Message {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// A streamed fragment of a provider response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LlmChunk {
    Text(String),
    ToolCall { id: String, name: String, args: Value },
    ToolResult { id: String, data: Value },
    FinishReason(String),
    Error(String),
}

/// Boxed chunk stream returned by [`LlmClient::invoke`].
pub type LlmStream = Pin<Box<dyn Stream<Item = LlmChunk> + Send>>;

/// Provider-facing LLM capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Start one model invocation and stream its chunks.
    async fn invoke(
        &self,
        model_id: &str,
        messages: Vec<Message>,
        tools: Vec<String>,
        schema_hint: Option<String>,
    ) -> Result<LlmStream>;
}

/// A resolved, callable tool.
#[async_trait]
pub trait ToolHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, name: &str, args: Value, work_dir: &Path) -> Result<Value>;
}

/// Resolves declared tool names into callable handles.
#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn ToolHandle>>>;
}

/// One persisted conversation session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub app: String,
    pub user: String,
    pub id: String,
    pub state: Value,
}

impl Session {
    pub fn new(app: impl Into<String>, user: impl Into<String>, id: impl Into<String>) -> Self {
        Session {
            app: app.into(),
            user: user.into(),
            id: id.into(),
            state: Value::Null,
        }
    }
}

/// Session persistence capability.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create(&self, app: &str, user: &str, session_id: &str, state: Value) -> Result<()>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>>;

    async fn append(&self, session_id: &str, event: Event) -> Result<()>;
}
