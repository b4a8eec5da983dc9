//! In-memory capability implementations for tests and local runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::capabilities::{
    LlmChunk, LlmClient, LlmStream, Message, Session, SessionStore, ToolHandle, ToolProvider,
};
use crate::error::{Result, RuntimeError};
use crate::events::Event;

/// An [`LlmClient`] that replays scripted chunk sequences in order.
///
/// Each `invoke` pops the next script; when the scripts run out the last one
/// repeats. Invocations are recorded for assertions.
pub struct StaticLlmClient {
    scripts: Mutex<Vec<Vec<LlmChunk>>>,
    cursor: Mutex<usize>,
    invocations: Mutex<Vec<RecordedInvocation>>,
}

#[derive(Debug, Clone)]
pub struct RecordedInvocation {
    pub model_id: String,
    pub messages: Vec<Message>,
    pub tools: Vec<String>,
    pub schema_hint: Option<String>,
}

impl StaticLlmClient {
    pub fn new(scripts: Vec<Vec<LlmChunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            cursor: Mutex::new(0),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand: each call returns one text chunk then a stop reason.
    pub fn with_texts(texts: Vec<&str>) -> Self {
        Self::new(
            texts
                .into_iter()
                .map(|text| {
                    vec![
                        LlmChunk::Text(text.to_string()),
                        LlmChunk::FinishReason("stop".to_string()),
                    ]
                })
                .collect(),
        )
    }

    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }
}

#[async_trait]
impl LlmClient for StaticLlmClient {
    async fn invoke(
        &self,
        model_id: &str,
        messages: Vec<Message>,
        tools: Vec<String>,
        schema_hint: Option<String>,
    ) -> Result<LlmStream> {
        self.invocations.lock().push(RecordedInvocation {
            model_id: model_id.to_string(),
            messages,
            tools,
            schema_hint,
        });
        let chunks = {
            let scripts = self.scripts.lock();
            if scripts.is_empty() {
                return Err(RuntimeError::Llm("no scripted responses".to_string()));
            }
            let mut cursor = self.cursor.lock();
            let index = (*cursor).min(scripts.len() - 1);
            *cursor += 1;
            scripts[index].clone()
        };
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

/// A [`ToolProvider`] that resolves every name to a no-op handle.
#[derive(Default)]
pub struct NullToolProvider;

struct NullTool {
    name: String,
}

#[async_trait]
impl ToolHandle for NullTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, _name: &str, args: Value, _work_dir: &Path) -> Result<Value> {
        Ok(args)
    }
}

#[async_trait]
impl ToolProvider for NullToolProvider {
    async fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn ToolHandle>>> {
        Ok(names
            .iter()
            .map(|name| Arc::new(NullTool { name: name.clone() }) as Arc<dyn ToolHandle>)
            .collect())
    }
}

/// An in-memory [`SessionStore`].
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, (Session, Vec<Event>)>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, session_id: &str) -> Vec<Event> {
        self.sessions
            .lock()
            .get(session_id)
            .map(|(_, events)| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, app: &str, user: &str, session_id: &str, state: Value) -> Result<()> {
        let session = Session {
            app: app.to_string(),
            user: user.to_string(),
            id: session_id.to_string(),
            state,
        };
        self.sessions
            .lock()
            .insert(session_id.to_string(), (session, Vec::new()));
        Ok(())
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>> {
        Ok(self
            .sessions
            .lock()
            .get(session_id)
            .map(|(session, _)| session.clone()))
    }

    async fn append(&self, session_id: &str, event: Event) -> Result<()> {
        match self.sessions.lock().get_mut(session_id) {
            Some((_, events)) => {
                events.push(event);
                Ok(())
            }
            None => Err(RuntimeError::Unresolved {
                what: "session",
                name: session_id.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_static_client_replays_scripts() {
        let client = StaticLlmClient::with_texts(vec!["one", "two"]);
        let mut stream = client
            .invoke("m", vec![Message::user("hi")], vec![], None)
            .await
            .expect("invoke");
        assert_eq!(stream.next().await, Some(LlmChunk::Text("one".into())));
        assert_eq!(
            stream.next().await,
            Some(LlmChunk::FinishReason("stop".into()))
        );

        let mut stream = client.invoke("m", vec![], vec![], None).await.expect("invoke");
        assert_eq!(stream.next().await, Some(LlmChunk::Text("two".into())));
        assert_eq!(client.invocation_count(), 2);
    }

    #[tokio::test]
    async fn test_static_client_repeats_last_script() {
        let client = StaticLlmClient::with_texts(vec!["only"]);
        for _ in 0..3 {
            let mut stream = client.invoke("m", vec![], vec![], None).await.expect("invoke");
            assert_eq!(stream.next().await, Some(LlmChunk::Text("only".into())));
        }
    }

    #[tokio::test]
    async fn test_session_store_roundtrip() {
        let store = InMemorySessionStore::new();
        store
            .create("app", "user", "s1", Value::Null)
            .await
            .expect("create");
        store
            .append("s1", Event::log("started"))
            .await
            .expect("append");
        let session = store.get("s1").await.expect("get").expect("present");
        assert_eq!(session.user, "user");
        assert_eq!(store.events_for("s1").len(), 1);
        assert!(store.get("missing").await.expect("get").is_none());
    }
}
