//! Local LLM clients for the CLI.
//!
//! Real provider adapters live outside this repository and are plugged in
//! through the `LlmClient` capability. The CLI ships two local stand-ins:
//! an echo client that reflects the last user message (handy for trying
//! workflows offline) and the scripted client from
//! `streetrace_runtime::testing` behind `--mock-response`.

use async_trait::async_trait;
use streetrace_runtime::{LlmChunk, LlmClient, LlmStream, Message, Result, Role};

pub use streetrace_runtime::testing::StaticLlmClient;

/// Reflects the last user message back as the model response.
#[derive(Default)]
pub struct EchoLlmClient;

#[async_trait]
impl LlmClient for EchoLlmClient {
    async fn invoke(
        &self,
        _model_id: &str,
        messages: Vec<Message>,
        _tools: Vec<String>,
        _schema_hint: Option<String>,
    ) -> Result<LlmStream> {
        let text = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Ok(Box::pin(futures::stream::iter(vec![
            LlmChunk::Text(text),
            LlmChunk::FinishReason("stop".to_string()),
        ])))
    }
}
