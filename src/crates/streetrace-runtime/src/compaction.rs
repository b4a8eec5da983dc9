//! History compaction: keeping agent conversations inside model budgets.
//!
//! After each agent call the runtime estimates the token footprint of the
//! accumulated conversation. When it exceeds the configured share of the
//! model's input budget, the history is compacted with the agent's strategy:
//!
//! - `truncate` keeps the first message (the system instruction) plus the
//!   longest fitting tail;
//! - `summarize` replaces the middle region with a single summary message
//!   produced by a separate LLM call, falling back to truncation when no
//!   client is available.
//!
//! Token counts use the `cl100k_base` tokenizer when it loads, otherwise a
//! 4-chars-per-token heuristic. Tests assert on behavior, not exact counts.

use futures::StreamExt;
use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

use streetrace_compiler::workflow::HistoryStrategy;

use crate::capabilities::{LlmChunk, LlmClient, Message};
use crate::error::{Result, RuntimeError};

/// Input budget assumed when the model declares none.
pub const DEFAULT_INPUT_BUDGET: usize = 128_000;

/// Share of the budget that triggers compaction when no policy overrides it.
pub const DEFAULT_TRIGGER_RATIO: f64 = 0.8;

fn tokenizer() -> Option<&'static CoreBPE> {
    static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();
    BPE.get_or_init(|| tiktoken_rs::cl100k_base().ok()).as_ref()
}

/// Estimate the token footprint of a text.
pub fn estimate_tokens(text: &str) -> usize {
    match tokenizer() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Estimate the footprint of a whole conversation, with a small per-message
/// overhead for role framing.
pub fn estimate_conversation(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| estimate_tokens(&m.content) + 4)
        .sum()
}

/// Result of one compaction pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionOutcome {
    pub messages: Vec<Message>,
    pub original_tokens: usize,
    pub compacted_tokens: usize,
    pub messages_removed: usize,
}

pub struct HistoryCompactor<'a> {
    pub strategy: HistoryStrategy,
    /// Compact once usage exceeds this share of the budget.
    pub trigger_ratio: f64,
    /// Client used by the summarize strategy; `None` falls back to truncate.
    pub llm: Option<&'a dyn LlmClient>,
    pub summarize_model: Option<String>,
    /// Rendered `preserve` items the summary must keep.
    pub preserve_notes: Vec<String>,
}

impl<'a> HistoryCompactor<'a> {
    pub fn new(strategy: HistoryStrategy) -> Self {
        Self {
            strategy,
            trigger_ratio: DEFAULT_TRIGGER_RATIO,
            llm: None,
            summarize_model: None,
            preserve_notes: Vec::new(),
        }
    }

    pub fn threshold(&self, budget: usize) -> usize {
        (budget as f64 * self.trigger_ratio) as usize
    }

    pub fn should_compact(&self, messages: &[Message], budget: usize) -> bool {
        estimate_conversation(messages) > self.threshold(budget)
    }

    /// Compact the conversation to fit the budget.
    pub async fn compact(
        &self,
        messages: Vec<Message>,
        budget: usize,
    ) -> Result<CompactionOutcome> {
        let original_tokens = estimate_conversation(&messages);
        let original_count = messages.len();
        let target = self.threshold(budget);

        let compacted = match self.strategy {
            HistoryStrategy::Truncate => truncate(messages, target),
            HistoryStrategy::Summarize => match self.llm {
                Some(llm) => self.summarize(llm, messages, target).await?,
                None => truncate(messages, target),
            },
        };

        let compacted_tokens = estimate_conversation(&compacted);
        Ok(CompactionOutcome {
            messages_removed: original_count.saturating_sub(compacted.len()),
            original_tokens,
            compacted_tokens,
            messages: compacted,
        })
    }

    async fn summarize(
        &self,
        llm: &dyn LlmClient,
        messages: Vec<Message>,
        target: usize,
    ) -> Result<Vec<Message>> {
        // Keep the system instruction and the last two exchanges; summarize
        // everything in between.
        const TAIL: usize = 4;
        if messages.len() <= TAIL + 2 {
            return Ok(truncate(messages, target));
        }
        let head = messages[0].clone();
        let tail: Vec<Message> = messages[messages.len() - TAIL..].to_vec();
        let middle = &messages[1..messages.len() - TAIL];

        let mut instruction = String::from(
            "Summarize the following conversation segment in a compact form. \
             Keep every fact needed to continue the task.",
        );
        if !self.preserve_notes.is_empty() {
            instruction.push_str("\nYou must preserve: ");
            instruction.push_str(&self.preserve_notes.join(", "));
            instruction.push('.');
        }
        let transcript = middle
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let model = self
            .summarize_model
            .clone()
            .unwrap_or_else(|| "summarizer".to_string());
        let stream = llm
            .invoke(
                &model,
                vec![Message::system(instruction), Message::user(transcript)],
                Vec::new(),
                None,
            )
            .await?;
        let summary_text = collect_text(stream).await?;

        let mut result = vec![head, Message::assistant(format!("[summary] {summary_text}"))];
        result.extend(tail);
        Ok(result)
    }
}

/// Keep the first message plus the longest tail that fits the target.
fn truncate(messages: Vec<Message>, target: usize) -> Vec<Message> {
    if messages.len() <= 2 {
        return messages;
    }
    let first = messages[0].clone();
    let mut budget = target.saturating_sub(estimate_tokens(&first.content) + 4);
    let mut tail: Vec<Message> = Vec::new();
    for message in messages[1..].iter().rev() {
        let cost = estimate_tokens(&message.content) + 4;
        if cost > budget && !tail.is_empty() {
            break;
        }
        budget = budget.saturating_sub(cost);
        tail.push(message.clone());
        // Always retain at least the final message, then stop once the
        // budget is gone.
        if budget == 0 {
            break;
        }
    }
    tail.reverse();
    let mut result = vec![first];
    result.extend(tail);
    result
}

/// Drain an LLM stream into its concatenated text.
pub async fn collect_text(mut stream: crate::capabilities::LlmStream) -> Result<String> {
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            LlmChunk::Text(fragment) => text.push_str(&fragment),
            LlmChunk::Error(message) => return Err(RuntimeError::Llm(message)),
            LlmChunk::FinishReason(_) | LlmChunk::ToolCall { .. } | LlmChunk::ToolResult { .. } => {
            }
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticLlmClient;

    fn long_conversation() -> Vec<Message> {
        let mut messages = vec![Message::system("You are a careful reviewer.")];
        for i in 0..10 {
            messages.push(Message::user(format!(
                "exchange {i}: {}",
                "lorem ipsum dolor sit amet ".repeat(30)
            )));
            messages.push(Message::assistant(format!(
                "reply {i}: {}",
                "consectetur adipiscing elit ".repeat(30)
            )));
        }
        messages
    }

    #[test]
    fn test_estimate_grows_with_text() {
        assert!(estimate_tokens("a long sentence about nothing much") > estimate_tokens("hi"));
        assert!(estimate_tokens("") == 0 || estimate_tokens("") < 4);
    }

    #[test]
    fn test_should_compact_threshold() {
        let compactor = HistoryCompactor::new(HistoryStrategy::Truncate);
        let messages = long_conversation();
        assert!(compactor.should_compact(&messages, 100));
        assert!(!compactor.should_compact(&messages, 1_000_000));
    }

    #[tokio::test]
    async fn test_truncate_keeps_first_and_tail() {
        let compactor = HistoryCompactor::new(HistoryStrategy::Truncate);
        let messages = long_conversation();
        let original = estimate_conversation(&messages);
        let outcome = compactor.compact(messages.clone(), 500).await.expect("compact");

        assert!(outcome.messages_removed > 0);
        assert!(outcome.compacted_tokens < outcome.original_tokens);
        assert_eq!(outcome.original_tokens, original);
        // System message survives.
        assert_eq!(outcome.messages[0], messages[0]);
        // Tail survives in order.
        assert_eq!(
            outcome.messages.last(),
            messages.last(),
        );
    }

    #[tokio::test]
    async fn test_summarize_replaces_middle() {
        let client = StaticLlmClient::with_texts(vec!["the middle was about lorem"]);
        let mut compactor = HistoryCompactor::new(HistoryStrategy::Summarize);
        compactor.llm = Some(&client);
        compactor.preserve_notes = vec!["$goal".to_string()];

        let messages = long_conversation();
        let outcome = compactor.compact(messages.clone(), 500).await.expect("compact");

        assert!(outcome.messages_removed > 0);
        assert_eq!(outcome.messages[0], messages[0]);
        assert!(outcome.messages[1].content.contains("[summary]"));
        // Preserve note reached the summarization instruction.
        let invocation = &client.invocations()[0];
        assert!(invocation.messages[0].content.contains("$goal"));
    }

    #[tokio::test]
    async fn test_summarize_without_client_falls_back_to_truncate() {
        let compactor = HistoryCompactor::new(HistoryStrategy::Summarize);
        let outcome = compactor
            .compact(long_conversation(), 500)
            .await
            .expect("compact");
        assert!(outcome.messages_removed > 0);
        assert!(!outcome.messages.iter().any(|m| m.content.contains("[summary]")));
    }
}
