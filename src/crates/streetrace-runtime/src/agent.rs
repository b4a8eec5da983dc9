//! The agent pipeline: resolve, dispatch, escalate, validate, compact.
//!
//! Agent handles are cached per workflow run and carry the resolved model,
//! tools, instruction template and accumulated conversation. Dispatch drives
//! the LLM tool loop, applying the agent's retry and timeout policies;
//! downstream steps evaluate escalation conditions, validate structured
//! output (with a single feedback retry) and compact history when a strategy
//! is configured.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use streetrace_compiler::workflow::{
    EscalationSpec, HistoryStrategy, PromptTemplate, RetryPolicySpec, SchemaRef,
};
use tokio_stream::StreamExt;

use crate::capabilities::{LlmChunk, Message, ToolHandle};
use crate::compaction::{HistoryCompactor, DEFAULT_INPUT_BUDGET};
use crate::context::WorkflowContext;
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::escalation;
use crate::events::Event;
use crate::interpreter::Executor;
use crate::validation;

/// Bound on agent-as-tool recursion; the deepest instance loses its
/// self-tool.
pub const MAX_AGENT_DEPTH: usize = 3;

/// Rounds of the model↔tool loop for a single agent call.
const MAX_TOOL_ROUNDS: usize = 8;

/// A built agent bound to its model, tools and instruction.
pub struct AgentHandle {
    pub name: String,
    pub model_id: String,
    pub instruction: PromptTemplate,
    pub escalation: Option<EscalationSpec>,
    pub expecting: Option<SchemaRef>,
    pub tools: Vec<Arc<dyn ToolHandle>>,
    pub tool_names: Vec<String>,
    pub agent_tools: Vec<String>,
    pub history: Mutex<Vec<Message>>,
    pub history_strategy: Option<HistoryStrategy>,
    pub retry: Option<RetryPolicySpec>,
    pub timeout_secs: Option<u64>,
    pub max_input_tokens: usize,
}

/// Raw dispatch result before validation.
pub(crate) struct DispatchOutcome {
    pub final_text: String,
    pub escalated: bool,
    /// Whether any tool exchange happened during dispatch.
    pub used_tools: bool,
}

impl Executor {
    /// Build or fetch the cached handle for a declared agent.
    pub(crate) async fn get_agent(&self, name: &str) -> Result<Arc<AgentHandle>> {
        if let Some(handle) = self.agents.lock().get(name) {
            return Ok(handle.clone());
        }

        let spec = self
            .workflow
            .agents
            .get(name)
            .ok_or_else(|| RuntimeError::Unresolved {
                what: "agent",
                name: name.to_string(),
            })?;

        let instruction_prompt = spec
            .instruction
            .as_ref()
            .and_then(|prompt_name| self.workflow.prompts.get(prompt_name));

        let instruction = if let Some(inline) = &spec.inline_instruction {
            inline.clone()
        } else if let Some(prompt) = instruction_prompt {
            prompt.template.clone()
        } else {
            PromptTemplate::parse("")
        };

        let escalation = instruction_prompt.and_then(|p| p.escalation.clone());
        let expecting = instruction_prompt
            .and_then(|p| p.expecting.clone())
            .or_else(|| spec.produces.clone());

        let model_ref = spec
            .model
            .clone()
            .or_else(|| instruction_prompt.and_then(|p| p.model.clone()))
            .or_else(|| self.workflow.default_model())
            .unwrap_or_else(|| "gpt-4".to_string());
        let model_id = self.workflow.resolve_model(&model_ref);

        let max_input_tokens = self
            .workflow
            .models
            .values()
            .find(|m| m.id == model_id)
            .and_then(|m| m.max_input_tokens)
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_INPUT_BUDGET);

        let retry = self
            .workflow
            .retry_policies
            .get(spec.retry.as_deref().unwrap_or("default"))
            .cloned();

        let timeout_secs = self
            .workflow
            .timeout_policies
            .get(spec.timeout.as_deref().unwrap_or("default"))
            .map(|t| t.seconds);

        let history_strategy = spec.history.or_else(|| {
            self.workflow
                .compaction_policy
                .as_ref()
                .and_then(|p| p.strategy)
        });

        let tools = self.tools.resolve(&spec.tools).await?;

        let handle = Arc::new(AgentHandle {
            name: name.to_string(),
            model_id,
            instruction,
            escalation,
            expecting,
            tools,
            tool_names: spec.tools.clone(),
            agent_tools: spec.agent_tools.clone(),
            history: Mutex::new(Vec::new()),
            history_strategy,
            retry,
            timeout_secs,
            max_input_tokens,
        });
        self.agents.lock().insert(name.to_string(), handle.clone());
        tracing::debug!(agent = name, model = %handle.model_id, "built agent handle");
        Ok(handle)
    }

    /// The full agent pipeline for a `run agent` statement.
    ///
    /// Returns the (possibly parsed) result; sets `ctx.escalated` when the
    /// instruction's escalation condition matched.
    pub(crate) async fn run_agent(
        &self,
        name: &str,
        input: &str,
        ctx: &mut WorkflowContext,
    ) -> Result<Value> {
        let handle = self.get_agent(name).await?;
        self.sink.emit(Event::agent_call(name, input)).await?;

        let instruction = self.render_template(&handle.instruction, ctx);
        let outcome = self
            .dispatch_with_policies(&handle, &instruction, input, 0)
            .await?;

        ctx.escalated = outcome.escalated;
        if outcome.escalated {
            self.sink
                .emit(Event::escalated(name, outcome.final_text.clone()))
                .await?;
        }
        if outcome.used_tools {
            use streetrace_compiler::workflow::{HandlerEventSpec, HandlerTimingSpec};
            self.run_handlers(HandlerTimingSpec::On, HandlerEventSpec::ToolCall, ctx)
                .await?;
            self.run_handlers(HandlerTimingSpec::After, HandlerEventSpec::ToolResult, ctx)
                .await?;
        }

        let result = self
            .validate_result(&handle, &instruction, input, outcome.final_text)
            .await?;
        self.sink
            .emit(Event::agent_result(name, result.clone()))
            .await?;

        self.compact_history(&handle, ctx).await?;
        Ok(result)
    }

    /// Dispatch used by parallel children: no validation (that happens
    /// sequentially after the join) and no handler application.
    pub(crate) async fn dispatch_for_parallel(
        &self,
        name: &str,
        input: &str,
        snapshot: &WorkflowContext,
    ) -> Result<DispatchOutcome> {
        let handle = self.get_agent(name).await?;
        self.sink.emit(Event::agent_call(name, input)).await?;
        let instruction = self.render_template(&handle.instruction, snapshot);
        let outcome = self
            .dispatch_with_policies(&handle, &instruction, input, 0)
            .await?;
        if outcome.escalated {
            self.sink
                .emit(Event::escalated(name, outcome.final_text.clone()))
                .await?;
        }
        Ok(outcome)
    }

    /// Validate a raw agent response, retrying once with error feedback and
    /// falling back to an empty result.
    pub(crate) async fn validate_result(
        &self,
        handle: &Arc<AgentHandle>,
        instruction: &str,
        input: &str,
        final_text: String,
    ) -> Result<Value> {
        let Some(expecting) = &handle.expecting else {
            return Ok(validation::try_parse_json(&final_text));
        };
        let shape = self
            .workflow
            .schemas
            .get(&expecting.name)
            .ok_or_else(|| RuntimeError::Unresolved {
                what: "schema",
                name: expecting.name.clone(),
            })?;

        let first_error = match validation::validate_response(
            &final_text,
            &expecting.name,
            shape,
            expecting.is_array,
        ) {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        tracing::debug!(
            agent = %handle.name,
            error = %first_error,
            "validation failed, retrying with feedback"
        );

        let retry_input = format!(
            "{input}\n---\n{}",
            validation::retry_feedback(&first_error.to_string())
        );
        let retry = self
            .dispatch_with_policies(handle, instruction, &retry_input, 0)
            .await?;

        match validation::validate_response(
            &retry.final_text,
            &expecting.name,
            shape,
            expecting.is_array,
        ) {
            Ok(value) => Ok(value),
            Err(second_error) => {
                tracing::warn!(
                    agent = %handle.name,
                    schema = %expecting.name,
                    "unparseable response after retry, falling back to empty result"
                );
                self.sink
                    .emit(Event::warning(
                        ErrorKind::SchemaValidation,
                        format!(
                            "agent `{}` expected `{}` but returned an unparseable response \
                             after retry: {second_error}",
                            handle.name, expecting.name
                        ),
                        None,
                    ))
                    .await?;
                Ok(validation::empty_fallback(expecting.is_array))
            }
        }
    }

    /// Apply the agent's timeout and retry policies around raw dispatch,
    /// then evaluate the escalation condition on the final text.
    pub(crate) async fn dispatch_with_policies(
        &self,
        handle: &Arc<AgentHandle>,
        instruction: &str,
        input: &str,
        depth: usize,
    ) -> Result<DispatchOutcome> {
        let mut attempt: u32 = 0;
        let (final_text, used_tools) = loop {
            let dispatch = self.dispatch_once(handle, instruction, input, depth);
            let result = match handle.timeout_secs {
                Some(seconds) => {
                    match tokio::time::timeout(
                        std::time::Duration::from_secs(seconds),
                        dispatch,
                    )
                    .await
                    {
                        Ok(inner) => inner,
                        Err(_) => Err(RuntimeError::Timeout {
                            scope: format!("agent `{}`", handle.name),
                            seconds,
                        }),
                    }
                }
                None => dispatch.await,
            };
            match result {
                Ok(outcome) => break outcome,
                Err(error @ RuntimeError::Llm(_)) => {
                    let Some(policy) = &handle.retry else {
                        return Err(error);
                    };
                    if !crate::retry::should_retry(policy, attempt) {
                        return Err(error);
                    }
                    let delay = crate::retry::delay_for(policy, attempt);
                    tracing::debug!(
                        agent = %handle.name,
                        attempt,
                        ?delay,
                        "llm call failed, backing off before retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        };

        let escalated = handle
            .escalation
            .as_ref()
            .map(|spec| escalation::matches(spec, &final_text))
            .unwrap_or(false);
        {
            let mut history = handle.history.lock();
            history.push(Message::user(input.to_string()));
            history.push(Message::assistant(final_text.clone()));
        }
        Ok(DispatchOutcome {
            final_text,
            escalated,
            used_tools,
        })
    }

    /// One pass of the model↔tool loop: invoke, relay chunks as events,
    /// execute requested tools, feed results back, accumulate final text.
    async fn dispatch_once(
        &self,
        handle: &Arc<AgentHandle>,
        instruction: &str,
        input: &str,
        depth: usize,
    ) -> Result<(String, bool)> {
        let mut messages = Vec::new();
        if !instruction.is_empty() {
            messages.push(Message::system(instruction.to_string()));
        }
        messages.extend(handle.history.lock().clone());
        messages.push(Message::user(input.to_string()));

        let mut tool_names = handle.tool_names.clone();
        if depth < MAX_AGENT_DEPTH {
            tool_names.extend(handle.agent_tools.iter().cloned());
        }
        let schema_hint = handle.expecting.as_ref().map(|s| {
            if s.is_array {
                format!("{}[]", s.name)
            } else {
                s.name.clone()
            }
        });

        let mut text = String::new();
        let mut used_tools = false;
        for _round in 0..MAX_TOOL_ROUNDS {
            let mut stream = self
                .llm
                .invoke(
                    &handle.model_id,
                    messages.clone(),
                    tool_names.clone(),
                    schema_hint.clone(),
                )
                .await?;

            let mut round_text = String::new();
            let mut tool_exchanges: Vec<(String, String, Value)> = Vec::new();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    LlmChunk::Text(fragment) => round_text.push_str(&fragment),
                    LlmChunk::ToolCall { id, name, args } => {
                        self.sink
                            .emit(Event::tool_call(id.clone(), name.clone(), args.clone()))
                            .await?;
                        let data = self.execute_tool(handle, &name, args, depth).await?;
                        self.sink
                            .emit(Event::tool_result(id.clone(), data.clone()))
                            .await?;
                        tool_exchanges.push((id, name, data));
                    }
                    LlmChunk::ToolResult { id, data } => {
                        // Client-side relays are surfaced but not re-executed.
                        self.sink.emit(Event::tool_result(id, data)).await?;
                    }
                    LlmChunk::FinishReason(_) => {}
                    LlmChunk::Error(message) => return Err(RuntimeError::Llm(message)),
                }
            }

            if tool_exchanges.is_empty() {
                text = round_text;
                break;
            }
            used_tools = true;
            // Feed tool results back and go around again.
            if !round_text.is_empty() {
                messages.push(Message::assistant(round_text));
            }
            for (id, name, data) in tool_exchanges {
                messages.push(Message::tool(format!(
                    "{name} ({id}) -> {}",
                    crate::value::render_text(&data)
                )));
            }
        }
        Ok((text, used_tools))
    }

    /// Execute one requested tool: a declared tool handle, or a peer agent
    /// exposed via `use agents`.
    ///
    /// Returns an explicitly boxed, `Send` future (rather than an `async fn`
    /// opaque type) to break the auto-trait cycle created by its mutual
    /// recursion with `dispatch_with_policies` through the tool loop.
    fn execute_tool<'a>(
        &'a self,
        handle: &'a Arc<AgentHandle>,
        name: &'a str,
        args: Value,
        depth: usize,
    ) -> futures::future::BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            if handle.agent_tools.iter().any(|agent| agent == name) {
                if depth + 1 >= MAX_AGENT_DEPTH {
                    return Ok(Value::String(format!(
                        "agent `{name}` is unavailable at this depth"
                    )));
                }
                let peer = self.get_agent(name).await?;
                let instruction = peer
                    .instruction
                    .static_text()
                    .map(str::to_string)
                    .unwrap_or_default();
                let input = crate::value::render_text(&args);
                // Boxed to break the async recursion through the tool loop.
                let dispatch: futures::future::BoxFuture<'_, Result<DispatchOutcome>> =
                    Box::pin(self.dispatch_with_policies(&peer, &instruction, &input, depth + 1));
                let outcome = dispatch.await?;
                return Ok(Value::String(outcome.final_text));
            }

            let tool = handle
                .tools
                .iter()
                .find(|t| t.name() == name)
                .ok_or_else(|| RuntimeError::Tool(format!("unknown tool `{name}`")))?;
            tool.call(name, args, &self.work_dir).await
        })
    }

    /// Compact the agent's history when its strategy and budget call for it.
    async fn compact_history(
        &self,
        handle: &Arc<AgentHandle>,
        ctx: &WorkflowContext,
    ) -> Result<()> {
        let Some(strategy) = handle.history_strategy else {
            // Without a policy an over-budget conversation is a hard error.
            let messages = handle.history.lock().clone();
            let estimated = crate::compaction::estimate_conversation(&messages);
            if estimated > handle.max_input_tokens {
                return Err(RuntimeError::ContextOverflow {
                    estimated,
                    budget: handle.max_input_tokens,
                });
            }
            return Ok(());
        };

        let policy = self.workflow.compaction_policy.as_ref();
        let mut compactor = HistoryCompactor::new(strategy);
        if let Some(ratio) = policy.and_then(|p| p.trigger_token_ratio) {
            compactor.trigger_ratio = ratio;
        }
        compactor.llm = Some(self.llm.as_ref());
        compactor.summarize_model = Some(handle.model_id.clone());
        if let Some(policy) = policy {
            compactor.preserve_notes = policy
                .preserve
                .iter()
                .map(|item| match item {
                    streetrace_syntax::ast::PreserveItem::Var(name) => ctx
                        .vars
                        .get(name)
                        .map(crate::value::render_text)
                        .unwrap_or_else(|| format!("${name}")),
                    streetrace_syntax::ast::PreserveItem::LastMessages(n) => {
                        format!("the last {n} messages")
                    }
                    streetrace_syntax::ast::PreserveItem::ToolResults => {
                        "tool results".to_string()
                    }
                })
                .collect();
        }

        let messages = handle.history.lock().clone();
        if !compactor.should_compact(&messages, handle.max_input_tokens) {
            return Ok(());
        }
        let outcome = compactor.compact(messages, handle.max_input_tokens).await?;
        tracing::info!(
            agent = %handle.name,
            original = outcome.original_tokens,
            compacted = outcome.compacted_tokens,
            removed = outcome.messages_removed,
            "compacted history"
        );
        self.sink
            .emit(Event::history_compaction(
                match strategy {
                    HistoryStrategy::Truncate => "truncate",
                    HistoryStrategy::Summarize => "summarize",
                },
                outcome.original_tokens,
                outcome.compacted_tokens,
                outcome.messages_removed,
            ))
            .await?;
        *handle.history.lock() = outcome.messages;
        Ok(())
    }
}
