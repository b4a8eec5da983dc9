//! The public runtime surface: `run_async` and `close`.
//!
//! One `run_async` call drives a whole workflow execution on a spawned
//! task, streaming events through a bounded channel. The terminal event is
//! `FlowResult` on success or `Error` otherwise. Dropping the returned
//! stream cancels the run: in-flight provider calls settle, no new
//! dispatches start, and cached agents are released.

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use streetrace_compiler::workflow::{CompiledWorkflow, HandlerEventSpec, HandlerTimingSpec};
use tokio_stream::wrappers::ReceiverStream;

use crate::capabilities::{LlmClient, Session, SessionStore, ToolProvider};
use crate::context::{WorkflowContext, RETURN_VALUE_VAR};
use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventSink};
use crate::interpreter::Executor;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Where execution enters a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    Flow(String),
    Agent(String),
}

/// Select the entry point: `flow main`, `flow default`, `agent main`,
/// `agent default`, then the single-agent fallback.
pub fn select_entry(workflow: &CompiledWorkflow) -> Result<EntryPoint> {
    for name in ["main", "default"] {
        if workflow.flows.contains_key(name) {
            return Ok(EntryPoint::Flow(name.to_string()));
        }
    }
    for name in ["main", "default"] {
        if workflow.agents.contains_key(name) {
            return Ok(EntryPoint::Agent(name.to_string()));
        }
    }
    if workflow.agents.len() == 1 {
        let name = workflow.agents.keys().next().expect("one agent");
        return Ok(EntryPoint::Agent(name.clone()));
    }
    Err(RuntimeError::NoEntryPoint)
}

/// Executes compiled workflows against the supplied capabilities.
pub struct WorkflowRuntime {
    workflow: Arc<CompiledWorkflow>,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolProvider>,
    sessions: Arc<dyn SessionStore>,
    work_dir: PathBuf,
    executors: Mutex<Vec<Executor>>,
}

impl WorkflowRuntime {
    pub fn new(
        workflow: Arc<CompiledWorkflow>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolProvider>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            workflow,
            llm,
            tools,
            sessions,
            work_dir: PathBuf::from("."),
            executors: Mutex::new(Vec::new()),
        }
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Start one execution and stream its events.
    ///
    /// The stream ends after the terminal `FlowResult` or `Error` event.
    /// Dropping it early requests cancellation.
    pub fn run_async(&self, session: Session, message: impl Into<String>) -> ReceiverStream<Event> {
        let message = message.into();
        let (sink, rx) = EventSink::channel(EVENT_CHANNEL_CAPACITY);
        let executor = Executor::new(
            self.workflow.clone(),
            self.llm.clone(),
            self.tools.clone(),
            sink.clone(),
            self.work_dir.clone(),
        );
        self.executors.lock().push(executor.clone());

        let workflow = self.workflow.clone();
        let sessions = self.sessions.clone();
        let run_id = uuid::Uuid::new_v4();
        tokio::spawn(async move {
            tracing::debug!(%run_id, session = %session.id, "starting workflow run");
            let terminal = match drive(&executor, &workflow, &message).await {
                Ok(result) => Event::flow_result(result),
                Err(error) => {
                    tracing::debug!(%run_id, %error, "workflow run failed");
                    Event::error(&error, None)
                }
            };
            let _ = sessions.append(&session.id, terminal.clone()).await;
            sink.emit_final(terminal).await;
            executor.close();
        });

        ReceiverStream::new(rx)
    }

    /// Release agents and cached resources of every run started here.
    pub async fn close(&self) {
        for executor in self.executors.lock().drain(..) {
            executor.close();
        }
    }
}

/// Run entry-point selection and interpretation to a final result value.
async fn drive(
    executor: &Executor,
    workflow: &CompiledWorkflow,
    message: &str,
) -> Result<Value> {
    let entry = select_entry(workflow)?;
    let mut ctx = WorkflowContext::new(message);

    executor
        .run_handlers(HandlerTimingSpec::On, HandlerEventSpec::Start, &mut ctx)
        .await?;
    executor
        .run_handlers(HandlerTimingSpec::After, HandlerEventSpec::Start, &mut ctx)
        .await?;
    executor
        .run_handlers(HandlerTimingSpec::On, HandlerEventSpec::Input, &mut ctx)
        .await?;
    executor
        .run_handlers(HandlerTimingSpec::After, HandlerEventSpec::Input, &mut ctx)
        .await?;

    let result = match entry {
        EntryPoint::Flow(name) => {
            executor.exec_flow(&name, &mut ctx).await?;
            match ctx.vars.remove(RETURN_VALUE_VAR) {
                Some(value) => value,
                None => ctx.last_call_result.clone(),
            }
        }
        EntryPoint::Agent(name) => {
            let input = ctx
                .vars
                .get(crate::context::INPUT_PROMPT_VAR)
                .map(crate::value::render_text)
                .unwrap_or_default();
            executor.run_agent(&name, &input, &mut ctx).await?
        }
    };

    executor
        .run_handlers(HandlerTimingSpec::On, HandlerEventSpec::Output, &mut ctx)
        .await?;
    executor
        .run_handlers(HandlerTimingSpec::After, HandlerEventSpec::Output, &mut ctx)
        .await?;

    Ok(result)
}
