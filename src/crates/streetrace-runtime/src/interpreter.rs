//! The flow interpreter.
//!
//! Walks a compiled [`FlowProgram`] instruction by instruction. Expression
//! evaluation is strict and left-to-right; boolean operators short-circuit;
//! comparison is structural. Every operation emits events through the shared
//! sink, and a closed sink unwinds execution as a cancellation.
//!
//! Escalation `continue` propagates as an [`Outcome`] so the nearest
//! enclosing loop can pick up the next iteration; at flow top level it
//! degrades to a plain skip.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use streetrace_compiler::workflow::{
    CompiledWorkflow, EscalationAction, GuardrailAction, Instruction, PromptTemplate,
};
use streetrace_syntax::ast::{BinOp, Expr, LiteralValue, UnOp};

use crate::agent::AgentHandle;
use crate::capabilities::{LlmClient, Message, ToolProvider};
use crate::compaction::collect_text;
use crate::context::{WorkflowContext, RETURN_VALUE_VAR};
use crate::error::{ErrorKind, Result, RuntimeError};
use crate::events::{Event, EventSink};
use crate::value;

/// Iteration ceiling for `loop do ... end` without `max`.
pub const DEFAULT_LOOP_CEILING: u32 = 100;

/// How a statement sequence finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Normal,
    /// A `return` executed; `_return_value` is set.
    Returned,
    /// An escalation `continue` is looking for the nearest loop.
    Continue,
}

/// Shared execution engine for one workflow run.
///
/// Cheap to clone: all state is behind `Arc`s, which is what lets parallel
/// blocks fan children out onto the executor.
#[derive(Clone)]
pub struct Executor {
    pub(crate) workflow: Arc<CompiledWorkflow>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) tools: Arc<dyn ToolProvider>,
    pub(crate) sink: EventSink,
    pub(crate) agents: Arc<Mutex<HashMap<String, Arc<AgentHandle>>>>,
    pub(crate) work_dir: PathBuf,
}

impl Executor {
    pub fn new(
        workflow: Arc<CompiledWorkflow>,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolProvider>,
        sink: EventSink,
        work_dir: PathBuf,
    ) -> Self {
        Self {
            workflow,
            llm,
            tools,
            sink,
            agents: Arc::new(Mutex::new(HashMap::new())),
            work_dir,
        }
    }

    /// Release cached agent handles.
    pub fn close(&self) {
        self.agents.lock().clear();
    }

    /// Execute a named flow to completion in the given context.
    pub async fn exec_flow(&self, name: &str, ctx: &mut WorkflowContext) -> Result<()> {
        let program = self
            .workflow
            .flows
            .get(name)
            .ok_or_else(|| RuntimeError::Unresolved {
                what: "flow",
                name: name.to_string(),
            })?;
        let _ = self.exec_body(&program.instructions, ctx, false).await?;
        Ok(())
    }

    /// Run the bodies of matching `on`/`after` event handlers.
    pub(crate) async fn run_handlers(
        &self,
        timing: streetrace_compiler::workflow::HandlerTimingSpec,
        event: streetrace_compiler::workflow::HandlerEventSpec,
        ctx: &mut WorkflowContext,
    ) -> Result<()> {
        let handlers: Vec<_> = self
            .workflow
            .event_handlers
            .iter()
            .filter(|h| h.timing == timing && h.event == event)
            .cloned()
            .collect();
        for handler in handlers {
            let _ = self.exec_body(&handler.body, ctx, false).await?;
        }
        Ok(())
    }

    /// Execute a statement sequence, honoring `failure` blocks attached to
    /// the preceding statement.
    ///
    /// `in_loop` decides what an escalation `continue` does: inside a loop
    /// body it propagates to the loop, anywhere else it degrades to a plain
    /// skip to the next statement.
    pub(crate) fn exec_body<'a>(
        &'a self,
        body: &'a [Instruction],
        ctx: &'a mut WorkflowContext,
        in_loop: bool,
    ) -> BoxFuture<'a, Result<Outcome>> {
        Box::pin(async move {
            let mut index = 0;
            while index < body.len() {
                let instruction = &body[index];
                if matches!(instruction, Instruction::Failure { .. }) {
                    // Reached without a preceding error: skipped.
                    index += 1;
                    continue;
                }
                match self.exec_instruction(instruction, ctx, in_loop).await {
                    Ok(Outcome::Normal) => index += 1,
                    Ok(Outcome::Continue) => {
                        if in_loop {
                            return Ok(Outcome::Continue);
                        }
                        index += 1;
                    }
                    Ok(Outcome::Returned) => return Ok(Outcome::Returned),
                    Err(error) if error.is_catchable() => {
                        let Some(Instruction::Failure {
                            body: failure_body, ..
                        }) = body.get(index + 1)
                        else {
                            return Err(error);
                        };
                        let span = self
                            .workflow
                            .source_map
                            .resolve(instruction.span());
                        self.sink
                            .emit(Event::warning(
                                error.kind(),
                                format!("{error} (handled by failure block)"),
                                span,
                            ))
                            .await?;
                        match self.exec_body(failure_body, ctx, in_loop).await? {
                            Outcome::Normal => index += 2,
                            other => return Ok(other),
                        }
                    }
                    Err(error) => return Err(error),
                }
            }
            Ok(Outcome::Normal)
        })
    }

    async fn exec_instruction(
        &self,
        instruction: &Instruction,
        ctx: &mut WorkflowContext,
        in_loop: bool,
    ) -> Result<Outcome> {
        match instruction {
            Instruction::Assign { target, value, .. } => {
                let value = self.eval(value, ctx)?;
                ctx.vars.insert(target.clone(), value);
                Ok(Outcome::Normal)
            }
            Instruction::AssignProperty {
                base, path, value, ..
            } => {
                let new_value = self.eval(value, ctx)?;
                let slot = ctx
                    .vars
                    .get_mut(base)
                    .ok_or_else(|| RuntimeError::Unresolved {
                        what: "variable",
                        name: base.clone(),
                    })?;
                value::set_path(slot, path, new_value)?;
                Ok(Outcome::Normal)
            }
            Instruction::RunAgent {
                target,
                agent,
                input,
                on_escalate,
                ..
            } => {
                let input_text = self.agent_input(input.as_ref(), ctx)?;
                let result = self.run_agent(agent, &input_text, ctx).await?;
                if ctx.escalated {
                    match on_escalate {
                        Some(EscalationAction::Return(expr)) => {
                            let return_value = self.eval(expr, ctx)?;
                            ctx.set_return_value(return_value);
                            return Ok(Outcome::Returned);
                        }
                        Some(EscalationAction::Continue) => return Ok(Outcome::Continue),
                        Some(EscalationAction::Abort) => {
                            return Err(RuntimeError::Abort(Some(format!(
                                "agent `{agent}` escalated"
                            ))));
                        }
                        None => {}
                    }
                }
                ctx.last_call_result = result.clone();
                if let Some(target) = target {
                    ctx.vars.insert(target.clone(), result);
                }
                Ok(Outcome::Normal)
            }
            Instruction::RunFlow { target, flow, .. } => {
                // Sub-flows share the caller's variable scope.
                let program = self
                    .workflow
                    .flows
                    .get(flow)
                    .ok_or_else(|| RuntimeError::Unresolved {
                        what: "flow",
                        name: flow.clone(),
                    })?;
                let _ = self.exec_body(&program.instructions, ctx, false).await?;
                if let Some(result) = ctx.vars.remove(RETURN_VALUE_VAR) {
                    ctx.last_call_result = result.clone();
                    if let Some(target) = target {
                        ctx.vars.insert(target.clone(), result);
                    }
                }
                Ok(Outcome::Normal)
            }
            Instruction::CallLlm {
                target,
                prompt,
                input,
                model,
                ..
            } => {
                let spec = self.workflow.prompts.get(prompt).ok_or_else(|| {
                    RuntimeError::Unresolved {
                        what: "prompt",
                        name: prompt.clone(),
                    }
                })?;
                let rendered = self.render_template(&spec.template, ctx);
                let model_ref = model
                    .clone()
                    .or_else(|| spec.model.clone())
                    .or_else(|| self.workflow.default_model())
                    .unwrap_or_else(|| "gpt-4".to_string());
                let model_id = self.workflow.resolve_model(&model_ref);

                let mut messages = vec![Message::system(rendered.clone())];
                if let Some(input) = input {
                    let input_value = self.eval(input, ctx)?;
                    messages.push(Message::user(value::render_text(&input_value)));
                }

                self.sink
                    .emit(Event::llm_call(rendered, model_id.clone()))
                    .await?;
                let stream = self
                    .llm
                    .invoke(&model_id, messages, Vec::new(), None)
                    .await?;
                let text = collect_text(stream).await?;
                self.sink.emit(Event::llm_response(text.clone())).await?;

                ctx.last_call_result = Value::String(text.clone());
                if let Some(target) = target {
                    ctx.vars.insert(target.clone(), Value::String(text));
                }
                Ok(Outcome::Normal)
            }
            Instruction::Return { value, .. } => {
                let value = self.eval(value, ctx)?;
                ctx.set_return_value(value);
                Ok(Outcome::Returned)
            }
            Instruction::Push { value, target, .. } => {
                let value = self.eval(value, ctx)?;
                let slot = ctx
                    .vars
                    .get_mut(target)
                    .ok_or_else(|| RuntimeError::Unresolved {
                        what: "variable",
                        name: target.clone(),
                    })?;
                let Value::Array(items) = slot else {
                    return Err(RuntimeError::TypeMismatch(format!(
                        "cannot push to `${target}`: it holds {}",
                        value::type_name(slot)
                    )));
                };
                items.push(value);
                Ok(Outcome::Normal)
            }
            Instruction::Escalate { message, .. } => {
                let output = match message {
                    Some(expr) => value::render_text(&self.eval(expr, ctx)?),
                    None => String::new(),
                };
                self.sink.emit(Event::escalated("flow", output)).await?;
                Ok(Outcome::Normal)
            }
            Instruction::Log { message, .. } => {
                let text = value::render_text(&self.eval(message, ctx)?);
                tracing::info!(message = %text, "flow log");
                self.sink.emit(Event::log(text)).await?;
                Ok(Outcome::Normal)
            }
            Instruction::Notify { message, .. } => {
                let text = value::render_text(&self.eval(message, ctx)?);
                self.sink.emit(Event::notify(text)).await?;
                Ok(Outcome::Normal)
            }
            Instruction::For {
                variable,
                iterable,
                body,
                ..
            } => {
                let items = match self.eval(iterable, ctx)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "cannot iterate over {}",
                            value::type_name(&other)
                        )));
                    }
                };
                for item in items {
                    ctx.vars.insert(variable.clone(), item);
                    match self.exec_body(body, ctx, true).await? {
                        Outcome::Normal | Outcome::Continue => {}
                        Outcome::Returned => return Ok(Outcome::Returned),
                    }
                }
                Ok(Outcome::Normal)
            }
            Instruction::Parallel { body, .. } => {
                self.exec_parallel(body, ctx).await?;
                Ok(Outcome::Normal)
            }
            Instruction::Loop {
                max_iterations,
                body,
                span,
            } => {
                let ceiling = max_iterations.unwrap_or(DEFAULT_LOOP_CEILING);
                for iteration in 0..ceiling {
                    match self.exec_body(body, ctx, true).await? {
                        Outcome::Normal | Outcome::Continue => {}
                        Outcome::Returned => return Ok(Outcome::Returned),
                    }
                    if max_iterations.is_none() && iteration + 1 == ceiling {
                        self.sink
                            .emit(Event::warning(
                                ErrorKind::LoopLimit,
                                format!(
                                    "unbounded loop stopped after {DEFAULT_LOOP_CEILING} iterations"
                                ),
                                self.workflow.source_map.resolve(*span),
                            ))
                            .await?;
                    }
                }
                Ok(Outcome::Normal)
            }
            Instruction::Match {
                scrutinee,
                cases,
                else_body,
                ..
            } => {
                let rendered = value::render_text(&self.eval(scrutinee, ctx)?);
                for case in cases {
                    if case.pattern == rendered {
                        return self.exec_body(&case.body, ctx, in_loop).await;
                    }
                }
                if let Some(else_body) = else_body {
                    return self.exec_body(else_body, ctx, in_loop).await;
                }
                Ok(Outcome::Normal)
            }
            Instruction::If {
                condition, body, ..
            } => {
                if value::truthy(&self.eval(condition, ctx)?) {
                    return self.exec_body(body, ctx, in_loop).await;
                }
                Ok(Outcome::Normal)
            }
            Instruction::Failure { .. } => Ok(Outcome::Normal),
            Instruction::Guardrail { action, span } => {
                self.exec_guardrail(action, *span, ctx).await?;
                Ok(Outcome::Normal)
            }
        }
    }

    /// Guardrail conditions resolve against context variables set by
    /// upstream detectors; an unbound name simply does not fire.
    async fn exec_guardrail(
        &self,
        action: &GuardrailAction,
        span: streetrace_compiler::SpanId,
        ctx: &mut WorkflowContext,
    ) -> Result<()> {
        match action {
            GuardrailAction::Mask(target) => {
                self.sink
                    .emit(Event::log(format!("mask `{target}` applied")))
                    .await
            }
            GuardrailAction::BlockIf(condition) => {
                let fired = ctx.vars.get(condition).map(value::truthy).unwrap_or(false);
                if fired {
                    return Err(RuntimeError::Blocked(condition.clone()));
                }
                Ok(())
            }
            GuardrailAction::WarnIf(condition) => {
                let fired = ctx.vars.get(condition).map(value::truthy).unwrap_or(false);
                if fired {
                    self.sink
                        .emit(Event::warning(
                            ErrorKind::Blocked,
                            format!("guardrail `{condition}` fired"),
                            self.workflow.source_map.resolve(span),
                        ))
                        .await?;
                }
                Ok(())
            }
            GuardrailAction::RetryWith { message, condition } => {
                let fire = match condition {
                    Some(expr) => value::truthy(&self.eval(expr, ctx)?),
                    None => true,
                };
                if fire {
                    let text = value::render_text(&self.eval(message, ctx)?);
                    self.sink
                        .emit(Event::log(format!("retry requested: {text}")))
                        .await?;
                }
                Ok(())
            }
        }
    }

    /// Fan a parallel block's `run` statements out as concurrent tasks.
    ///
    /// Children read a snapshot of the caller's variables and share the
    /// input derived from the first child's `with` expression. Validation
    /// retries run sequentially after the join; an aborting child surfaces
    /// its error only after every sibling's result is collected.
    async fn exec_parallel(&self, body: &[Instruction], ctx: &mut WorkflowContext) -> Result<()> {
        let mut children = Vec::new();
        for instruction in body {
            match instruction {
                Instruction::RunAgent {
                    target,
                    agent,
                    input,
                    on_escalate,
                    ..
                } => children.push((target.clone(), agent.clone(), input, on_escalate.clone())),
                other => {
                    return Err(RuntimeError::TypeMismatch(format!(
                        "parallel blocks may only contain run statements (at {:?})",
                        self.workflow.source_map.resolve(other.span())
                    )));
                }
            }
        }
        if children.is_empty() {
            return Ok(());
        }

        let snapshot = ctx.snapshot();
        let shared_input = self.agent_input(children[0].2.as_ref(), &snapshot)?;

        let mut tasks = Vec::new();
        for (target, agent, _, on_escalate) in &children {
            let executor = self.clone();
            let agent_name = agent.clone();
            let input = shared_input.clone();
            let snap = snapshot.clone();
            let task = tokio::spawn(async move {
                executor
                    .dispatch_for_parallel(&agent_name, &input, &snap)
                    .await
            });
            tasks.push((target.clone(), agent.clone(), on_escalate.clone(), task));
        }

        let mut abort: Option<RuntimeError> = None;
        let mut outcomes = Vec::new();
        for (target, agent, on_escalate, task) in tasks {
            let result = task
                .await
                .map_err(|e| RuntimeError::Llm(format!("parallel task panicked: {e}")))?;
            match result {
                Ok(outcome) => {
                    if outcome.escalated
                        && matches!(on_escalate, Some(EscalationAction::Abort))
                        && abort.is_none()
                    {
                        abort = Some(RuntimeError::Abort(Some(format!(
                            "agent `{agent}` escalated"
                        ))));
                    }
                    outcomes.push((target, agent, outcome));
                }
                Err(error @ RuntimeError::Abort(_)) => {
                    if abort.is_none() {
                        abort = Some(error);
                    }
                }
                Err(error) => return Err(error),
            }
        }

        // Sequential validation and assignment after the join.
        for (target, agent, outcome) in outcomes {
            let handle = self.get_agent(&agent).await?;
            let instruction = self.render_template(&handle.instruction, &snapshot);
            let result = self
                .validate_result(&handle, &instruction, &shared_input, outcome.final_text)
                .await?;
            self.sink
                .emit(Event::agent_result(agent.as_str(), result.clone()))
                .await?;
            if let Some(target) = target {
                ctx.vars.insert(target, result);
            }
        }

        match abort {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Derive an agent's input text: the `with` expression, defaulting to
    /// `$input_prompt`.
    fn agent_input(&self, input: Option<&Expr>, ctx: &WorkflowContext) -> Result<String> {
        match input {
            Some(expr) => Ok(value::render_text(&self.eval(expr, ctx)?)),
            None => Ok(ctx
                .vars
                .get(crate::context::INPUT_PROMPT_VAR)
                .map(value::render_text)
                .unwrap_or_default()),
        }
    }

    /// Render a prompt template against context variables. Dotted
    /// interpolations (`${a.b}`) walk into objects.
    pub(crate) fn render_template(
        &self,
        template: &PromptTemplate,
        ctx: &WorkflowContext,
    ) -> String {
        template.render(|name| {
            let mut parts = name.split('.');
            let base = parts.next()?;
            let root = ctx.vars.get(base)?;
            let path: Vec<String> = parts.map(str::to_string).collect();
            value::walk_path(root, &path).ok().map(value::render_text)
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    pub(crate) fn eval(&self, expr: &Expr, ctx: &WorkflowContext) -> Result<Value> {
        self.eval_with_element(expr, ctx, None)
    }

    fn eval_with_element(
        &self,
        expr: &Expr,
        ctx: &WorkflowContext,
        element: Option<&Value>,
    ) -> Result<Value> {
        match expr {
            Expr::Literal { value, .. } => Ok(match value {
                LiteralValue::Null => Value::Null,
                LiteralValue::Bool(b) => Value::Bool(*b),
                LiteralValue::Int(i) => Value::from(*i),
                LiteralValue::Float(f) => Value::from(*f),
                LiteralValue::Str(s) => Value::String(s.clone()),
            }),
            Expr::Var { name, .. } | Expr::Name { name, .. } => ctx
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::Unresolved {
                    what: "variable",
                    name: name.clone(),
                }),
            Expr::Property { base, path, .. } => {
                let root = self.eval_with_element(base, ctx, element)?;
                Ok(value::walk_path(&root, path)?.clone())
            }
            Expr::ImplicitProperty { path, .. } => {
                let element = element.ok_or_else(|| {
                    RuntimeError::TypeMismatch(
                        "`.property` is only valid inside a filter condition".to_string(),
                    )
                })?;
                Ok(value::walk_path(element, path)?.clone())
            }
            Expr::Binary {
                op, left, right, ..
            } => self.eval_binary(*op, left, right, ctx, element),
            Expr::Unary { op, operand, .. } => {
                let operand = self.eval_with_element(operand, ctx, element)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!value::truthy(&operand))),
                    UnOp::Neg => value::arithmetic('-', &Value::from(0), &operand),
                }
            }
            Expr::Call { name, args, .. } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_with_element(arg, ctx, element)?);
                }
                self.eval_function(name, values)
            }
            Expr::List { elements, .. } => {
                let mut items = Vec::with_capacity(elements.len());
                for element_expr in elements {
                    items.push(self.eval_with_element(element_expr, ctx, element)?);
                }
                Ok(Value::Array(items))
            }
            Expr::Object { entries, .. } => {
                let mut map = serde_json::Map::new();
                for (key, value_expr) in entries {
                    map.insert(
                        key.clone(),
                        self.eval_with_element(value_expr, ctx, element)?,
                    );
                }
                Ok(Value::Object(map))
            }
            Expr::Filter {
                list, condition, ..
            } => {
                let list_value = self.eval_with_element(list, ctx, element)?;
                let Value::Array(items) = list_value else {
                    return Err(RuntimeError::TypeMismatch(format!(
                        "cannot filter {}",
                        value::type_name(&list_value)
                    )));
                };
                let mut kept = Vec::new();
                for item in items {
                    if value::truthy(&self.eval_with_element(condition, ctx, Some(&item))?) {
                        kept.push(item);
                    }
                }
                Ok(Value::Array(kept))
            }
        }
    }

    fn eval_binary(
        &self,
        op: BinOp,
        left: &Expr,
        right: &Expr,
        ctx: &WorkflowContext,
        element: Option<&Value>,
    ) -> Result<Value> {
        // Short-circuit boolean operators first.
        match op {
            BinOp::And => {
                let left = self.eval_with_element(left, ctx, element)?;
                if !value::truthy(&left) {
                    return Ok(Value::Bool(false));
                }
                let right = self.eval_with_element(right, ctx, element)?;
                return Ok(Value::Bool(value::truthy(&right)));
            }
            BinOp::Or => {
                let left = self.eval_with_element(left, ctx, element)?;
                if value::truthy(&left) {
                    return Ok(Value::Bool(true));
                }
                let right = self.eval_with_element(right, ctx, element)?;
                return Ok(Value::Bool(value::truthy(&right)));
            }
            _ => {}
        }

        let left = self.eval_with_element(left, ctx, element)?;
        let right = self.eval_with_element(right, ctx, element)?;
        match op {
            BinOp::Eq => Ok(Value::Bool(value::values_equal(&left, &right))),
            BinOp::Ne => Ok(Value::Bool(!value::values_equal(&left, &right))),
            BinOp::Lt => Ok(Value::Bool(
                value::compare_values(&left, &right)? == std::cmp::Ordering::Less,
            )),
            BinOp::Gt => Ok(Value::Bool(
                value::compare_values(&left, &right)? == std::cmp::Ordering::Greater,
            )),
            BinOp::Le => Ok(Value::Bool(
                value::compare_values(&left, &right)? != std::cmp::Ordering::Greater,
            )),
            BinOp::Ge => Ok(Value::Bool(
                value::compare_values(&left, &right)? != std::cmp::Ordering::Less,
            )),
            BinOp::Add => value::arithmetic('+', &left, &right),
            BinOp::Sub => value::arithmetic('-', &left, &right),
            BinOp::Mul => value::arithmetic('*', &left, &right),
            BinOp::Div => value::arithmetic('/', &left, &right),
            BinOp::And | BinOp::Or => unreachable!("handled above"),
        }
    }

    fn eval_function(&self, name: &str, args: Vec<Value>) -> Result<Value> {
        match (name, args.as_slice()) {
            ("len", [Value::Array(items)]) => Ok(Value::from(items.len() as i64)),
            ("len", [Value::String(text)]) => Ok(Value::from(text.chars().count() as i64)),
            ("len", [Value::Object(map)]) => Ok(Value::from(map.len() as i64)),
            ("len", [other]) => Err(RuntimeError::TypeMismatch(format!(
                "len() expects a list, string or object, got {}",
                value::type_name(other)
            ))),
            ("str", [value]) => Ok(Value::String(value::render_text(value))),
            _ => Err(RuntimeError::Unresolved {
                what: "function",
                name: name.to_string(),
            }),
        }
    }
}
