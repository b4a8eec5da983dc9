//! Lowering from the validated AST to the compiled workflow.
//!
//! Declarations fold in a fixed order — models, schemas, tools, prompts,
//! agents, flows, handlers — so every cross-reference is resolvable at
//! execution time and identical input produces byte-identical output. Each
//! emitted instruction and prompt records its originating span in the
//! source map.

use streetrace_syntax::ast::{
    Decl, DslFile, EscalationHandler, Expr, LiteralValue, Stmt, ToolKind,
};
use streetrace_syntax::Span;

use crate::workflow::{
    AgentSpec, BackoffSpec, CompactionPolicy, CompiledWorkflow, EscalationAction, EscalationSpec,
    FieldShape, FlowProgram, GuardrailAction, HandlerEventSpec, HandlerSpec, HandlerTimingSpec,
    HistoryStrategy, Instruction, MatchArm, ModelSpec, PromptSpec, PromptTemplate, RetryPolicySpec,
    SchemaRef, SchemaShape, TimeoutPolicySpec, ToolAuthSpec, ToolDescriptor,
};

/// Lower a semantically valid file into an executable workflow.
///
/// Codegen is infallible: everything that can go wrong was already rejected
/// by the semantic analyzer.
pub fn generate(file: &DslFile) -> CompiledWorkflow {
    let mut gen = Generator {
        workflow: CompiledWorkflow::default(),
    };
    gen.fold_models(file);
    gen.fold_schemas(file);
    gen.fold_tools(file);
    gen.fold_prompts(file);
    gen.fold_agents(file);
    gen.fold_flows(file);
    gen.fold_policies(file);
    gen.fold_handlers(file);
    tracing::debug!(
        models = gen.workflow.models.len(),
        prompts = gen.workflow.prompts.len(),
        agents = gen.workflow.agents.len(),
        flows = gen.workflow.flows.len(),
        "generated workflow"
    );
    gen.workflow
}

struct Generator {
    workflow: CompiledWorkflow,
}

impl Generator {
    fn fold_models(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::Model(model) = decl else { continue };
            let spec = match &model.provider_model {
                Some(id) => ModelSpec {
                    id: id.clone(),
                    temperature: None,
                    max_tokens: None,
                    max_input_tokens: None,
                },
                None => {
                    let mut provider = None;
                    let mut name = None;
                    let mut temperature = None;
                    let mut max_tokens = None;
                    let mut max_input_tokens = None;
                    for (key, value) in &model.properties {
                        match (key.as_str(), value) {
                            ("provider", LiteralValue::Str(v)) => provider = Some(v.clone()),
                            ("name", LiteralValue::Str(v)) => name = Some(v.clone()),
                            ("temperature", LiteralValue::Float(v)) => temperature = Some(*v),
                            ("temperature", LiteralValue::Int(v)) => {
                                temperature = Some(*v as f64)
                            }
                            ("max_tokens", LiteralValue::Int(v)) => max_tokens = Some(*v as u64),
                            ("max_input_tokens", LiteralValue::Int(v)) => {
                                max_input_tokens = Some(*v as u64)
                            }
                            _ => {}
                        }
                    }
                    let id = match (provider, name) {
                        (Some(provider), Some(name)) => format!("{provider}/{name}"),
                        (None, Some(name)) => name,
                        (Some(provider), None) => provider,
                        (None, None) => model.name.clone(),
                    };
                    ModelSpec {
                        id,
                        temperature,
                        max_tokens,
                        max_input_tokens,
                    }
                }
            };
            self.workflow.models.insert(model.name.clone(), spec);
        }
    }

    fn fold_schemas(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::Schema(schema) = decl else { continue };
            let fields = schema
                .fields
                .iter()
                .map(|field| FieldShape {
                    name: field.name.clone(),
                    base: field.ty.base,
                    is_list: field.ty.is_list,
                    is_optional: field.ty.is_optional,
                })
                .collect();
            self.workflow
                .schemas
                .insert(schema.name.clone(), SchemaShape { fields });
        }
    }

    fn fold_tools(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::Tool(tool) = decl else { continue };
            let descriptor = match &tool.kind {
                ToolKind::Mcp { url, auth } => ToolDescriptor::Mcp {
                    url: url.clone(),
                    auth: auth.as_ref().map(|a| match a {
                        streetrace_syntax::ast::ToolAuth::Bearer(v) => {
                            ToolAuthSpec::Bearer(v.clone())
                        }
                        streetrace_syntax::ast::ToolAuth::Basic(v) => {
                            ToolAuthSpec::Basic(v.clone())
                        }
                    }),
                },
                ToolKind::Builtin { reference } => ToolDescriptor::Builtin {
                    reference: reference.clone(),
                },
                ToolKind::Custom { properties } => ToolDescriptor::Custom {
                    properties: properties
                        .iter()
                        .map(|(k, v)| (k.clone(), literal_to_json(v)))
                        .collect(),
                },
            };
            self.workflow.tools.insert(tool.name.clone(), descriptor);
        }
    }

    fn fold_prompts(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::Prompt(prompt) = decl else { continue };
            let span = self.intern(prompt.span);
            let spec = PromptSpec {
                template: PromptTemplate::parse(prompt.body.as_deref().unwrap_or("")),
                model: prompt.model.clone(),
                expecting: prompt.expecting.as_deref().map(SchemaRef::parse),
                inherit: prompt.inherit.clone(),
                escalation: prompt.escalation.as_ref().map(|esc| EscalationSpec {
                    op: esc.op,
                    value: esc.value.clone(),
                }),
                span,
            };
            self.workflow.prompts.insert(prompt.name.clone(), spec);
        }
    }

    fn fold_agents(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::Agent(agent) = decl else { continue };
            let name = agent.name.clone().unwrap_or_else(|| "default".to_string());
            let span = self.intern(agent.span);
            let spec = AgentSpec {
                instruction: agent.instruction.clone(),
                inline_instruction: agent
                    .inline_prompt
                    .as_deref()
                    .map(PromptTemplate::parse),
                tools: agent.tools.clone(),
                description: agent.description.clone(),
                delegate: agent.delegate.clone(),
                agent_tools: agent.agent_tools.clone(),
                history: agent.history.as_deref().and_then(HistoryStrategy::from_name),
                model: agent.model.clone(),
                produces: agent.produces.as_deref().map(SchemaRef::parse),
                retry: agent.retry.clone(),
                timeout: agent.timeout.clone(),
                span,
            };
            self.workflow.agents.insert(name, spec);
        }
    }

    fn fold_flows(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::Flow(flow) = decl else { continue };
            let instructions = self.lower_body(&flow.body);
            self.workflow
                .flows
                .insert(flow.name.clone(), FlowProgram { instructions });
        }
    }

    fn fold_policies(&mut self, file: &DslFile) {
        for decl in &file.decls {
            match decl {
                Decl::Policy(policy) => {
                    // One compaction policy per workflow; the first wins.
                    if self.workflow.compaction_policy.is_none() {
                        self.workflow.compaction_policy = Some(CompactionPolicy {
                            strategy: policy
                                .strategy
                                .as_deref()
                                .and_then(HistoryStrategy::from_name),
                            trigger_token_ratio: policy
                                .trigger
                                .as_ref()
                                .and_then(trigger_ratio),
                            preserve: policy.preserve.clone(),
                        });
                    }
                }
                Decl::RetryPolicy(policy) => {
                    self.workflow.retry_policies.insert(
                        policy.name.clone(),
                        RetryPolicySpec {
                            times: policy.times,
                            backoff: match policy.backoff {
                                streetrace_syntax::ast::BackoffKind::Exponential => {
                                    BackoffSpec::Exponential
                                }
                                streetrace_syntax::ast::BackoffKind::Linear => BackoffSpec::Linear,
                                streetrace_syntax::ast::BackoffKind::Fixed => BackoffSpec::Fixed,
                            },
                        },
                    );
                }
                Decl::TimeoutPolicy(policy) => {
                    self.workflow.timeout_policies.insert(
                        policy.name.clone(),
                        TimeoutPolicySpec {
                            seconds: policy.unit.to_seconds(policy.value),
                        },
                    );
                }
                _ => {}
            }
        }
    }

    fn fold_handlers(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let Decl::EventHandler(handler) = decl else { continue };
            let body = self.lower_body(&handler.body);
            self.workflow.event_handlers.push(HandlerSpec {
                timing: match handler.timing {
                    streetrace_syntax::ast::HandlerTiming::On => HandlerTimingSpec::On,
                    streetrace_syntax::ast::HandlerTiming::After => HandlerTimingSpec::After,
                },
                event: match handler.event {
                    streetrace_syntax::ast::HandlerEvent::Start => HandlerEventSpec::Start,
                    streetrace_syntax::ast::HandlerEvent::Input => HandlerEventSpec::Input,
                    streetrace_syntax::ast::HandlerEvent::Output => HandlerEventSpec::Output,
                    streetrace_syntax::ast::HandlerEvent::ToolCall => HandlerEventSpec::ToolCall,
                    streetrace_syntax::ast::HandlerEvent::ToolResult => {
                        HandlerEventSpec::ToolResult
                    }
                },
                body,
            });
        }
    }

    fn lower_body(&mut self, stmts: &[Stmt]) -> Vec<Instruction> {
        stmts.iter().map(|stmt| self.lower_stmt(stmt)).collect()
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Instruction {
        let span = self.intern(stmt.span());
        match stmt {
            Stmt::Assignment { target, value, .. } => Instruction::Assign {
                target: target.clone(),
                value: value.clone(),
                span,
            },
            Stmt::PropertyAssignment {
                base, path, value, ..
            } => Instruction::AssignProperty {
                base: base.clone(),
                path: path.clone(),
                value: value.clone(),
                span,
            },
            Stmt::Run(run) => {
                if run.is_flow {
                    Instruction::RunFlow {
                        target: run.target.clone(),
                        flow: run.name.clone(),
                        input: run.input.clone(),
                        span,
                    }
                } else {
                    Instruction::RunAgent {
                        target: run.target.clone(),
                        agent: run.name.clone(),
                        input: run.input.clone(),
                        on_escalate: run.on_escalate.as_ref().map(|handler| match handler {
                            EscalationHandler::Return(expr) => {
                                EscalationAction::Return(expr.clone())
                            }
                            EscalationHandler::Continue => EscalationAction::Continue,
                            EscalationHandler::Abort => EscalationAction::Abort,
                        }),
                        span,
                    }
                }
            }
            Stmt::Call(call) => Instruction::CallLlm {
                target: call.target.clone(),
                prompt: call.prompt.clone(),
                input: call.input.clone(),
                model: call.model.clone(),
                span,
            },
            Stmt::Return { value, .. } => Instruction::Return {
                value: value.clone(),
                span,
            },
            Stmt::Push { value, target, .. } => Instruction::Push {
                value: value.clone(),
                target: target.clone(),
                span,
            },
            Stmt::Escalate { message, .. } => Instruction::Escalate {
                message: message.clone(),
                span,
            },
            Stmt::Log { message, .. } => Instruction::Log {
                message: message.clone(),
                span,
            },
            Stmt::Notify { message, .. } => Instruction::Notify {
                message: message.clone(),
                span,
            },
            Stmt::For(for_loop) => Instruction::For {
                variable: for_loop.variable.clone(),
                iterable: for_loop.iterable.clone(),
                body: self.lower_body(&for_loop.body),
                span,
            },
            Stmt::Parallel { body, .. } => Instruction::Parallel {
                body: self.lower_body(body),
                span,
            },
            Stmt::Loop {
                max_iterations,
                body,
                ..
            } => Instruction::Loop {
                max_iterations: *max_iterations,
                body: self.lower_body(body),
                span,
            },
            Stmt::Match(m) => Instruction::Match {
                scrutinee: m.scrutinee.clone(),
                cases: m
                    .cases
                    .iter()
                    .map(|case| MatchArm {
                        pattern: case.pattern.clone(),
                        body: self.lower_body(&case.body),
                    })
                    .collect(),
                else_body: m.else_body.as_ref().map(|body| self.lower_body(body)),
                span,
            },
            Stmt::If(if_block) => Instruction::If {
                condition: if_block.condition.clone(),
                body: self.lower_body(&if_block.body),
                span,
            },
            Stmt::Failure { body, .. } => Instruction::Failure {
                body: self.lower_body(body),
                span,
            },
            Stmt::Mask { target, .. } => Instruction::Guardrail {
                action: GuardrailAction::Mask(target.clone()),
                span,
            },
            Stmt::BlockIf { condition, .. } => Instruction::Guardrail {
                action: GuardrailAction::BlockIf(condition.clone()),
                span,
            },
            Stmt::WarnIf { condition, .. } => Instruction::Guardrail {
                action: GuardrailAction::WarnIf(condition.clone()),
                span,
            },
            Stmt::RetryWith {
                message, condition, ..
            } => Instruction::Guardrail {
                action: GuardrailAction::RetryWith {
                    message: message.clone(),
                    condition: condition.clone(),
                },
                span,
            },
        }
    }

    fn intern(&mut self, span: Span) -> crate::source_map::SpanId {
        self.workflow.source_map.intern(span)
    }
}

/// Extract the ratio from a `token_usage > N` trigger expression.
fn trigger_ratio(expr: &Expr) -> Option<f64> {
    if let Expr::Binary {
        op: streetrace_syntax::ast::BinOp::Gt,
        left,
        right,
        ..
    } = expr
    {
        if matches!(&**left, Expr::Name { name, .. } if name == "token_usage") {
            return match &**right {
                Expr::Literal {
                    value: LiteralValue::Float(ratio),
                    ..
                } => Some(*ratio),
                Expr::Literal {
                    value: LiteralValue::Int(ratio),
                    ..
                } => Some(*ratio as f64),
                _ => None,
            };
        }
    }
    None
}

fn literal_to_json(value: &LiteralValue) -> serde_json::Value {
    match value {
        LiteralValue::Null => serde_json::Value::Null,
        LiteralValue::Bool(v) => serde_json::Value::Bool(*v),
        LiteralValue::Int(v) => serde_json::Value::from(*v),
        LiteralValue::Float(v) => serde_json::Value::from(*v),
        LiteralValue::Str(v) => serde_json::Value::String(v.clone()),
    }
}
