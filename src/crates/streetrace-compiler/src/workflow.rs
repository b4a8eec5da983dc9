//! The compiled workflow: an executable, serializable representation.
//!
//! Declarations land in `BTreeMap`s keyed by name so iteration order — and
//! therefore serialized output — is deterministic: identical source yields
//! byte-identical compiled artifacts.
//!
//! Prompt bodies compile to [`PromptTemplate`]s rather than host closures;
//! the runtime renders a template against its variable map at call time.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use streetrace_syntax::ast::{BaseType, EscalationOp, Expr, PreserveItem};

use crate::source_map::{SourceMap, SpanId};

/// A fully lowered workflow, ready for the runtime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledWorkflow {
    pub models: BTreeMap<String, ModelSpec>,
    pub schemas: BTreeMap<String, SchemaShape>,
    pub tools: BTreeMap<String, ToolDescriptor>,
    pub prompts: BTreeMap<String, PromptSpec>,
    pub agents: BTreeMap<String, AgentSpec>,
    pub flows: BTreeMap<String, FlowProgram>,
    pub compaction_policy: Option<CompactionPolicy>,
    pub retry_policies: BTreeMap<String, RetryPolicySpec>,
    pub timeout_policies: BTreeMap<String, TimeoutPolicySpec>,
    pub event_handlers: Vec<HandlerSpec>,
    pub source_map: SourceMap,
}

impl CompiledWorkflow {
    /// Resolve a model reference: a declared model's id, or the reference
    /// itself when it is already a `provider/model` literal.
    pub fn resolve_model(&self, reference: &str) -> String {
        self.models
            .get(reference)
            .map(|m| m.id.clone())
            .unwrap_or_else(|| reference.to_string())
    }

    /// The model used when nothing more specific is configured: the first
    /// declared model.
    pub fn default_model(&self) -> Option<String> {
        self.models.values().next().map(|m| m.id.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// `provider/model` identifier handed to the LLM client.
    pub id: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub max_input_tokens: Option<u64>,
}

/// The structural shape of a declared schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaShape {
    pub fields: Vec<FieldShape>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldShape {
    pub name: String,
    pub base: BaseType,
    pub is_list: bool,
    pub is_optional: bool,
}

/// Opaque tool reference; resolution happens in the `ToolProvider`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolDescriptor {
    Mcp {
        url: String,
        auth: Option<ToolAuthSpec>,
    },
    Builtin {
        reference: String,
    },
    Custom {
        properties: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolAuthSpec {
    Bearer(String),
    Basic(String),
}

/// A prompt ready to render: template plus modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptSpec {
    pub template: PromptTemplate,
    pub model: Option<String>,
    pub expecting: Option<SchemaRef>,
    pub inherit: Option<String>,
    pub escalation: Option<EscalationSpec>,
    pub span: SpanId,
}

/// Reference to a declared schema; `is_array` corresponds to a `[]` suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaRef {
    pub name: String,
    pub is_array: bool,
}

impl SchemaRef {
    /// Parse `Finding` / `Finding[]` notation.
    pub fn parse(raw: &str) -> SchemaRef {
        match raw.strip_suffix("[]") {
            Some(name) => SchemaRef {
                name: name.to_string(),
                is_array: true,
            },
            None => SchemaRef {
                name: raw.to_string(),
                is_array: false,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationSpec {
    pub op: EscalationOp,
    pub value: String,
}

/// A prompt body split into literal text and `${name}` interpolations.
///
/// Triple-quoted text is preserved verbatim; only explicit `${name}` forms
/// become substitution points.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub segments: Vec<TemplateSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TemplateSegment {
    Text(String),
    Var(String),
}

impl PromptTemplate {
    /// Split a raw body on `${name}` interpolations.
    pub fn parse(body: &str) -> PromptTemplate {
        let mut segments = Vec::new();
        let mut text = String::new();
        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            if chars[i] == '$' && i + 1 < chars.len() && chars[i + 1] == '{' {
                if let Some(close) = chars[i + 2..].iter().position(|&c| c == '}') {
                    let name: String = chars[i + 2..i + 2 + close].iter().collect();
                    let valid = !name.is_empty()
                        && name
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
                    if valid {
                        if !text.is_empty() {
                            segments.push(TemplateSegment::Text(std::mem::take(&mut text)));
                        }
                        segments.push(TemplateSegment::Var(name));
                        i += 2 + close + 1;
                        continue;
                    }
                }
            }
            text.push(chars[i]);
            i += 1;
        }
        if !text.is_empty() {
            segments.push(TemplateSegment::Text(text));
        }
        PromptTemplate { segments }
    }

    /// Render against a variable lookup. Unknown variables render as empty
    /// text.
    pub fn render(&self, lookup: impl Fn(&str) -> Option<String>) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                TemplateSegment::Text(text) => out.push_str(text),
                TemplateSegment::Var(name) => {
                    if let Some(value) = lookup(name) {
                        out.push_str(&value);
                    }
                }
            }
        }
        out
    }

    /// The static text of a template with no interpolations.
    pub fn static_text(&self) -> Option<&str> {
        match self.segments.as_slice() {
            [] => Some(""),
            [TemplateSegment::Text(text)] => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Name of the instruction prompt in `prompts`.
    pub instruction: Option<String>,
    /// Inline instruction body for agents declaring `prompt """..."""`.
    pub inline_instruction: Option<PromptTemplate>,
    pub tools: Vec<String>,
    pub description: Option<String>,
    pub delegate: Vec<String>,
    pub agent_tools: Vec<String>,
    pub history: Option<HistoryStrategy>,
    pub model: Option<String>,
    pub produces: Option<SchemaRef>,
    pub retry: Option<String>,
    pub timeout: Option<String>,
    pub span: SpanId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStrategy {
    Truncate,
    Summarize,
}

impl HistoryStrategy {
    pub fn from_name(name: &str) -> Option<HistoryStrategy> {
        match name {
            "truncate" => Some(HistoryStrategy::Truncate),
            "summarize" => Some(HistoryStrategy::Summarize),
            _ => None,
        }
    }
}

/// An ordered sequence of runtime instructions for one flow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowProgram {
    pub instructions: Vec<Instruction>,
}

/// Runtime instructions, mirroring the statement family of the AST.
///
/// Expressions are carried as AST expression nodes; the interpreter
/// evaluates them strictly, left to right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Assign {
        target: String,
        value: Expr,
        span: SpanId,
    },
    AssignProperty {
        base: String,
        path: Vec<String>,
        value: Expr,
        span: SpanId,
    },
    RunAgent {
        target: Option<String>,
        agent: String,
        input: Option<Expr>,
        on_escalate: Option<EscalationAction>,
        span: SpanId,
    },
    RunFlow {
        target: Option<String>,
        flow: String,
        input: Option<Expr>,
        span: SpanId,
    },
    CallLlm {
        target: Option<String>,
        prompt: String,
        input: Option<Expr>,
        model: Option<String>,
        span: SpanId,
    },
    Return {
        value: Expr,
        span: SpanId,
    },
    Push {
        value: Expr,
        target: String,
        span: SpanId,
    },
    Escalate {
        message: Option<Expr>,
        span: SpanId,
    },
    Log {
        message: Expr,
        span: SpanId,
    },
    Notify {
        message: Expr,
        span: SpanId,
    },
    For {
        variable: String,
        iterable: Expr,
        body: Vec<Instruction>,
        span: SpanId,
    },
    Parallel {
        body: Vec<Instruction>,
        span: SpanId,
    },
    Loop {
        max_iterations: Option<u32>,
        body: Vec<Instruction>,
        span: SpanId,
    },
    Match {
        scrutinee: Expr,
        cases: Vec<MatchArm>,
        else_body: Option<Vec<Instruction>>,
        span: SpanId,
    },
    If {
        condition: Expr,
        body: Vec<Instruction>,
        span: SpanId,
    },
    Failure {
        body: Vec<Instruction>,
        span: SpanId,
    },
    Guardrail {
        action: GuardrailAction,
        span: SpanId,
    },
}

impl Instruction {
    pub fn span(&self) -> SpanId {
        match self {
            Instruction::Assign { span, .. }
            | Instruction::AssignProperty { span, .. }
            | Instruction::RunAgent { span, .. }
            | Instruction::RunFlow { span, .. }
            | Instruction::CallLlm { span, .. }
            | Instruction::Return { span, .. }
            | Instruction::Push { span, .. }
            | Instruction::Escalate { span, .. }
            | Instruction::Log { span, .. }
            | Instruction::Notify { span, .. }
            | Instruction::For { span, .. }
            | Instruction::Parallel { span, .. }
            | Instruction::Loop { span, .. }
            | Instruction::Match { span, .. }
            | Instruction::If { span, .. }
            | Instruction::Failure { span, .. }
            | Instruction::Guardrail { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: String,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EscalationAction {
    Return(Expr),
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GuardrailAction {
    Mask(String),
    BlockIf(String),
    WarnIf(String),
    RetryWith {
        message: Expr,
        condition: Option<Expr>,
    },
}

/// Workflow-scoped history compaction defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionPolicy {
    pub strategy: Option<HistoryStrategy>,
    /// Compact once estimated usage exceeds this share of the input budget.
    pub trigger_token_ratio: Option<f64>,
    pub preserve: Vec<PreserveItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicySpec {
    pub times: u32,
    pub backoff: BackoffSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffSpec {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicySpec {
    pub seconds: u64,
}

/// Compiled `on`/`after` event handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub timing: HandlerTimingSpec,
    pub event: HandlerEventSpec,
    pub body: Vec<Instruction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerTimingSpec {
    On,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerEventSpec {
    Start,
    Input,
    Output,
    ToolCall,
    ToolResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_parse_and_render() {
        let template = PromptTemplate::parse("Review ${goal} carefully.\nContext: ${ctx}");
        assert_eq!(
            template.segments,
            vec![
                TemplateSegment::Text("Review ".into()),
                TemplateSegment::Var("goal".into()),
                TemplateSegment::Text(" carefully.\nContext: ".into()),
                TemplateSegment::Var("ctx".into()),
            ]
        );
        let rendered = template.render(|name| match name {
            "goal" => Some("the diff".to_string()),
            _ => None,
        });
        assert_eq!(rendered, "Review the diff carefully.\nContext: ");
    }

    #[test]
    fn test_template_without_interpolation_is_static() {
        let template = PromptTemplate::parse("You are helpful.");
        assert_eq!(template.static_text(), Some("You are helpful."));
    }

    #[test]
    fn test_template_keeps_bare_dollar_text() {
        let template = PromptTemplate::parse("Costs $5. Use ${x}.");
        assert_eq!(
            template.segments,
            vec![
                TemplateSegment::Text("Costs $5. Use ".into()),
                TemplateSegment::Var("x".into()),
                TemplateSegment::Text(".".into()),
            ]
        );
    }

    #[test]
    fn test_template_rejects_invalid_interpolation_names() {
        let template = PromptTemplate::parse("keep ${not valid} as text");
        assert_eq!(template.static_text(), Some("keep ${not valid} as text"));
    }

    #[test]
    fn test_schema_ref_parsing() {
        assert_eq!(
            SchemaRef::parse("Finding[]"),
            SchemaRef {
                name: "Finding".into(),
                is_array: true
            }
        );
        assert_eq!(
            SchemaRef::parse("Finding"),
            SchemaRef {
                name: "Finding".into(),
                is_array: false
            }
        );
    }
}
