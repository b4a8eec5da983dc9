//! Typed AST for the DSL.
//!
//! Closed sum types for the three node families (declarations, statements,
//! expressions). Every node records the source span of its leftmost to
//! rightmost tokens. Nodes serialize with serde so determinism tests can
//! compare whole files byte-for-byte.

use serde::{Deserialize, Serialize};

use crate::source::Span;

/// Root node: one parsed `.sr` file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DslFile {
    pub version: Option<VersionDecl>,
    pub decls: Vec<Decl>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionDecl {
    pub version: String,
    pub span: Span,
}

/// Top-level declarations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Decl {
    Import(ImportStmt),
    Model(ModelDef),
    Schema(SchemaDef),
    Tool(ToolDef),
    Prompt(PromptDef),
    Agent(AgentDef),
    Flow(FlowDef),
    Policy(PolicyDef),
    RetryPolicy(RetryPolicyDef),
    TimeoutPolicy(TimeoutPolicyDef),
    EventHandler(EventHandler),
}

impl Decl {
    pub fn span(&self) -> Span {
        match self {
            Decl::Import(d) => d.span,
            Decl::Model(d) => d.span,
            Decl::Schema(d) => d.span,
            Decl::Tool(d) => d.span,
            Decl::Prompt(d) => d.span,
            Decl::Agent(d) => d.span,
            Decl::Flow(d) => d.span,
            Decl::Policy(d) => d.span,
            Decl::RetryPolicy(d) => d.span,
            Decl::TimeoutPolicy(d) => d.span,
            Decl::EventHandler(d) => d.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStmt {
    pub kind: ImportKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ImportKind {
    /// `import base from streetrace`
    Streetrace { name: String },
    /// `import ./custom_agent.sr`
    Local { path: String },
    /// `import lib from pip://third_party`
    Pip { name: String, uri: String },
    /// `import gh from mcp://api.github.com`
    Mcp { name: String, uri: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    /// Short form `model n = provider/model`.
    pub provider_model: Option<String>,
    /// Long form key/value body, in source order.
    pub properties: Vec<(String, LiteralValue)>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDef {
    pub name: String,
    pub fields: Vec<SchemaField>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaField {
    pub name: String,
    pub ty: TypeExpr,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeExpr {
    pub base: BaseType,
    pub is_list: bool,
    pub is_optional: bool,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BaseType {
    Bool,
    Int,
    Float,
    String,
    Object,
}

impl BaseType {
    pub fn from_name(name: &str) -> Option<BaseType> {
        match name {
            "bool" => Some(BaseType::Bool),
            "int" => Some(BaseType::Int),
            "float" => Some(BaseType::Float),
            "string" => Some(BaseType::String),
            "object" => Some(BaseType::Object),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub kind: ToolKind,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolKind {
    /// `tool gh = mcp "https://..." with auth bearer "token"`
    Mcp { url: String, auth: Option<ToolAuth> },
    /// `tool fs = builtin streetrace.fs`
    Builtin { reference: String },
    /// Long form `tool name:` with a key/value body.
    Custom { properties: Vec<(String, LiteralValue)> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ToolAuth {
    Bearer(String),
    Basic(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptDef {
    pub name: String,
    /// None for forward declarations (`prompt x`); merged by the semantic
    /// analyzer with the body-carrying definition.
    pub body: Option<String>,
    pub model: Option<String>,
    /// Expected schema name; `[]` suffix marks an array.
    pub expecting: Option<String>,
    pub inherit: Option<String>,
    pub escalation: Option<EscalationCondition>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationCondition {
    pub op: EscalationOp,
    pub value: String,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationOp {
    /// `~` — compare after normalization.
    Normalized,
    Eq,
    Ne,
    Contains,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDef {
    /// None for the anonymous single-agent form.
    pub name: Option<String>,
    pub tools: Vec<String>,
    pub instruction: Option<String>,
    /// Inline `prompt """..."""` body inside the agent block.
    pub inline_prompt: Option<String>,
    pub produces: Option<String>,
    pub description: Option<String>,
    /// `history truncate` / `history summarize`.
    pub history: Option<String>,
    pub model: Option<String>,
    pub retry: Option<String>,
    pub timeout: Option<String>,
    /// `delegate a, b` — delegated sub-agents.
    pub delegate: Vec<String>,
    /// `use agents a, b` — agents exposed to this agent as tools.
    pub agent_tools: Vec<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDef {
    pub name: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDef {
    pub name: String,
    pub trigger: Option<Expr>,
    pub strategy: Option<String>,
    pub preserve: Vec<PreserveItem>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PreserveItem {
    /// `$goal`
    Var(String),
    /// `last 5 messages`
    LastMessages(u32),
    /// `tool results`
    ToolResults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyDef {
    pub name: String,
    pub times: u32,
    pub backoff: BackoffKind,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Exponential,
    Linear,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicyDef {
    pub name: String,
    pub value: u64,
    pub unit: TimeUnit,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
}

impl TimeUnit {
    pub fn to_seconds(self, value: u64) -> u64 {
        match self {
            TimeUnit::Seconds => value,
            TimeUnit::Minutes => value * 60,
            TimeUnit::Hours => value * 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHandler {
    pub timing: HandlerTiming,
    pub event: HandlerEvent,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandlerTiming {
    On,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerEvent {
    Start,
    Input,
    Output,
    ToolCall,
    ToolResult,
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `$x = expr`
    Assignment {
        target: String,
        value: Expr,
        span: Span,
    },
    /// `$x.a.b = expr`
    PropertyAssignment {
        base: String,
        path: Vec<String>,
        value: Expr,
        span: Span,
    },
    Run(RunStmt),
    Call(CallStmt),
    Return {
        value: Expr,
        span: Span,
    },
    /// `push expr to $list`
    Push {
        value: Expr,
        target: String,
        span: Span,
    },
    Escalate {
        message: Option<Expr>,
        span: Span,
    },
    Log {
        message: Expr,
        span: Span,
    },
    Notify {
        message: Expr,
        span: Span,
    },
    For(ForLoop),
    Parallel {
        body: Vec<Stmt>,
        span: Span,
    },
    /// `loop [max N] do ... end`
    Loop {
        max_iterations: Option<u32>,
        body: Vec<Stmt>,
        span: Span,
    },
    Match(MatchBlock),
    If(IfBlock),
    /// `failure do ... end` — runs when the preceding statement failed
    /// recoverably.
    Failure {
        body: Vec<Stmt>,
        span: Span,
    },
    /// `mask pii`
    Mask {
        target: String,
        span: Span,
    },
    /// `block if jailbreak`
    BlockIf {
        condition: String,
        span: Span,
    },
    /// `warn if drift`
    WarnIf {
        condition: String,
        span: Span,
    },
    /// `retry with expr [if cond]`
    RetryWith {
        message: Expr,
        condition: Option<Expr>,
        span: Span,
    },
}

impl Stmt {
    pub fn span(&self) -> Span {
        match self {
            Stmt::Assignment { span, .. }
            | Stmt::PropertyAssignment { span, .. }
            | Stmt::Return { span, .. }
            | Stmt::Push { span, .. }
            | Stmt::Escalate { span, .. }
            | Stmt::Log { span, .. }
            | Stmt::Notify { span, .. }
            | Stmt::Parallel { span, .. }
            | Stmt::Loop { span, .. }
            | Stmt::Failure { span, .. }
            | Stmt::Mask { span, .. }
            | Stmt::BlockIf { span, .. }
            | Stmt::WarnIf { span, .. }
            | Stmt::RetryWith { span, .. } => *span,
            Stmt::Run(s) => s.span,
            Stmt::Call(s) => s.span,
            Stmt::For(s) => s.span,
            Stmt::Match(s) => s.span,
            Stmt::If(s) => s.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStmt {
    /// Assignment target variable, without `$`.
    pub target: Option<String>,
    /// Agent or flow name.
    pub name: String,
    pub is_flow: bool,
    /// `with <expr>`; defaults to `$input_prompt` at execution time.
    pub input: Option<Expr>,
    pub on_escalate: Option<EscalationHandler>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EscalationHandler {
    Return(Expr),
    Continue,
    Abort,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallStmt {
    pub target: Option<String>,
    pub prompt: String,
    pub input: Option<Expr>,
    pub model: Option<String>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForLoop {
    pub variable: String,
    pub iterable: Expr,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchBlock {
    pub scrutinee: Expr,
    pub cases: Vec<MatchCase>,
    pub else_body: Option<Vec<Stmt>>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: String,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IfBlock {
    pub condition: Expr,
    pub body: Vec<Stmt>,
    pub span: Span,
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Literal {
        value: LiteralValue,
        span: Span,
    },
    /// `$name`
    Var {
        name: String,
        span: Span,
    },
    /// `$var.a.b` or `name.a.b`
    Property {
        base: Box<Expr>,
        path: Vec<String>,
        span: Span,
    },
    /// Bare reference to a declaration or variable.
    Name {
        name: String,
        span: Span,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
        span: Span,
    },
    Unary {
        op: UnOp,
        operand: Box<Expr>,
        span: Span,
    },
    Call {
        name: String,
        args: Vec<Expr>,
        span: Span,
    },
    List {
        elements: Vec<Expr>,
        span: Span,
    },
    Object {
        entries: Vec<(String, Expr)>,
        span: Span,
    },
    /// `filter $list where .prop OP value`
    Filter {
        list: Box<Expr>,
        condition: Box<Expr>,
        span: Span,
    },
    /// `.prop` inside a filter condition, bound to the iterating element.
    ImplicitProperty {
        path: Vec<String>,
        span: Span,
    },
}

impl Expr {
    pub fn span(&self) -> Span {
        match self {
            Expr::Literal { span, .. }
            | Expr::Var { span, .. }
            | Expr::Property { span, .. }
            | Expr::Name { span, .. }
            | Expr::Binary { span, .. }
            | Expr::Unary { span, .. }
            | Expr::Call { span, .. }
            | Expr::List { span, .. }
            | Expr::Object { span, .. }
            | Expr::Filter { span, .. }
            | Expr::ImplicitProperty { span, .. } => *span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiteralValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Not,
    Neg,
}
