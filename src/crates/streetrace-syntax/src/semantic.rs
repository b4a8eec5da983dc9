//! Semantic analysis: name resolution, prompt merging, scoping checks.
//!
//! A single pass over the AST. Errors accumulate into a [`DiagnosticBatch`];
//! the file only moves on to code generation when the batch stays free of
//! error-severity entries.
//!
//! Prompt forward declarations (`prompt x`) merge with their body-carrying
//! definition here. Anonymous agents are given the name `default`, which is
//! what makes the single-agent entry-point fallback work downstream.

use std::collections::{BTreeMap, HashSet};

use crate::ast::{
    AgentDef, Decl, DslFile, EscalationHandler, Expr, PromptDef, Stmt,
};
use crate::diagnostic::{Diagnostic, DiagnosticBatch, ErrorCode};

/// The variable every flow starts with.
pub const INPUT_PROMPT_VAR: &str = "input_prompt";

/// Analyze a parsed file, returning it with prompts merged and anonymous
/// agents named.
pub fn analyze(file: DslFile) -> Result<DslFile, DiagnosticBatch> {
    let mut analyzer = Analyzer::default();
    let file = analyzer.run(file);
    if analyzer.batch.has_errors() {
        Err(analyzer.batch)
    } else {
        Ok(file)
    }
}

#[derive(Default)]
struct Analyzer {
    batch: DiagnosticBatch,
    models: HashSet<String>,
    schemas: HashSet<String>,
    tools: HashSet<String>,
    prompts: HashSet<String>,
    agents: HashSet<String>,
    flows: HashSet<String>,
    retry_policies: HashSet<String>,
    timeout_policies: HashSet<String>,
}

impl Analyzer {
    fn run(&mut self, file: DslFile) -> DslFile {
        let file = self.merge_prompts(file);
        self.collect_names(&file);
        for decl in &file.decls {
            match decl {
                Decl::Prompt(prompt) => self.check_prompt(prompt),
                Decl::Agent(agent) => self.check_agent(agent),
                Decl::Flow(flow) => self.check_flow_body(&flow.body),
                Decl::EventHandler(handler) => self.check_handler_body(&handler.body),
                _ => {}
            }
        }
        file
    }

    /// Merge `prompt x` declarations with the `prompt x: body` definition,
    /// and name anonymous agents `default`.
    ///
    /// A second body for one prompt is a duplicate definition. Modifiers from
    /// the body-carrying definition win; the declaration fills the gaps.
    fn merge_prompts(&mut self, mut file: DslFile) -> DslFile {
        let mut merged: BTreeMap<String, PromptDef> = BTreeMap::new();
        let mut order: Vec<String> = Vec::new();

        for decl in &file.decls {
            let Decl::Prompt(prompt) = decl else { continue };
            match merged.get_mut(&prompt.name) {
                None => {
                    order.push(prompt.name.clone());
                    merged.insert(prompt.name.clone(), prompt.clone());
                }
                Some(existing) => {
                    if existing.body.is_some() && prompt.body.is_some() {
                        self.batch.push(
                            Diagnostic::error(
                                ErrorCode::DuplicateDefinition,
                                format!("prompt `{}` has more than one body", prompt.name),
                                prompt.span,
                            )
                            .with_label(existing.span, "first body defined here"),
                        );
                        continue;
                    }
                    if prompt.body.is_some() {
                        existing.body = prompt.body.clone();
                    }
                    if existing.model.is_none() {
                        existing.model = prompt.model.clone();
                    }
                    if existing.expecting.is_none() {
                        existing.expecting = prompt.expecting.clone();
                    }
                    if existing.inherit.is_none() {
                        existing.inherit = prompt.inherit.clone();
                    }
                    if existing.escalation.is_none() {
                        existing.escalation = prompt.escalation.clone();
                    }
                }
            }
        }

        // Rebuild the declaration list with each prompt appearing once, at
        // its first position.
        let mut emitted: HashSet<String> = HashSet::new();
        file.decls = file
            .decls
            .into_iter()
            .filter_map(|decl| match decl {
                Decl::Prompt(prompt) => {
                    if emitted.insert(prompt.name.clone()) {
                        Some(Decl::Prompt(merged[&prompt.name].clone()))
                    } else {
                        None
                    }
                }
                Decl::Agent(mut agent) => {
                    if agent.name.is_none() {
                        agent.name = Some("default".to_string());
                    }
                    Some(Decl::Agent(agent))
                }
                other => Some(other),
            })
            .collect();
        file
    }

    fn collect_names(&mut self, file: &DslFile) {
        for decl in &file.decls {
            let (kind, name, set) = match decl {
                Decl::Model(d) => ("model", d.name.clone(), &mut self.models),
                Decl::Schema(d) => ("schema", d.name.clone(), &mut self.schemas),
                Decl::Tool(d) => ("tool", d.name.clone(), &mut self.tools),
                Decl::Prompt(d) => ("prompt", d.name.clone(), &mut self.prompts),
                Decl::Agent(d) => (
                    "agent",
                    d.name.clone().unwrap_or_else(|| "default".to_string()),
                    &mut self.agents,
                ),
                Decl::Flow(d) => ("flow", d.name.clone(), &mut self.flows),
                Decl::RetryPolicy(d) => ("retry policy", d.name.clone(), &mut self.retry_policies),
                Decl::TimeoutPolicy(d) => {
                    ("timeout policy", d.name.clone(), &mut self.timeout_policies)
                }
                Decl::Policy(_) | Decl::Import(_) | Decl::EventHandler(_) => continue,
            };
            if !set.insert(name.clone()) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::DuplicateDefinition,
                    format!("the {kind} `{name}` is defined multiple times"),
                    decl.span(),
                ));
            }
        }
    }

    fn check_prompt(&mut self, prompt: &PromptDef) {
        if let Some(expecting) = &prompt.expecting {
            let base = expecting.strip_suffix("[]").unwrap_or(expecting);
            if !self.schemas.contains(base) {
                self.batch.push(
                    Diagnostic::error(
                        ErrorCode::UnresolvedName,
                        format!("cannot find schema `{base}` in this file"),
                        prompt.span,
                    )
                    .with_help(format!("declare it with `schema {base}:`")),
                );
            }
        }
        if let Some(model) = &prompt.model {
            self.check_model_ref(model, prompt.span);
        }
        if let Some(inherit) = &prompt.inherit {
            if !self.prompts.contains(inherit) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find prompt `{inherit}` to inherit from"),
                    prompt.span,
                ));
            }
        }
    }

    /// A model reference names a declared model or is a `provider/model`
    /// literal.
    fn check_model_ref(&mut self, model: &str, span: crate::source::Span) {
        if !self.models.contains(model) && !model.contains('/') {
            self.batch.push(Diagnostic::error(
                ErrorCode::UnresolvedName,
                format!("cannot find model `{model}` in this file"),
                span,
            ));
        }
    }

    fn check_agent(&mut self, agent: &AgentDef) {
        for tool in &agent.tools {
            if !self.tools.contains(tool) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find tool `{tool}` in this file"),
                    agent.span,
                ));
            }
        }
        if let Some(instruction) = &agent.instruction {
            if !self.prompts.contains(instruction) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find prompt `{instruction}` in this file"),
                    agent.span,
                ));
            }
        }
        if let Some(produces) = &agent.produces {
            let base = produces.strip_suffix("[]").unwrap_or(produces);
            if !self.schemas.contains(base) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find schema `{base}` in this file"),
                    agent.span,
                ));
            }
        }
        if let Some(model) = &agent.model {
            self.check_model_ref(model, agent.span);
        }
        if let Some(retry) = &agent.retry {
            if !self.retry_policies.contains(retry) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find retry policy `{retry}` in this file"),
                    agent.span,
                ));
            }
        }
        if let Some(timeout) = &agent.timeout {
            if !self.timeout_policies.contains(timeout) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find timeout policy `{timeout}` in this file"),
                    agent.span,
                ));
            }
        }
        for peer in agent.delegate.iter().chain(agent.agent_tools.iter()) {
            let is_self = agent.name.as_deref() == Some(peer.as_str());
            if !is_self && !self.agents.contains(peer) {
                self.batch.push(Diagnostic::error(
                    ErrorCode::UnresolvedName,
                    format!("cannot find agent `{peer}` in this file"),
                    agent.span,
                ));
            }
        }
    }

    fn check_flow_body(&mut self, body: &[Stmt]) {
        let mut bound: HashSet<String> = HashSet::new();
        bound.insert(INPUT_PROMPT_VAR.to_string());
        self.check_stmts(body, &mut bound);
    }

    /// Event handler bodies see the same built-ins as flows.
    fn check_handler_body(&mut self, body: &[Stmt]) {
        self.check_flow_body(body);
    }

    fn check_stmts(&mut self, stmts: &[Stmt], bound: &mut HashSet<String>) {
        for stmt in stmts {
            self.check_stmt(stmt, bound);
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt, bound: &mut HashSet<String>) {
        match stmt {
            Stmt::Assignment { target, value, .. } => {
                self.check_expr(value, bound);
                bound.insert(target.clone());
            }
            Stmt::PropertyAssignment {
                base, value, span, ..
            } => {
                if !bound.contains(base) {
                    self.batch.push(
                        Diagnostic::error(
                            ErrorCode::UnresolvedName,
                            format!("cannot assign into `${base}` before it is bound"),
                            *span,
                        )
                        .with_help(format!("assign `${base}` an object first")),
                    );
                }
                self.check_expr(value, bound);
            }
            Stmt::Run(run) => {
                if let Some(input) = &run.input {
                    self.check_expr(input, bound);
                }
                if run.is_flow {
                    if !self.flows.contains(&run.name) {
                        self.batch.push(Diagnostic::error(
                            ErrorCode::UnresolvedName,
                            format!("cannot find flow `{}` in this file", run.name),
                            run.span,
                        ));
                    }
                } else if !self.agents.contains(&run.name) {
                    self.batch.push(Diagnostic::error(
                        ErrorCode::UnresolvedName,
                        format!("cannot find agent `{}` in this file", run.name),
                        run.span,
                    ));
                }
                if let Some(EscalationHandler::Return(expr)) = &run.on_escalate {
                    if run.is_flow {
                        self.batch.push(
                            Diagnostic::error(
                                ErrorCode::BadEscalation,
                                "`on escalate return` is only valid when running an agent",
                                run.span,
                            )
                            .with_help("flows do not raise escalations themselves"),
                        );
                    }
                    self.check_expr(expr, bound);
                }
                if let Some(target) = &run.target {
                    bound.insert(target.clone());
                }
            }
            Stmt::Call(call) => {
                if !self.prompts.contains(&call.prompt) {
                    self.batch.push(Diagnostic::error(
                        ErrorCode::UnresolvedName,
                        format!("cannot find prompt `{}` in this file", call.prompt),
                        call.span,
                    ));
                }
                if let Some(model) = &call.model {
                    self.check_model_ref(model, call.span);
                }
                if let Some(input) = &call.input {
                    self.check_expr(input, bound);
                }
                if let Some(target) = &call.target {
                    bound.insert(target.clone());
                }
            }
            Stmt::Return { value, .. } => self.check_expr(value, bound),
            Stmt::Push {
                value,
                target,
                span,
            } => {
                self.check_expr(value, bound);
                if !bound.contains(target) {
                    self.batch.push(
                        Diagnostic::error(
                            ErrorCode::UnresolvedName,
                            format!("cannot push to `${target}` before it is bound"),
                            *span,
                        )
                        .with_help(format!("initialize it with `${target} = []`")),
                    );
                }
            }
            Stmt::Escalate { message, .. } => {
                if let Some(message) = message {
                    self.check_expr(message, bound);
                }
            }
            Stmt::Log { message, .. } | Stmt::Notify { message, .. } => {
                self.check_expr(message, bound);
            }
            Stmt::For(for_loop) => {
                self.check_expr(&for_loop.iterable, bound);
                bound.insert(for_loop.variable.clone());
                self.check_stmts(&for_loop.body, bound);
            }
            Stmt::Parallel { body, .. } => {
                // Children read a snapshot of the caller scope; sibling
                // writes become visible only after the join.
                let snapshot = bound.clone();
                let mut joined: Vec<String> = Vec::new();
                for child in body {
                    let mut child_scope = snapshot.clone();
                    self.check_stmt(child, &mut child_scope);
                    for name in child_scope.difference(&snapshot) {
                        joined.push(name.clone());
                    }
                }
                bound.extend(joined);
            }
            Stmt::Loop { body, .. } => self.check_stmts(body, bound),
            Stmt::Match(m) => {
                self.check_expr(&m.scrutinee, bound);
                for case in &m.cases {
                    self.check_stmts(&case.body, bound);
                }
                if let Some(else_body) = &m.else_body {
                    self.check_stmts(else_body, bound);
                }
            }
            Stmt::If(if_block) => {
                self.check_expr(&if_block.condition, bound);
                self.check_stmts(&if_block.body, bound);
            }
            Stmt::Failure { body, .. } => self.check_stmts(body, bound),
            Stmt::Mask { .. }
            | Stmt::BlockIf { .. }
            | Stmt::WarnIf { .. } => {}
            Stmt::RetryWith {
                message, condition, ..
            } => {
                self.check_expr(message, bound);
                if let Some(condition) = condition {
                    self.check_expr(condition, bound);
                }
            }
        }
    }

    fn check_expr(&mut self, expr: &Expr, bound: &HashSet<String>) {
        match expr {
            Expr::Var { name, span } => {
                if !bound.contains(name) {
                    self.batch.push(
                        Diagnostic::error(
                            ErrorCode::UnresolvedName,
                            format!("cannot find variable `${name}` in this scope"),
                            *span,
                        )
                        .with_span_label("not bound here"),
                    );
                }
            }
            Expr::Property { base, .. } => self.check_expr(base, bound),
            Expr::Binary { left, right, .. } => {
                self.check_expr(left, bound);
                self.check_expr(right, bound);
            }
            Expr::Unary { operand, .. } => self.check_expr(operand, bound),
            Expr::Call { args, .. } => {
                for arg in args {
                    self.check_expr(arg, bound);
                }
            }
            Expr::List { elements, .. } => {
                for element in elements {
                    self.check_expr(element, bound);
                }
            }
            Expr::Object { entries, .. } => {
                for (_, value) in entries {
                    self.check_expr(value, bound);
                }
            }
            Expr::Filter { list, condition, .. } => {
                self.check_expr(list, bound);
                self.check_expr(condition, bound);
            }
            // Bare names may reference declarations or ambient values
            // (e.g. `token_usage` in policy triggers); they resolve late.
            Expr::Name { .. } | Expr::ImplicitProperty { .. } | Expr::Literal { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn analyze_src(source: &str) -> Result<DslFile, DiagnosticBatch> {
        analyze(parse(source).expect("parse"))
    }

    fn first_error(source: &str) -> Diagnostic {
        analyze_src(source)
            .expect_err("expected analysis errors")
            .diagnostics
            .into_iter()
            .next()
            .unwrap()
    }

    #[test]
    fn test_duplicate_model_is_rejected() {
        let err = first_error("model m = openai/gpt-4\nmodel m = openai/gpt-4\n");
        assert_eq!(err.code, ErrorCode::DuplicateDefinition);
    }

    #[test]
    fn test_same_name_different_kinds_is_fine() {
        let source = "
model triage = openai/gpt-4
flow triage:
    return \"ok\"
";
        assert!(analyze_src(source).is_ok());
    }

    #[test]
    fn test_prompt_forward_declaration_merges() {
        let source = "prompt p
prompt p expecting F[]: \"\"\"body\"\"\"

schema F:
    title: string
";
        let file = analyze_src(source).expect("analyze");
        let prompts: Vec<_> = file
            .decls
            .iter()
            .filter_map(|d| match d {
                Decl::Prompt(p) => Some(p),
                _ => None,
            })
            .collect();
        assert_eq!(prompts.len(), 1);
        assert_eq!(prompts[0].body.as_deref(), Some("body"));
        assert_eq!(prompts[0].expecting.as_deref(), Some("F[]"));
    }

    #[test]
    fn test_two_prompt_bodies_are_duplicate() {
        let source = "prompt p: \"\"\"one\"\"\"
prompt p: \"\"\"two\"\"\"
";
        let err = first_error(source);
        assert_eq!(err.code, ErrorCode::DuplicateDefinition);
        assert!(err.message.contains("more than one body"));
    }

    #[test]
    fn test_unresolved_schema_in_expecting() {
        let err = first_error("prompt p expecting Missing: \"\"\"x\"\"\"\n");
        assert_eq!(err.code, ErrorCode::UnresolvedName);
        assert!(err.message.contains("Missing"));
    }

    #[test]
    fn test_unresolved_tool_in_agent() {
        let err = first_error("prompt p: \"\"\"x\"\"\"\nagent: tools ghost; instruction p\n");
        assert_eq!(err.code, ErrorCode::UnresolvedName);
        assert!(err.message.contains("ghost"));
    }

    #[test]
    fn test_provider_model_literal_is_valid_model_ref() {
        let source = "prompt p using model \"anthropic/claude-haiku\": \"\"\"x\"\"\"\n";
        assert!(analyze_src(source).is_ok());
    }

    #[test]
    fn test_named_model_ref_must_exist() {
        let err = first_error("prompt p using model \"compact\": \"\"\"x\"\"\"\n");
        assert_eq!(err.code, ErrorCode::UnresolvedName);
    }

    #[test]
    fn test_unbound_variable_in_flow() {
        let source = "
flow main:
    return $never_set
";
        let err = first_error(source);
        assert_eq!(err.code, ErrorCode::UnresolvedName);
        assert!(err.message.contains("never_set"));
    }

    #[test]
    fn test_input_prompt_is_builtin() {
        let source = "
flow main:
    return $input_prompt
";
        assert!(analyze_src(source).is_ok());
    }

    #[test]
    fn test_property_assignment_requires_bound_base() {
        let source = "
flow main:
    $report.status = \"done\"
";
        let err = first_error(source);
        assert_eq!(err.code, ErrorCode::UnresolvedName);
    }

    #[test]
    fn test_push_requires_bound_list() {
        let source = "
flow main:
    push 1 to $items
";
        let err = first_error(source);
        assert!(err.message.contains("push"));
    }

    #[test]
    fn test_run_agent_must_resolve() {
        let source = "
flow main:
    run agent nobody
";
        let err = first_error(source);
        assert_eq!(err.code, ErrorCode::UnresolvedName);
        assert!(err.message.contains("agent `nobody`"));
    }

    #[test]
    fn test_escalate_return_on_flow_is_bad_escalation() {
        let source = "
flow helper:
    return \"x\"

flow main:
    $r = run helper with $input_prompt, on escalate return $r
";
        let batch = analyze_src(source).expect_err("expected error");
        assert!(batch
            .diagnostics
            .iter()
            .any(|d| d.code == ErrorCode::BadEscalation));
    }

    #[test]
    fn test_for_loop_binds_iteration_variable() {
        let source = "
flow main:
    $items = [1, 2]
    $out = []
    for $item in $items do
        push $item to $out
    end
    return $out
";
        assert!(analyze_src(source).is_ok());
    }

    #[test]
    fn test_parallel_children_do_not_see_sibling_writes() {
        let source = "
flow main:
    $q = \"query\"
    parallel do
        $a = run agent web with $q
        $b = run agent doc with $a
    end
    return $b
prompt p: \"\"\"x\"\"\"
agent web: instruction p
agent doc: instruction p
";
        let batch = analyze_src(source).expect_err("expected error");
        assert!(batch
            .diagnostics
            .iter()
            .any(|d| d.message.contains("$a") || d.message.contains("`a`")));
    }

    #[test]
    fn test_parallel_targets_visible_after_join() {
        let source = "
prompt p: \"\"\"x\"\"\"
agent web: instruction p
agent doc: instruction p

flow main:
    $q = \"query\"
    parallel do
        $a = run agent web with $q
        $b = run agent doc with $q
    end
    return $a
";
        assert!(analyze_src(source).is_ok());
    }

    #[test]
    fn test_anonymous_agent_becomes_default() {
        let source = "prompt greet: \"\"\"Say hello.\"\"\"\nagent: instruction greet\n";
        let file = analyze_src(source).expect("analyze");
        let agent = file
            .decls
            .iter()
            .find_map(|d| match d {
                Decl::Agent(a) => Some(a),
                _ => None,
            })
            .unwrap();
        assert_eq!(agent.name.as_deref(), Some("default"));
    }
}
