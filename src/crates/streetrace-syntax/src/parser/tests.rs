use crate::ast::*;
use crate::parser::parse;

fn decls_of(source: &str) -> Vec<Decl> {
    parse(source).expect("parse").decls
}

fn models(decls: &[Decl]) -> Vec<&ModelDef> {
    decls
        .iter()
        .filter_map(|d| match d {
            Decl::Model(m) => Some(m),
            _ => None,
        })
        .collect()
}

fn flows(decls: &[Decl]) -> Vec<&FlowDef> {
    decls
        .iter()
        .filter_map(|d| match d {
            Decl::Flow(f) => Some(f),
            _ => None,
        })
        .collect()
}

#[test]
fn test_parses_minimal_agent() {
    let source = r#"
model main = anthropic/claude-sonnet

agent:
    tools github
    instruction my_prompt

prompt my_prompt: """
You are helpful.
"""
"#;
    let file = parse(source).expect("parse");
    assert!(file.version.is_none());

    let ms = models(&file.decls);
    assert_eq!(ms.len(), 1);
    assert_eq!(ms[0].name, "main");
    assert_eq!(ms[0].provider_model.as_deref(), Some("anthropic/claude-sonnet"));

    let agents: Vec<_> = file
        .decls
        .iter()
        .filter_map(|d| match d {
            Decl::Agent(a) => Some(a),
            _ => None,
        })
        .collect();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].name, None);
    assert_eq!(agents[0].tools, vec!["github"]);
    assert_eq!(agents[0].instruction.as_deref(), Some("my_prompt"));

    let prompts: Vec<_> = file
        .decls
        .iter()
        .filter_map(|d| match d {
            Decl::Prompt(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(prompts.len(), 1);
    assert_eq!(prompts[0].name, "my_prompt");
    assert_eq!(prompts[0].body.as_deref(), Some("You are helpful."));
}

#[test]
fn test_parses_version_declaration() {
    let file = parse("streetrace v1.2\n\nmodel main = openai/gpt-4\n").expect("parse");
    assert_eq!(file.version.as_ref().map(|v| v.version.as_str()), Some("v1.2"));
}

#[test]
fn test_parses_model_long_form() {
    let source = "
model main:
    provider: anthropic
    name: claude-sonnet
    temperature: 0.7
    max_tokens: 4096
";
    let decls = decls_of(source);
    let ms = models(&decls);
    assert_eq!(ms.len(), 1);
    assert_eq!(ms[0].name, "main");
    assert!(ms[0].provider_model.is_none());
    assert_eq!(
        ms[0].properties[0],
        ("provider".to_string(), LiteralValue::Str("anthropic".into()))
    );
    assert!(ms[0]
        .properties
        .iter()
        .any(|(k, v)| k == "temperature" && *v == LiteralValue::Float(0.7)));
}

#[test]
fn test_parses_schema_definition() {
    let source = "
schema ReviewResult:
    approved: bool
    comments: list[string]
    severity: string?
";
    let decls = decls_of(source);
    let schema = match &decls[0] {
        Decl::Schema(s) => s,
        other => panic!("expected schema, got {other:?}"),
    };
    assert_eq!(schema.name, "ReviewResult");
    assert_eq!(schema.fields.len(), 3);

    let approved = &schema.fields[0];
    assert_eq!(approved.name, "approved");
    assert_eq!(approved.ty.base, BaseType::Bool);
    assert!(!approved.ty.is_list);

    let comments = &schema.fields[1];
    assert_eq!(comments.ty.base, BaseType::String);
    assert!(comments.ty.is_list);

    let severity = &schema.fields[2];
    assert_eq!(severity.ty.base, BaseType::String);
    assert!(severity.ty.is_optional);
}

#[test]
fn test_parses_tool_mcp_short_form() {
    let decls =
        decls_of("tool github = mcp \"https://api.github.com\" with auth bearer \"token\"\n");
    let tool = match &decls[0] {
        Decl::Tool(t) => t,
        other => panic!("expected tool, got {other:?}"),
    };
    assert_eq!(tool.name, "github");
    assert_eq!(
        tool.kind,
        ToolKind::Mcp {
            url: "https://api.github.com".into(),
            auth: Some(ToolAuth::Bearer("token".into())),
        }
    );
}

#[test]
fn test_parses_tool_builtin() {
    let decls = decls_of("tool fs = builtin streetrace.fs\n");
    let tool = match &decls[0] {
        Decl::Tool(t) => t,
        other => panic!("expected tool, got {other:?}"),
    };
    assert_eq!(tool.name, "fs");
    assert_eq!(
        tool.kind,
        ToolKind::Builtin {
            reference: "streetrace.fs".into()
        }
    );
}

#[test]
fn test_parses_import_statements() {
    let source = "import base from streetrace
import ./custom_agent.sr
import lib from pip://third_party
";
    let decls = decls_of(source);
    let imports: Vec<_> = decls
        .iter()
        .filter_map(|d| match d {
            Decl::Import(i) => Some(&i.kind),
            _ => None,
        })
        .collect();
    assert_eq!(imports.len(), 3);
    assert_eq!(imports[0], &ImportKind::Streetrace { name: "base".into() });
    assert_eq!(
        imports[1],
        &ImportKind::Local {
            path: "./custom_agent.sr".into()
        }
    );
    assert_eq!(
        imports[2],
        &ImportKind::Pip {
            name: "lib".into(),
            uri: "pip://third_party".into()
        }
    );
}

#[test]
fn test_parses_retry_policy() {
    let decls = decls_of("retry default = 3 times, exponential backoff\n");
    let policy = match &decls[0] {
        Decl::RetryPolicy(p) => p,
        other => panic!("expected retry policy, got {other:?}"),
    };
    assert_eq!(policy.name, "default");
    assert_eq!(policy.times, 3);
    assert_eq!(policy.backoff, BackoffKind::Exponential);
}

#[test]
fn test_parses_timeout_policy() {
    let decls = decls_of("timeout default = 2 minutes\n");
    let policy = match &decls[0] {
        Decl::TimeoutPolicy(p) => p,
        other => panic!("expected timeout policy, got {other:?}"),
    };
    assert_eq!(policy.name, "default");
    assert_eq!(policy.value, 2);
    assert_eq!(policy.unit, TimeUnit::Minutes);
}

#[test]
fn test_parses_event_handler() {
    let source = "
on input do
    mask pii
    block if jailbreak
end
";
    let decls = decls_of(source);
    let handler = match &decls[0] {
        Decl::EventHandler(h) => h,
        other => panic!("expected handler, got {other:?}"),
    };
    assert_eq!(handler.timing, HandlerTiming::On);
    assert_eq!(handler.event, HandlerEvent::Input);
    assert_eq!(handler.body.len(), 2);
    assert!(matches!(&handler.body[0], Stmt::Mask { target, .. } if target == "pii"));
    assert!(matches!(&handler.body[1], Stmt::BlockIf { condition, .. } if condition == "jailbreak"));
}

#[test]
fn test_parses_flow_with_control_structures() {
    let source = "
flow process_items:
    $results = []
    for $item in $items do
        $result = run agent process_item with $item
        push $result to $results
    end
    return $results
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    assert_eq!(flow.name, "process_items");
    assert_eq!(flow.body.len(), 3);

    let for_loop = match &flow.body[1] {
        Stmt::For(f) => f,
        other => panic!("expected for loop, got {other:?}"),
    };
    assert_eq!(for_loop.variable, "item");
    assert_eq!(for_loop.body.len(), 2);
    assert!(matches!(&for_loop.body[1], Stmt::Push { target, .. } if target == "results"));
    assert!(matches!(&flow.body[2], Stmt::Return { .. }));
}

#[test]
fn test_parses_prompt_with_modifiers() {
    let source = "prompt analyze_goal using model \"compact\" expecting GoalAnalysis: \"\"\"
You are a work analyst.
\"\"\"
";
    let decls = decls_of(source);
    let prompt = match &decls[0] {
        Decl::Prompt(p) => p,
        other => panic!("expected prompt, got {other:?}"),
    };
    assert_eq!(prompt.name, "analyze_goal");
    assert_eq!(prompt.model.as_deref(), Some("compact"));
    assert_eq!(prompt.expecting.as_deref(), Some("GoalAnalysis"));
}

#[test]
fn test_parses_prompt_with_array_schema_and_escalation() {
    let decls = decls_of("prompt p expecting Finding[] escalate if ~ \"DONE\"\n");
    let prompt = match &decls[0] {
        Decl::Prompt(p) => p,
        other => panic!("expected prompt, got {other:?}"),
    };
    assert_eq!(prompt.expecting.as_deref(), Some("Finding[]"));
    let esc = prompt.escalation.as_ref().expect("escalation");
    assert_eq!(esc.op, EscalationOp::Normalized);
    assert_eq!(esc.value, "DONE");
    assert!(prompt.body.is_none());
}

#[test]
fn test_parses_escalation_operators() {
    for (src, op) in [
        ("prompt p escalate if == \"FATAL\"\n", EscalationOp::Eq),
        ("prompt p escalate if != \"OK\"\n", EscalationOp::Ne),
        (
            "prompt p escalate if contains \"SKIP\"\n",
            EscalationOp::Contains,
        ),
    ] {
        let decls = decls_of(src);
        let prompt = match &decls[0] {
            Decl::Prompt(p) => p,
            other => panic!("expected prompt, got {other:?}"),
        };
        assert_eq!(prompt.escalation.as_ref().unwrap().op, op);
    }
}

#[test]
fn test_parses_match_block() {
    let source = "
flow handle_type:
    match $item.type
        when \"standard\" -> run agent process_standard with $item
        when \"expedited\" -> run agent process_expedited with $item
        else -> log \"Unknown type\"
    end
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let match_block = match &flow.body[0] {
        Stmt::Match(m) => m,
        other => panic!("expected match, got {other:?}"),
    };
    assert_eq!(match_block.cases.len(), 2);
    assert_eq!(match_block.cases[0].pattern, "standard");
    assert!(match_block.else_body.is_some());
}

#[test]
fn test_parses_parallel_block() {
    let source = "
flow parallel_search:
    parallel do
        $web_results = run agent web_search with $topic
        $doc_results = run agent doc_search with $topic
    end
    return $web_results
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let body = match &flow.body[0] {
        Stmt::Parallel { body, .. } => body,
        other => panic!("expected parallel, got {other:?}"),
    };
    assert_eq!(body.len(), 2);
    let first = match &body[0] {
        Stmt::Run(r) => r,
        other => panic!("expected run, got {other:?}"),
    };
    assert_eq!(first.target.as_deref(), Some("web_results"));
    assert_eq!(first.name, "web_search");
    assert!(!first.is_flow);
}

#[test]
fn test_parses_run_with_escalation_handlers() {
    let source = "
flow main:
    $c = \"initial\"
    $c = run agent peer1 with $c, on escalate return $c
    return $c
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let run = match &flow.body[1] {
        Stmt::Run(r) => r,
        other => panic!("expected run, got {other:?}"),
    };
    assert_eq!(run.target.as_deref(), Some("c"));
    assert!(matches!(run.on_escalate, Some(EscalationHandler::Return(_))));

    let source = "
flow main:
    run agent a with $x, on escalate continue
    run agent b, on escalate abort
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let first = match &flow.body[0] {
        Stmt::Run(r) => r,
        other => panic!("expected run, got {other:?}"),
    };
    assert!(matches!(first.on_escalate, Some(EscalationHandler::Continue)));
    let second = match &flow.body[1] {
        Stmt::Run(r) => r,
        other => panic!("expected run, got {other:?}"),
    };
    assert!(second.input.is_none());
    assert!(matches!(second.on_escalate, Some(EscalationHandler::Abort)));
}

#[test]
fn test_parses_run_flow_form() {
    let source = "
flow main:
    $r = run triage with $input_prompt
    run cleanup
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let first = match &flow.body[0] {
        Stmt::Run(r) => r,
        other => panic!("expected run, got {other:?}"),
    };
    assert!(first.is_flow);
    assert_eq!(first.name, "triage");
    let second = match &flow.body[1] {
        Stmt::Run(r) => r,
        other => panic!("expected run, got {other:?}"),
    };
    assert!(second.is_flow);
    assert_eq!(second.name, "cleanup");
}

#[test]
fn test_parses_call_llm() {
    let source = "
flow main:
    $t = call llm analyze with $input_prompt using model \"compact\"
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let call = match &flow.body[0] {
        Stmt::Call(c) => c,
        other => panic!("expected call, got {other:?}"),
    };
    assert_eq!(call.target.as_deref(), Some("t"));
    assert_eq!(call.prompt, "analyze");
    assert_eq!(call.model.as_deref(), Some("compact"));
}

#[test]
fn test_parses_filter_expression() {
    let source = "
flow main:
    $picked = filter $results where .severity == \"high\"
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    let value = match &flow.body[0] {
        Stmt::Assignment { value, .. } => value,
        other => panic!("expected assignment, got {other:?}"),
    };
    let (list, condition) = match value {
        Expr::Filter { list, condition, .. } => (list, condition),
        other => panic!("expected filter, got {other:?}"),
    };
    assert!(matches!(&**list, Expr::Var { name, .. } if name == "results"));
    match &**condition {
        Expr::Binary { op: BinOp::Eq, left, .. } => {
            assert!(matches!(&**left, Expr::ImplicitProperty { path, .. } if path == &vec!["severity".to_string()]));
        }
        other => panic!("expected comparison, got {other:?}"),
    }
}

#[test]
fn test_parses_property_assignment() {
    let source = "
flow main:
    $report.status = \"done\"
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    match &flow.body[0] {
        Stmt::PropertyAssignment { base, path, .. } => {
            assert_eq!(base, "report");
            assert_eq!(path, &vec!["status".to_string()]);
        }
        other => panic!("expected property assignment, got {other:?}"),
    }
}

#[test]
fn test_parses_loop_with_and_without_max() {
    let source = "
flow main:
    loop max 3 do
        run agent a
    end
    loop do
        run agent b
    end
";
    let decls = decls_of(source);
    let flow = flows(&decls)[0];
    assert!(matches!(
        &flow.body[0],
        Stmt::Loop {
            max_iterations: Some(3),
            ..
        }
    ));
    assert!(matches!(
        &flow.body[1],
        Stmt::Loop {
            max_iterations: None,
            ..
        }
    ));
}

#[test]
fn test_parses_agent_short_form() {
    let decls = decls_of("agent: tools fs; instruction greet\n");
    let agent = match &decls[0] {
        Decl::Agent(a) => a,
        other => panic!("expected agent, got {other:?}"),
    };
    assert_eq!(agent.name, None);
    assert_eq!(agent.tools, vec!["fs"]);
    assert_eq!(agent.instruction.as_deref(), Some("greet"));
}

#[test]
fn test_parses_agent_block_form_full() {
    let source = "
agent reviewer:
    tools github, fs
    instruction analyze
    description \"Reviews changes\"
    history truncate
    model compact
    use agents helper
";
    let decls = decls_of(source);
    let agent = match &decls[0] {
        Decl::Agent(a) => a,
        other => panic!("expected agent, got {other:?}"),
    };
    assert_eq!(agent.name.as_deref(), Some("reviewer"));
    assert_eq!(agent.tools, vec!["github", "fs"]);
    assert_eq!(agent.history.as_deref(), Some("truncate"));
    assert_eq!(agent.model.as_deref(), Some("compact"));
    assert_eq!(agent.agent_tools, vec!["helper"]);
}

#[test]
fn test_parses_policy_with_preserve() {
    let source = "
policy compaction:
    trigger: token_usage > 0.8
    strategy: summarize
    preserve: $goal, last 5 messages, tool results
";
    let decls = decls_of(source);
    let policy = match &decls[0] {
        Decl::Policy(p) => p,
        other => panic!("expected policy, got {other:?}"),
    };
    assert_eq!(policy.strategy.as_deref(), Some("summarize"));
    assert!(policy.trigger.is_some());
    assert_eq!(
        policy.preserve,
        vec![
            PreserveItem::Var("goal".into()),
            PreserveItem::LastMessages(5),
            PreserveItem::ToolResults,
        ]
    );
}

#[test]
fn test_all_nodes_carry_source_positions() {
    let source = "
model main = anthropic/claude-sonnet

flow main:
    $x = 1
    return $x
";
    let file = parse(source).expect("parse");
    let model_span = file.decls[0].span();
    assert_eq!(model_span.line, 2);
    assert_eq!(model_span.column, 1);
    let flow = flows(&file.decls)[0];
    assert!(flow.span.line >= 4);
    for stmt in &flow.body {
        assert!(stmt.span().line >= 5);
    }
}

#[test]
fn test_parse_error_reports_span() {
    let err = parse("model = anthropic/claude\n").unwrap_err();
    assert_eq!(err.code, crate::diagnostic::ErrorCode::ParseError);
    assert_eq!(err.span.line, 1);
}

#[test]
fn test_parse_is_deterministic() {
    let source = "
flow main:
    $items = [\"a\", \"b\"]
    for $item in $items do
        $r = run agent worker with $item, on escalate continue
        push $r to $out
    end
    return $out
";
    let a = parse(source).expect("parse");
    let b = parse(source).expect("parse");
    assert_eq!(a, b);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}
