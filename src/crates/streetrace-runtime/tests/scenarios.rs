//! End-to-end workflow scenarios against a scripted LLM client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use streetrace_compiler::compile_source;
use streetrace_runtime::testing::{InMemorySessionStore, NullToolProvider, StaticLlmClient};
use streetrace_runtime::SessionStore;
use streetrace_runtime::{
    ErrorKind, Event, LlmChunk, LlmClient, LlmStream, Message, Result, Session, WorkflowRuntime,
};

async fn run_to_completion(
    source: &str,
    client: Arc<StaticLlmClient>,
    message: &str,
) -> Vec<Event> {
    let workflow = Arc::new(compile_source(source).expect("compile"));
    let store = Arc::new(InMemorySessionStore::new());
    store
        .create("test", "user", "s1", Value::Null)
        .await
        .expect("create session");
    let runtime = WorkflowRuntime::new(
        workflow,
        client,
        Arc::new(NullToolProvider),
        store.clone(),
    );
    let mut stream = runtime.run_async(Session::new("test", "user", "s1"), message);
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }
    runtime.close().await;
    events
}

async fn create_store() -> Arc<InMemorySessionStore> {
    let store = Arc::new(InMemorySessionStore::new());
    store
        .create("test", "user", "s1", Value::Null)
        .await
        .expect("create session");
    store
}

fn final_result(events: &[Event]) -> &Value {
    match events.last() {
        Some(Event::FlowResult { result, .. }) => result,
        other => panic!("expected FlowResult terminal event, got {other:?}"),
    }
}

// S1: minimal agent echo.
#[tokio::test]
async fn test_minimal_agent_echo() {
    let source = r#"
model main = anthropic/claude-sonnet

tool fs = builtin streetrace.fs

prompt greet: """Say hello."""

agent: tools fs; instruction greet
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["hello"]));
    let events = run_to_completion(source, client.clone(), "hi").await;

    assert_eq!(final_result(&events), &json!("hello"));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::AgentCall { agent, input, .. } if agent == "default" && input == "hi")));
    let invocation = &client.invocations()[0];
    assert_eq!(invocation.model_id, "anthropic/claude-sonnet");
    assert_eq!(invocation.messages[0].content, "Say hello.");
}

// S2: escalation with `on escalate return`.
#[tokio::test]
async fn test_escalation_with_return() {
    let source = r#"
model main = openai/gpt-4

prompt p escalate if ~ "DONE": """Keep working."""

agent peer1: instruction p

flow main:
    $c = "initial"
    $c = run agent peer1 with $c, on escalate return $c
    return $c
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["**Done.**"]));
    let events = run_to_completion(source, client, "go").await;

    assert_eq!(final_result(&events), &json!("initial"));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::Escalated { agent, .. } if agent == "peer1")));
}

#[tokio::test]
async fn test_no_escalation_when_condition_does_not_match() {
    let source = r#"
model main = openai/gpt-4

prompt p escalate if ~ "DONE": """Keep working."""

agent peer1: instruction p

flow main:
    $c = "initial"
    $c = run agent peer1 with $c, on escalate return $c
    return $c
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["still going"]));
    let events = run_to_completion(source, client, "go").await;

    assert_eq!(final_result(&events), &json!("still going"));
    assert!(!events.iter().any(|e| matches!(e, Event::Escalated { .. })));
}

// S3: for-loop with `on escalate continue`.
#[tokio::test]
async fn test_for_loop_with_continue() {
    let source = r#"
model main = openai/gpt-4

prompt p escalate if contains "SKIP": """Process the item."""

agent worker: instruction p

flow main:
    $items = ["good1", "SKIP_ME", "good3"]
    $out = []
    for $item in $items do
        $r = run agent worker with $item, on escalate continue
        push $r to $out
    end
    return $out
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec![
        "processed_good1",
        "SKIP_ME",
        "processed_good3",
    ]));
    let events = run_to_completion(source, client, "go").await;

    assert_eq!(
        final_result(&events),
        &json!(["processed_good1", "processed_good3"])
    );
}

// S4: schema validation with retry then empty fallback.
#[tokio::test]
async fn test_schema_validation_retry_fallback() {
    let source = r#"
model main = openai/gpt-4

schema Finding:
    title: string

prompt p expecting Finding[]: """Report findings as JSON."""

agent scanner: instruction p

flow main:
    $r = run agent scanner with $input_prompt
    return $r
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["not json", "not json"]));
    let events = run_to_completion(source, client.clone(), "scan").await;

    assert_eq!(final_result(&events), &json!([]));
    assert_eq!(client.invocation_count(), 2);
    let warning = events
        .iter()
        .find(|e| matches!(e, Event::Error { fatal: false, .. }))
        .expect("schema warning event");
    match warning {
        Event::Error { kind, .. } => assert_eq!(*kind, ErrorKind::SchemaValidation),
        _ => unreachable!(),
    }
    // The retry input carried error feedback.
    let retry_messages = &client.invocations()[1].messages;
    assert!(retry_messages
        .iter()
        .any(|m| m.content.contains("could not be parsed")));
}

#[tokio::test]
async fn test_schema_validation_succeeds_first_try() {
    let source = r#"
model main = openai/gpt-4

schema Finding:
    title: string

prompt p expecting Finding[]: """Report findings as JSON."""

agent scanner: instruction p

flow main:
    $r = run agent scanner with $input_prompt
    return $r
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec![
        r#"```json
[{"title": "one"}]
```"#,
    ]));
    let events = run_to_completion(source, client.clone(), "scan").await;

    assert_eq!(final_result(&events), &json!([{"title": "one"}]));
    assert_eq!(client.invocation_count(), 1);
}

// S5: parallel block with two concurrent agents.
#[tokio::test]
async fn test_parallel_block() {
    let source = r#"
model main = openai/gpt-4

prompt web_p: """Search the web."""
prompt doc_p: """Search the docs."""

agent web: instruction web_p
agent doc: instruction doc_p

flow main:
    $q = $input_prompt
    parallel do
        $a = run agent web with $q
        $b = run agent doc with $q
    end
    return [$a, $b]
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["web result", "doc result"]));
    let events = run_to_completion(source, client.clone(), "query").await;

    // Which script lands on which child is scheduling-dependent; both
    // results must arrive, each exactly once.
    let result = final_result(&events).as_array().expect("list result");
    let mut texts: Vec<&str> = result.iter().map(|v| v.as_str().unwrap()).collect();
    texts.sort_unstable();
    assert_eq!(texts, vec!["doc result", "web result"]);

    let agent_calls: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            Event::AgentCall { agent, input, .. } => Some((agent.as_str(), input.as_str())),
            _ => None,
        })
        .collect();
    assert_eq!(agent_calls.len(), 2);
    // Both children share the first child's input.
    assert!(agent_calls.iter().all(|(_, input)| *input == "query"));
    assert_eq!(client.invocation_count(), 2);
}

// S6: history compaction with the truncate strategy.
#[tokio::test]
async fn test_history_compaction_truncate() {
    let source = r#"
model main:
    provider: test
    name: tiny
    max_input_tokens: 120

prompt p: """Keep refining the answer."""

agent refiner:
    instruction p
    history truncate

flow main:
    $text = $input_prompt
    loop max 10 do
        $text = run agent refiner with $text
    end
    return $text
"#;
    let long = "lorem ipsum dolor sit amet consectetur adipiscing elit ".repeat(4);
    let client = Arc::new(StaticLlmClient::with_texts(vec![long.as_str()]));
    let events = run_to_completion(source, client, "start").await;

    let compaction = events
        .iter()
        .find(|e| matches!(e, Event::HistoryCompaction { .. }))
        .expect("history compaction event");
    match compaction {
        Event::HistoryCompaction {
            strategy,
            original_tokens,
            compacted_tokens,
            messages_removed,
            ..
        } => {
            assert_eq!(strategy, "truncate");
            assert!(original_tokens > compacted_tokens);
            assert!(*messages_removed > 0);
        }
        _ => unreachable!(),
    }
    // Subsequent calls proceeded without a ContextOverflow error.
    assert!(matches!(events.last(), Some(Event::FlowResult { .. })));
}

#[tokio::test]
async fn test_context_overflow_without_strategy() {
    let source = r#"
model main:
    provider: test
    name: tiny
    max_input_tokens: 40

prompt p: """Answer."""

agent chatty: instruction p

flow main:
    $a = run agent chatty with $input_prompt
    $b = run agent chatty with $a
    return $b
"#;
    let long = "lorem ipsum dolor sit amet consectetur adipiscing elit ".repeat(4);
    let client = Arc::new(StaticLlmClient::with_texts(vec![long.as_str()]));
    let events = run_to_completion(source, client, "start").await;

    match events.last() {
        Some(Event::Error { kind, fatal, .. }) => {
            assert_eq!(*kind, ErrorKind::ContextOverflow);
            assert!(fatal);
        }
        other => panic!("expected ContextOverflow error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_escalation_abort_is_fatal() {
    let source = r#"
model main = openai/gpt-4

prompt p escalate if == "FATAL": """Try the task."""

agent worker: instruction p

flow main:
    $r = run agent worker with $input_prompt, on escalate abort
    return $r
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["FATAL"]));
    let events = run_to_completion(source, client, "go").await;

    match events.last() {
        Some(Event::Error { kind, fatal, .. }) => {
            assert_eq!(*kind, ErrorKind::AbortError);
            assert!(fatal);
        }
        other => panic!("expected abort error, got {other:?}"),
    }
    assert!(!events.iter().any(|e| matches!(e, Event::FlowResult { .. })));
}

#[tokio::test]
async fn test_call_llm_emits_call_and_response() {
    let source = r#"
model main = openai/gpt-4

prompt summarize: """Summarize the input."""

flow main:
    $t = call llm summarize with $input_prompt
    return $t
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["a summary"]));
    let events = run_to_completion(source, client, "long text").await;

    let call_index = events
        .iter()
        .position(|e| matches!(e, Event::LlmCall { .. }))
        .expect("LlmCall event");
    let response_index = events
        .iter()
        .position(|e| matches!(e, Event::LlmResponse { .. }))
        .expect("LlmResponse event");
    assert!(call_index < response_index);
    assert_eq!(final_result(&events), &json!("a summary"));
}

#[tokio::test]
async fn test_match_block_selects_by_rendered_value() {
    let source = r#"
model main = openai/gpt-4

flow main:
    $mode = "fast"
    $result = ""
    match $mode
        when "fast" -> $result = "took fast path"
        when "slow" -> $result = "took slow path"
        else -> $result = "unknown"
    end
    return $result
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["unused"]));
    let events = run_to_completion(source, client, "go").await;
    assert_eq!(final_result(&events), &json!("took fast path"));
}

#[tokio::test]
async fn test_loop_bounding_and_unbounded_warning() {
    let source = r#"
model main = openai/gpt-4

flow main:
    $n = 0
    loop do
        $n = $n + 1
    end
    return $n
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["unused"]));
    let events = run_to_completion(source, client, "go").await;

    assert_eq!(final_result(&events), &json!(100));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Error {
            kind: ErrorKind::LoopLimit,
            fatal: false,
            ..
        }
    )));
}

#[tokio::test]
async fn test_bounded_loop_runs_exactly_max_times() {
    let source = r#"
model main = openai/gpt-4

flow main:
    $n = 0
    loop max 3 do
        $n = $n + 1
    end
    return $n
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["unused"]));
    let events = run_to_completion(source, client, "go").await;
    assert_eq!(final_result(&events), &json!(3));
    assert!(!events
        .iter()
        .any(|e| matches!(e, Event::Error { kind: ErrorKind::LoopLimit, .. })));
}

#[tokio::test]
async fn test_filter_expression_end_to_end() {
    let source = r#"
model main = openai/gpt-4

flow main:
    $findings = [{"title": "a", "severity": "high"}, {"title": "b", "severity": "low"}]
    $picked = filter $findings where .severity == "high"
    return $picked
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["unused"]));
    let events = run_to_completion(source, client, "go").await;
    assert_eq!(
        final_result(&events),
        &json!([{"title": "a", "severity": "high"}])
    );
}

#[tokio::test]
async fn test_subflow_return_value_assigns_to_target() {
    let source = r#"
model main = openai/gpt-4

flow helper:
    $sum = 41 + 1
    return $sum

flow main:
    $r = run helper
    return $r
"#;
    let client = Arc::new(StaticLlmClient::with_texts(vec!["unused"]));
    let events = run_to_completion(source, client, "go").await;
    assert_eq!(final_result(&events), &json!(42));
}

/// Client whose calls hang long enough to trip a timeout policy.
struct SlowClient;

#[async_trait]
impl LlmClient for SlowClient {
    async fn invoke(
        &self,
        _model_id: &str,
        _messages: Vec<Message>,
        _tools: Vec<String>,
        _schema_hint: Option<String>,
    ) -> Result<LlmStream> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Box::pin(futures::stream::iter(vec![
            LlmChunk::Text("too late".to_string()),
            LlmChunk::FinishReason("stop".to_string()),
        ])))
    }
}

#[tokio::test(start_paused = true)]
async fn test_timeout_caught_by_failure_block() {
    let source = r#"
model main = openai/gpt-4

timeout default = 2 seconds

prompt p: """Answer fast."""

agent slow: instruction p

flow main:
    $r = run agent slow with $input_prompt
    failure do
        $r = "fallback"
    end
    return $r
"#;
    let workflow = Arc::new(compile_source(source).expect("compile"));
    let store = create_store().await;
    let runtime = WorkflowRuntime::new(
        workflow,
        Arc::new(SlowClient),
        Arc::new(NullToolProvider),
        store,
    );
    let mut stream = runtime.run_async(Session::new("test", "user", "s1"), "go");
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        events.push(event);
    }

    assert_eq!(final_result(&events), &json!("fallback"));
    assert!(events.iter().any(|e| matches!(
        e,
        Event::Error {
            kind: ErrorKind::Timeout,
            fatal: false,
            ..
        }
    )));
}

#[tokio::test]
async fn test_terminal_event_is_appended_to_session() {
    let source = r#"
model main = openai/gpt-4

prompt p: """Echo."""

agent echo: instruction p
"#;
    let workflow = Arc::new(compile_source(source).expect("compile"));
    let store = create_store().await;
    let runtime = WorkflowRuntime::new(
        workflow,
        Arc::new(StaticLlmClient::with_texts(vec!["ok"])),
        Arc::new(NullToolProvider),
        store.clone(),
    );
    let mut stream = runtime.run_async(Session::new("test", "user", "s1"), "go");
    while stream.next().await.is_some() {}

    let persisted = store.events_for("s1");
    assert_eq!(persisted.len(), 1);
    assert!(matches!(persisted[0], Event::FlowResult { .. }));
}
