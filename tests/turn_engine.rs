use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Barrier;

use turnloop::{
    AgentProfile, CompletionResponse, DelegateTool, Message, Result, Role, ScriptedClient, Tool,
    ToolCall, ToolContext, ToolDispatcher, ToolRegistry, TurnEngine, TurnloopError, Usage,
};

struct FixedTool {
    name: &'static str,
    output: &'static str,
    delay_ms: u64,
}

#[async_trait]
impl Tool for FixedTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed string"
    }

    async fn call(&self, _input: Value, _ctx: &ToolContext) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        Ok(Value::String(self.output.to_string()))
    }
}

struct BarrierTool {
    name: &'static str,
    barrier: Arc<Barrier>,
}

#[async_trait]
impl Tool for BarrierTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Waits until every sibling call has started"
    }

    async fn call(&self, _input: Value, _ctx: &ToolContext) -> Result<Value> {
        self.barrier.wait().await;
        Ok(Value::String(format!("{} done", self.name)))
    }
}

struct SlowCounter {
    hits: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for SlowCounter {
    fn name(&self) -> &str {
        "slow_write"
    }

    fn description(&self) -> &str {
        "Sleeps, then records a side effect"
    }

    async fn call(&self, _input: Value, _ctx: &ToolContext) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(Value::String("written".into()))
    }
}

fn engine_with(client: Arc<ScriptedClient>, registry: ToolRegistry) -> TurnEngine {
    TurnEngine::new(client, Arc::new(ToolDispatcher::new(registry)))
}

fn bash_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(FixedTool {
        name: "bash",
        output: "hi",
        delay_ms: 0,
    });
    registry
}

#[tokio::test]
async fn plain_reply_finishes_in_one_round() {
    let client = ScriptedClient::new(vec![CompletionResponse::text("Response").with_usage(10, 5)]);
    let engine = engine_with(client.clone(), ToolRegistry::new());

    let result = engine.run_turn(&[Message::user("Hello")], &[]).await.unwrap();

    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.messages[1], Message::assistant("Response"));
    assert_eq!(result.usage, Usage::new(10, 5));
    assert_eq!(client.requests().len(), 1);
}

#[tokio::test]
async fn tool_round_then_answer() {
    let call = ToolCall::with_arguments("call_1", "bash", &json!({"command": "echo hi"}));
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![call.clone()]).with_usage(12, 4),
        CompletionResponse::text("Done").with_usage(20, 3),
    ]);
    let engine = engine_with(client, bash_registry());

    let result = engine
        .run_turn(&[Message::user("run echo hi")], &[])
        .await
        .unwrap();

    assert_eq!(
        result.messages,
        vec![
            Message::user("run echo hi"),
            Message::assistant_tool_calls(vec![call]),
            Message::tool("call_1", "bash", "hi"),
            Message::assistant("Done"),
        ]
    );
    assert_eq!(result.usage, Usage::new(32, 7));
}

#[tokio::test]
async fn unknown_tool_is_fed_back_to_the_model() {
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![ToolCall::new("call_1", "foo_tool", "{}")]),
        CompletionResponse::text("Sorry, that tool does not exist"),
    ]);
    let engine = engine_with(client.clone(), bash_registry());

    let result = engine.run_turn(&[Message::user("try foo")], &[]).await.unwrap();

    assert_eq!(result.messages[2].content.as_deref(), Some("Error: Unknown tool foo_tool"));
    let second_request = &client.requests()[1];
    assert_eq!(second_request.last(), Some(&result.messages[2]));
    assert_eq!(result.final_text(), "Sorry, that tool does not exist");
}

#[tokio::test]
async fn history_grows_by_one_plus_k_per_tool_round() {
    let calls = vec![
        ToolCall::new("a", "bash", r#"{"command":"1"}"#),
        ToolCall::new("b", "bash", r#"{"command":"2"}"#),
        ToolCall::new("c", "missing", "{}"),
    ];
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(calls),
        CompletionResponse::text("ok"),
    ]);
    let engine = engine_with(client.clone(), bash_registry());

    engine.run_turn(&[Message::user("go")], &[]).await.unwrap();

    let requests = client.requests();
    assert_eq!(requests[1].len(), requests[0].len() + 1 + 3);
}

#[tokio::test]
async fn results_follow_call_order_despite_latency() {
    let mut registry = ToolRegistry::new();
    registry.register(FixedTool {
        name: "slow",
        output: "slow result",
        delay_ms: 80,
    });
    registry.register(FixedTool {
        name: "medium",
        output: "medium result",
        delay_ms: 30,
    });
    registry.register(FixedTool {
        name: "fast",
        output: "fast result",
        delay_ms: 0,
    });
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![
            ToolCall::new("1", "slow", "{}"),
            ToolCall::new("2", "medium", "{}"),
            ToolCall::new("3", "fast", "{}"),
        ]),
        CompletionResponse::text("ok"),
    ]);

    let result = engine_with(client, registry)
        .run_turn(&[Message::user("go")], &[])
        .await
        .unwrap();

    let tool_messages: Vec<(&str, &str)> = result
        .messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| (m.tool_call_id.as_deref().unwrap_or_default(), m.text()))
        .collect();
    assert_eq!(
        tool_messages,
        vec![("1", "slow result"), ("2", "medium result"), ("3", "fast result")]
    );
}

#[tokio::test]
async fn calls_in_one_round_run_concurrently() {
    let barrier = Arc::new(Barrier::new(2));
    let mut registry = ToolRegistry::new();
    registry.register(BarrierTool {
        name: "left",
        barrier: barrier.clone(),
    });
    registry.register(BarrierTool {
        name: "right",
        barrier,
    });
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![
            ToolCall::new("l", "left", "{}"),
            ToolCall::new("r", "right", "{}"),
        ]),
        CompletionResponse::text("both done"),
    ]);
    let engine = engine_with(client, registry);

    // Run sequentially, the first call would wait on the barrier forever.
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        engine.run_turn(&[Message::user("go")], &[]),
    )
    .await
    .expect("tool calls were not run concurrently")
    .unwrap();

    assert_eq!(result.messages[2].text(), "left done");
    assert_eq!(result.messages[3].text(), "right done");
}

#[tokio::test]
async fn usage_is_the_sum_of_every_round() {
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![ToolCall::new("1", "bash", "{}")]).with_usage(100, 10),
        CompletionResponse::tool_calls(vec![ToolCall::new("2", "bash", "{}")]).with_usage(150, 20),
        CompletionResponse::text("done").with_usage(200, 30),
    ]);

    let result = engine_with(client, bash_registry())
        .run_turn(&[Message::user("go")], &[])
        .await
        .unwrap();

    assert_eq!(result.usage, Usage::new(450, 60));
    assert_eq!(result.usage.total_tokens(), 510);
}

#[tokio::test]
async fn transport_failure_keeps_prior_rounds() {
    let client = ScriptedClient::with_results(vec![
        Ok(CompletionResponse::tool_calls(vec![ToolCall::new("1", "bash", "{}")]).with_usage(5, 5)),
        Err(TurnloopError::LanguageModel("connection reset".into())),
    ]);

    let err = engine_with(client, bash_registry())
        .run_turn(&[Message::user("go")], &[])
        .await
        .unwrap_err();

    match &err {
        TurnloopError::TurnAborted { messages, usage, .. } => {
            assert_eq!(messages.len(), 3);
            assert_eq!(*usage, Usage::new(5, 5));
        }
        other => panic!("expected an aborted turn, got {other:?}"),
    }
    assert!(matches!(err.root(), TurnloopError::LanguageModel(_)));
}

#[tokio::test]
async fn delegation_returns_the_nested_answer_verbatim() {
    let profiles = BTreeMap::from([(
        "specialist".to_string(),
        AgentProfile {
            system_prompt: "You are a specialist.".into(),
            tools: vec!["bash".into()],
        },
    )]);
    let mut registry = bash_registry();
    registry.register(DelegateTool::new(profiles));

    let delegate_call = ToolCall::with_arguments(
        "call_d",
        "delegate",
        &json!({"agent": "specialist", "task": "investigate X"}),
    );
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![delegate_call]).with_usage(10, 5),
        CompletionResponse::text("Findings: X is Y").with_usage(100, 100),
        CompletionResponse::text("X is Y, per the specialist").with_usage(10, 5),
    ]);
    let engine = engine_with(client.clone(), registry);

    let result = engine
        .run_turn(&[Message::user("what is X?")], &[])
        .await
        .unwrap();

    assert_eq!(result.messages[2].text(), "Findings: X is Y");
    assert_eq!(result.messages[2].name.as_deref(), Some("delegate"));
    assert_eq!(
        client.requests()[1],
        vec![
            Message::system("You are a specialist."),
            Message::user("investigate X")
        ]
    );
    // Nested usage is not rolled into the parent turn.
    assert_eq!(result.usage, Usage::new(20, 10));
}

#[tokio::test]
async fn cancelled_turns_stop_their_tools() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(SlowCounter { hits: hits.clone() });
    let client = ScriptedClient::new(vec![
        CompletionResponse::tool_calls(vec![ToolCall::new("1", "slow_write", "{}")]),
        CompletionResponse::text("done"),
    ]);
    let engine = engine_with(client, registry);

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        engine.run_turn(&[Message::user("go")], &[]),
    )
    .await;
    assert!(outcome.is_err());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}
