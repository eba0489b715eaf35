//! End-to-end engine scenarios against a mock tool registry.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use flowdeck_core::{EngineError, Result, StepStatus, ToolClient, Workflow, WorkflowStatus};
use flowdeck_engine::WorkflowEngine;
use flowdeck_registry::{Initializer, ResolvedToolConfig, SdkRegistry};
use flowdeck_reliability::ReliabilityConfig;
use flowdeck_vault::SecretManager;
use serde_json::{Map, Value, json};

// ---------------------------------------------------------------------------
// Mock tool
// ---------------------------------------------------------------------------

/// Scriptable test client: the action path selects the behavior.
struct MockClient {
    flaky_remaining: AtomicU32,
}

#[async_trait]
impl ToolClient for MockClient {
    async fn call_action(&self, path: &str, inputs: Value) -> Result<Value> {
        match path {
            "echo" => Ok(inputs),
            "auth_fail" => Err(EngineError::authentication_failed("bad credentials")),
            "boom" => Err(EngineError::internal("exploded")),
            "flaky" => {
                let remaining = self.flaky_remaining.load(Ordering::SeqCst);
                if remaining > 0 {
                    self.flaky_remaining.fetch_sub(1, Ordering::SeqCst);
                    Err(EngineError::network("transient failure"))
                } else {
                    Ok(json!({ "recovered": true }))
                }
            }
            "sleep" => {
                let ms = inputs.get("ms").and_then(Value::as_u64).unwrap_or(50);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!({ "slept_ms": ms }))
            }
            other => Err(EngineError::invalid_config(format!(
                "mock has no action `{other}`"
            ))),
        }
    }
}

struct MockInitializer {
    flaky_failures: u32,
}

#[async_trait]
impl Initializer for MockInitializer {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&self, _config: &ResolvedToolConfig) -> Result<Arc<dyn ToolClient>> {
        Ok(Arc::new(MockClient {
            flaky_remaining: AtomicU32::new(self.flaky_failures),
        }))
    }
}

fn engine_with_mock(flaky_failures: u32) -> WorkflowEngine {
    // Short wrapper delays so retry-path tests stay fast.
    let reliability = ReliabilityConfig {
        timeout: Duration::from_secs(5),
        max_retries: 0,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        retryable_statuses: vec![429, 500, 502, 503, 504],
    };
    let registry = Arc::new(SdkRegistry::with_reliability(
        SecretManager::new(),
        reliability,
    ));
    registry.register_initializer(Arc::new(MockInitializer { flaky_failures }));
    WorkflowEngine::new(registry)
}

fn workflow(value: Value) -> Workflow {
    serde_json::from_value(value).expect("workflow document should deserialize")
}

fn no_inputs() -> Map<String, Value> {
    Map::new()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S1 — sequential steps with variable chaining.
#[tokio::test]
async fn sequential_steps_chain_variables() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "s1" },
        "steps": [
            { "id": "set_x", "action": "core.set", "inputs": { "x": 10 }, "output": "x" },
            { "id": "set_y", "action": "core.set", "inputs": { "y": "{{ x * 2 }}" }, "output": "y" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("x"), Some(&json!(10)));
    assert_eq!(result.variable("y"), Some(&json!(20)));
}

/// S2 — if/else branching on a predicate.
#[tokio::test]
async fn if_else_takes_the_right_branch() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "s2" },
        "steps": [
            { "id": "init", "action": "core.set", "inputs": { "n": 5 }, "output": "n" },
            { "id": "branch", "condition": "n > 3",
              "then": [
                  { "id": "big", "action": "core.set", "inputs": { "msg": "big" }, "output": "msg" }
              ],
              "else": [
                  { "id": "small", "action": "core.set", "inputs": { "msg": "small" }, "output": "msg" }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("msg"), Some(&json!("big")));
    // The untaken branch never ran.
    assert!(!result.step_results.iter().any(|r| r.step_id == "small"));
}

/// S3 — for-each collects per-iteration outputs in input order.
#[tokio::test]
async fn foreach_collects_outputs_in_order() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "s3" },
        "steps": [
            { "id": "each", "items": "{{ inputs.items }}", "output": "squares",
              "steps": [
                  { "id": "sq", "action": "core.set", "inputs": { "sq": "{{ item * item }}" }, "output": "sq" }
              ] }
        ]
    }));

    let mut inputs = Map::new();
    inputs.insert("items".to_string(), json!([1, 2, 3]));
    let result = engine.execute(&wf, inputs).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("squares"), Some(&json!([1, 4, 9])));
}

/// The iteration index resolves under both spellings inside the body.
#[tokio::test]
async fn foreach_binds_index_under_both_spellings() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "index-spellings" },
        "steps": [
            { "id": "each", "items": "['a', 'b']", "output": "pairs",
              "steps": [
                  { "id": "tag", "action": "core.set",
                    "inputs": { "v": "{{ item }}-{{ itemIndex }}-{{ item_index }}" },
                    "output": "v" }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("pairs"), Some(&json!(["a-0-0", "b-1-1"])));
}

/// S3 variant — concurrency does not disturb output order.
#[tokio::test]
async fn foreach_concurrent_preserves_output_order() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "s3-concurrent" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "each", "items": "{{ inputs.items }}", "output": "doubled", "concurrency": 3,
              "steps": [
                  // Later items sleep less, so execution order inverts.
                  { "id": "nap", "action": "svc.sleep", "inputs": { "ms": "{{ (3 - item_index) * 20 }}" } },
                  { "id": "double", "action": "core.set", "inputs": { "v": "{{ item * 2 }}" }, "output": "v" }
              ] }
        ]
    }));

    let mut inputs = Map::new();
    inputs.insert("items".to_string(), json!([1, 2, 3]));
    let result = engine.execute(&wf, inputs).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("doubled"), Some(&json!([2, 4, 6])));
}

/// Iteration isolation: writes inside one iteration never reach another.
#[tokio::test]
async fn foreach_iterations_are_isolated() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "isolation" },
        "steps": [
            { "id": "each", "items": "[1, 2]", "output": "seen", "concurrency": 2,
              "steps": [
                  { "id": "peek", "action": "core.set",
                    "inputs": { "v": "{{ default(scratch, 'fresh') }}" }, "output": "v" },
                  { "id": "mark", "action": "core.set",
                    "inputs": { "scratch": "dirty" }, "output": "scratch" }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    // Every iteration observed a fresh frame, and nothing leaked out.
    assert_eq!(result.variable("seen"), Some(&json!(["dirty", "dirty"])));
    assert!(result.variable("scratch").is_none());

    let peeks: Vec<_> = result
        .step_results
        .iter()
        .filter(|r| r.step_id == "peek")
        .collect();
    assert_eq!(peeks.len(), 2);
    for peek in peeks {
        assert_eq!(peek.output, Some(json!("fresh")));
    }
}

/// S4 — parallel with majority wait and a failing branch.
#[tokio::test]
async fn parallel_majority_with_failing_branch() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "s4" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "fanout", "wait": "majority", "on_error": "continue", "output": "fanout",
              "branches": [
                  { "id": "b1", "steps": [
                      { "id": "ok1", "action": "core.set", "inputs": { "r1": 1 }, "output": "r1" } ] },
                  { "id": "b2", "steps": [
                      { "id": "bad", "action": "svc.auth_fail", "inputs": {} } ] },
                  { "id": "b3", "steps": [
                      { "id": "ok3", "action": "core.set", "inputs": { "r3": 3 }, "output": "r3" } ] }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    let fanout = result.variable("fanout").unwrap();
    assert_eq!(fanout["successful"], json!(["b1", "b3"]));
    assert_eq!(fanout["failed"], json!(["b2"]));
    assert!(fanout["errors"]["b2"].as_str().unwrap().contains("AUTHENTICATION_FAILED"));

    // Successful branches wrote their outputs back to the parent scope.
    assert_eq!(result.variable("r1"), Some(&json!(1)));
    assert_eq!(result.variable("r3"), Some(&json!(3)));
}

#[tokio::test]
async fn parallel_all_fails_the_step_when_a_branch_fails() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "parallel-all" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "fanout", "wait": "all",
              "branches": [
                  { "id": "good", "steps": [
                      { "id": "ok", "action": "core.set", "inputs": { "a": 1 }, "output": "a" } ] },
                  { "id": "bad", "steps": [
                      { "id": "no", "action": "svc.auth_fail", "inputs": {} } ] }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
}

/// While loops observe body writes and stop at the condition.
#[tokio::test]
async fn while_loop_counts_to_the_limit() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "while" },
        "steps": [
            { "id": "init", "action": "core.set", "inputs": { "n": 0 }, "output": "n" },
            { "id": "loop", "condition": "n < 5", "max_iterations": 100, "output": "loop_info",
              "steps": [
                  { "id": "inc", "action": "core.set", "inputs": { "n": "{{ n + 1 }}" }, "output": "n" }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("n"), Some(&json!(5)));
    assert_eq!(result.variable("loop_info"), Some(&json!({ "iterations": 5 })));
}

#[tokio::test]
async fn while_loop_respects_iteration_cap() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "while-cap" },
        "steps": [
            { "id": "loop", "condition": "true", "max_iterations": 3, "output": "info",
              "steps": [
                  { "id": "noop", "action": "core.set", "inputs": { "x": 1 }, "output": "x" }
              ] }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();
    assert_eq!(result.variable("info"), Some(&json!({ "iterations": 3 })));
}

// ---------------------------------------------------------------------------
// Conditions, retries, error policies
// ---------------------------------------------------------------------------

#[tokio::test]
async fn false_condition_skips_step_without_output() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "conditions" },
        "steps": [
            { "id": "init", "action": "core.set", "inputs": { "flag": false }, "output": "flag" },
            { "id": "guarded", "action": "core.set", "inputs": { "x": 1 }, "output": "x",
              "conditions": ["flag"] },
            { "id": "after", "action": "core.set", "inputs": { "done": true }, "output": "done" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert!(result.variable("x").is_none());
    assert_eq!(result.variable("done"), Some(&json!(true)));

    let guarded = result
        .step_results
        .iter()
        .find(|r| r.step_id == "guarded")
        .unwrap();
    assert_eq!(guarded.status, StepStatus::Skipped);
}

#[tokio::test]
async fn step_retry_policy_recovers_transient_failures() {
    let engine = engine_with_mock(2);
    let wf = workflow(json!({
        "metadata": { "name": "retry" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "flaky", "action": "svc.flaky", "inputs": {}, "output": "out",
              "retry": { "max_attempts": 5, "initial_delay_ms": 5, "max_delay_ms": 20 } }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("out"), Some(&json!({ "recovered": true })));

    let flaky = result
        .step_results
        .iter()
        .find(|r| r.step_id == "flaky")
        .unwrap();
    assert_eq!(flaky.retry_count, 2);
}

#[tokio::test]
async fn retry_policy_does_not_retry_non_matching_kinds() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "retry-kinds" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "denied", "action": "svc.auth_fail", "inputs": {},
              "retry": { "max_attempts": 5, "initial_delay_ms": 5 } }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    let denied = result
        .step_results
        .iter()
        .find(|r| r.step_id == "denied")
        .unwrap();
    assert_eq!(denied.retry_count, 0);
}

#[tokio::test]
async fn error_policy_continue_keeps_the_workflow_alive() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "continue" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "bad", "action": "svc.boom", "inputs": {}, "on_error": "continue" },
            { "id": "after", "action": "core.set", "inputs": { "done": true }, "output": "done" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("done"), Some(&json!(true)));

    let bad = result.step_results.iter().find(|r| r.step_id == "bad").unwrap();
    assert_eq!(bad.status, StepStatus::Failed);
}

#[tokio::test]
async fn failing_step_reports_id_and_error() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "fail" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "bad", "action": "svc.boom", "inputs": {} },
            { "id": "never", "action": "core.set", "inputs": { "x": 1 }, "output": "x" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert_eq!(result.failed_step.as_deref(), Some("bad"));
    assert!(result.error.as_deref().unwrap().contains("INTERNAL_ERROR"));
    assert!(!result.step_results.iter().any(|r| r.step_id == "never"));
}

#[tokio::test]
async fn expression_error_fails_the_step() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "expr-error" },
        "steps": [
            { "id": "div", "action": "core.set", "inputs": { "x": "{{ 1 / 0 }}" }, "output": "x" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("EXPRESSION_ERROR"));
}

// ---------------------------------------------------------------------------
// Sub-workflows, script context, fan-out actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sub_workflow_runs_with_inputs_and_returns_scope() {
    let engine = engine_with_mock(0);
    engine.add_workflow(workflow(json!({
        "metadata": { "name": "child" },
        "steps": [
            { "id": "double", "action": "core.set",
              "inputs": { "doubled": "{{ inputs.n * 2 }}" }, "output": "doubled" }
        ]
    })));

    let wf = workflow(json!({
        "metadata": { "name": "parent" },
        "steps": [
            { "id": "call", "workflow": "child", "inputs": { "n": 21 }, "output": "child_out" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("child_out"), Some(&json!({ "doubled": 42 })));
}

#[tokio::test]
async fn missing_sub_workflow_is_provider_not_found() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "parent" },
        "steps": [
            { "id": "call", "workflow": "ghost", "inputs": {} }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();
    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("PROVIDER_NOT_FOUND"));
}

#[tokio::test]
async fn script_execute_sees_the_variable_scope() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "script" },
        "steps": [
            { "id": "init", "action": "core.set", "inputs": { "n": 6 }, "output": "n" },
            { "id": "calc", "action": "script.execute",
              "inputs": { "script": "context.n * 7" }, "output": "answer" }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(result.variable("answer"), Some(&json!(42)));
}

#[tokio::test]
async fn parallel_map_preserves_item_order() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "pmap" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "map", "action": "parallel.map", "output": "echoed",
              "inputs": {
                  "items": [1, 2, 3],
                  "action": "svc.echo",
                  "concurrency": 3
              } }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Completed);
    assert_eq!(
        result.variable("echoed"),
        Some(&json!([{ "item": 1 }, { "item": 2 }, { "item": 3 }]))
    );
}

#[tokio::test]
async fn parallel_spawn_reports_branch_outcomes() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "pspawn" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "spawn", "action": "parallel.spawn", "output": "report", "on_error": "continue",
              "inputs": { "branches": [
                  { "id": "a", "action": "svc.echo", "inputs": { "v": 1 } },
                  { "id": "b", "action": "svc.boom", "inputs": {} }
              ] } }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    let report = result.variable("report").unwrap();
    assert_eq!(report["successful"], json!(["a"]));
    assert_eq!(report["failed"], json!(["b"]));
    assert_eq!(report["results"]["a"], json!({ "v": 1 }));
}

// ---------------------------------------------------------------------------
// Cancellation and permissions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_stops_the_run() {
    let engine = Arc::new(engine_with_mock(0));
    let wf = workflow(json!({
        "metadata": { "name": "cancel" },
        "tools": { "svc": { "sdk": "mock" } },
        "steps": [
            { "id": "slow", "action": "svc.sleep", "inputs": { "ms": 5000 } },
            { "id": "never", "action": "core.set", "inputs": { "x": 1 }, "output": "x" }
        ]
    }));

    let token = tokio_util::sync::CancellationToken::new();
    let run_token = token.clone();
    let run_engine = Arc::clone(&engine);
    let handle = tokio::spawn(async move {
        run_engine
            .execute_with_cancel(&wf, Map::new(), run_token)
            .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("cancelled run must finish promptly")
        .unwrap()
        .unwrap();

    assert_eq!(result.status, WorkflowStatus::Cancelled);
    assert!(result.variable("x").is_none());
}

#[tokio::test]
async fn permissions_deny_tool_dispatch() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "perms" },
        "tools": { "svc": { "sdk": "mock" } },
        "permissions": { "svc": false },
        "steps": [
            { "id": "blocked", "action": "svc.echo", "inputs": {} }
        ]
    }));

    let result = engine.execute(&wf, no_inputs()).await.unwrap();

    assert_eq!(result.status, WorkflowStatus::Failed);
    assert!(result.error.as_deref().unwrap().contains("AUTHORIZATION_FAILED"));
}

#[tokio::test]
async fn duplicate_step_ids_fail_validation() {
    let engine = engine_with_mock(0);
    let wf = workflow(json!({
        "metadata": { "name": "dup" },
        "steps": [
            { "id": "a", "action": "core.set", "inputs": { "x": 1 }, "output": "x" },
            { "id": "a", "action": "core.set", "inputs": { "y": 2 }, "output": "y" }
        ]
    }));

    let err = engine.execute(&wf, no_inputs()).await.unwrap_err();
    assert_eq!(err.kind, flowdeck_core::ErrorKind::ProviderConflict);
}
