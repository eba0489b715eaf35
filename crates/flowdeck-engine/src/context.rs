//! Per-run execution context.
//!
//! Created at `execute()`, owned and mutated exclusively by the engine.
//! Branch and iteration forks get their own contexts over snapshot/child
//! scopes, so concurrent tasks never share a mutable scope.

use chrono::{DateTime, Utc};
use flowdeck_core::{StepResult, StepStatus, VariableScope, WorkflowStatus};
use serde_json::{Map, Value};

/// Mutable state of one workflow run.
#[derive(Debug)]
pub struct ExecutionContext {
    /// The live variable scope.  The root frame holds the read-only
    /// `inputs` binding plus every step output written so far.
    pub scope: VariableScope,
    /// Per-step records, appended in completion order.
    pub step_results: Vec<StepResult>,
    /// Overall run status.
    pub status: WorkflowStatus,
    /// Id of the step that failed the run, when it did.
    pub failed_step: Option<String>,
    /// Normalized message of the failing error.
    pub error: Option<String>,
}

impl ExecutionContext {
    /// Create a context for a run with the given initial inputs.
    pub fn new(inputs: Map<String, Value>) -> Self {
        let mut scope = VariableScope::new();
        scope.set("inputs", Value::Object(inputs));
        Self {
            scope,
            step_results: Vec::new(),
            status: WorkflowStatus::Running,
            failed_step: None,
            error: None,
        }
    }

    /// Fork for a parallel branch: the branch observes the scope as a
    /// snapshot taken at launch and collects its own step records.
    pub fn fork_branch(&self) -> Self {
        Self {
            scope: self.scope.snapshot(),
            step_results: Vec::new(),
            status: WorkflowStatus::Running,
            failed_step: None,
            error: None,
        }
    }

    /// Fork for a loop iteration: a child scope frame holds the iteration
    /// bindings, and nothing written inside escapes to the parent.
    pub fn fork_iteration(&self) -> Self {
        Self {
            scope: self.scope.child(),
            step_results: Vec::new(),
            status: WorkflowStatus::Running,
            failed_step: None,
            error: None,
        }
    }

    /// Append a step record.
    pub fn record(&mut self, result: StepResult) {
        self.step_results.push(result);
    }

    /// Absorb a fork's step records.  The fork's scope is discarded with it.
    pub fn absorb_results(&mut self, fork: ExecutionContext) {
        self.step_results.extend(fork.step_results);
    }

    /// Mark the run failed at the given step.
    pub fn fail(&mut self, step_id: &str, error: &flowdeck_core::EngineError) {
        self.status = WorkflowStatus::Failed;
        self.failed_step = Some(step_id.to_string());
        self.error = Some(error.to_string());
    }
}

/// Build a step record with consistent timing fields.
pub(crate) fn step_record(
    step_id: &str,
    status: StepStatus,
    output: Option<Value>,
    error: Option<String>,
    started_at: DateTime<Utc>,
    retry_count: u32,
) -> StepResult {
    let completed_at = Utc::now();
    let duration_ms = (completed_at - started_at).num_milliseconds().max(0) as u64;
    StepResult {
        step_id: step_id.to_string(),
        status,
        output,
        error,
        started_at,
        completed_at,
        duration_ms,
        retry_count,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
