//! Workflow run results.

use chrono::{DateTime, Utc};
use flowdeck_core::{StepResult, StepStatus, WorkflowStatus};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The completed record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    /// Id of the executed workflow.
    pub workflow_id: String,
    /// Name of the executed workflow.
    pub workflow_name: String,
    /// Terminal status of the run.
    pub status: WorkflowStatus,
    /// The final variable scope, flattened.  Includes the `inputs` binding.
    pub variables: Map<String, Value>,
    /// Per-step records in completion order.
    pub step_results: Vec<StepResult>,
    /// Id of the failing step, when the run failed.
    #[serde(default)]
    pub failed_step: Option<String>,
    /// Normalized error message, when the run failed.
    #[serde(default)]
    pub error: Option<String>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
}

impl WorkflowResult {
    /// Whether the run completed successfully.
    pub fn succeeded(&self) -> bool {
        self.status == WorkflowStatus::Completed
    }

    /// Look up a final variable by name.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Render a compact human-readable summary of the run.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "workflow `{}` {:?} in {}ms ({} steps)\n",
            self.workflow_name,
            self.status,
            self.duration_ms,
            self.step_results.len()
        ));

        for step in &self.step_results {
            let marker = match step.status {
                StepStatus::Completed => "ok  ",
                StepStatus::Failed => "FAIL",
                StepStatus::Skipped => "skip",
                StepStatus::Running => "run ",
                StepStatus::Pending => "wait",
            };
            out.push_str(&format!(
                "  [{marker}] {:<24} {:>6}ms retries={}",
                step.step_id, step.duration_ms, step.retry_count
            ));
            if let Some(error) = &step.error {
                out.push_str(&format!("  {error}"));
            }
            out.push('\n');
        }

        if let Some(failed) = &self.failed_step {
            out.push_str(&format!(
                "failed at `{failed}`: {}\n",
                self.error.as_deref().unwrap_or("unknown error")
            ));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_lists_steps_and_failure() {
        let now = Utc::now();
        let result = WorkflowResult {
            workflow_id: "wf-1".into(),
            workflow_name: "deploy".into(),
            status: WorkflowStatus::Failed,
            variables: Map::new(),
            step_results: vec![StepResult {
                step_id: "build".into(),
                status: StepStatus::Failed,
                output: None,
                error: Some("TIMEOUT: too slow".into()),
                started_at: now,
                completed_at: now,
                duration_ms: 12,
                retry_count: 2,
            }],
            failed_step: Some("build".into()),
            error: Some("TIMEOUT: too slow".into()),
            started_at: now,
            completed_at: now,
            duration_ms: 12,
        };

        let summary = result.summary();
        assert!(summary.contains("deploy"));
        assert!(summary.contains("[FAIL] build"));
        assert!(summary.contains("failed at `build`"));
        assert!(!result.succeeded());
    }
}
