//! Workflow data model.
//!
//! A [`Workflow`] is the parsed, immutable form of an authored workflow
//! document: metadata, an ordered list of [`Step`]s, tool configurations,
//! and optional event-source definitions.  The document parser that turns
//! authored text into this structure lives outside the engine; everything
//! here deserializes directly from the parser's JSON/YAML output shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{EngineError, ErrorKind, Result};

/// Variable names that step outputs may not shadow.
///
/// `inputs` is the read-only initial-input binding; the rest are bound by
/// iteration frames.  Both spellings of the index variable are reserved so
/// a document cannot shadow either.
pub const RESERVED_OUTPUT_NAMES: [&str; 5] =
    ["inputs", "item", "item_index", "itemIndex", "accumulator"];

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// Execution mode of a workflow.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowMode {
    /// Run the step list to completion and exit.
    #[default]
    Batch,
    /// Stay resident; steps may block on `event.wait` indefinitely.
    Daemon,
}

/// Identifying metadata of a workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Unique identifier.  Generated when the document does not carry one.
    #[serde(default = "generated_id")]
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Optional document version string.
    #[serde(default)]
    pub version: Option<String>,
}

fn generated_id() -> String {
    Uuid::now_v7().to_string()
}

impl Default for WorkflowMetadata {
    fn default() -> Self {
        Self {
            id: generated_id(),
            name: "unnamed".to_string(),
            version: None,
        }
    }
}

/// A complete workflow definition.  Immutable after parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Identifying metadata.
    #[serde(default)]
    pub metadata: WorkflowMetadata,
    /// Execution mode.
    #[serde(default)]
    pub mode: WorkflowMode,
    /// The ordered sequence of steps to execute.
    pub steps: Vec<Step>,
    /// Tool name → configuration, registered into the SDK registry at start.
    #[serde(default)]
    pub tools: BTreeMap<String, ToolConfig>,
    /// Long-lived event sources started for daemon-mode workflows.
    #[serde(default)]
    pub sources: Vec<EventSourceConfig>,
    /// Optional tool-name → allowed map enforced at dispatch.
    #[serde(default)]
    pub permissions: Option<BTreeMap<String, bool>>,
}

impl Workflow {
    /// Create a workflow with the given name and steps.
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            metadata: WorkflowMetadata {
                id: generated_id(),
                name: name.into(),
                version: None,
            },
            mode: WorkflowMode::Batch,
            steps,
            tools: BTreeMap::new(),
            sources: Vec::new(),
            permissions: None,
        }
    }

    /// Set the execution mode.
    pub fn with_mode(mut self, mode: WorkflowMode) -> Self {
        self.mode = mode;
        self
    }

    /// Register a tool configuration.
    pub fn with_tool(mut self, name: impl Into<String>, config: ToolConfig) -> Self {
        self.tools.insert(name.into(), config);
        self
    }

    /// Validate structural invariants after parse.
    ///
    /// Checks that step ids are unique within their scope and that no step's
    /// output variable shadows a reserved name.  Nested step lists (branch
    /// bodies, loop bodies) are each their own scope.
    ///
    /// # Errors
    ///
    /// Returns a `PROVIDER_CONFLICT` error for a duplicate id and an
    /// `INVALID_CONFIG` error for a reserved output name.
    pub fn validate(&self) -> Result<()> {
        validate_scope(&self.steps)
    }
}

fn validate_scope(steps: &[Step]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();

    for step in steps {
        if !seen.insert(step.id.as_str()) {
            return Err(EngineError::new(
                ErrorKind::ProviderConflict,
                format!("duplicate step id `{}` in scope", step.id),
            ));
        }

        if let Some(output) = &step.output
            && RESERVED_OUTPUT_NAMES.contains(&output.as_str())
        {
            return Err(EngineError::invalid_config(format!(
                "step `{}` output `{output}` shadows a reserved variable name",
                step.id
            )));
        }

        match &step.kind {
            StepKind::If { then, r#else, .. } => {
                validate_scope(then)?;
                validate_scope(r#else)?;
            }
            StepKind::ForEach { steps, .. } | StepKind::While { steps, .. } => {
                validate_scope(steps)?;
            }
            StepKind::Parallel { branches, .. } => {
                let mut branch_ids = std::collections::HashSet::new();
                for branch in branches {
                    if !branch_ids.insert(branch.id.as_str()) {
                        return Err(EngineError::new(
                            ErrorKind::ProviderConflict,
                            format!("duplicate parallel branch id `{}`", branch.id),
                        ));
                    }
                    validate_scope(&branch.steps)?;
                }
            }
            StepKind::Action { .. } | StepKind::SubWorkflow { .. } => {}
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single step in a workflow.
///
/// Common control fields live here; the behavior variant lives in
/// [`StepKind`], flattened so a step deserializes from a single object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Identifier, unique within the step's scope.
    pub id: String,
    /// Optional human-readable name.
    #[serde(default)]
    pub name: Option<String>,
    /// Variable name the step's output is stored under.
    #[serde(default)]
    pub output: Option<String>,
    /// Predicate expressions that must all be truthy for the step to run.
    #[serde(default)]
    pub conditions: Option<Vec<String>>,
    /// Per-step retry policy.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// What to do when the step ultimately fails.
    #[serde(default, alias = "onError")]
    pub on_error: ErrorPolicy,
    /// Per-step timeout in milliseconds.
    #[serde(default, alias = "timeoutMs")]
    pub timeout_ms: Option<u64>,
    /// The behavior variant.
    #[serde(flatten)]
    pub kind: StepKind,
}

impl Step {
    /// Create an action step `id` invoking `action` with the given inputs.
    pub fn action(
        id: impl Into<String>,
        action: impl Into<String>,
        inputs: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            name: None,
            output: None,
            conditions: None,
            retry: None,
            on_error: ErrorPolicy::default(),
            timeout_ms: None,
            kind: StepKind::Action {
                action: action.into(),
                inputs,
            },
        }
    }

    /// Set the output variable name.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    /// Add a condition expression.
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.conditions
            .get_or_insert_with(Vec::new)
            .push(condition.into());
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the error policy.
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }
}

/// The behavior variant of a step.
///
/// Untagged: the discriminating keys (`action`, `workflow`, `then`,
/// `items`, `branches`, plain `condition`+`steps`) identify the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StepKind {
    /// Invoke `<sdk>.<path…>` with resolved inputs.
    Action {
        /// Dotted action name, e.g. `slack.chat.postMessage`.
        action: String,
        /// Raw (unresolved) inputs; templates are resolved at execution.
        #[serde(default)]
        inputs: Map<String, Value>,
    },

    /// Execute another workflow with resolved inputs.
    SubWorkflow {
        /// Name of the referenced workflow in the workflow library.
        workflow: String,
        #[serde(default)]
        inputs: Map<String, Value>,
    },

    /// Conditional branch.
    If {
        /// Predicate expression.
        condition: String,
        /// Steps to run when the condition is truthy.
        then: Vec<Step>,
        /// Steps to run otherwise.
        #[serde(default, rename = "else")]
        r#else: Vec<Step>,
    },

    /// Iterate over the items an expression evaluates to.
    ForEach {
        /// Expression producing the items array.
        items: String,
        /// Name the current item is bound to inside the body.
        #[serde(default = "default_item_var", rename = "as")]
        item_var: String,
        /// Loop body.
        steps: Vec<Step>,
        /// Maximum concurrent iterations (1 = sequential).
        #[serde(default)]
        concurrency: Option<usize>,
    },

    /// Run named branches concurrently.
    Parallel {
        /// The branches to launch.
        branches: Vec<Branch>,
        /// When the step is considered complete.
        #[serde(default)]
        wait: WaitPolicy,
    },

    /// Repeat the body while a condition holds.
    While {
        /// Predicate evaluated before each iteration.
        condition: String,
        /// Loop body.
        steps: Vec<Step>,
        /// Hard iteration cap; the engine clamps this to its own maximum.
        #[serde(default, alias = "maxIterations")]
        max_iterations: Option<u64>,
    },
}

fn default_item_var() -> String {
    "item".to_string()
}

/// One branch of a parallel step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Branch {
    /// Branch identifier, unique within the parallel step.
    pub id: String,
    /// The branch body.
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// Per-step retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (minimum 1).
    #[serde(default = "default_max_attempts", alias = "maxAttempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_delay_ms", alias = "initialDelayMs")]
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each attempt.
    #[serde(default = "default_backoff_multiplier", alias = "backoffMultiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on the delay.
    #[serde(default = "default_max_delay_ms", alias = "maxDelayMs")]
    pub max_delay_ms: u64,
    /// Error kinds to retry on.  Empty means "any retryable kind".
    #[serde(default, alias = "retryOn")]
    pub retry_on: Vec<ErrorKind>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            retry_on: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Whether this policy retries an error of the given kind.
    pub fn applies_to(&self, kind: ErrorKind) -> bool {
        if self.retry_on.is_empty() {
            kind.retryable()
        } else {
            self.retry_on.contains(&kind)
        }
    }

    /// The delay before retry number `attempt` (0-based), capped at
    /// `max_delay_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> std::time::Duration {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        std::time::Duration::from_millis((raw as u64).min(self.max_delay_ms))
    }
}

/// What happens when a step ultimately fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the surrounding workflow.
    #[default]
    Fail,
    /// Record the failure and continue with the next step.
    Continue,
    /// Mark the step skipped and continue.
    Skip,
}

/// When a parallel step is considered complete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPolicy {
    /// Wait for every branch.
    #[default]
    All,
    /// Complete after the first branch succeeds.
    Any,
    /// Complete once more than half of the branches have finished.
    Majority,
}

// ---------------------------------------------------------------------------
// Tool configuration
// ---------------------------------------------------------------------------

/// Configuration of a tool declared by a workflow.
///
/// `auth` values may be literal strings or secret references
/// (`${secret:env://SLACK_TOKEN}`); references are resolved lazily when the
/// tool's client is first built.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// The SDK identifier this tool is an instance of.
    pub sdk: String,
    /// Authentication material, possibly containing secret references.
    #[serde(default)]
    pub auth: BTreeMap<String, String>,
    /// Free-form SDK options (endpoints, workspace ids, …).
    #[serde(default)]
    pub options: Map<String, Value>,
}

impl ToolConfig {
    /// Create a config for the given SDK with no auth or options.
    pub fn new(sdk: impl Into<String>) -> Self {
        Self {
            sdk: sdk.into(),
            auth: BTreeMap::new(),
            options: Map::new(),
        }
    }

    /// Add an auth entry.
    pub fn with_auth(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.auth.insert(key.into(), value.into());
        self
    }

    /// Add an option.
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.insert(key.into(), value);
        self
    }
}

// ---------------------------------------------------------------------------
// Event sources
// ---------------------------------------------------------------------------

/// The kind of a long-lived event source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSourceKind {
    /// Bidirectional WebSocket connection.
    Websocket,
    /// Interval or cron-expression ticker.
    Cron,
    /// RSS/Atom feed poller.
    Rss,
}

/// Definition of an event source attached to a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceConfig {
    /// Source kind.
    pub kind: EventSourceKind,
    /// Unique source id.
    pub id: String,
    /// Kind-specific options (url, interval, …).
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Event-type substrings to keep; other events are dropped at the source.
    #[serde(default)]
    pub filter: Option<Vec<String>>,
}

/// An event produced by a source and consumed by `event.wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSourceEvent {
    /// Id of the source that produced the event.
    pub source: String,
    /// Event type (`tick`, `new_item`, `message`, `error`, …).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub data: Map<String, Value>,
    /// When the event was produced.
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

/// The execution status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet reached.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed after exhausting its retry policy.
    Failed,
    /// Conditions were not met, or the step was cancelled before it ran.
    Skipped,
}

/// The structured record of one step's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// The step this record describes.
    pub step_id: String,
    /// Final status.
    pub status: StepStatus,
    /// The step's output, when it completed and produced one.
    #[serde(default)]
    pub output: Option<Value>,
    /// Normalized error message, when it failed.
    #[serde(default)]
    pub error: Option<String>,
    /// When execution began.
    pub started_at: DateTime<Utc>,
    /// When execution finished.
    pub completed_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Number of retries performed (0 = first attempt succeeded).
    pub retry_count: u32,
}

/// The overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created but not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// All steps ran to completion.
    Completed,
    /// A step failed and its error policy said to fail the run.
    Failed,
    /// The run was cancelled.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
