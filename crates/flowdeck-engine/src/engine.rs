//! The workflow engine.
//!
//! Drives a workflow against inputs: validates the document, registers
//! its tools, then walks the step list.  Sequential steps run one at a
//! time; `parallel` steps and `for-each` with `concurrency > 1` run
//! cooperatively concurrent forks over isolated scopes.  The engine is
//! the only writer of the run's [`ExecutionContext`].
//!
//! Action strings with the `workflow.` or `parallel.` prefixes are
//! intercepted here — sub-workflow execution and fan-out need the engine
//! itself, so they never reach the SDK registry.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use flowdeck_core::workflow::{Branch, Step, StepKind, WaitPolicy};
use flowdeck_core::{
    EngineError, ErrorPolicy, Result, StepStatus, Workflow, WorkflowStatus,
};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowdeck_registry::SdkRegistry;

use crate::context::{ExecutionContext, step_record};
use crate::result::WorkflowResult;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine-wide tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrency cap for parallel branches and `parallel.map`.
    pub max_parallel_branches: usize,
    /// Hard cap on `while` iterations, regardless of the step's own cap.
    pub max_while_iterations: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_branches: 8,
            max_while_iterations: 1_000,
        }
    }
}

/// Per-run state threaded through step execution.
struct RunState<'a> {
    token: CancellationToken,
    permissions: Option<&'a BTreeMap<String, bool>>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Executes workflows against a shared SDK registry.
pub struct WorkflowEngine {
    registry: Arc<SdkRegistry>,
    /// Named workflows resolvable from sub-workflow steps.
    library: DashMap<String, Arc<Workflow>>,
    config: EngineConfig,
}

impl WorkflowEngine {
    /// Create an engine over the given registry with default tuning.
    pub fn new(registry: Arc<SdkRegistry>) -> Self {
        Self::with_config(registry, EngineConfig::default())
    }

    /// Create an engine with explicit tuning.
    pub fn with_config(registry: Arc<SdkRegistry>, config: EngineConfig) -> Self {
        Self {
            registry,
            library: DashMap::new(),
            config,
        }
    }

    /// The registry this engine dispatches through.
    pub fn registry(&self) -> &Arc<SdkRegistry> {
        &self.registry
    }

    /// Make a workflow resolvable by name from sub-workflow steps.
    pub fn add_workflow(&self, workflow: Workflow) {
        self.library
            .insert(workflow.metadata.name.clone(), Arc::new(workflow));
    }

    /// Execute a workflow to completion.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
    ) -> Result<WorkflowResult> {
        self.execute_with_cancel(workflow, inputs, CancellationToken::new())
            .await
    }

    /// Execute a workflow with an externally-held cancellation token.
    ///
    /// Cancelling the token stops the run at the next suspension point;
    /// active tool calls and rate-limit waiters are abandoned, and the
    /// result reports status `cancelled`.
    pub async fn execute_with_cancel(
        &self,
        workflow: &Workflow,
        inputs: Map<String, Value>,
        token: CancellationToken,
    ) -> Result<WorkflowResult> {
        workflow.validate()?;
        self.register_tools(workflow);

        info!(
            workflow = %workflow.metadata.name,
            steps = workflow.steps.len(),
            mode = ?workflow.mode,
            "starting workflow run"
        );

        let started_at = Utc::now();
        let mut ctx = ExecutionContext::new(inputs);
        let run = RunState {
            token,
            permissions: workflow.permissions.as_ref(),
        };

        let outcome = self.run_steps(&mut ctx, &workflow.steps, &run).await;

        if ctx.status == WorkflowStatus::Running {
            ctx.status = match outcome {
                Ok(()) => WorkflowStatus::Completed,
                Err(_) => WorkflowStatus::Failed,
            };
        }

        let completed_at = Utc::now();
        let result = WorkflowResult {
            workflow_id: workflow.metadata.id.clone(),
            workflow_name: workflow.metadata.name.clone(),
            status: ctx.status,
            variables: ctx.scope.flatten(),
            step_results: ctx.step_results,
            failed_step: ctx.failed_step,
            error: ctx.error,
            started_at,
            completed_at,
            duration_ms: (completed_at - started_at).num_milliseconds().max(0) as u64,
        };

        info!(
            workflow = %workflow.metadata.name,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "workflow run finished"
        );
        Ok(result)
    }

    /// Register the workflow's declared tools, tolerating tools that an
    /// earlier run already registered.
    fn register_tools(&self, workflow: &Workflow) {
        for (name, config) in &workflow.tools {
            match self.registry.register_tool(name, config.clone()) {
                Ok(()) => {}
                Err(e) if e.kind == flowdeck_core::ErrorKind::ProviderConflict => {
                    debug!(tool = %name, "tool already registered, keeping existing");
                }
                Err(e) => warn!(tool = %name, error = %e, "tool registration failed"),
            }
        }
    }

    // -- Step sequencing -----------------------------------------------------

    /// Run a step list sequentially.  Boxed because step kinds recurse.
    fn run_steps<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        steps: &'a [Step],
        run: &'a RunState<'a>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for step in steps {
                if run.token.is_cancelled() {
                    ctx.status = WorkflowStatus::Cancelled;
                    break;
                }
                self.run_step(ctx, step, run).await?;
                if ctx.status == WorkflowStatus::Cancelled {
                    break;
                }
            }
            Ok(())
        })
    }

    /// Run one step: conditions, the attempt loop, output assignment, and
    /// error-policy handling.
    async fn run_step(
        &self,
        ctx: &mut ExecutionContext,
        step: &Step,
        run: &RunState<'_>,
    ) -> Result<()> {
        let started_at = Utc::now();

        // Conditions: all must be truthy, otherwise the step is skipped.
        if let Some(conditions) = &step.conditions {
            for condition in conditions {
                match flowdeck_expr::evaluate_predicate(condition, &ctx.scope) {
                    Ok(true) => {}
                    Ok(false) => {
                        debug!(step = %step.id, condition, "condition false, skipping step");
                        ctx.record(step_record(
                            &step.id,
                            StepStatus::Skipped,
                            None,
                            None,
                            started_at,
                            0,
                        ));
                        return Ok(());
                    }
                    Err(e) => {
                        return self.handle_step_failure(ctx, step, e, started_at, 0);
                    }
                }
            }
        }

        let mut retry_count = 0u32;
        loop {
            let attempt = self.run_step_once(ctx, step, run);
            let outcome = match step.timeout_ms {
                Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), attempt).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(EngineError::timeout(format!(
                        "step `{}` exceeded {ms}ms",
                        step.id
                    ))),
                },
                None => attempt.await,
            };

            match outcome {
                Ok(output) => {
                    if let Some(name) = &step.output {
                        ctx.scope.set(name, output.clone());
                    }
                    ctx.record(step_record(
                        &step.id,
                        StepStatus::Completed,
                        Some(output),
                        None,
                        started_at,
                        retry_count,
                    ));
                    return Ok(());
                }
                Err(error) => {
                    if run.token.is_cancelled() {
                        ctx.status = WorkflowStatus::Cancelled;
                        ctx.record(step_record(
                            &step.id,
                            StepStatus::Skipped,
                            None,
                            Some("workflow cancelled".to_string()),
                            started_at,
                            retry_count,
                        ));
                        return Ok(());
                    }

                    if let Some(policy) = &step.retry
                        && policy.applies_to(error.kind)
                        && retry_count + 1 < policy.max_attempts
                    {
                        let delay = policy.delay_for_attempt(retry_count);
                        debug!(
                            step = %step.id,
                            retry = retry_count + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "step retrying"
                        );
                        tokio::time::sleep(delay).await;
                        retry_count += 1;
                        continue;
                    }

                    return self.handle_step_failure(ctx, step, error, started_at, retry_count);
                }
            }
        }
    }

    /// Apply the step's error policy to a final failure.
    fn handle_step_failure(
        &self,
        ctx: &mut ExecutionContext,
        step: &Step,
        error: EngineError,
        started_at: chrono::DateTime<Utc>,
        retry_count: u32,
    ) -> Result<()> {
        match step.on_error {
            ErrorPolicy::Fail => {
                warn!(step = %step.id, error = %error, "step failed, failing workflow");
                ctx.record(step_record(
                    &step.id,
                    StepStatus::Failed,
                    None,
                    Some(error.to_string()),
                    started_at,
                    retry_count,
                ));
                if ctx.failed_step.is_none() {
                    ctx.fail(&step.id, &error);
                } else {
                    ctx.status = WorkflowStatus::Failed;
                }
                Err(error)
            }
            ErrorPolicy::Continue => {
                warn!(step = %step.id, error = %error, "step failed, continuing");
                ctx.record(step_record(
                    &step.id,
                    StepStatus::Failed,
                    None,
                    Some(error.to_string()),
                    started_at,
                    retry_count,
                ));
                Ok(())
            }
            ErrorPolicy::Skip => {
                debug!(step = %step.id, error = %error, "step failed, marked skipped");
                ctx.record(step_record(
                    &step.id,
                    StepStatus::Skipped,
                    None,
                    Some(error.to_string()),
                    started_at,
                    retry_count,
                ));
                Ok(())
            }
        }
    }

    // -- Step dispatch -------------------------------------------------------

    /// Execute a step's behavior variant and produce its output value.
    fn run_step_once<'a>(
        &'a self,
        ctx: &'a mut ExecutionContext,
        step: &'a Step,
        run: &'a RunState<'a>,
    ) -> futures::future::BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match &step.kind {
                StepKind::Action { action, inputs } => {
                    let resolved =
                        flowdeck_expr::resolve(&Value::Object(inputs.clone()), &ctx.scope)?;
                    self.dispatch_action(ctx, action, resolved, run).await
                }

                StepKind::SubWorkflow { workflow, inputs } => {
                    let resolved =
                        flowdeck_expr::resolve(&Value::Object(inputs.clone()), &ctx.scope)?;
                    let inputs = resolved.as_object().cloned().unwrap_or_default();
                    self.run_sub_workflow(workflow, inputs, run).await
                }

                StepKind::If {
                    condition,
                    then,
                    r#else,
                } => {
                    let branch_taken = flowdeck_expr::evaluate_predicate(condition, &ctx.scope)?;
                    let branch = if branch_taken { then } else { r#else };
                    // Both branches run in the step's own scope.
                    self.run_steps(ctx, branch, run).await?;
                    Ok(Value::Bool(branch_taken))
                }

                StepKind::ForEach {
                    items,
                    item_var,
                    steps,
                    concurrency,
                } => {
                    self.run_foreach(ctx, items, item_var, steps, *concurrency, run)
                        .await
                }

                StepKind::Parallel { branches, wait } => {
                    self.run_parallel(ctx, branches, *wait, run).await
                }

                StepKind::While {
                    condition,
                    steps,
                    max_iterations,
                } => {
                    let cap = max_iterations
                        .unwrap_or(self.config.max_while_iterations)
                        .min(self.config.max_while_iterations);

                    let mut iterations = 0u64;
                    while iterations < cap {
                        if run.token.is_cancelled() {
                            ctx.status = WorkflowStatus::Cancelled;
                            break;
                        }
                        if !flowdeck_expr::evaluate_predicate(condition, &ctx.scope)? {
                            break;
                        }
                        // The body shares the step's scope so the condition
                        // can observe its writes.
                        self.run_steps(ctx, steps, run).await?;
                        iterations += 1;
                    }
                    Ok(json!({ "iterations": iterations }))
                }
            }
        })
    }

    /// Dispatch an action string, intercepting the engine-reserved
    /// `workflow.*` and `parallel.*` prefixes.
    async fn dispatch_action(
        &self,
        ctx: &mut ExecutionContext,
        action: &str,
        inputs: Value,
        run: &RunState<'_>,
    ) -> Result<Value> {
        if let Some(rest) = action.strip_prefix("workflow.") {
            return self.run_workflow_action(rest, inputs, run).await;
        }
        if let Some(rest) = action.strip_prefix("parallel.") {
            return self.run_parallel_action(rest, inputs, run).await;
        }

        // `script.execute` gets the current variable scope injected as
        // `context` unless the step supplied one explicitly.
        let inputs = if action == "script.execute" {
            let mut map = inputs.as_object().cloned().unwrap_or_default();
            map.entry("context".to_string())
                .or_insert_with(|| Value::Object(ctx.scope.flatten()));
            Value::Object(map)
        } else {
            inputs
        };

        let dispatch = self.registry.execute(action, inputs, run.permissions);
        tokio::select! {
            _ = run.token.cancelled() => Err(EngineError::timeout(format!(
                "call to `{action}` aborted: workflow cancelled"
            ))),
            result = dispatch => result,
        }
    }

    // -- Sub-workflows -------------------------------------------------------

    async fn run_workflow_action(
        &self,
        action: &str,
        inputs: Value,
        run: &RunState<'_>,
    ) -> Result<Value> {
        match action {
            "execute" => {
                let name = inputs
                    .get("workflow")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        EngineError::invalid_config("workflow.execute requires input `workflow`")
                    })?;
                let sub_inputs = inputs
                    .get("inputs")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                self.run_sub_workflow(name, sub_inputs, run).await
            }
            other => Err(EngineError::invalid_config(format!(
                "workflow has no action `{other}`"
            ))),
        }
    }

    async fn run_sub_workflow(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        run: &RunState<'_>,
    ) -> Result<Value> {
        let workflow = self
            .library
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                EngineError::provider_not_found(format!("workflow `{name}` is not in the library"))
            })?;

        debug!(workflow = %name, "running sub-workflow");
        let result = self
            .execute_with_cancel(&workflow, inputs, run.token.child_token())
            .await?;

        if result.status != WorkflowStatus::Completed {
            return Err(EngineError::internal(format!(
                "sub-workflow `{name}` {}: {}",
                match result.status {
                    WorkflowStatus::Cancelled => "was cancelled",
                    _ => "failed",
                },
                result.error.as_deref().unwrap_or("unknown error")
            )));
        }

        // The sub-run's variable scope (minus its inputs echo) is the
        // step's output.
        let mut variables = result.variables;
        variables.remove("inputs");
        Ok(Value::Object(variables))
    }

    // -- Fan-out actions -----------------------------------------------------

    async fn run_parallel_action(
        &self,
        action: &str,
        inputs: Value,
        run: &RunState<'_>,
    ) -> Result<Value> {
        match action {
            "map" => self.run_parallel_map(inputs, run).await,
            "spawn" => self.run_parallel_spawn(inputs, run).await,
            other => Err(EngineError::invalid_config(format!(
                "parallel has no action `{other}`"
            ))),
        }
    }

    /// `parallel.map` — run one action per item, preserving item order in
    /// the output.
    async fn run_parallel_map(&self, inputs: Value, run: &RunState<'_>) -> Result<Value> {
        let items = inputs
            .get("items")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                EngineError::invalid_config("parallel.map requires an `items` array")
            })?;
        let action = inputs
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::invalid_config("parallel.map requires input `action`"))?
            .to_string();
        let item_key = inputs
            .get("item_key")
            .and_then(Value::as_str)
            .unwrap_or("item")
            .to_string();
        let base = inputs
            .get("inputs")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let concurrency = inputs
            .get("concurrency")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(self.config.max_parallel_branches)
            .clamp(1, self.config.max_parallel_branches);

        let outputs: Vec<Result<Value>> = futures::stream::iter(items.into_iter().map(|item| {
            let mut call_inputs = base.clone();
            call_inputs.insert(item_key.clone(), item);
            let action = action.clone();
            async move {
                self.registry
                    .execute(&action, Value::Object(call_inputs), run.permissions)
                    .await
            }
        }))
        .buffered(concurrency)
        .collect()
        .await;

        let mut collected = Vec::with_capacity(outputs.len());
        for output in outputs {
            collected.push(output?);
        }
        Ok(Value::Array(collected))
    }

    /// `parallel.spawn` — run named single-action branches concurrently,
    /// reporting the same shape as a `parallel` step.
    async fn run_parallel_spawn(&self, inputs: Value, run: &RunState<'_>) -> Result<Value> {
        let branches = inputs
            .get("branches")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| {
                EngineError::invalid_config("parallel.spawn requires a `branches` array")
            })?;

        let mut pending = FuturesUnordered::new();
        for (index, branch) in branches.iter().enumerate() {
            let id = branch
                .get("id")
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("branch-{index}"));
            let action = branch
                .get("action")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| {
                    EngineError::invalid_config(format!(
                        "parallel.spawn branch `{id}` is missing `action`"
                    ))
                })?;
            let call_inputs = branch.get("inputs").cloned().unwrap_or(json!({}));

            pending.push(async move {
                let started = std::time::Instant::now();
                let outcome = self
                    .registry
                    .execute(&action, call_inputs, run.permissions)
                    .await;
                (id, outcome, started.elapsed().as_millis() as u64)
            });
        }

        let mut successful = Vec::new();
        let mut failed = Vec::new();
        let mut results = Map::new();
        let mut errors = Map::new();
        let mut timing = Map::new();

        while let Some((id, outcome, elapsed_ms)) = pending.next().await {
            timing.insert(id.clone(), json!(elapsed_ms));
            match outcome {
                Ok(value) => {
                    successful.push(id.clone());
                    results.insert(id, value);
                }
                Err(e) => {
                    failed.push(id.clone());
                    errors.insert(id, json!(e.to_string()));
                }
            }
        }

        successful.sort();
        failed.sort();
        Ok(json!({
            "successful": successful,
            "failed": failed,
            "results": results,
            "errors": errors,
            "timing": timing,
            "costs": {},
        }))
    }

    // -- For-each ------------------------------------------------------------

    async fn run_foreach(
        &self,
        ctx: &mut ExecutionContext,
        items_expr: &str,
        item_var: &str,
        steps: &[Step],
        concurrency: Option<usize>,
        run: &RunState<'_>,
    ) -> Result<Value> {
        let items_value = if items_expr.contains("{{") {
            flowdeck_expr::resolve_template(items_expr, &ctx.scope)?
        } else {
            flowdeck_expr::evaluate(items_expr, &ctx.scope)?
        };
        let items = items_value.as_array().cloned().ok_or_else(|| {
            EngineError::expression(format!(
                "for-each items `{items_expr}` did not evaluate to an array"
            ))
        })?;

        let concurrency = concurrency.unwrap_or(1).max(1);
        debug!(
            items = items.len(),
            concurrency,
            "for-each starting"
        );

        // The iteration's output slot: the value of the last body step
        // that declares an output, read from the iteration scope after it
        // finishes.  Skipped iterations leave the slot null, preserving
        // index alignment with the input.
        let output_var = steps.iter().rev().find_map(|s| s.output.clone());

        let mut outputs = vec![Value::Null; items.len()];

        if concurrency <= 1 {
            for (index, item) in items.into_iter().enumerate() {
                if run.token.is_cancelled() {
                    ctx.status = WorkflowStatus::Cancelled;
                    break;
                }
                let mut iteration = ctx.fork_iteration();
                iteration.scope.set(item_var, item);
                bind_item_index(&mut iteration, index);

                let outcome = self.run_steps(&mut iteration, steps, run).await;
                if let Some(name) = &output_var {
                    outputs[index] = iteration.scope.get(name).cloned().unwrap_or(Value::Null);
                }
                ctx.absorb_results(iteration);
                outcome?;
            }
        } else {
            let mut forks = Vec::with_capacity(items.len());
            for (index, item) in items.into_iter().enumerate() {
                let mut iteration = ctx.fork_iteration();
                iteration.scope.set(item_var, item);
                bind_item_index(&mut iteration, index);
                forks.push((index, iteration));
            }

            let finished: Vec<(usize, ExecutionContext, Result<()>)> =
                futures::stream::iter(forks.into_iter().map(|(index, mut iteration)| async move {
                    let outcome = self.run_steps(&mut iteration, steps, run).await;
                    (index, iteration, outcome)
                }))
                .buffered(concurrency)
                .collect()
                .await;

            let mut first_error = None;
            for (index, iteration, outcome) in finished {
                if let Some(name) = &output_var {
                    outputs[index] = iteration.scope.get(name).cloned().unwrap_or(Value::Null);
                }
                ctx.absorb_results(iteration);
                if let Err(e) = outcome
                    && first_error.is_none()
                {
                    first_error = Some(e);
                }
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        Ok(Value::Array(outputs))
    }

    // -- Parallel steps ------------------------------------------------------

    async fn run_parallel(
        &self,
        ctx: &mut ExecutionContext,
        branches: &[Branch],
        wait: WaitPolicy,
        run: &RunState<'_>,
    ) -> Result<Value> {
        let total = branches.len();
        if total == 0 {
            return Err(EngineError::invalid_config(
                "parallel step has no branches",
            ));
        }

        // `majority` means: stop once more than half of the branches have
        // succeeded; if that becomes impossible, run every branch out.
        let majority_threshold = total / 2 + 1;

        let branch_tokens: Vec<CancellationToken> =
            (0..total).map(|_| run.token.child_token()).collect();

        let mut pending = FuturesUnordered::new();
        for (index, branch) in branches.iter().enumerate() {
            let fork = ctx.fork_branch();
            let branch_run = RunState {
                token: branch_tokens[index].clone(),
                permissions: run.permissions,
            };
            pending.push(async move {
                let mut fork = fork;
                let started = std::time::Instant::now();
                let outcome = self.run_steps(&mut fork, &branch.steps, &branch_run).await;
                (index, fork, outcome, started.elapsed().as_millis() as u64)
            });
        }

        #[derive(Debug, PartialEq)]
        enum BranchState {
            Succeeded,
            Failed,
            Skipped,
        }
        let mut states: Vec<BranchState> = (0..total).map(|_| BranchState::Skipped).collect();
        let mut forks: Vec<Option<ExecutionContext>> = (0..total).map(|_| None).collect();
        let mut errors = Map::new();
        let mut timing = Map::new();
        let mut successes = 0usize;
        let mut first_error: Option<String> = None;

        while let Some((index, fork, outcome, elapsed_ms)) = pending.next().await {
            let branch_id = &branches[index].id;
            timing.insert(branch_id.clone(), json!(elapsed_ms));

            match outcome {
                // A branch unwound by workflow-level cancellation finished
                // without running out; it stays skipped.
                Ok(()) if fork.status == WorkflowStatus::Cancelled => {
                    states[index] = BranchState::Skipped;
                }
                Ok(()) if fork.status != WorkflowStatus::Failed => {
                    states[index] = BranchState::Succeeded;
                    successes += 1;
                }
                Ok(()) => {
                    states[index] = BranchState::Failed;
                    let message = fork
                        .error
                        .clone()
                        .unwrap_or_else(|| "branch failed".to_string());
                    errors.insert(branch_id.clone(), json!(message.clone()));
                    first_error.get_or_insert(message);
                }
                Err(e) => {
                    states[index] = BranchState::Failed;
                    errors.insert(branch_id.clone(), json!(e.to_string()));
                    first_error.get_or_insert(e.to_string());
                }
            }
            forks[index] = Some(fork);

            let stop = match wait {
                WaitPolicy::All => false,
                WaitPolicy::Any => successes >= 1,
                WaitPolicy::Majority => successes >= majority_threshold,
            };
            if stop {
                for token in &branch_tokens {
                    token.cancel();
                }
                break;
            }
        }
        // Dropping the unfinished futures abandons those branches; they
        // stay recorded as skipped.
        drop(pending);

        // Write declared outputs back to the parent scope in
        // branch-definition order, successful branches only, then absorb
        // every finished branch's step records.
        let mut results = Map::new();
        for (index, branch) in branches.iter().enumerate() {
            let Some(fork) = forks[index].take() else {
                continue;
            };
            if states[index] == BranchState::Succeeded {
                let mut branch_output = Value::Null;
                for step in &branch.steps {
                    if let Some(name) = &step.output
                        && let Some(value) = fork.scope.get(name)
                    {
                        ctx.scope.set(name, value.clone());
                        branch_output = value.clone();
                    }
                }
                results.insert(branch.id.clone(), branch_output);
            }
            ctx.absorb_results(fork);
        }

        let successful: Vec<&str> = branches
            .iter()
            .enumerate()
            .filter(|(i, _)| states[*i] == BranchState::Succeeded)
            .map(|(_, b)| b.id.as_str())
            .collect();
        let failed: Vec<&str> = branches
            .iter()
            .enumerate()
            .filter(|(i, _)| states[*i] == BranchState::Failed)
            .map(|(_, b)| b.id.as_str())
            .collect();
        let skipped: Vec<&str> = branches
            .iter()
            .enumerate()
            .filter(|(i, _)| states[*i] == BranchState::Skipped)
            .map(|(_, b)| b.id.as_str())
            .collect();

        let step_failed = match wait {
            WaitPolicy::All => !failed.is_empty(),
            WaitPolicy::Any => successes == 0,
            WaitPolicy::Majority => successes < majority_threshold,
        };

        let report = json!({
            "successful": successful,
            "failed": failed,
            "skipped": skipped,
            "results": results,
            "errors": errors,
            "timing": timing,
            "costs": {},
        });

        if step_failed {
            return Err(EngineError::internal(format!(
                "parallel step did not satisfy wait policy {wait:?}: {}",
                first_error.unwrap_or_else(|| "no branch succeeded".to_string())
            )));
        }
        Ok(report)
    }
}

/// Bind the iteration index under both accepted spellings, matching the
/// camelCase tolerance of the document fields.
fn bind_item_index(iteration: &mut ExecutionContext, index: usize) {
    iteration.scope.set("itemIndex", json!(index));
    iteration.scope.set("item_index", json!(index));
}
