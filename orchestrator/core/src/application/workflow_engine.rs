//! Workflow Engine Application Service
//!
//! This module implements the scheduling engine that drives runs across a
//! step dependency graph.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrate run execution (scheduling tick loop)
//! - **Dependencies:** Domain (WorkflowDefinition, WorkflowRun),
//!   Application (ToolInvocationService, SagaManager, LoopSafetyMonitor,
//!   BudgetController), Infrastructure (EventBus, Repositories)
//!
//! # Scheduling Tick
//!
//! ```text
//! loop {
//!     budget check            -> proceed | downgrade tier | abort
//!     settle cascading skips
//!     ready = steps whose dependencies are all Success
//!     dispatch ready steps concurrently (bounded fan-out)
//!     for each completed step:
//!         on success: saga write-ahead, then record Success
//!         on bulkhead-full: defer (bounded), redispatch next tick
//!         on failure: record Failed, route run to compensation
//!     loop-safety check       -> continue | cut
//! }
//! ```
//!
//! A run settles `Committed` when every step is Success/Skipped, or
//! `Failed` after the saga manager has rolled back committed steps. The
//! operator-visible failure surface is always the `CompensationReport`.

use chrono::Utc;
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::budget::{BudgetController, BudgetDecision};
use crate::application::loop_safety::{CutReason, LoopSafetyMonitor, Verdict};
use crate::application::saga_manager::SagaManager;
use crate::application::tool_invocation_service::{
    InvokeError, InvokePolicy, ToolInvocationService,
};
use crate::domain::events::RunEvent;
use crate::domain::repository::{RepositoryError, RunRepository, WorkflowRepository};
use crate::domain::run::{
    ExecutionTier, RunError, RunId, RunState, StepResult, TenantId, WorkflowRun,
};
use crate::domain::saga::CompensationReport;
use crate::domain::tool::{IdempotencyKey, ToolContext, ToolRegistry};
use crate::domain::workflow::{
    StepId, WorkflowDefinition, WorkflowError, WorkflowId, WorkflowVersion,
};
use crate::infrastructure::event_bus::EventBus;

// ============================================================================
// Configuration & Errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bulkhead-full redispatches allowed per step before it fails;
    /// deliberately separate from the step's retry budget
    pub max_dispatch_deferrals: u32,

    /// Pause before redispatching a tick that only deferred steps
    pub deferral_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_dispatch_deferrals: 8,
            deferral_delay: Duration::from_millis(25),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Workflow {0} not found")]
    WorkflowNotFound(WorkflowId),

    #[error("Run {0} not found")]
    RunNotFound(RunId),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Run(#[from] RunError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error("Template rendering failed: {0}")]
    Template(String),
}

// ============================================================================
// Application Service: WorkflowEngine
// ============================================================================

/// Workflow Engine (Application Service)
///
/// Owns each run exclusively between `start_run` and its terminal state.
pub struct WorkflowEngine {
    /// Workflow definition repository
    workflows: Arc<dyn WorkflowRepository>,

    /// Run state repository
    runs: Arc<dyn RunRepository>,

    /// Reliability wrapper for every tool call
    invocation: Arc<ToolInvocationService>,

    /// Write-ahead compensation log and rollback driver
    saga: Arc<SagaManager>,

    /// Loop-safety backstop
    monitor: LoopSafetyMonitor,

    /// Budget and degradation controller
    budget: BudgetController,

    /// Event bus for outbound domain events
    event_bus: Arc<EventBus>,

    /// Template renderer (Handlebars)
    template_engine: Arc<handlebars::Handlebars<'static>>,

    /// Cancellation tokens for in-flight runs
    active: DashMap<RunId, CancellationToken>,

    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        runs: Arc<dyn RunRepository>,
        invocation: Arc<ToolInvocationService>,
        saga: Arc<SagaManager>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            workflows,
            runs,
            invocation,
            saga,
            monitor: LoopSafetyMonitor::new(),
            budget: BudgetController::new(),
            event_bus,
            template_engine: Arc::new(handlebars::Handlebars::new()),
            active: DashMap::new(),
            config,
        }
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    // ========================================================================
    // Workflow Management
    // ========================================================================

    /// Register a workflow definition, resolving every referenced tool
    /// against the adapter registry up front
    pub async fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<WorkflowId, EngineError> {
        let registry = self.invocation.registry();
        for step in &definition.steps {
            if !registry.contains(&step.tool_id) {
                return Err(WorkflowError::UnknownTool {
                    step: step.id.clone(),
                    tool: step.tool_id.clone(),
                }
                .into());
            }
            if let Some(compensation) = &step.compensation {
                if !registry.contains(&compensation.tool_id) {
                    return Err(WorkflowError::UnknownTool {
                        step: step.id.clone(),
                        tool: compensation.tool_id.clone(),
                    }
                    .into());
                }
            }
        }

        let workflow_id = definition.id;
        info!(
            workflow_id = %workflow_id,
            workflow_name = %definition.metadata.name,
            version = %definition.version,
            "Registering workflow"
        );
        self.workflows.save(&definition).await?;
        Ok(workflow_id)
    }

    pub async fn workflow_by_name(&self, name: &str) -> Option<WorkflowDefinition> {
        self.workflows.find_by_name(name).await.ok().flatten()
    }

    // ========================================================================
    // Run Lifecycle
    // ========================================================================

    /// Create a run in `Pending`; the first tick dispatches it
    pub async fn start_run(
        &self,
        workflow_id: WorkflowId,
        version: Option<WorkflowVersion>,
        tenant_id: TenantId,
        input: serde_json::Value,
    ) -> Result<RunId, EngineError> {
        let definition = match version {
            Some(version) => self.workflows.find(workflow_id, version).await?,
            None => self.workflows.latest(workflow_id).await?,
        }
        .ok_or(EngineError::WorkflowNotFound(workflow_id))?;

        let run = WorkflowRun::new(&definition, tenant_id, input);
        let run_id = run.run_id;
        self.runs.save(&run).await?;
        self.active.insert(run_id, CancellationToken::new());

        info!(
            run_id = %run_id,
            workflow_name = %definition.metadata.name,
            version = %definition.version,
            tenant_id = %run.tenant_id,
            "Run created"
        );
        Ok(run_id)
    }

    /// Request cancellation; in-flight invocations observe it at the next
    /// retry/backoff boundary and the run rolls back committed steps
    pub async fn cancel_run(&self, run_id: RunId) -> Result<(), EngineError> {
        if let Some(token) = self.active.get(&run_id) {
            info!(run_id = %run_id, "Cancellation requested");
            token.cancel();
            return Ok(());
        }
        if self.runs.find_archived(run_id).await?.is_some() {
            // Already settled; nothing to cancel
            return Ok(());
        }
        Err(EngineError::RunNotFound(run_id))
    }

    /// Drive a run until it settles; returns the terminal state
    pub async fn run_to_completion(&self, run_id: RunId) -> Result<RunState, EngineError> {
        while self.tick(run_id).await? {}
        let run = self
            .runs
            .find_archived(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        Ok(run.state)
    }

    /// Rollback outcome for a failed run, once archived
    pub async fn failure_report(
        &self,
        run_id: RunId,
    ) -> Result<Option<CompensationReport>, EngineError> {
        Ok(self
            .runs
            .find_archived(run_id)
            .await?
            .and_then(|run| run.failure_report))
    }

    pub async fn archived_run(&self, run_id: RunId) -> Result<Option<WorkflowRun>, EngineError> {
        Ok(self.runs.find_archived(run_id).await?)
    }

    // ========================================================================
    // Scheduling Tick
    // ========================================================================

    /// Advance the run by one scheduling tick
    ///
    /// Returns:
    /// - `Ok(true)` if the run is still executing
    /// - `Ok(false)` once the run has settled (`Committed` or `Failed`)
    pub async fn tick(&self, run_id: RunId) -> Result<bool, EngineError> {
        let Some(mut run) = self.runs.find(run_id).await? else {
            // Terminal runs are archived; report them as settled
            if self.runs.find_archived(run_id).await?.is_some() {
                return Ok(false);
            }
            return Err(EngineError::RunNotFound(run_id));
        };
        if run.state.is_terminal() {
            return Ok(false);
        }

        let definition = self
            .workflows
            .find(run.workflow_id, run.workflow_version)
            .await?
            .ok_or(EngineError::WorkflowNotFound(run.workflow_id))?;

        let cancel = self
            .active
            .get(&run_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if run.state == RunState::Pending {
            run.transition_to(RunState::Running)?;
            info!(
                run_id = %run_id,
                workflow_name = %definition.metadata.name,
                "Run started"
            );
            self.event_bus.publish(RunEvent::RunStarted {
                run_id,
                tenant_id: run.tenant_id.clone(),
                workflow_id: run.workflow_id,
                started_at: Utc::now(),
            });
            self.runs.save(&run).await?;
        }

        if cancel.is_cancelled() {
            self.fail_with_compensation(&mut run, "run cancelled".to_string())
                .await?;
            return Ok(false);
        }

        match self.budget.check(&run, &definition.budget) {
            BudgetDecision::Proceed => {}
            BudgetDecision::Downgrade(tier) => {
                if run.tier == ExecutionTier::Standard {
                    run.tier = tier;
                    run.transition_to(RunState::Degraded)?;
                    warn!(run_id = %run_id, "Soft budget ceiling crossed, degrading run");
                    self.event_bus.publish(RunEvent::RunDegraded {
                        run_id,
                        tenant_id: run.tenant_id.clone(),
                        reason: "soft budget ceiling crossed".to_string(),
                        degraded_at: Utc::now(),
                    });
                    self.runs.save(&run).await?;
                }
            }
            BudgetDecision::Abort(reason) => {
                self.fail_with_compensation(&mut run, format!("budget abort: {}", reason))
                    .await?;
                return Ok(false);
            }
        }

        // Settle cascading skips before computing the ready set
        loop {
            let skips = run.steps_to_skip(&definition);
            if skips.is_empty() {
                break;
            }
            for step_id in skips {
                debug!(run_id = %run_id, step_id = %step_id, "Skipping step");
                run.record_step_result(StepResult::skipped(step_id))?;
            }
        }

        if run.all_settled(&definition) {
            self.commit_run(&mut run).await?;
            return Ok(false);
        }

        let ready = run.ready_steps(&definition);
        if ready.is_empty() {
            // Cannot happen with a validated DAG; cut rather than spin
            self.fail_with_compensation(&mut run, "no dispatchable steps remain".to_string())
                .await?;
            return Ok(false);
        }

        let remaining = definition.loop_safety.max_steps.saturating_sub(run.step_count) as usize;
        if remaining == 0 {
            let reason = CutReason::StepLimitExceeded {
                limit: definition.loop_safety.max_steps,
            };
            self.fail_with_compensation(&mut run, reason.to_string())
                .await?;
            return Ok(false);
        }

        let batch: Vec<StepId> = ready
            .into_iter()
            .take(definition.fan_out_limit.min(remaining))
            .collect();

        let (progressed, terminal_failure) = self
            .dispatch_batch(&mut run, &definition, batch, &cancel)
            .await?;

        if let Some(cause) = terminal_failure {
            self.fail_with_compensation(&mut run, cause).await?;
            return Ok(false);
        }

        if progressed {
            if let Verdict::Cut(reason) = self.monitor.check_and_record(&mut run, &definition) {
                warn!(run_id = %run_id, reason = %reason, "Loop-safety cut");
                counter!("relay_loop_safety_cuts_total").increment(1);
                self.fail_with_compensation(&mut run, reason.to_string())
                    .await?;
                return Ok(false);
            }
        }

        if run.all_settled(&definition) {
            self.commit_run(&mut run).await?;
            return Ok(false);
        }

        self.runs.save(&run).await?;
        if !progressed {
            // Only deferrals this tick; let bulkhead slots free up
            tokio::time::sleep(self.config.deferral_delay).await;
        }
        Ok(true)
    }

    /// Dispatch a batch of ready steps concurrently and fold the results
    /// into the run. Returns `(progressed, terminal_failure)`.
    async fn dispatch_batch(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
        batch: Vec<StepId>,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<String>), EngineError> {
        let context = self.template_context(run);
        let mut join_set = JoinSet::new();
        let mut progressed = false;
        let mut terminal_failure: Option<String> = None;

        for step_id in batch {
            let Some(step) = definition.step(&step_id) else {
                continue;
            };

            // A template that fails to render is a definition bug; fail the
            // step rather than wedging the run mid-tick
            let key_template = step.idempotency_key.as_deref().unwrap_or_default();
            let rendered = self
                .render(&step.input, &context)
                .and_then(|input| Ok((input, self.render(key_template, &context)?)));
            let (rendered_input, rendered_key) = match rendered {
                Ok(pair) => pair,
                Err(error) => {
                    let cause = format!("step '{}' input template invalid: {}", step_id, error);
                    run.record_step_result(StepResult::failed(step_id.clone(), cause.clone(), 0))?;
                    self.publish_step_failed(run, step, &cause);
                    terminal_failure.get_or_insert(cause);
                    progressed = true;
                    continue;
                }
            };
            let payload = parse_rendered(rendered_input);
            let key = if step.idempotency_key.is_some() {
                IdempotencyKey::new(rendered_key)
            } else {
                IdempotencyKey::derived(&run.run_id, &step.id, "step")
            };

            debug!(
                run_id = %run.run_id,
                step_id = %step_id,
                tool_id = %step.tool_id,
                "Dispatching step"
            );
            self.event_bus.publish(RunEvent::StepStarted {
                run_id: run.run_id,
                tenant_id: run.tenant_id.clone(),
                step_id: step.id.clone(),
                tool_id: step.tool_id.clone(),
                started_at: Utc::now(),
            });

            let service = self.invocation.clone();
            let policy = InvokePolicy::from(step);
            let ctx = ToolContext {
                run_id: run.run_id,
                tenant_id: run.tenant_id.clone(),
                step_id: step.id.clone(),
                tool_id: step.tool_id.clone(),
                attempt: 0,
                tier: run.tier,
                config: step.config.clone(),
            };
            let step_cancel = cancel.child_token();
            let id = step.id.clone();
            join_set.spawn(async move {
                let result = service.invoke(key, payload, policy, ctx, step_cancel).await;
                (id, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (step_id, result) = match joined {
                Ok(pair) => pair,
                Err(join_error) => {
                    terminal_failure
                        .get_or_insert(format!("step task aborted: {}", join_error));
                    continue;
                }
            };
            let Some(step) = definition.step(&step_id) else {
                continue;
            };

            match result {
                Ok(outcome) => {
                    // Write-ahead: the compensation intent is durable before
                    // the step is marked Success in the run
                    if let Some(spec) = &step.compensation {
                        let mut comp_context = self.template_context(run);
                        comp_context["output"] = outcome.response.output.clone();
                        let recorded = match self.render(&spec.payload, &comp_context) {
                            Ok(rendered) => self
                                .saga
                                .record_commit(
                                    run.run_id,
                                    &step.id,
                                    spec,
                                    parse_rendered(rendered),
                                )
                                .await
                                .map_err(|e| e.to_string()),
                            Err(e) => Err(e.to_string()),
                        };
                        if let Err(cause) = recorded {
                            let cause = format!(
                                "step '{}' succeeded but its compensation intent could not be recorded: {}",
                                step_id, cause
                            );
                            run.record_step_result(StepResult::failed(
                                step_id.clone(),
                                cause.clone(),
                                outcome.attempt_count,
                            ))?;
                            self.publish_step_failed(run, step, &cause);
                            terminal_failure.get_or_insert(cause);
                            progressed = true;
                            continue;
                        }
                    }

                    info!(
                        run_id = %run.run_id,
                        step_id = %step_id,
                        attempts = outcome.attempt_count,
                        deduplicated = outcome.deduplicated,
                        "Step succeeded"
                    );
                    self.event_bus.publish(RunEvent::StepSucceeded {
                        run_id: run.run_id,
                        tenant_id: run.tenant_id.clone(),
                        step_id: step.id.clone(),
                        tool_id: step.tool_id.clone(),
                        attempt_count: outcome.attempt_count,
                        succeeded_at: Utc::now(),
                    });
                    run.record_step_result(StepResult::success(
                        step_id,
                        outcome.response.output,
                        outcome.attempt_count,
                        outcome.response.cost_units,
                    ))?;
                    progressed = true;
                }
                Err(InvokeError::BulkheadFull(_)) => {
                    // Not counted against the step's retry budget; the step
                    // stays pending and is redispatched on a later tick
                    let deferrals = run.note_deferral(&step_id);
                    if deferrals > self.config.max_dispatch_deferrals {
                        let cause = format!(
                            "step '{}' starved by bulkhead after {} deferrals",
                            step_id, deferrals
                        );
                        run.record_step_result(StepResult::failed(
                            step_id.clone(),
                            cause.clone(),
                            0,
                        ))?;
                        self.publish_step_failed(run, step, &cause);
                        terminal_failure.get_or_insert(cause);
                    } else {
                        debug!(
                            run_id = %run.run_id,
                            step_id = %step_id,
                            deferrals,
                            "Bulkhead full, step deferred"
                        );
                    }
                }
                Err(InvokeError::Cancelled) => {
                    terminal_failure
                        .get_or_insert(format!("step '{}' cancelled", step_id));
                }
                Err(error) => {
                    let cause = error.to_string();
                    warn!(
                        run_id = %run.run_id,
                        step_id = %step_id,
                        error = %cause,
                        "Step failed"
                    );
                    run.record_step_result(StepResult::failed(
                        step_id.clone(),
                        cause.clone(),
                        error.attempts(),
                    ))?;
                    self.publish_step_failed(run, step, &cause);
                    terminal_failure.get_or_insert(format!("step '{}' failed: {}", step_id, cause));
                    progressed = true;
                }
            }
        }

        Ok((progressed, terminal_failure))
    }

    // ========================================================================
    // Terminal Paths
    // ========================================================================

    async fn commit_run(&self, run: &mut WorkflowRun) -> Result<(), EngineError> {
        run.transition_to(RunState::Committed)?;
        info!(
            run_id = %run.run_id,
            steps = run.step_count,
            cost_units = run.consumed_cost_units,
            "Run committed"
        );
        counter!("relay_runs_total", "outcome" => "committed").increment(1);
        self.event_bus.publish(RunEvent::RunCommitted {
            run_id: run.run_id,
            tenant_id: run.tenant_id.clone(),
            workflow_id: run.workflow_id,
            committed_at: Utc::now(),
        });
        self.saga.prune(run.run_id).await?;
        self.runs.archive(run).await?;
        self.active.remove(&run.run_id);
        Ok(())
    }

    async fn fail_with_compensation(
        &self,
        run: &mut WorkflowRun,
        cause: String,
    ) -> Result<(), EngineError> {
        warn!(run_id = %run.run_id, cause = %cause, "Run entering compensation");
        run.failure_cause = Some(cause.clone());
        run.transition_to(RunState::Compensating)?;
        self.runs.save(run).await?;

        // The dispatch loop has quiesced; rollback runs under a fresh token
        // so the cancellation that killed the forward path cannot kill it
        let report = self.saga.compensate(run, CancellationToken::new()).await?;
        if !report.fully_compensated() {
            warn!(
                run_id = %run.run_id,
                uncompensated = report.uncompensated_steps().len(),
                "Partial compensation failure"
            );
        }
        run.failure_report = Some(report);
        run.transition_to(RunState::Failed)?;
        counter!("relay_runs_total", "outcome" => "failed").increment(1);
        self.event_bus.publish(RunEvent::RunFailed {
            run_id: run.run_id,
            tenant_id: run.tenant_id.clone(),
            workflow_id: run.workflow_id,
            cause,
            failed_at: Utc::now(),
        });
        self.runs.archive(run).await?;
        self.active.remove(&run.run_id);
        Ok(())
    }

    fn publish_step_failed(
        &self,
        run: &WorkflowRun,
        step: &crate::domain::workflow::Step,
        cause: &str,
    ) {
        self.event_bus.publish(RunEvent::StepFailed {
            run_id: run.run_id,
            tenant_id: run.tenant_id.clone(),
            step_id: step.id.clone(),
            tool_id: step.tool_id.clone(),
            cause: cause.to_string(),
            failed_at: Utc::now(),
        });
    }

    // ========================================================================
    // Template Rendering
    // ========================================================================

    fn template_context(&self, run: &WorkflowRun) -> serde_json::Value {
        let mut steps = serde_json::Map::new();
        for (step_id, result) in &run.step_results {
            steps.insert(
                step_id.to_string(),
                serde_json::json!({ "output": result.output }),
            );
        }
        serde_json::json!({
            "run": { "input": run.input },
            "steps": steps,
        })
    }

    fn render(&self, template: &str, context: &serde_json::Value) -> Result<String, EngineError> {
        self.template_engine
            .render_template(template, context)
            .map_err(|e| EngineError::Template(e.to_string()))
    }
}

/// Rendered templates that form valid JSON become structured payloads;
/// anything else is passed through as a string
fn parse_rendered(rendered: String) -> serde_json::Value {
    serde_json::from_str(&rendered).unwrap_or(serde_json::Value::String(rendered))
}
