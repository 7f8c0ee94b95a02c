// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Run Domain Model
//!
//! A `WorkflowRun` is the runtime aggregate for one execution of a workflow
//! definition. It is owned exclusively by the workflow engine for its
//! lifetime: created on start, archived on terminal state. All bookkeeping
//! the loop-safety monitor and budget controller need (progress hashes,
//! step counts, consumed cost units) lives here, keyed by value rather
//! than by references into other aggregates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

use crate::domain::saga::CompensationReport;
use crate::domain::workflow::{StepId, WorkflowDefinition, WorkflowId, WorkflowVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant owning a run; tool-level shared state (breakers, bulkheads) is
/// deliberately cross-tenant
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects: Run State
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Running,
    /// Budget soft ceiling crossed; still executing, on the cheaper tier
    Degraded,
    Committed,
    Compensating,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Committed | RunState::Failed)
    }

    /// States in which the engine may dispatch new steps
    pub fn is_schedulable(&self) -> bool {
        matches!(self, RunState::Running | RunState::Degraded)
    }

    fn can_transition(&self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Compensating)
                | (Running, Degraded)
                | (Running, Committed)
                | (Running, Compensating)
                | (Degraded, Committed)
                | (Degraded, Compensating)
                | (Compensating, Failed)
        )
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunState::Pending => "pending",
            RunState::Running => "running",
            RunState::Degraded => "degraded",
            RunState::Committed => "committed",
            RunState::Compensating => "compensating",
            RunState::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// Execution tier selected by the budget controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionTier {
    Standard,
    Economy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Success,
    Failed,
    Skipped,
}

/// Outcome of one step within a run, recorded at most once
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    pub output: serde_json::Value,
    pub error: Option<String>,
    pub attempt_count: u32,
    pub cost_units: f64,
    pub committed_at: DateTime<Utc>,
}

impl StepResult {
    pub fn success(step_id: StepId, output: serde_json::Value, attempts: u32, cost: f64) -> Self {
        Self {
            step_id,
            status: StepStatus::Success,
            output,
            error: None,
            attempt_count: attempts,
            cost_units: cost,
            committed_at: Utc::now(),
        }
    }

    pub fn failed(step_id: StepId, error: String, attempts: u32) -> Self {
        Self {
            step_id,
            status: StepStatus::Failed,
            output: serde_json::Value::Null,
            error: Some(error),
            attempt_count: attempts,
            cost_units: 0.0,
            committed_at: Utc::now(),
        }
    }

    pub fn skipped(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Skipped,
            output: serde_json::Value::Null,
            error: None,
            attempt_count: 0,
            cost_units: 0.0,
            committed_at: Utc::now(),
        }
    }
}

/// One loop-safety observation: digests of the externally observable state
///
/// `composite` covers the pending step set plus the output window;
/// `outputs` covers the output window alone and is what oscillation
/// detection compares, so that repeating output cycles are caught even
/// while the pending set shrinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub composite: String,
    pub outputs: String,
}

// ============================================================================
// Aggregate: WorkflowRun
// ============================================================================

/// Runtime state of one workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub workflow_id: WorkflowId,
    pub workflow_version: WorkflowVersion,
    pub state: RunState,
    pub tier: ExecutionTier,
    pub input: serde_json::Value,
    pub step_results: HashMap<StepId, StepResult>,
    /// Step ids in commit order; drives the loop-safety output window and
    /// deterministic reporting
    pub commit_log: Vec<StepId>,
    /// Executed (Success or Failed) steps; Skipped steps do not count
    pub step_count: u64,
    /// Bounded ring of recent progress samples
    pub progress_hash_history: VecDeque<ProgressSample>,
    /// Total samples ever recorded; monotonically non-decreasing in step_count
    pub progress_samples_total: u64,
    /// Consecutive samples with an unchanged output digest
    pub stagnant_ticks: u32,
    pub consumed_cost_units: f64,
    /// Bulkhead-full redispatch counts, per step; not part of retry budgets
    pub dispatch_deferrals: HashMap<StepId, u32>,
    /// Why the run left the happy path (step failure, loop cut, budget abort)
    pub failure_cause: Option<String>,
    /// Operator-visible rollback outcome for failed runs
    pub failure_report: Option<CompensationReport>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        definition: &WorkflowDefinition,
        tenant_id: TenantId,
        input: serde_json::Value,
    ) -> Self {
        Self {
            run_id: RunId::new(),
            tenant_id,
            workflow_id: definition.id,
            workflow_version: definition.version,
            state: RunState::Pending,
            tier: ExecutionTier::Standard,
            input,
            step_results: HashMap::new(),
            commit_log: Vec::new(),
            step_count: 0,
            progress_hash_history: VecDeque::new(),
            progress_samples_total: 0,
            stagnant_ticks: 0,
            consumed_cost_units: 0.0,
            dispatch_deferrals: HashMap::new(),
            failure_cause: None,
            failure_report: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition the run to a new state, enforcing the legal state machine
    pub fn transition_to(&mut self, state: RunState) -> Result<(), RunError> {
        if !self.state.can_transition(state) {
            return Err(RunError::InvalidTransition {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        if state.is_terminal() {
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record a step result, at most once per step per run
    pub fn record_step_result(&mut self, result: StepResult) -> Result<(), RunError> {
        if self.step_results.contains_key(&result.step_id) {
            return Err(RunError::DuplicateStepResult(result.step_id.clone()));
        }
        if result.status != StepStatus::Skipped {
            self.step_count += 1;
        }
        self.consumed_cost_units += result.cost_units;
        self.commit_log.push(result.step_id.clone());
        self.step_results.insert(result.step_id.clone(), result);
        Ok(())
    }

    pub fn step_result(&self, id: &StepId) -> Option<&StepResult> {
        self.step_results.get(id)
    }

    /// Steps whose dependencies are all `Success` and which have no result yet
    pub fn ready_steps(&self, definition: &WorkflowDefinition) -> Vec<StepId> {
        definition
            .steps
            .iter()
            .filter(|step| !self.step_results.contains_key(&step.id))
            .filter(|step| {
                step.depends_on.iter().all(|dep| {
                    self.step_result(dep)
                        .map(|r| r.status == StepStatus::Success)
                        .unwrap_or(false)
                })
            })
            .map(|step| step.id.clone())
            .collect()
    }

    /// Unsettled steps that must be skipped before scheduling: all
    /// dependencies settled, and either a dependency was skipped (skips
    /// cascade) or the run is degraded and the step opts out of the
    /// cheaper tier
    pub fn steps_to_skip(&self, definition: &WorkflowDefinition) -> Vec<StepId> {
        definition
            .steps
            .iter()
            .filter(|step| !self.step_results.contains_key(&step.id))
            .filter(|step| {
                let all_settled = step
                    .depends_on
                    .iter()
                    .all(|dep| self.step_results.contains_key(dep));
                if !all_settled {
                    return false;
                }
                let dep_skipped = step.depends_on.iter().any(|dep| {
                    self.step_result(dep)
                        .map(|r| r.status == StepStatus::Skipped)
                        .unwrap_or(false)
                });
                dep_skipped
                    || (self.tier == ExecutionTier::Economy && step.skip_on_degraded)
            })
            .map(|step| step.id.clone())
            .collect()
    }

    /// True once every step in the definition has a recorded result
    pub fn all_settled(&self, definition: &WorkflowDefinition) -> bool {
        definition
            .steps
            .iter()
            .all(|step| self.step_results.contains_key(&step.id))
    }

    /// Outputs of the most recently committed steps, oldest first
    pub fn recent_outputs(&self, n: usize) -> Vec<&serde_json::Value> {
        self.commit_log
            .iter()
            .rev()
            .take(n)
            .filter_map(|id| self.step_results.get(id))
            .map(|r| &r.output)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect()
    }

    /// Append a progress sample, keeping the ring bounded to `cap`
    pub fn record_progress_sample(&mut self, sample: ProgressSample, cap: usize) {
        self.progress_hash_history.push_back(sample);
        self.progress_samples_total += 1;
        while self.progress_hash_history.len() > cap.max(1) {
            self.progress_hash_history.pop_front();
        }
    }

    pub fn deferral_count(&self, step: &StepId) -> u32 {
        self.dispatch_deferrals.get(step).copied().unwrap_or(0)
    }

    pub fn note_deferral(&mut self, step: &StepId) -> u32 {
        let count = self.dispatch_deferrals.entry(step.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.ended_at.unwrap_or_else(Utc::now) - self.started_at
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("Step '{0}' already has a recorded result for this run")]
    DuplicateStepResult(StepId),

    #[error("Illegal run state transition {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("Run is not schedulable in state {0}")]
    NotSchedulable(RunState),
}
