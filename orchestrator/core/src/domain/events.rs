// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Outbound Domain Events
//!
//! Every run/step state transition, saga action and circuit transition is
//! published on the event bus for external observability and analytics
//! consumers. Events are tagged with `run_id`, `tenant_id`, and the
//! `step_id`/`tool_id` of the triggering invocation; `topic()` yields the
//! dotted event name used by downstream routing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::run::{RunId, TenantId};
use crate::domain::workflow::{StepId, ToolId, WorkflowId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        started_at: DateTime<Utc>,
    },
    RunCommitted {
        run_id: RunId,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        committed_at: DateTime<Utc>,
    },
    RunFailed {
        run_id: RunId,
        tenant_id: TenantId,
        workflow_id: WorkflowId,
        cause: String,
        failed_at: DateTime<Utc>,
    },
    RunDegraded {
        run_id: RunId,
        tenant_id: TenantId,
        reason: String,
        degraded_at: DateTime<Utc>,
    },
    StepStarted {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        started_at: DateTime<Utc>,
    },
    StepSucceeded {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        attempt_count: u32,
        succeeded_at: DateTime<Utc>,
    },
    StepFailed {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        cause: String,
        failed_at: DateTime<Utc>,
    },
    StepRetried {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        attempt: u32,
        delay_ms: u64,
        retried_at: DateTime<Utc>,
    },
    CompensationStarted {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        started_at: DateTime<Utc>,
    },
    CompensationCompleted {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        completed_at: DateTime<Utc>,
    },
    CompensationFailed {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        cause: String,
        failed_at: DateTime<Utc>,
    },
    CircuitOpened {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        consecutive_failures: u32,
        opened_at: DateTime<Utc>,
    },
    CircuitClosed {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        closed_at: DateTime<Utc>,
    },
    CircuitHalfOpened {
        run_id: RunId,
        tenant_id: TenantId,
        step_id: StepId,
        tool_id: ToolId,
        half_opened_at: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Dotted event name for downstream routing
    pub fn topic(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "workflow.run.started",
            RunEvent::RunCommitted { .. } => "workflow.run.committed",
            RunEvent::RunFailed { .. } => "workflow.run.failed",
            RunEvent::RunDegraded { .. } => "workflow.run.degraded",
            RunEvent::StepStarted { .. } => "workflow.step.started",
            RunEvent::StepSucceeded { .. } => "workflow.step.succeeded",
            RunEvent::StepFailed { .. } => "workflow.step.failed",
            RunEvent::StepRetried { .. } => "workflow.step.retried",
            RunEvent::CompensationStarted { .. } => "saga.compensation.started",
            RunEvent::CompensationCompleted { .. } => "saga.compensation.completed",
            RunEvent::CompensationFailed { .. } => "saga.compensation.failed",
            RunEvent::CircuitOpened { .. } => "circuit.opened",
            RunEvent::CircuitClosed { .. } => "circuit.closed",
            RunEvent::CircuitHalfOpened { .. } => "circuit.half_opened",
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::RunCommitted { run_id, .. }
            | RunEvent::RunFailed { run_id, .. }
            | RunEvent::RunDegraded { run_id, .. }
            | RunEvent::StepStarted { run_id, .. }
            | RunEvent::StepSucceeded { run_id, .. }
            | RunEvent::StepFailed { run_id, .. }
            | RunEvent::StepRetried { run_id, .. }
            | RunEvent::CompensationStarted { run_id, .. }
            | RunEvent::CompensationCompleted { run_id, .. }
            | RunEvent::CompensationFailed { run_id, .. }
            | RunEvent::CircuitOpened { run_id, .. }
            | RunEvent::CircuitClosed { run_id, .. }
            | RunEvent::CircuitHalfOpened { run_id, .. } => *run_id,
        }
    }

    pub fn step_id(&self) -> Option<&StepId> {
        match self {
            RunEvent::StepStarted { step_id, .. }
            | RunEvent::StepSucceeded { step_id, .. }
            | RunEvent::StepFailed { step_id, .. }
            | RunEvent::StepRetried { step_id, .. }
            | RunEvent::CompensationStarted { step_id, .. }
            | RunEvent::CompensationCompleted { step_id, .. }
            | RunEvent::CompensationFailed { step_id, .. }
            | RunEvent::CircuitOpened { step_id, .. }
            | RunEvent::CircuitClosed { step_id, .. }
            | RunEvent::CircuitHalfOpened { step_id, .. } => Some(step_id),
            _ => None,
        }
    }
}
