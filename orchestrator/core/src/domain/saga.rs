// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Saga Domain Model
//!
//! Write-ahead compensation log entries and the operator-visible rollback
//! report. Entries are append-only records keyed by `(run_id, step_id)`;
//! the payload is resolved at commit time so a compensation never needs
//! the originating step object to still exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::run::RunId;
use crate::domain::workflow::{RetryPolicy, StepId, ToolId};

/// One committed step's compensating action, written before the step is
/// marked `Success` in the run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaLogEntry {
    pub run_id: RunId,
    pub step_id: StepId,
    pub tool_id: ToolId,
    /// Resolved compensation payload (no templates at this point)
    pub payload: serde_json::Value,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Position in the run's commit order, assigned by the saga log
    pub commit_seq: u64,
    pub committed_at: DateTime<Utc>,
}

/// Terminal state of one compensation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationStatus {
    Completed,
    /// Retries exhausted; rollback of earlier entries continued anyway
    Failed { cause: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationOutcome {
    pub step_id: StepId,
    pub tool_id: ToolId,
    pub status: CompensationStatus,
    pub attempt_count: u32,
    pub finished_at: DateTime<Utc>,
}

impl CompensationOutcome {
    pub fn succeeded(&self) -> bool {
        self.status == CompensationStatus::Completed
    }
}

/// The only operator-visible failure surface for a run: which steps were
/// rolled back and which could not be
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationReport {
    pub run_id: RunId,
    /// Outcomes in execution order (reverse commit order)
    pub outcomes: Vec<CompensationOutcome>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl CompensationReport {
    pub fn fully_compensated(&self) -> bool {
        self.outcomes.iter().all(|o| o.succeeded())
    }

    /// Steps whose compensation failed and need operator attention
    pub fn uncompensated_steps(&self) -> Vec<&StepId> {
        self.outcomes
            .iter()
            .filter(|o| !o.succeeded())
            .map(|o| &o.step_id)
            .collect()
    }
}
