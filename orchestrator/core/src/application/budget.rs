// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Budget & Degradation Controller
//!
//! Tracks a run's cumulative wall-clock time, cost units and step count
//! against the workflow's budget. Crossing a soft ceiling downgrades the
//! run to the cheaper execution tier instead of aborting; crossing a hard
//! ceiling aborts, which forces the run into compensation.

use crate::domain::run::{ExecutionTier, WorkflowRun};
use crate::domain::workflow::RunBudget;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BudgetDecision {
    Proceed,
    Downgrade(ExecutionTier),
    Abort(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BudgetController;

impl BudgetController {
    pub fn new() -> Self {
        Self
    }

    pub fn check(&self, run: &WorkflowRun, budget: &RunBudget) -> BudgetDecision {
        let elapsed = run.elapsed().to_std().unwrap_or_default();

        if let Some(hard) = budget.hard_wall_clock {
            if elapsed >= hard {
                return BudgetDecision::Abort(format!(
                    "hard wall-clock budget exhausted ({}s elapsed)",
                    elapsed.as_secs()
                ));
            }
        }
        if let Some(hard) = budget.hard_cost_units {
            if run.consumed_cost_units >= hard {
                return BudgetDecision::Abort(format!(
                    "hard cost budget exhausted ({:.1} units consumed)",
                    run.consumed_cost_units
                ));
            }
        }
        if let Some(max_steps) = budget.max_steps {
            if run.step_count >= max_steps {
                return BudgetDecision::Abort(format!(
                    "step budget exhausted ({} steps executed)",
                    run.step_count
                ));
            }
        }

        if run.tier == ExecutionTier::Standard {
            let soft_clock_crossed = budget
                .soft_wall_clock
                .map(|soft| elapsed >= soft)
                .unwrap_or(false);
            let soft_cost_crossed = budget
                .soft_cost_units
                .map(|soft| run.consumed_cost_units >= soft)
                .unwrap_or(false);
            if soft_clock_crossed || soft_cost_crossed {
                return BudgetDecision::Downgrade(ExecutionTier::Economy);
            }
        }

        BudgetDecision::Proceed
    }
}
