// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Loop-Safety Monitor
//!
//! The backstop preventing unbounded or oscillating execution,
//! independent of any tool's own retry logic. After each scheduling tick
//! that produced results, it digests the run's externally observable
//! state (pending step set + the last N outputs) and records the sample
//! on the run:
//!
//! - `step_count >= max_steps` cuts the run with `StepLimitExceeded`
//! - an output digest recurring within a sliding window of W samples
//!   (other than the immediately previous sample) cuts with
//!   `OscillationDetected`
//! - K consecutive samples with an unchanged output digest cut with
//!   `NoProgress`
//!
//! Every cut routes the run to compensation; none is silently ignored.

use sha2::{Digest, Sha256};

use crate::domain::run::{ProgressSample, WorkflowRun};
use crate::domain::workflow::WorkflowDefinition;

/// Why a run was cut
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CutReason {
    StepLimitExceeded { limit: u64 },
    OscillationDetected { window: usize },
    NoProgress { threshold: u32 },
}

impl std::fmt::Display for CutReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CutReason::StepLimitExceeded { limit } => {
                write!(f, "step limit exceeded (max_steps = {})", limit)
            }
            CutReason::OscillationDetected { window } => {
                write!(f, "oscillation detected (window = {})", window)
            }
            CutReason::NoProgress { threshold } => {
                write!(f, "no progress for {} consecutive steps", threshold)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Continue,
    Cut(CutReason),
}

/// Stateless monitor; thresholds come from the workflow definition and
/// observations are recorded on the run itself
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopSafetyMonitor;

impl LoopSafetyMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Record a progress sample for the run and decide whether it may
    /// continue
    pub fn check_and_record(
        &self,
        run: &mut WorkflowRun,
        definition: &WorkflowDefinition,
    ) -> Verdict {
        let config = &definition.loop_safety;

        if run.step_count >= config.max_steps {
            return Verdict::Cut(CutReason::StepLimitExceeded {
                limit: config.max_steps,
            });
        }

        let outputs_digest = digest_outputs(run, config.output_window);
        let composite_digest = digest_composite(run, definition, &outputs_digest);

        let stagnant = run
            .progress_hash_history
            .back()
            .map(|sample| sample.outputs == outputs_digest)
            .unwrap_or(false);
        if stagnant {
            run.stagnant_ticks += 1;
        } else {
            run.stagnant_ticks = 0;
        }

        // Recurrence of an earlier (non-adjacent) output window within W
        // samples: the run is revisiting a state it already left
        let recurred = !stagnant
            && run
                .progress_hash_history
                .iter()
                .rev()
                .take(config.oscillation_window)
                .any(|sample| sample.outputs == outputs_digest);

        let cap = config
            .oscillation_window
            .max(config.no_progress_threshold as usize + 1);
        run.record_progress_sample(
            ProgressSample {
                composite: composite_digest,
                outputs: outputs_digest,
            },
            cap,
        );

        if run.stagnant_ticks >= config.no_progress_threshold {
            return Verdict::Cut(CutReason::NoProgress {
                threshold: config.no_progress_threshold,
            });
        }
        if recurred {
            return Verdict::Cut(CutReason::OscillationDetected {
                window: config.oscillation_window,
            });
        }

        Verdict::Continue
    }
}

/// Digest over the last `n` step outputs, in commit order
fn digest_outputs(run: &WorkflowRun, n: usize) -> String {
    let mut hasher = Sha256::new();
    for output in run.recent_outputs(n) {
        hasher.update(output.to_string().as_bytes());
        hasher.update([0x1e]);
    }
    hex::encode(hasher.finalize())
}

/// Digest over the pending step set plus the output digest
fn digest_composite(
    run: &WorkflowRun,
    definition: &WorkflowDefinition,
    outputs_digest: &str,
) -> String {
    let mut hasher = Sha256::new();
    for step in &definition.steps {
        if !run.step_results.contains_key(&step.id) {
            hasher.update(step.id.as_str().as_bytes());
            hasher.update([0x1e]);
        }
    }
    hasher.update(outputs_digest.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::{StepResult, TenantId};
    use crate::domain::workflow::{
        LoopSafetyConfig, RetryPolicy, RunBudget, Step, StepId, ToolId, WorkflowMetadata,
        WorkflowVersion,
    };
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    fn chain(len: usize, config: LoopSafetyConfig) -> WorkflowDefinition {
        let steps = (0..len)
            .map(|i| Step {
                id: StepId::new(format!("s{}", i)).unwrap(),
                depends_on: if i == 0 {
                    BTreeSet::new()
                } else {
                    [StepId::new(format!("s{}", i - 1)).unwrap()]
                        .into_iter()
                        .collect()
                },
                tool_id: ToolId::new("echo"),
                input: "{}".to_string(),
                config: serde_json::Value::Null,
                timeout: Duration::from_secs(1),
                retry: RetryPolicy::default(),
                idempotency_key: None,
                skip_on_degraded: false,
                compensation: None,
            })
            .collect();

        WorkflowDefinition::new(
            WorkflowMetadata {
                name: "chain".to_string(),
                description: None,
                labels: HashMap::new(),
            },
            WorkflowVersion(1),
            steps,
            config,
            RunBudget::default(),
            1,
        )
        .unwrap()
    }

    fn commit(run: &mut WorkflowRun, step: usize, output: serde_json::Value) {
        run.record_step_result(StepResult::success(
            StepId::new(format!("s{}", step)).unwrap(),
            output,
            1,
            0.0,
        ))
        .unwrap();
    }

    #[test]
    fn test_step_limit_cut() {
        let config = LoopSafetyConfig {
            max_steps: 3,
            ..Default::default()
        };
        let def = chain(5, config);
        let monitor = LoopSafetyMonitor::new();
        let mut run = WorkflowRun::new(&def, TenantId::new("t1"), serde_json::json!({}));

        for i in 0..3 {
            commit(&mut run, i, serde_json::json!(format!("out{}", i)));
        }
        let verdict = monitor.check_and_record(&mut run, &def);
        assert_eq!(
            verdict,
            Verdict::Cut(CutReason::StepLimitExceeded { limit: 3 })
        );
    }

    #[test]
    fn test_distinct_outputs_continue() {
        let def = chain(6, LoopSafetyConfig::default());
        let monitor = LoopSafetyMonitor::new();
        let mut run = WorkflowRun::new(&def, TenantId::new("t1"), serde_json::json!({}));

        for i in 0..5 {
            commit(&mut run, i, serde_json::json!(format!("distinct-{}", i)));
            assert_eq!(monitor.check_and_record(&mut run, &def), Verdict::Continue);
        }
    }

    #[test]
    fn test_oscillating_outputs_cut_before_step_limit() {
        let config = LoopSafetyConfig {
            max_steps: 100,
            oscillation_window: 5,
            no_progress_threshold: 10,
            output_window: 2,
        };
        let def = chain(20, config);
        let monitor = LoopSafetyMonitor::new();
        let mut run = WorkflowRun::new(&def, TenantId::new("t1"), serde_json::json!({}));

        // Outputs cycle A, B, A, B...: the 2-output window repeats every
        // two steps, well within the detection window
        let mut cut = None;
        for i in 0..12 {
            let output = if i % 2 == 0 { "A" } else { "B" };
            commit(&mut run, i, serde_json::json!(output));
            if let Verdict::Cut(reason) = monitor.check_and_record(&mut run, &def) {
                cut = Some((i, reason));
                break;
            }
        }

        let (at, reason) = cut.expect("oscillating run should be cut");
        assert!(matches!(reason, CutReason::OscillationDetected { .. }));
        assert!((at as u64) < 100, "cut before reaching max_steps");
        assert!(run.step_count <= 100);
    }

    #[test]
    fn test_identical_outputs_cut_as_no_progress() {
        let config = LoopSafetyConfig {
            max_steps: 100,
            oscillation_window: 5,
            no_progress_threshold: 3,
            output_window: 3,
        };
        let def = chain(20, config);
        let monitor = LoopSafetyMonitor::new();
        let mut run = WorkflowRun::new(&def, TenantId::new("t1"), serde_json::json!({}));

        let mut cut = None;
        for i in 0..12 {
            commit(&mut run, i, serde_json::json!("same"));
            if let Verdict::Cut(reason) = monitor.check_and_record(&mut run, &def) {
                cut = Some(reason);
                break;
            }
        }

        assert_eq!(cut, Some(CutReason::NoProgress { threshold: 3 }));
    }

    #[test]
    fn test_history_stays_bounded() {
        let config = LoopSafetyConfig {
            max_steps: 100,
            oscillation_window: 4,
            no_progress_threshold: 10,
            output_window: 1,
        };
        let def = chain(20, config.clone());
        let monitor = LoopSafetyMonitor::new();
        let mut run = WorkflowRun::new(&def, TenantId::new("t1"), serde_json::json!({}));

        for i in 0..15 {
            commit(&mut run, i, serde_json::json!(format!("unique-{}", i)));
            let _ = monitor.check_and_record(&mut run, &def);
        }

        let cap = config
            .oscillation_window
            .max(config.no_progress_threshold as usize + 1);
        assert!(run.progress_hash_history.len() <= cap);
        assert_eq!(run.progress_samples_total, 15);
    }
}
