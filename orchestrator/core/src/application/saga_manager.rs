// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Saga Manager
//!
//! Records write-ahead compensation intents and replays them in strict
//! reverse commit order when a run fails. The log entry is appended
//! *before* the step is marked `Success` in the run, so a crash between
//! the primary action and the run update cannot leave an unrecorded side
//! effect. Compensations are invoked through the same reliability wrapper
//! as forward actions; a failed compensation is recorded and surfaced,
//! never re-thrown to abort the rest of the rollback.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::application::tool_invocation_service::{InvokePolicy, ToolInvocationService};
use crate::domain::events::RunEvent;
use crate::domain::repository::{RepositoryError, SagaLogRepository};
use crate::domain::run::{RunId, WorkflowRun};
use crate::domain::saga::{
    CompensationOutcome, CompensationReport, CompensationStatus, SagaLogEntry,
};
use crate::domain::tool::{IdempotencyKey, ToolContext};
use crate::domain::workflow::{CompensationSpec, StepId};
use crate::infrastructure::event_bus::EventBus;

/// Escalation seam for partial compensation failures ("manual
/// intervention hooks"); delivery is an external concern
#[async_trait]
pub trait CompensationAlertHook: Send + Sync {
    async fn on_compensation_failure(&self, run_id: RunId, step_id: &StepId, cause: &str);
}

pub struct SagaManager {
    log: Arc<dyn SagaLogRepository>,
    invocation: Arc<ToolInvocationService>,
    event_bus: Arc<EventBus>,
    alert_hook: Option<Arc<dyn CompensationAlertHook>>,
}

impl SagaManager {
    pub fn new(
        log: Arc<dyn SagaLogRepository>,
        invocation: Arc<ToolInvocationService>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            log,
            invocation,
            event_bus,
            alert_hook: None,
        }
    }

    pub fn with_alert_hook(mut self, hook: Arc<dyn CompensationAlertHook>) -> Self {
        self.alert_hook = Some(hook);
        self
    }

    /// Write-ahead: record a committed step's compensation intent with its
    /// payload already resolved
    pub async fn record_commit(
        &self,
        run_id: RunId,
        step_id: &StepId,
        spec: &CompensationSpec,
        payload: serde_json::Value,
    ) -> Result<u64, RepositoryError> {
        let entry = SagaLogEntry {
            run_id,
            step_id: step_id.clone(),
            tool_id: spec.tool_id.clone(),
            payload,
            timeout: spec.timeout,
            retry: spec.retry.clone(),
            commit_seq: 0,
            committed_at: Utc::now(),
        };
        let seq = self.log.append(entry).await?;
        info!(run_id = %run_id, step_id = %step_id, commit_seq = seq, "Saga intent recorded");
        Ok(seq)
    }

    /// Roll back every committed step of the run, most recent first.
    /// Callers must only invoke this after the run's dispatch loop has
    /// quiesced, so no forward action races the rollback.
    pub async fn compensate(
        &self,
        run: &WorkflowRun,
        cancel: CancellationToken,
    ) -> Result<CompensationReport, RepositoryError> {
        let started_at = Utc::now();
        let mut entries = self.log.entries_for_run(run.run_id).await?;
        // Reverse commit order; commit timestamp is the deterministic
        // tie-break for entries racing to the same sequence window
        entries.sort_by(|a, b| {
            b.commit_seq
                .cmp(&a.commit_seq)
                .then(b.committed_at.cmp(&a.committed_at))
        });

        info!(
            run_id = %run.run_id,
            entries = entries.len(),
            "Starting compensation"
        );

        let mut outcomes = Vec::with_capacity(entries.len());
        for entry in entries {
            self.event_bus.publish(RunEvent::CompensationStarted {
                run_id: run.run_id,
                tenant_id: run.tenant_id.clone(),
                step_id: entry.step_id.clone(),
                tool_id: entry.tool_id.clone(),
                started_at: Utc::now(),
            });

            let key = IdempotencyKey::derived(&run.run_id, &entry.step_id, "compensation");
            let ctx = ToolContext {
                run_id: run.run_id,
                tenant_id: run.tenant_id.clone(),
                step_id: entry.step_id.clone(),
                tool_id: entry.tool_id.clone(),
                attempt: 0,
                tier: run.tier,
                config: serde_json::Value::Null,
            };
            let policy = InvokePolicy {
                timeout: entry.timeout,
                retry: entry.retry.clone(),
            };

            match self
                .invocation
                .invoke(key, entry.payload.clone(), policy, ctx, cancel.clone())
                .await
            {
                Ok(outcome) => {
                    info!(
                        run_id = %run.run_id,
                        step_id = %entry.step_id,
                        "Compensation completed"
                    );
                    self.event_bus.publish(RunEvent::CompensationCompleted {
                        run_id: run.run_id,
                        tenant_id: run.tenant_id.clone(),
                        step_id: entry.step_id.clone(),
                        tool_id: entry.tool_id.clone(),
                        completed_at: Utc::now(),
                    });
                    outcomes.push(CompensationOutcome {
                        step_id: entry.step_id,
                        tool_id: entry.tool_id,
                        status: CompensationStatus::Completed,
                        attempt_count: outcome.attempt_count,
                        finished_at: Utc::now(),
                    });
                }
                Err(error) => {
                    // Partial compensation failure never blocks rollback of
                    // the remaining entries
                    warn!(
                        run_id = %run.run_id,
                        step_id = %entry.step_id,
                        error = %error,
                        "Compensation failed, continuing with earlier entries"
                    );
                    let cause = error.to_string();
                    self.event_bus.publish(RunEvent::CompensationFailed {
                        run_id: run.run_id,
                        tenant_id: run.tenant_id.clone(),
                        step_id: entry.step_id.clone(),
                        tool_id: entry.tool_id.clone(),
                        cause: cause.clone(),
                        failed_at: Utc::now(),
                    });
                    if let Some(hook) = &self.alert_hook {
                        hook.on_compensation_failure(run.run_id, &entry.step_id, &cause)
                            .await;
                    }
                    outcomes.push(CompensationOutcome {
                        step_id: entry.step_id,
                        tool_id: entry.tool_id,
                        status: CompensationStatus::Failed { cause },
                        attempt_count: error.attempts(),
                        finished_at: Utc::now(),
                    });
                }
            }
        }

        Ok(CompensationReport {
            run_id: run.run_id,
            outcomes,
            started_at,
            finished_at: Utc::now(),
        })
    }

    /// Drop a committed run's entries
    pub async fn prune(&self, run_id: RunId) -> Result<(), RepositoryError> {
        self.log.prune_run(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::TenantId;
    use crate::domain::tool::{ToolAdapter, ToolCallError, ToolResponse};
    use crate::domain::workflow::{
        LoopSafetyConfig, RetryPolicy, RunBudget, Step, ToolId, WorkflowDefinition,
        WorkflowMetadata, WorkflowVersion,
    };
    use crate::infrastructure::bulkhead::{BulkheadConfig, BulkheadRegistry};
    use crate::infrastructure::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
    use crate::infrastructure::idempotency::IdempotencyStore;
    use crate::infrastructure::repositories::InMemorySagaLogRepository;
    use crate::infrastructure::tool_registry::InMemoryToolRegistry;
    use parking_lot::Mutex;
    use std::collections::{BTreeSet, HashMap};
    use std::time::Duration;

    /// Records invocation order by step id; fails for steps in `fail_for`
    struct RecordingAdapter {
        seen: Arc<Mutex<Vec<String>>>,
        fail_for: Vec<String>,
    }

    #[async_trait]
    impl ToolAdapter for RecordingAdapter {
        async fn call(
            &self,
            _payload: serde_json::Value,
            ctx: &crate::domain::tool::ToolContext,
        ) -> Result<ToolResponse, ToolCallError> {
            let step = ctx.step_id.to_string();
            self.seen.lock().push(step.clone());
            if self.fail_for.contains(&step) {
                Err(ToolCallError::Rejected {
                    reason: "compensation rejected".to_string(),
                })
            } else {
                Ok(ToolResponse::new(serde_json::json!({ "undone": step })))
            }
        }

        fn idempotent(&self) -> bool {
            true
        }
    }

    struct CountingHook {
        alerts: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl CompensationAlertHook for CountingHook {
        async fn on_compensation_failure(&self, _run_id: RunId, step_id: &StepId, _cause: &str) {
            self.alerts.lock().push(step_id.to_string());
        }
    }

    fn test_run() -> WorkflowRun {
        let definition = WorkflowDefinition::new(
            WorkflowMetadata {
                name: "saga-test".to_string(),
                description: None,
                labels: HashMap::new(),
            },
            WorkflowVersion(1),
            vec![Step {
                id: StepId::new("only").unwrap(),
                depends_on: BTreeSet::new(),
                tool_id: ToolId::new("undo"),
                input: "{}".to_string(),
                config: serde_json::Value::Null,
                timeout: Duration::from_secs(1),
                retry: RetryPolicy::default(),
                idempotency_key: None,
                skip_on_degraded: false,
                compensation: None,
            }],
            LoopSafetyConfig::default(),
            RunBudget::default(),
            1,
        )
        .unwrap();
        WorkflowRun::new(&definition, TenantId::new("t1"), serde_json::json!({}))
    }

    fn manager_with(
        adapter: Arc<dyn ToolAdapter>,
        hook: Option<Arc<dyn CompensationAlertHook>>,
    ) -> SagaManager {
        let registry = InMemoryToolRegistry::new();
        registry.register(ToolId::new("undo"), adapter);
        let event_bus = Arc::new(EventBus::with_default_capacity());
        let invocation = Arc::new(ToolInvocationService::new(
            Arc::new(registry),
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            Arc::new(BulkheadRegistry::new(BulkheadConfig::default())),
            Arc::new(IdempotencyStore::new(Duration::from_secs(60))),
            event_bus.clone(),
        ));
        let manager = SagaManager::new(
            Arc::new(InMemorySagaLogRepository::new()),
            invocation,
            event_bus,
        );
        match hook {
            Some(hook) => manager.with_alert_hook(hook),
            None => manager,
        }
    }

    fn spec() -> CompensationSpec {
        CompensationSpec {
            tool_id: ToolId::new("undo"),
            payload: "{{output}}".to_string(),
            timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                max_retries: 0,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
        }
    }

    #[tokio::test]
    async fn test_compensates_in_reverse_commit_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_with(
            Arc::new(RecordingAdapter {
                seen: seen.clone(),
                fail_for: vec![],
            }),
            None,
        );
        let run = test_run();

        for step in ["charge_payment", "reserve_inventory"] {
            manager
                .record_commit(
                    run.run_id,
                    &StepId::new(step).unwrap(),
                    &spec(),
                    serde_json::json!({ "step": step }),
                )
                .await
                .unwrap();
        }

        let report = manager
            .compensate(&run, CancellationToken::new())
            .await
            .unwrap();

        assert!(report.fully_compensated());
        assert_eq!(
            *seen.lock(),
            vec!["reserve_inventory".to_string(), "charge_payment".to_string()]
        );
    }

    #[tokio::test]
    async fn test_partial_failure_continues_and_alerts() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let alerts = Arc::new(Mutex::new(Vec::new()));
        let manager = manager_with(
            Arc::new(RecordingAdapter {
                seen: seen.clone(),
                fail_for: vec!["reserve_inventory".to_string()],
            }),
            Some(Arc::new(CountingHook {
                alerts: alerts.clone(),
            })),
        );
        let run = test_run();

        for step in ["charge_payment", "reserve_inventory"] {
            manager
                .record_commit(
                    run.run_id,
                    &StepId::new(step).unwrap(),
                    &spec(),
                    serde_json::json!({}),
                )
                .await
                .unwrap();
        }

        let report = manager
            .compensate(&run, CancellationToken::new())
            .await
            .unwrap();

        // The failing entry is recorded, the earlier one still rolled back
        assert!(!report.fully_compensated());
        assert_eq!(
            report.uncompensated_steps(),
            vec![&StepId::new("reserve_inventory").unwrap()]
        );
        assert_eq!(
            *seen.lock(),
            vec!["reserve_inventory".to_string(), "charge_payment".to_string()]
        );
        assert_eq!(*alerts.lock(), vec!["reserve_inventory".to_string()]);
    }

    #[tokio::test]
    async fn test_prune_clears_entries() {
        let manager = manager_with(
            Arc::new(RecordingAdapter {
                seen: Arc::new(Mutex::new(Vec::new())),
                fail_for: vec![],
            }),
            None,
        );
        let run = test_run();

        manager
            .record_commit(
                run.run_id,
                &StepId::new("charge_payment").unwrap(),
                &spec(),
                serde_json::json!({}),
            )
            .await
            .unwrap();
        manager.prune(run.run_id).await.unwrap();

        let report = manager
            .compensate(&run, CancellationToken::new())
            .await
            .unwrap();
        assert!(report.outcomes.is_empty());
    }
}
