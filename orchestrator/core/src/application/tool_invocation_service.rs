// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Tool Invocation Service (Reliability Wrapper)
//!
//! Every tool call, forward actions and compensations alike, goes
//! through this service. It composes, in order:
//!
//! 1. **Idempotency check**: a non-expired snapshot for the key is
//!    returned without calling the tool; concurrent duplicates wait on the
//!    first caller's result
//! 2. **Circuit breaker gate**: open breakers fail fast; half-open admits
//!    exactly one probe
//! 3. **Bulkhead**: a per-tool concurrency slot, fail-fast on exhaustion
//!    (not counted against the retry budget)
//! 4. **Timeout**: bounds each attempt
//! 5. **Retry**: exponential backoff with jitter; ambiguous failures
//!    (timeout, tool-side effect unknown) retry only for adapters declared
//!    idempotent
//!
//! The breaker sees invocation-level outcomes: one success or one failure
//! per logical invocation, after retries are exhausted. Transient errors
//! never escape this service except by exhaustion.

use chrono::Utc;
use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::events::RunEvent;
use crate::domain::tool::{
    IdempotencyKey, ToolAdapter, ToolCallError, ToolContext, ToolRegistry, ToolResponse,
};
use crate::domain::workflow::{RetryPolicy, Step, ToolId};
use crate::infrastructure::bulkhead::BulkheadRegistry;
use crate::infrastructure::circuit_breaker::{
    CircuitBreakerRegistry, CircuitTransition, GateDecision,
};
use crate::infrastructure::event_bus::EventBus;
use crate::infrastructure::idempotency::{IdempotencyStore, Reservation};

/// Timeout and retry policy for one logical invocation
#[derive(Debug, Clone)]
pub struct InvokePolicy {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl From<&Step> for InvokePolicy {
    fn from(step: &Step) -> Self {
        Self {
            timeout: step.timeout,
            retry: step.retry.clone(),
        }
    }
}

/// Typed invocation failures surfaced to the workflow engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum InvokeError {
    #[error("unknown tool '{0}'")]
    UnknownTool(ToolId),

    #[error("circuit open for tool '{0}'")]
    CircuitOpen(ToolId),

    #[error("bulkhead exhausted for tool '{0}'")]
    BulkheadFull(ToolId),

    #[error("tool '{tool_id}' timed out after {attempts} attempt(s)")]
    Timeout { tool_id: ToolId, attempts: u32 },

    #[error("tool '{tool_id}' rejected the call after {attempts} attempt(s): {reason}")]
    Rejected {
        tool_id: ToolId,
        reason: String,
        attempts: u32,
    },

    #[error("tool '{tool_id}' unavailable: {reason}")]
    Unavailable { tool_id: ToolId, reason: String },

    #[error("invocation cancelled")]
    Cancelled,
}

impl InvokeError {
    /// Fail-fast signals the caller may retry later without a saga rollback
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvokeError::CircuitOpen(_) | InvokeError::BulkheadFull(_)
        )
    }

    pub fn attempts(&self) -> u32 {
        match self {
            InvokeError::Timeout { attempts, .. } | InvokeError::Rejected { attempts, .. } => {
                *attempts
            }
            InvokeError::Unavailable { .. } => 1,
            _ => 0,
        }
    }
}

/// Result of a successful invocation
#[derive(Debug, Clone)]
pub struct InvocationOutcome {
    pub response: ToolResponse,
    pub attempt_count: u32,
    /// True when the result came from the idempotency store
    pub deduplicated: bool,
}

enum AttemptResult {
    Success(ToolResponse, u32),
    Failed(ToolCallError, u32),
    Cancelled,
}

/// Application service wrapping every tool invocation with the shared
/// reliability state (breakers, bulkheads, idempotency records)
pub struct ToolInvocationService {
    registry: Arc<dyn ToolRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    bulkheads: Arc<BulkheadRegistry>,
    idempotency: Arc<IdempotencyStore>,
    event_bus: Arc<EventBus>,
}

impl ToolInvocationService {
    pub fn new(
        registry: Arc<dyn ToolRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        bulkheads: Arc<BulkheadRegistry>,
        idempotency: Arc<IdempotencyStore>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            registry,
            breakers,
            bulkheads,
            idempotency,
            event_bus,
        }
    }

    pub fn registry(&self) -> &Arc<dyn ToolRegistry> {
        &self.registry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Invoke a tool once, logically: retried duplicates with the same key
    /// trigger the underlying tool at most once while the record is live
    pub async fn invoke(
        &self,
        key: IdempotencyKey,
        payload: serde_json::Value,
        policy: InvokePolicy,
        ctx: ToolContext,
        cancel: CancellationToken,
    ) -> Result<InvocationOutcome, InvokeError> {
        let adapter = self
            .registry
            .get(&ctx.tool_id)
            .ok_or_else(|| InvokeError::UnknownTool(ctx.tool_id.clone()))?;

        loop {
            if cancel.is_cancelled() {
                return Err(InvokeError::Cancelled);
            }

            match self.idempotency.reserve(&key) {
                Reservation::Completed(response) => {
                    debug!(
                        tool_id = %ctx.tool_id,
                        idempotency_key = %key,
                        "Idempotency hit, returning stored snapshot"
                    );
                    counter!("relay_tool_invocations_total",
                        "tool" => ctx.tool_id.to_string(), "outcome" => "deduplicated")
                    .increment(1);
                    return Ok(InvocationOutcome {
                        response,
                        attempt_count: 0,
                        deduplicated: true,
                    });
                }
                Reservation::Follower(follower) => {
                    let waited = tokio::select! {
                        _ = cancel.cancelled() => return Err(InvokeError::Cancelled),
                        result = follower.wait() => result,
                    };
                    match waited {
                        Some(response) => {
                            counter!("relay_tool_invocations_total",
                                "tool" => ctx.tool_id.to_string(), "outcome" => "deduplicated")
                            .increment(1);
                            return Ok(InvocationOutcome {
                                response,
                                attempt_count: 0,
                                deduplicated: true,
                            });
                        }
                        // Owner abandoned; take over on the next iteration
                        None => continue,
                    }
                }
                Reservation::Owner(owner) => {
                    return self
                        .invoke_as_owner(owner, adapter, payload, policy, ctx, cancel)
                        .await;
                }
            }
        }
    }

    async fn invoke_as_owner(
        &self,
        owner: crate::infrastructure::idempotency::ReservationOwner,
        adapter: Arc<dyn ToolAdapter>,
        payload: serde_json::Value,
        policy: InvokePolicy,
        ctx: ToolContext,
        cancel: CancellationToken,
    ) -> Result<InvocationOutcome, InvokeError> {
        let tool_id = ctx.tool_id.clone();

        // Circuit breaker gate; dropping `owner` on rejection wakes any
        // followers so they can fail fast too
        let probing = match self.breakers.try_acquire(&tool_id) {
            GateDecision::Reject => {
                counter!("relay_tool_invocations_total",
                    "tool" => tool_id.to_string(), "outcome" => "circuit_open")
                .increment(1);
                return Err(InvokeError::CircuitOpen(tool_id));
            }
            GateDecision::AllowProbe => {
                self.publish_circuit(CircuitTransition::HalfOpened, &ctx);
                true
            }
            GateDecision::Allow => false,
        };

        // Bulkhead slot; exhaustion is not a tool failure and feeds neither
        // the breaker nor the retry budget
        let permit = match self.bulkheads.try_acquire(&tool_id) {
            Some(permit) => permit,
            None => {
                if probing {
                    self.breakers.release_probe(&tool_id);
                }
                counter!("relay_tool_invocations_total",
                    "tool" => tool_id.to_string(), "outcome" => "bulkhead_full")
                .increment(1);
                return Err(InvokeError::BulkheadFull(tool_id));
            }
        };

        let started = Instant::now();
        let result = self
            .attempt_loop(&adapter, &payload, &policy, &ctx, &cancel)
            .await;
        drop(permit);

        histogram!("relay_tool_call_duration_seconds", "tool" => tool_id.to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            AttemptResult::Success(response, attempts) => {
                if let Some(CircuitTransition::Closed) = self.breakers.on_success(&tool_id) {
                    self.publish_circuit(CircuitTransition::Closed, &ctx);
                }
                owner.complete(tool_id.clone(), response.clone());
                counter!("relay_tool_invocations_total",
                    "tool" => tool_id.to_string(), "outcome" => "success")
                .increment(1);
                Ok(InvocationOutcome {
                    response,
                    attempt_count: attempts,
                    deduplicated: false,
                })
            }
            AttemptResult::Cancelled => {
                // Not a tool outcome: the breaker learns nothing
                if probing {
                    self.breakers.release_probe(&tool_id);
                }
                Err(InvokeError::Cancelled)
            }
            AttemptResult::Failed(error, attempts) => {
                if let Some(CircuitTransition::Opened) = self.breakers.on_failure(&tool_id) {
                    self.publish_circuit(CircuitTransition::Opened, &ctx);
                }
                counter!("relay_tool_invocations_total",
                    "tool" => tool_id.to_string(), "outcome" => "failure")
                .increment(1);
                Err(match error {
                    ToolCallError::Timeout => InvokeError::Timeout { tool_id, attempts },
                    ToolCallError::Rejected { reason } => InvokeError::Rejected {
                        tool_id,
                        reason,
                        attempts,
                    },
                    ToolCallError::Unavailable { reason } => {
                        InvokeError::Unavailable { tool_id, reason }
                    }
                })
            }
        }
    }

    /// Timeout-bounded attempts with backoff; cancellation is observed at
    /// the attempt and backoff boundaries
    async fn attempt_loop(
        &self,
        adapter: &Arc<dyn ToolAdapter>,
        payload: &serde_json::Value,
        policy: &InvokePolicy,
        ctx: &ToolContext,
        cancel: &CancellationToken,
    ) -> AttemptResult {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let call_ctx = ToolContext {
                attempt,
                ..ctx.clone()
            };

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return AttemptResult::Cancelled,
                result = tokio::time::timeout(
                    policy.timeout,
                    adapter.call(payload.clone(), &call_ctx),
                ) => result,
            };

            let error = match outcome {
                Ok(Ok(response)) => return AttemptResult::Success(response, attempt),
                Ok(Err(error)) => error,
                Err(_elapsed) => ToolCallError::Timeout,
            };

            let retries_left = attempt <= policy.retry.max_retries;
            if !error.is_retryable(adapter.idempotent()) || !retries_left {
                return AttemptResult::Failed(error, attempt);
            }

            let delay = policy.retry.delay_for_attempt(attempt - 1);
            warn!(
                run_id = %ctx.run_id,
                step_id = %ctx.step_id,
                tool_id = %ctx.tool_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Tool call failed, retrying"
            );
            self.event_bus.publish(RunEvent::StepRetried {
                run_id: ctx.run_id,
                tenant_id: ctx.tenant_id.clone(),
                step_id: ctx.step_id.clone(),
                tool_id: ctx.tool_id.clone(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                retried_at: Utc::now(),
            });

            tokio::select! {
                _ = cancel.cancelled() => return AttemptResult::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn publish_circuit(&self, transition: CircuitTransition, ctx: &ToolContext) {
        let event = match transition {
            CircuitTransition::Opened => RunEvent::CircuitOpened {
                run_id: ctx.run_id,
                tenant_id: ctx.tenant_id.clone(),
                step_id: ctx.step_id.clone(),
                tool_id: ctx.tool_id.clone(),
                consecutive_failures: self.breakers.consecutive_failures(&ctx.tool_id),
                opened_at: Utc::now(),
            },
            CircuitTransition::Closed => RunEvent::CircuitClosed {
                run_id: ctx.run_id,
                tenant_id: ctx.tenant_id.clone(),
                step_id: ctx.step_id.clone(),
                tool_id: ctx.tool_id.clone(),
                closed_at: Utc::now(),
            },
            CircuitTransition::HalfOpened => RunEvent::CircuitHalfOpened {
                run_id: ctx.run_id,
                tenant_id: ctx.tenant_id.clone(),
                step_id: ctx.step_id.clone(),
                tool_id: ctx.tool_id.clone(),
                half_opened_at: Utc::now(),
            },
        };
        info!(tool_id = %ctx.tool_id, topic = event.topic(), "Circuit transition");
        self.event_bus.publish(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::run::{ExecutionTier, RunId, TenantId};
    use crate::domain::workflow::StepId;
    use crate::infrastructure::bulkhead::BulkheadConfig;
    use crate::infrastructure::circuit_breaker::{CircuitBreakerConfig, CircuitState};
    use crate::infrastructure::tool_registry::InMemoryToolRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails `fail_times` calls with the scripted error, then succeeds
    struct ScriptedAdapter {
        calls: AtomicU32,
        fail_times: u32,
        error: ToolCallError,
        idempotent: bool,
        delay: Option<Duration>,
    }

    impl ScriptedAdapter {
        fn rejecting(fail_times: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_times,
                error: ToolCallError::Rejected {
                    reason: "scripted".to_string(),
                },
                idempotent: false,
                delay: None,
            }
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ToolAdapter for ScriptedAdapter {
        async fn call(
            &self,
            payload: serde_json::Value,
            _ctx: &ToolContext,
        ) -> Result<ToolResponse, ToolCallError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.fail_times {
                Err(self.error.clone())
            } else {
                Ok(ToolResponse::with_cost(payload, 1.0))
            }
        }

        fn idempotent(&self) -> bool {
            self.idempotent
        }
    }

    fn service_with(
        adapter: Arc<dyn ToolAdapter>,
        breaker_config: CircuitBreakerConfig,
        bulkhead_config: BulkheadConfig,
    ) -> Arc<ToolInvocationService> {
        let registry = InMemoryToolRegistry::new();
        registry.register(ToolId::new("payments"), adapter);
        Arc::new(ToolInvocationService::new(
            Arc::new(registry),
            Arc::new(CircuitBreakerRegistry::new(breaker_config)),
            Arc::new(BulkheadRegistry::new(bulkhead_config)),
            Arc::new(IdempotencyStore::new(Duration::from_secs(60))),
            Arc::new(EventBus::with_default_capacity()),
        ))
    }

    fn ctx() -> ToolContext {
        ToolContext {
            run_id: RunId::new(),
            tenant_id: TenantId::new("t1"),
            step_id: StepId::new("charge").unwrap(),
            tool_id: ToolId::new("payments"),
            attempt: 0,
            tier: ExecutionTier::Standard,
            config: serde_json::Value::Null,
        }
    }

    fn fast_policy(max_retries: u32) -> InvokePolicy {
        InvokePolicy {
            timeout: Duration::from_millis(100),
            retry: RetryPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
            },
        }
    }

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let adapter = Arc::new(ScriptedAdapter::rejecting(2));
        let service = service_with(
            adapter.clone(),
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
        );

        let outcome = service
            .invoke(
                IdempotencyKey::new("k1"),
                serde_json::json!({"amount": 5}),
                fast_policy(3),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.attempt_count, 3);
        assert!(!outcome.deduplicated);
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_surfaces_typed_error() {
        let adapter = Arc::new(ScriptedAdapter::rejecting(10));
        let service = service_with(
            adapter.clone(),
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
        );

        let error = service
            .invoke(
                IdempotencyKey::new("k1"),
                serde_json::json!({}),
                fast_policy(2),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, InvokeError::Rejected { attempts: 3, .. }));
        assert_eq!(adapter.call_count(), 3);
    }

    #[tokio::test]
    async fn test_idempotent_duplicate_calls_tool_once() {
        let adapter = Arc::new(ScriptedAdapter::rejecting(0));
        let service = service_with(
            adapter.clone(),
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
        );

        let payload = serde_json::json!({"amount": 5});
        let first = service
            .invoke(
                IdempotencyKey::new("same-key"),
                payload.clone(),
                fast_policy(0),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let second = service
            .invoke(
                IdempotencyKey::new("same-key"),
                payload,
                fast_policy(0),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(first.response, second.response);
        assert!(second.deduplicated);
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_ambiguous_timeout_not_retried_for_non_idempotent_tool() {
        let adapter = Arc::new(ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_times: 0,
            error: ToolCallError::Timeout,
            idempotent: false,
            delay: Some(Duration::from_millis(200)),
        });
        let service = service_with(
            adapter.clone(),
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
        );

        let error = service
            .invoke(
                IdempotencyKey::new("k1"),
                serde_json::json!({}),
                InvokePolicy {
                    timeout: Duration::from_millis(20),
                    retry: RetryPolicy {
                        max_retries: 3,
                        base_delay: Duration::from_millis(1),
                        max_delay: Duration::from_millis(5),
                        jitter: false,
                    },
                },
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, InvokeError::Timeout { attempts: 1, .. }));
        assert_eq!(adapter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_fast() {
        let adapter = Arc::new(ScriptedAdapter::rejecting(100));
        let service = service_with(
            adapter.clone(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_secs(60),
            },
            BulkheadConfig::default(),
        );

        for i in 0..2 {
            let error = service
                .invoke(
                    IdempotencyKey::new(format!("k{}", i)),
                    serde_json::json!({}),
                    fast_policy(0),
                    ctx(),
                    CancellationToken::new(),
                )
                .await
                .unwrap_err();
            assert!(matches!(error, InvokeError::Rejected { .. }));
        }

        assert_eq!(
            service.breakers().state(&ToolId::new("payments")),
            CircuitState::Open
        );
        let calls_before = adapter.call_count();

        let error = service
            .invoke(
                IdempotencyKey::new("k-gated"),
                serde_json::json!({}),
                fast_policy(0),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, InvokeError::CircuitOpen(_)));
        assert!(error.is_transient());
        assert_eq!(adapter.call_count(), calls_before);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_breaker() {
        let adapter = Arc::new(ScriptedAdapter::rejecting(2));
        let service = service_with(
            adapter.clone(),
            CircuitBreakerConfig {
                failure_threshold: 2,
                cooldown: Duration::from_millis(20),
            },
            BulkheadConfig::default(),
        );

        for i in 0..2 {
            let _ = service
                .invoke(
                    IdempotencyKey::new(format!("k{}", i)),
                    serde_json::json!({}),
                    fast_policy(0),
                    ctx(),
                    CancellationToken::new(),
                )
                .await;
        }
        assert_eq!(
            service.breakers().state(&ToolId::new("payments")),
            CircuitState::Open
        );

        tokio::time::sleep(Duration::from_millis(40)).await;

        // Probe call: adapter now succeeds, breaker closes
        let outcome = service
            .invoke(
                IdempotencyKey::new("probe"),
                serde_json::json!({}),
                fast_policy(0),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(!outcome.deduplicated);
        assert_eq!(
            service.breakers().state(&ToolId::new("payments")),
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn test_bulkhead_full_fails_fast() {
        let adapter = Arc::new(ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_times: 0,
            error: ToolCallError::Timeout,
            idempotent: true,
            delay: Some(Duration::from_millis(200)),
        });
        let service = service_with(
            adapter,
            CircuitBreakerConfig::default(),
            BulkheadConfig::default().with_limit(ToolId::new("payments"), 1),
        );

        let slow = {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .invoke(
                        IdempotencyKey::new("slow"),
                        serde_json::json!({}),
                        InvokePolicy {
                            timeout: Duration::from_secs(1),
                            retry: RetryPolicy::default(),
                        },
                        ctx(),
                        CancellationToken::new(),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;

        let error = service
            .invoke(
                IdempotencyKey::new("crowded-out"),
                serde_json::json!({}),
                fast_policy(0),
                ctx(),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, InvokeError::BulkheadFull(_)));
        assert!(error.is_transient());

        assert!(slow.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_cancellation_observed_at_backoff_boundary() {
        let adapter = Arc::new(ScriptedAdapter {
            calls: AtomicU32::new(0),
            fail_times: 100,
            error: ToolCallError::Rejected {
                reason: "scripted".to_string(),
            },
            idempotent: false,
            delay: None,
        });
        let service = service_with(
            adapter,
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
        );

        let cancel = CancellationToken::new();
        let invocation = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                service
                    .invoke(
                        IdempotencyKey::new("cancelled"),
                        serde_json::json!({}),
                        InvokePolicy {
                            timeout: Duration::from_millis(100),
                            retry: RetryPolicy {
                                max_retries: 50,
                                base_delay: Duration::from_millis(50),
                                max_delay: Duration::from_millis(50),
                                jitter: false,
                            },
                        },
                        ctx(),
                        cancel,
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();

        let result = invocation.await.unwrap();
        assert!(matches!(result, Err(InvokeError::Cancelled)));
    }

    #[tokio::test]
    async fn test_unknown_tool_rejected() {
        let service = service_with(
            Arc::new(ScriptedAdapter::rejecting(0)),
            CircuitBreakerConfig::default(),
            BulkheadConfig::default(),
        );

        let mut bad_ctx = ctx();
        bad_ctx.tool_id = ToolId::new("ghost");

        let error = service
            .invoke(
                IdempotencyKey::new("k"),
                serde_json::json!({}),
                fast_policy(0),
                bad_ctx,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(error, InvokeError::UnknownTool(_)));
    }
}
