// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Tool Adapter Contract
//!
//! Tools (payment, CRM, email, knowledge search) are opaque capabilities
//! behind a uniform adapter trait. Adapters declare whether they are
//! idempotent; the reliability wrapper uses that declaration to decide
//! whether an ambiguous failure (timeout with unknown tool-side effect)
//! may be retried. Adapters are selected by a registry lookup at workflow
//! registration time, not by runtime dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::domain::run::{ExecutionTier, RunId, TenantId};
use crate::domain::workflow::{StepId, ToolId};

/// Call-scoped context passed to every adapter invocation
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub step_id: StepId,
    pub tool_id: ToolId,
    /// 1-based attempt number for this logical invocation
    pub attempt: u32,
    pub tier: ExecutionTier,
    /// Static step configuration from the workflow definition
    pub config: serde_json::Value,
}

/// Successful adapter response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub output: serde_json::Value,
    /// Cost units consumed by this call, fed to the budget controller
    #[serde(default)]
    pub cost_units: f64,
}

impl ToolResponse {
    pub fn new(output: serde_json::Value) -> Self {
        Self {
            output,
            cost_units: 0.0,
        }
    }

    pub fn with_cost(output: serde_json::Value, cost_units: f64) -> Self {
        Self { output, cost_units }
    }
}

/// Adapter-side failure taxonomy
#[derive(Debug, Clone, thiserror::Error)]
pub enum ToolCallError {
    /// The call did not complete in time; tool-side effect unknown
    #[error("tool call timed out")]
    Timeout,

    /// The tool rejected the call before doing any work
    #[error("tool rejected the call: {reason}")]
    Rejected { reason: String },

    /// The tool could not be reached or is down
    #[error("tool unavailable: {reason}")]
    Unavailable { reason: String },
}

impl ToolCallError {
    /// Ambiguous failures may have had a tool-side effect; they are only
    /// retried for adapters that declare themselves idempotent
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, ToolCallError::Timeout)
    }

    /// Rejections carry no side effect and always qualify for retry
    pub fn is_retryable(&self, adapter_idempotent: bool) -> bool {
        match self {
            ToolCallError::Rejected { .. } => true,
            ToolCallError::Timeout => adapter_idempotent,
            ToolCallError::Unavailable { .. } => false,
        }
    }
}

/// Uniform contract implemented by every external tool adapter
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    async fn call(
        &self,
        payload: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolResponse, ToolCallError>;

    /// Whether a repeated call with the same payload has at most one real
    /// effect. Defaults to false: ambiguous failures are then not retried.
    fn idempotent(&self) -> bool {
        false
    }
}

/// Registry resolving tool ids to adapters at workflow registration time
pub trait ToolRegistry: Send + Sync {
    fn get(&self, id: &ToolId) -> Option<Arc<dyn ToolAdapter>>;
    fn contains(&self, id: &ToolId) -> bool {
        self.get(id).is_some()
    }
}

// ============================================================================
// Idempotency Records
// ============================================================================

/// Caller-supplied (or run-derived) key deduplicating tool calls
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Run-scoped key for steps without an external one
    pub fn derived(run_id: &RunId, step_id: &StepId, scope: &str) -> Self {
        let name = format!("{}/{}/{}", run_id, step_id, scope);
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Cached snapshot of a completed tool call, shared across callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub idempotency_key: IdempotencyKey,
    pub tool_id: ToolId,
    pub result_snapshot: ToolResponse,
    pub expires_at: DateTime<Utc>,
}

impl ToolCallRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
