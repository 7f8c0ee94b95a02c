// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

pub mod budget;
pub mod loop_safety;
pub mod saga_manager;
pub mod tool_invocation_service;
pub mod workflow_engine;

// Re-export the service surface for convenience
pub use budget::{BudgetController, BudgetDecision};
pub use loop_safety::{CutReason, LoopSafetyMonitor, Verdict};
pub use saga_manager::{CompensationAlertHook, SagaManager};
pub use tool_invocation_service::{
    InvocationOutcome, InvokeError, InvokePolicy, ToolInvocationService,
};
pub use workflow_engine::{EngineConfig, EngineError, WorkflowEngine};
