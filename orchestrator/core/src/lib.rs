// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0
//! Relay Orchestrator Core
//!
//! Multi-tenant orchestration for multi-step agent workflows: a workflow
//! engine over a step dependency graph, a reliability wrapper around every
//! tool invocation (idempotency, circuit breaking, bulkheads, timeout,
//! retry), saga-style compensation, loop-safety cuts and budget-driven
//! degradation.
//!
//! # Architecture
//!
//! - **Layer:** Core System
//! - **Purpose:** Domain model, application services and in-memory
//!   infrastructure for the orchestration core

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
