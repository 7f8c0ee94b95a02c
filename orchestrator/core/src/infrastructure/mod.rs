// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

pub mod bulkhead;
pub mod circuit_breaker;
pub mod event_bus;
pub mod idempotency;
pub mod repositories;
pub mod tool_registry;
pub mod workflow_parser;

pub use event_bus::{EventBus, EventBusError};
