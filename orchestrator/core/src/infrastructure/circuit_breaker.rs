// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Per-Tool Circuit Breakers
//!
//! Process-wide breaker state shared by every run and tenant calling a
//! tool. The registry is an explicitly injected component (constructed
//! once, passed to the tool invocation service) so tests can substitute
//! isolated instances. Each tool's cell is mutated under its own lock;
//! readers elsewhere treat the state as eventually consistent.
//!
//! State machine: `Closed -> Open` after `failure_threshold` consecutive
//! invocation-level failures; `Open -> HalfOpen` once the cooldown has
//! elapsed, admitting exactly one probe; the probe's outcome decides
//! `Closed` vs re-`Open`.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use crate::domain::workflow::ToolId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time the breaker stays open before admitting a probe
    #[serde(default = "default_cooldown", with = "humantime_serde")]
    pub cooldown: Duration,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown() -> Duration {
    Duration::from_secs(30)
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown: default_cooldown(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Observable state transition, returned so the caller can publish it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened,
    Closed,
    HalfOpened,
}

/// Gate decision for one invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Allow,
    /// Breaker moved `Open -> HalfOpen` and this caller holds the probe
    AllowProbe,
    Reject,
}

#[derive(Debug)]
struct BreakerCell {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for BreakerCell {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Registry of breaker cells keyed by tool id
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    cells: DashMap<ToolId, Mutex<BreakerCell>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    fn with_cell<T>(&self, tool: &ToolId, f: impl FnOnce(&mut BreakerCell) -> T) -> T {
        let cell = self
            .cells
            .entry(tool.clone())
            .or_insert_with(|| Mutex::new(BreakerCell::default()));
        let mut guard = cell.lock();
        f(&mut guard)
    }

    /// Gate an invocation of `tool`
    pub fn try_acquire(&self, tool: &ToolId) -> GateDecision {
        let cooldown = self.config.cooldown;
        self.with_cell(tool, |cell| match cell.state {
            CircuitState::Closed => GateDecision::Allow,
            CircuitState::Open => {
                let elapsed = cell
                    .opened_at
                    .map(|t| t.elapsed() >= cooldown)
                    .unwrap_or(true);
                if elapsed {
                    cell.state = CircuitState::HalfOpen;
                    cell.probe_in_flight = true;
                    GateDecision::AllowProbe
                } else {
                    GateDecision::Reject
                }
            }
            CircuitState::HalfOpen => {
                if cell.probe_in_flight {
                    GateDecision::Reject
                } else {
                    cell.probe_in_flight = true;
                    GateDecision::AllowProbe
                }
            }
        })
    }

    /// Release a probe slot without an outcome (bulkhead full, cancelled)
    pub fn release_probe(&self, tool: &ToolId) {
        self.with_cell(tool, |cell| {
            if cell.state == CircuitState::HalfOpen {
                cell.probe_in_flight = false;
            }
        });
    }

    /// Feed an invocation-level success
    pub fn on_success(&self, tool: &ToolId) -> Option<CircuitTransition> {
        self.with_cell(tool, |cell| {
            cell.probe_in_flight = false;
            match cell.state {
                CircuitState::HalfOpen => {
                    cell.state = CircuitState::Closed;
                    cell.consecutive_failures = 0;
                    cell.opened_at = None;
                    Some(CircuitTransition::Closed)
                }
                CircuitState::Closed => {
                    cell.consecutive_failures = 0;
                    None
                }
                // Late success from a call that raced the breaker opening
                CircuitState::Open => None,
            }
        })
    }

    /// Feed an invocation-level failure (retries already exhausted)
    pub fn on_failure(&self, tool: &ToolId) -> Option<CircuitTransition> {
        let threshold = self.config.failure_threshold;
        self.with_cell(tool, |cell| {
            cell.probe_in_flight = false;
            cell.consecutive_failures += 1;
            match cell.state {
                CircuitState::HalfOpen => {
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    Some(CircuitTransition::Opened)
                }
                CircuitState::Closed if cell.consecutive_failures >= threshold => {
                    cell.state = CircuitState::Open;
                    cell.opened_at = Some(Instant::now());
                    Some(CircuitTransition::Opened)
                }
                _ => None,
            }
        })
    }

    pub fn state(&self, tool: &ToolId) -> CircuitState {
        self.cells
            .get(tool)
            .map(|cell| cell.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    pub fn consecutive_failures(&self, tool: &ToolId) -> u32 {
        self.cells
            .get(tool)
            .map(|cell| cell.lock().consecutive_failures)
            .unwrap_or(0)
    }
}
