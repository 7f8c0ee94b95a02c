// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Per-Tool Bulkheads
//!
//! Fixed-size concurrency pools isolating load on one tool from the rest.
//! Slots are `tokio` semaphore permits: owned, so they travel with the
//! invocation future and release on every exit path, including
//! cancellation. Exhaustion is a fail-fast signal, not a queue.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::domain::workflow::ToolId;

#[derive(Debug, Clone)]
pub struct BulkheadConfig {
    /// Pool size for tools without an explicit override
    pub default_limit: usize,
    pub per_tool: HashMap<ToolId, usize>,
}

impl Default for BulkheadConfig {
    fn default() -> Self {
        Self {
            default_limit: 8,
            per_tool: HashMap::new(),
        }
    }
}

impl BulkheadConfig {
    pub fn with_limit(mut self, tool: ToolId, limit: usize) -> Self {
        self.per_tool.insert(tool, limit.max(1));
        self
    }

    fn limit_for(&self, tool: &ToolId) -> usize {
        self.per_tool
            .get(tool)
            .copied()
            .unwrap_or(self.default_limit)
            .max(1)
    }
}

/// Registry of per-tool semaphores, created lazily on first use
pub struct BulkheadRegistry {
    config: BulkheadConfig,
    pools: DashMap<ToolId, Arc<Semaphore>>,
}

impl BulkheadRegistry {
    pub fn new(config: BulkheadConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
        }
    }

    fn pool(&self, tool: &ToolId) -> Arc<Semaphore> {
        self.pools
            .entry(tool.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.limit_for(tool))))
            .clone()
    }

    /// Acquire a slot without waiting; `None` means the pool is exhausted
    pub fn try_acquire(&self, tool: &ToolId) -> Option<OwnedSemaphorePermit> {
        self.pool(tool).try_acquire_owned().ok()
    }

    pub fn available(&self, tool: &ToolId) -> usize {
        self.pool(tool).available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_pool_fails_fast() {
        let bulkheads = BulkheadRegistry::new(
            BulkheadConfig::default().with_limit(ToolId::new("payments"), 2),
        );
        let tool = ToolId::new("payments");

        let _a = bulkheads.try_acquire(&tool).unwrap();
        let _b = bulkheads.try_acquire(&tool).unwrap();
        assert!(bulkheads.try_acquire(&tool).is_none());
    }

    #[test]
    fn test_permit_released_on_drop() {
        let bulkheads = BulkheadRegistry::new(
            BulkheadConfig::default().with_limit(ToolId::new("payments"), 1),
        );
        let tool = ToolId::new("payments");

        let permit = bulkheads.try_acquire(&tool).unwrap();
        assert!(bulkheads.try_acquire(&tool).is_none());
        drop(permit);
        assert!(bulkheads.try_acquire(&tool).is_some());
    }

    #[test]
    fn test_tools_have_independent_pools() {
        let bulkheads = BulkheadRegistry::new(
            BulkheadConfig::default().with_limit(ToolId::new("payments"), 1),
        );

        let _payments = bulkheads.try_acquire(&ToolId::new("payments")).unwrap();
        assert!(bulkheads.try_acquire(&ToolId::new("payments")).is_none());
        assert!(bulkheads.try_acquire(&ToolId::new("email")).is_some());
    }
}
