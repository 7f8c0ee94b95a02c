// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! In-memory tool adapter registry. Adapters are registered at process
//! startup and resolved once at workflow registration time; the engine
//! never dispatches on tool names it has not validated.

use dashmap::DashMap;
use std::sync::Arc;

use crate::domain::tool::{ToolAdapter, ToolRegistry};
use crate::domain::workflow::ToolId;

#[derive(Default)]
pub struct InMemoryToolRegistry {
    adapters: DashMap<ToolId, Arc<dyn ToolAdapter>>,
}

impl InMemoryToolRegistry {
    pub fn new() -> Self {
        Self {
            adapters: DashMap::new(),
        }
    }

    pub fn register(&self, id: ToolId, adapter: Arc<dyn ToolAdapter>) {
        self.adapters.insert(id, adapter);
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl ToolRegistry for InMemoryToolRegistry {
    fn get(&self, id: &ToolId) -> Option<Arc<dyn ToolAdapter>> {
        self.adapters.get(id).map(|entry| entry.value().clone())
    }
}
