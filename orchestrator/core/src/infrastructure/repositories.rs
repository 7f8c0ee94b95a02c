// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! In-Memory Repositories
//!
//! Reference implementations of the persistence ports. Production
//! deployments swap these for a durable store; the traits are the
//! boundary. Run and saga records are arenas keyed by id, not object
//! graphs, so compensations can outlive the step that produced them.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::domain::repository::{
    RepositoryError, RunRepository, SagaLogRepository, WorkflowRepository,
};
use crate::domain::run::{RunId, WorkflowRun};
use crate::domain::saga::SagaLogEntry;
use crate::domain::workflow::{WorkflowDefinition, WorkflowId, WorkflowVersion};

// ============================================================================
// Workflow Repository
// ============================================================================

#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    definitions: RwLock<HashMap<(WorkflowId, WorkflowVersion), WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError> {
        let mut definitions = self.definitions.write().await;
        let key = (definition.id, definition.version);
        if definitions.contains_key(&key) {
            return Err(RepositoryError::Conflict(format!(
                "workflow {} {} already registered",
                definition.id, definition.version
            )));
        }
        definitions.insert(key, definition.clone());
        Ok(())
    }

    async fn find(
        &self,
        id: WorkflowId,
        version: WorkflowVersion,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.read().await.get(&(id, version)).cloned())
    }

    async fn latest(
        &self,
        id: WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| d.id == id)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn find_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError> {
        Ok(self
            .definitions
            .read()
            .await
            .values()
            .filter(|d| d.metadata.name == name)
            .max_by_key(|d| d.version)
            .cloned())
    }

    async fn list_all(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError> {
        Ok(self.definitions.read().await.values().cloned().collect())
    }
}

// ============================================================================
// Run Repository
// ============================================================================

#[derive(Default)]
pub struct InMemoryRunRepository {
    active: RwLock<HashMap<RunId, WorkflowRun>>,
    archived: RwLock<HashMap<RunId, WorkflowRun>>,
}

impl InMemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for InMemoryRunRepository {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.active.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn find(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.active.read().await.get(&id).cloned())
    }

    async fn archive(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        self.active.write().await.remove(&run.run_id);
        self.archived.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn find_archived(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.archived.read().await.get(&id).cloned())
    }
}

// ============================================================================
// Saga Log Repository
// ============================================================================

#[derive(Default)]
pub struct InMemorySagaLogRepository {
    entries: RwLock<HashMap<RunId, Vec<SagaLogEntry>>>,
}

impl InMemorySagaLogRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SagaLogRepository for InMemorySagaLogRepository {
    async fn append(&self, mut entry: SagaLogEntry) -> Result<u64, RepositoryError> {
        let mut entries = self.entries.write().await;
        let log = entries.entry(entry.run_id).or_default();
        let seq = log.len() as u64;
        entry.commit_seq = seq;
        log.push(entry);
        Ok(seq)
    }

    async fn entries_for_run(
        &self,
        run_id: RunId,
    ) -> Result<Vec<SagaLogEntry>, RepositoryError> {
        Ok(self
            .entries
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn prune_run(&self, run_id: RunId) -> Result<(), RepositoryError> {
        self.entries.write().await.remove(&run_id);
        Ok(())
    }
}
