// Copyright (c) 2026 Relay Systems, Inc.
// SPDX-License-Identifier: AGPL-3.0

//! Repository Traits
//!
//! Persistence ports for the orchestration core. Physical durable storage
//! is an external collaborator; the core programs against these traits and
//! ships in-memory implementations in the infrastructure layer.

use async_trait::async_trait;

use crate::domain::run::{RunId, WorkflowRun};
use crate::domain::saga::SagaLogEntry;
use crate::domain::workflow::{WorkflowDefinition, WorkflowId, WorkflowVersion};

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Conflicting write: {0}")]
    Conflict(String),

    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Workflow definitions, keyed by `(workflow_id, version)`
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn save(&self, definition: &WorkflowDefinition) -> Result<(), RepositoryError>;

    async fn find(
        &self,
        id: WorkflowId,
        version: WorkflowVersion,
    ) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    /// Highest registered version for a workflow id
    async fn latest(&self, id: WorkflowId) -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn find_by_name(&self, name: &str)
        -> Result<Option<WorkflowDefinition>, RepositoryError>;

    async fn list_all(&self) -> Result<Vec<WorkflowDefinition>, RepositoryError>;
}

/// Run records, keyed by `run_id`; archived on terminal state
#[async_trait]
pub trait RunRepository: Send + Sync {
    async fn save(&self, run: &WorkflowRun) -> Result<(), RepositoryError>;

    async fn find(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError>;

    /// Move a terminal run out of the active set
    async fn archive(&self, run: &WorkflowRun) -> Result<(), RepositoryError>;

    async fn find_archived(&self, id: RunId) -> Result<Option<WorkflowRun>, RepositoryError>;
}

/// Append-only saga log, keyed by `(run_id, step_id)`, ordered by commit
/// sequence; single writer per run
#[async_trait]
pub trait SagaLogRepository: Send + Sync {
    /// Append an entry; the log assigns and returns the commit sequence
    async fn append(&self, entry: SagaLogEntry) -> Result<u64, RepositoryError>;

    /// Entries for a run in commit order
    async fn entries_for_run(&self, run_id: RunId) -> Result<Vec<SagaLogEntry>, RepositoryError>;

    /// Drop a run's entries once the run has committed
    async fn prune_run(&self, run_id: RunId) -> Result<(), RepositoryError>;
}
