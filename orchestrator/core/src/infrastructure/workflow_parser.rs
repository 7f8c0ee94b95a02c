//! Workflow YAML Parser
//!
//! Infrastructure for parsing workflow YAML manifests into domain objects.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Parse external YAML → Domain objects
//! - **Anti-Corruption:** Translates YAML schema to domain model
//!
//! # Manifest Format
//!
//! ```yaml
//! apiVersion: relay.dev/v1
//! kind: Workflow
//! metadata:
//!   name: order-fulfillment
//!   version: 3
//! spec:
//!   fan_out_limit: 4
//!   loop_safety:
//!     max_steps: 64
//!   steps:
//!     - id: charge_payment
//!       tool: payments
//!       input: "{{run.input.order}}"
//!       idempotency_key: "{{run.input.payment_intent}}"
//!       timeout: 10s
//!       compensation:
//!         tool: payments
//!         payload: "{{output.charge_id}}"
//!     - id: send_confirmation
//!       depends_on: [charge_payment]
//!       tool: email
//!       input: "{{steps.charge_payment.output}}"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::domain::workflow::{
    CompensationSpec, LoopSafetyConfig, RetryPolicy, RunBudget, Step, StepId, ToolId,
    WorkflowDefinition, WorkflowError, WorkflowMetadata, WorkflowVersion,
};

pub const API_VERSION: &str = "relay.dev/v1";
pub const KIND: &str = "Workflow";

// ============================================================================
// YAML Schema (External Representation)
// ============================================================================

/// External YAML representation of a workflow manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowManifest {
    pub api_version: String,
    pub kind: String,
    pub metadata: WorkflowMetadataYaml,
    pub spec: WorkflowSpecYaml,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadataYaml {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpecYaml {
    #[serde(default)]
    pub fan_out_limit: Option<usize>,
    #[serde(default)]
    pub loop_safety: Option<LoopSafetyConfig>,
    #[serde(default)]
    pub budget: Option<RunBudget>,
    pub steps: Vec<StepYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepYaml {
    pub id: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub tool: String,
    pub input: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub skip_on_degraded: bool,
    #[serde(default)]
    pub compensation: Option<CompensationYaml>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationYaml {
    pub tool: String,
    pub payload: String,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

// ============================================================================
// Parser
// ============================================================================

pub struct WorkflowParser;

impl WorkflowParser {
    /// Parse a workflow manifest from a YAML file
    pub fn parse_file<P: AsRef<Path>>(path: P) -> Result<WorkflowDefinition> {
        let yaml = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read manifest {}", path.as_ref().display()))?;
        Self::parse_yaml(&yaml)
    }

    /// Parse a workflow manifest from a YAML string
    pub fn parse_yaml(yaml: &str) -> Result<WorkflowDefinition> {
        let manifest: WorkflowManifest =
            serde_yaml::from_str(yaml).context("Failed to parse workflow YAML")?;
        Self::from_manifest(manifest).map_err(Into::into)
    }

    /// Convert the external schema into a validated domain definition
    pub fn from_manifest(manifest: WorkflowManifest) -> Result<WorkflowDefinition, WorkflowError> {
        if manifest.api_version != API_VERSION {
            return Err(WorkflowError::InvalidManifest(format!(
                "expected apiVersion '{}', got '{}'",
                API_VERSION, manifest.api_version
            )));
        }
        if manifest.kind != KIND {
            return Err(WorkflowError::InvalidManifest(format!(
                "expected kind '{}', got '{}'",
                KIND, manifest.kind
            )));
        }

        let mut steps = Vec::with_capacity(manifest.spec.steps.len());
        for step in manifest.spec.steps {
            steps.push(Self::convert_step(step)?);
        }

        WorkflowDefinition::new(
            WorkflowMetadata {
                name: manifest.metadata.name,
                description: manifest.metadata.description,
                labels: manifest.metadata.labels,
            },
            WorkflowVersion(manifest.metadata.version),
            steps,
            manifest.spec.loop_safety.unwrap_or_default(),
            manifest.spec.budget.unwrap_or_default(),
            manifest.spec.fan_out_limit.unwrap_or(4),
        )
    }

    fn convert_step(step: StepYaml) -> Result<Step, WorkflowError> {
        let id = StepId::new(step.id)?;
        let mut depends_on = BTreeSet::new();
        for dep in step.depends_on {
            depends_on.insert(StepId::new(dep)?);
        }

        let compensation = step.compensation.map(|c| CompensationSpec {
            tool_id: ToolId::new(c.tool),
            payload: c.payload,
            timeout: c.timeout.unwrap_or(Duration::from_secs(30)),
            retry: c.retry.unwrap_or_default(),
        });

        Ok(Step {
            id,
            depends_on,
            tool_id: ToolId::new(step.tool),
            input: step.input,
            config: step.config,
            timeout: step.timeout.unwrap_or(Duration::from_secs(30)),
            retry: step.retry.unwrap_or_default(),
            idempotency_key: step.idempotency_key,
            skip_on_degraded: step.skip_on_degraded,
            compensation,
        })
    }
}
