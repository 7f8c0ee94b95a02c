//! Workflow Domain Model
//!
//! This module defines the core domain entities and value objects for
//! workflow definitions. A workflow is a directed acyclic graph of steps;
//! each step invokes one tool through the reliability wrapper and may carry
//! a compensating action for rollback.
//!
//! # Architectural Context
//!
//! - **Bounded Context:** Orchestration Context
//! - **Aggregate Root:** WorkflowDefinition
//!
//! # Design Principles
//!
//! 1. **Immutability:** Workflow definitions are immutable once registered
//! 2. **Versioned:** A definition never changes under a running execution
//! 3. **Self-Validating:** Constructors enforce invariants (unique step ids,
//!    resolvable dependencies, acyclic graph)

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;
use uuid::Uuid;

// ============================================================================
// Value Objects: Identifiers
// ============================================================================

/// Unique identifier for a workflow definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub Uuid);

impl WorkflowId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkflowId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonically increasing version of a workflow definition
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct WorkflowVersion(pub u32);

impl std::fmt::Display for WorkflowVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Unique name for a step within a workflow (e.g., "charge_payment")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(String);

impl StepId {
    /// Create a new StepId with validation
    ///
    /// # Validation Rules
    /// - Must not be empty
    /// - Lowercase alphanumeric, underscores and hyphens only
    pub fn new(id: impl Into<String>) -> Result<Self, WorkflowError> {
        let id = id.into();
        if id.is_empty() {
            return Err(WorkflowError::InvalidStepId(
                "Step id cannot be empty".to_string(),
            ));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(WorkflowError::InvalidStepId(format!(
                "Step id '{}' must be lowercase alphanumeric, '_' or '-'",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a registered tool adapter (e.g., "payments", "crm")
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolId(String);

impl ToolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ToolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Value Objects: Policies
// ============================================================================

/// Retry policy for a single tool invocation
///
/// Delay for attempt `n` is `base_delay * 2^n` plus/minus up to 10% jitter,
/// capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before the first retry
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound for any single backoff delay
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Add random jitter to each delay
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_millis(200)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(10)
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retrying after attempt `attempt` (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(31) as i32);
        let delay = (self.base_delay.as_millis() as f64 * exp)
            .min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter {
            (delay + jitter_within(delay * 0.1)).max(0.0) as u64
        } else {
            delay as u64
        };

        Duration::from_millis(delay_ms)
    }
}

/// Jitter in `[-max, +max]` derived from the system clock's sub-second nanos.
fn jitter_within(max: f64) -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos as f64 / u32::MAX as f64) * max * 2.0 - max
}

/// Compensating action for a committed step
///
/// The payload is a Handlebars template rendered when the primary action
/// commits; the saga log stores the resolved payload so compensation does
/// not depend on the originating step still being in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// Tool invoked to undo the step
    pub tool_id: ToolId,

    /// Payload template ({{output}} is the committed step's output)
    pub payload: String,

    /// Timeout for the compensation call
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retry policy for the compensation call
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(30)
}

// ============================================================================
// Entity: Step
// ============================================================================

/// A leaf unit of work: one tool invocation with its policies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Unique step id within the workflow
    pub id: StepId,

    /// Steps that must reach `Success` before this one is ready
    #[serde(default)]
    pub depends_on: BTreeSet<StepId>,

    /// Tool invoked by this step
    pub tool_id: ToolId,

    /// Input payload template ({{run.input}}, {{steps.<id>.output}})
    pub input: String,

    /// Static tool configuration, passed through to the adapter
    #[serde(default)]
    pub config: serde_json::Value,

    /// Timeout for a single invocation attempt
    #[serde(default = "default_step_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retry policy for the invocation
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Idempotency key template; when absent a run-scoped key is derived
    #[serde(default)]
    pub idempotency_key: Option<String>,

    /// Skip this step instead of executing it when the run is degraded
    #[serde(default)]
    pub skip_on_degraded: bool,

    /// Compensating action, required for steps with external side effects
    #[serde(default)]
    pub compensation: Option<CompensationSpec>,
}

// ============================================================================
// Value Objects: Safety & Budget Configuration
// ============================================================================

/// Loop-safety thresholds, configurable per workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopSafetyConfig {
    /// Hard ceiling on completed steps for a run
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,

    /// Sliding window (W) for progress-hash recurrence detection
    #[serde(default = "default_oscillation_window")]
    pub oscillation_window: usize,

    /// Consecutive no-change ticks (K) before the run is cut
    #[serde(default = "default_no_progress_threshold")]
    pub no_progress_threshold: u32,

    /// Number of most recent step outputs folded into the progress hash
    #[serde(default = "default_output_window")]
    pub output_window: usize,
}

fn default_max_steps() -> u64 {
    128
}

fn default_oscillation_window() -> usize {
    5
}

fn default_no_progress_threshold() -> u32 {
    3
}

fn default_output_window() -> usize {
    3
}

impl Default for LoopSafetyConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            oscillation_window: default_oscillation_window(),
            no_progress_threshold: default_no_progress_threshold(),
            output_window: default_output_window(),
        }
    }
}

/// Per-run budget ceilings; soft thresholds degrade, hard thresholds abort
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunBudget {
    #[serde(default, with = "humantime_serde")]
    pub soft_wall_clock: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub hard_wall_clock: Option<Duration>,

    #[serde(default)]
    pub soft_cost_units: Option<f64>,

    #[serde(default)]
    pub hard_cost_units: Option<f64>,

    /// Hard ceiling on completed steps, independent of loop safety
    #[serde(default)]
    pub max_steps: Option<u64>,
}

// ============================================================================
// Aggregate Root: WorkflowDefinition
// ============================================================================

/// Workflow metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Unique workflow name (DNS label format: lowercase, alphanumeric, hyphens)
    pub name: String,

    /// Human-readable description
    pub description: Option<String>,

    /// Key-value labels for categorization
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl WorkflowMetadata {
    /// Validate workflow name (DNS label format)
    pub fn validate_name(name: &str) -> Result<(), WorkflowError> {
        if name.is_empty() || name.len() > 63 {
            return Err(WorkflowError::InvalidWorkflowName(
                "Name must be 1-63 characters".to_string(),
            ));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(WorkflowError::InvalidWorkflowName(
                "Name must be lowercase alphanumeric + hyphens".to_string(),
            ));
        }

        if !name
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
            || !name
                .chars()
                .last()
                .map(|c| c.is_ascii_alphanumeric())
                .unwrap_or(false)
        {
            return Err(WorkflowError::InvalidWorkflowName(
                "Name must start and end with alphanumeric".to_string(),
            ));
        }

        Ok(())
    }
}

/// Workflow Aggregate Root
///
/// A complete, validated workflow definition. Immutable once created.
///
/// # Invariants
/// - Must have at least one step
/// - Step ids are unique
/// - Every `depends_on` target references an existing step
/// - The dependency graph is acyclic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub metadata: WorkflowMetadata,
    pub version: WorkflowVersion,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub loop_safety: LoopSafetyConfig,
    #[serde(default)]
    pub budget: RunBudget,
    /// Maximum number of ready steps dispatched concurrently per run
    #[serde(default = "default_fan_out_limit")]
    pub fan_out_limit: usize,
}

fn default_fan_out_limit() -> usize {
    4
}

impl WorkflowDefinition {
    /// Create a new WorkflowDefinition with validation
    pub fn new(
        metadata: WorkflowMetadata,
        version: WorkflowVersion,
        steps: Vec<Step>,
        loop_safety: LoopSafetyConfig,
        budget: RunBudget,
        fan_out_limit: usize,
    ) -> Result<Self, WorkflowError> {
        WorkflowMetadata::validate_name(&metadata.name)?;

        if steps.is_empty() {
            return Err(WorkflowError::NoSteps);
        }

        let mut ids = HashSet::new();
        for step in &steps {
            if !ids.insert(step.id.clone()) {
                return Err(WorkflowError::DuplicateStep(step.id.clone()));
            }
        }

        for step in &steps {
            for dep in &step.depends_on {
                if dep == &step.id {
                    return Err(WorkflowError::SelfDependency(step.id.clone()));
                }
                if !ids.contains(dep) {
                    return Err(WorkflowError::UnknownDependency {
                        step: step.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let definition = Self {
            id: WorkflowId::new(),
            metadata,
            version,
            steps,
            loop_safety,
            budget,
            fan_out_limit: fan_out_limit.max(1),
        };

        definition.check_for_cycles()?;

        Ok(definition)
    }

    /// Get a step by id
    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    /// All tool ids referenced by steps and compensations
    pub fn referenced_tools(&self) -> BTreeSet<ToolId> {
        let mut tools = BTreeSet::new();
        for step in &self.steps {
            tools.insert(step.tool_id.clone());
            if let Some(compensation) = &step.compensation {
                tools.insert(compensation.tool_id.clone());
            }
        }
        tools
    }

    /// Detect cycles in the dependency graph (DFS with a recursion stack)
    fn check_for_cycles(&self) -> Result<(), WorkflowError> {
        fn visit(
            current: &StepId,
            definition: &WorkflowDefinition,
            visited: &mut HashSet<StepId>,
            rec_stack: &mut HashSet<StepId>,
        ) -> Option<StepId> {
            visited.insert(current.clone());
            rec_stack.insert(current.clone());

            if let Some(step) = definition.step(current) {
                for dep in &step.depends_on {
                    if !visited.contains(dep) {
                        if let Some(offender) = visit(dep, definition, visited, rec_stack) {
                            return Some(offender);
                        }
                    } else if rec_stack.contains(dep) {
                        return Some(dep.clone());
                    }
                }
            }

            rec_stack.remove(current);
            None
        }

        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for step in &self.steps {
            if !visited.contains(&step.id) {
                if let Some(offender) = visit(&step.id, self, &mut visited, &mut rec_stack) {
                    return Err(WorkflowError::CyclicDependency(offender));
                }
            }
        }

        Ok(())
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

/// Rejections raised while loading a workflow definition; fatal to the run
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow must have at least one step")]
    NoSteps,

    #[error("Duplicate step id '{0}'")]
    DuplicateStep(StepId),

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: StepId, dependency: StepId },

    #[error("Step '{0}' depends on itself")]
    SelfDependency(StepId),

    #[error("Cyclic dependency detected through step '{0}'")]
    CyclicDependency(StepId),

    #[error("Step '{step}' references unknown tool '{tool}'")]
    UnknownTool { step: StepId, tool: ToolId },

    #[error("Invalid workflow name: {0}")]
    InvalidWorkflowName(String),

    #[error("Invalid step id: {0}")]
    InvalidStepId(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, deps: &[&str]) -> Step {
        Step {
            id: StepId::new(id).unwrap(),
            depends_on: deps.iter().map(|d| StepId::new(*d).unwrap()).collect(),
            tool_id: ToolId::new("echo"),
            input: "{}".to_string(),
            config: serde_json::Value::Null,
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            idempotency_key: None,
            skip_on_degraded: false,
            compensation: None,
        }
    }

    fn metadata(name: &str) -> WorkflowMetadata {
        WorkflowMetadata {
            name: name.to_string(),
            description: None,
            labels: HashMap::new(),
        }
    }

    fn build(steps: Vec<Step>) -> Result<WorkflowDefinition, WorkflowError> {
        WorkflowDefinition::new(
            metadata("test-workflow"),
            WorkflowVersion(1),
            steps,
            LoopSafetyConfig::default(),
            RunBudget::default(),
            4,
        )
    }

    #[test]
    fn test_step_id_validation() {
        assert!(StepId::new("charge_payment").is_ok());
        assert!(StepId::new("").is_err());
        assert!(StepId::new("Charge").is_err());
    }

    #[test]
    fn test_workflow_name_validation() {
        assert!(WorkflowMetadata::validate_name("order-fulfillment").is_ok());
        assert!(WorkflowMetadata::validate_name("My-Workflow").is_err());
        assert!(WorkflowMetadata::validate_name("my_workflow").is_err());
        assert!(WorkflowMetadata::validate_name("-invalid").is_err());
    }

    #[test]
    fn test_workflow_no_steps() {
        assert!(matches!(build(vec![]), Err(WorkflowError::NoSteps)));
    }

    #[test]
    fn test_workflow_duplicate_step() {
        let result = build(vec![step("a", &[]), step("a", &[])]);
        assert!(matches!(result, Err(WorkflowError::DuplicateStep(_))));
    }

    #[test]
    fn test_workflow_unknown_dependency() {
        let result = build(vec![step("a", &["ghost"])]);
        assert!(matches!(
            result,
            Err(WorkflowError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_workflow_cycle_detection() {
        let result = build(vec![step("a", &["b"]), step("b", &["c"]), step("c", &["a"])]);
        assert!(matches!(result, Err(WorkflowError::CyclicDependency(_))));
    }

    #[test]
    fn test_workflow_valid_diamond() {
        let result = build(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["a"]),
            step("d", &["b", "c"]),
        ]);
        assert!(result.is_ok());
    }

    #[test]
    fn test_retry_delay_exponential() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
    }

    #[test]
    fn test_retry_delay_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_delay_jitter_bounded() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        let delay = policy.delay_for_attempt(0);
        assert!(delay.as_millis() >= 90 && delay.as_millis() <= 110);
    }

    #[test]
    fn test_referenced_tools_include_compensations() {
        let mut charge = step("charge", &[]);
        charge.compensation = Some(CompensationSpec {
            tool_id: ToolId::new("refund"),
            payload: "{{output}}".to_string(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
        });
        let definition = build(vec![charge]).unwrap();
        let tools = definition.referenced_tools();
        assert!(tools.contains(&ToolId::new("echo")));
        assert!(tools.contains(&ToolId::new("refund")));
    }
}
