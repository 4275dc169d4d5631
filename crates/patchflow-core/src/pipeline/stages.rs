// crates/patchflow-core/src/pipeline/stages.rs
// ============================================================================
// Module: Patchflow Stage Contracts
// Description: Workflow registry, typed stage IO, and model tier selection.
// Purpose: Keep stages pure functions over schema-validated input/output.
// Dependencies: crate::{core, interfaces}, serde, serde_json
// ============================================================================

//! ## Overview
//! The stage catalogue is a closed set of tagged variants dispatched through
//! a table; adding a stage is a registry change plus a handler, not a
//! subclass. Stages call the model capability through the injected port and
//! never touch storage or network; the orchestrator owns every side effect.
//! Model output is parsed and validated here, so a malformed artifact is a
//! typed `capability_output_invalid` failure rather than a stray panic.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::core::Capability;
use crate::core::CoreError;
use crate::core::ModelTier;
use crate::core::RunId;
use crate::core::StageKind;
use crate::core::TargetDescriptor;
use crate::core::TenantId;
use crate::core::WorkflowKind;
use crate::interfaces::CapabilityError;
use crate::interfaces::ModelCapability;
use crate::interfaces::ModelRequest;

// ============================================================================
// SECTION: Workflow Registry
// ============================================================================

/// Returns the ordered stage sequence for a workflow kind.
#[must_use]
pub const fn stage_sequence(kind: WorkflowKind) -> &'static [StageKind] {
    match kind {
        WorkflowKind::Triage => &[StageKind::Triage],
        WorkflowKind::Review => &[StageKind::Triage, StageKind::Review],
        WorkflowKind::Resolve => &[StageKind::Triage, StageKind::Resolve, StageKind::Review],
        WorkflowKind::IssueToCode => {
            &[StageKind::Triage, StageKind::Plan, StageKind::Code, StageKind::Review]
        }
        WorkflowKind::Autopilot => &[
            StageKind::Triage,
            StageKind::Plan,
            StageKind::Code,
            StageKind::Resolve,
            StageKind::Review,
        ],
    }
}

/// Returns true when the workflow ends in an approval-gated apply.
#[must_use]
pub const fn ends_in_apply_gate(kind: WorkflowKind) -> bool {
    matches!(kind, WorkflowKind::Autopilot)
}

// ============================================================================
// SECTION: Model Tier Selection
// ============================================================================

/// Complexity score above which code-producing stages use the heavy tier.
const HEAVY_COMPLEXITY: u8 = 70;

/// Complexity score below which code-producing stages use the light tier.
const LIGHT_COMPLEXITY: u8 = 30;

/// Selects the model tier for a stage.
///
/// Triage always runs light. Review runs standard. Plan, code, and resolve
/// scale with the triage complexity score when one is available.
#[must_use]
pub const fn select_model_tier(stage: StageKind, complexity: Option<u8>) -> ModelTier {
    match stage {
        StageKind::Triage => ModelTier::Light,
        StageKind::Review => ModelTier::Standard,
        StageKind::Plan | StageKind::Code | StageKind::Resolve => match complexity {
            Some(score) if score >= HEAVY_COMPLEXITY => ModelTier::Heavy,
            Some(score) if score < LIGHT_COMPLEXITY => ModelTier::Light,
            _ => ModelTier::Standard,
        },
    }
}

// ============================================================================
// SECTION: Stage Input
// ============================================================================

/// Typed input snapshot handed to a stage.
///
/// # Invariants
/// - `prior` holds the inline artifacts of completed stages, keyed by stage
///   label; stages reference prior work only through this map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageInput {
    /// Run identifier.
    pub run_id: RunId,
    /// Tenant identifier.
    pub tenant_id: TenantId,
    /// Workflow being executed.
    pub workflow: WorkflowKind,
    /// External host target.
    pub target: TargetDescriptor,
    /// Normalized trigger request payload.
    pub request: Value,
    /// Inline artifacts of completed stages keyed by stage label.
    pub prior: BTreeMap<String, Value>,
}

// ============================================================================
// SECTION: Stage Outputs
// ============================================================================

/// Triage stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriageOutput {
    /// Complexity score in `0..=100` consumed by tier selection.
    pub complexity_score: u8,
    /// Labels the upstream system attaches to host issues.
    pub labels: Vec<String>,
    /// Human-readable summary surfaced to read endpoints.
    pub summary: String,
}

/// Plan stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanOutput {
    /// Ordered implementation tasks.
    pub tasks: Vec<String>,
    /// Human-readable summary.
    pub summary: String,
}

/// Mutation proposed by a code or resolve stage.
///
/// # Invariants
/// - `payload` is the JSON form of the mutation; the approval gate binds
///   the RFC 8785 canonical bytes of this value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedMutation {
    /// Capability the mutation exercises.
    pub capability: Capability,
    /// Mutation payload.
    pub payload: Value,
    /// Payload content type.
    pub content_type: String,
}

/// Code stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeOutput {
    /// Proposed mutation, absent when no change is needed.
    pub mutation: Option<ProposedMutation>,
    /// Human-readable summary.
    pub summary: String,
}

/// Resolve stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveOutput {
    /// Rebased or conflict-resolved mutation, absent when none is needed.
    pub mutation: Option<ProposedMutation>,
    /// Human-readable summary.
    pub summary: String,
}

/// Review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    /// The accumulated artifacts are sound.
    Approve,
    /// The artifacts need changes before applying.
    RequestChanges,
}

/// Review stage output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewOutput {
    /// Review verdict.
    pub verdict: ReviewVerdict,
    /// Reviewer comments.
    pub comments: Vec<String>,
    /// Human-readable summary.
    pub summary: String,
}

/// Tagged stage output union.
///
/// # Invariants
/// - The tag always matches the stage that produced the output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum StageOutput {
    /// Triage output.
    Triage(TriageOutput),
    /// Plan output.
    Plan(PlanOutput),
    /// Code output.
    Code(CodeOutput),
    /// Resolve output.
    Resolve(ResolveOutput),
    /// Review output.
    Review(ReviewOutput),
}

impl StageOutput {
    /// Returns the stage that produced the output.
    #[must_use]
    pub const fn stage(&self) -> StageKind {
        match self {
            Self::Triage(_) => StageKind::Triage,
            Self::Plan(_) => StageKind::Plan,
            Self::Code(_) => StageKind::Code,
            Self::Resolve(_) => StageKind::Resolve,
            Self::Review(_) => StageKind::Review,
        }
    }

    /// Returns the human-readable summary.
    #[must_use]
    pub fn summary(&self) -> &str {
        match self {
            Self::Triage(output) => &output.summary,
            Self::Plan(output) => &output.summary,
            Self::Code(output) => &output.summary,
            Self::Resolve(output) => &output.summary,
            Self::Review(output) => &output.summary,
        }
    }

    /// Returns the proposed mutation, if the stage produced one.
    #[must_use]
    pub const fn proposed_mutation(&self) -> Option<&ProposedMutation> {
        match self {
            Self::Code(output) => output.mutation.as_ref(),
            Self::Resolve(output) => output.mutation.as_ref(),
            Self::Triage(_) | Self::Plan(_) | Self::Review(_) => None,
        }
    }
}

// ============================================================================
// SECTION: Output Parsing
// ============================================================================

/// Stable code for schema-invalid capability output.
pub const CAPABILITY_OUTPUT_INVALID: &str = "capability_output_invalid";

/// Parses and validates raw model output for a stage.
///
/// # Errors
///
/// Returns a permanent `capability_output_invalid` error when the content
/// is not valid JSON, carries the wrong stage tag, or violates field
/// constraints.
pub fn parse_stage_output(stage: StageKind, content: &str) -> Result<StageOutput, CoreError> {
    let output: StageOutput = serde_json::from_str(content).map_err(|err| {
        CoreError::permanent(CAPABILITY_OUTPUT_INVALID, format!("unparseable artifact: {err}"))
    })?;
    if output.stage() != stage {
        return Err(CoreError::permanent(
            CAPABILITY_OUTPUT_INVALID,
            format!("expected {} output, got {}", stage.as_str(), output.stage().as_str()),
        ));
    }
    if let StageOutput::Triage(triage) = &output {
        if triage.complexity_score > 100 {
            return Err(CoreError::permanent(
                CAPABILITY_OUTPUT_INVALID,
                "complexity score out of range",
            ));
        }
    }
    Ok(output)
}

// ============================================================================
// SECTION: Stage Execution
// ============================================================================

/// Classifies a capability failure into the core taxonomy.
fn classify_capability_error(error: &CapabilityError) -> CoreError {
    match error {
        CapabilityError::Timeout => CoreError::timeout("model call timed out"),
        CapabilityError::Unavailable(detail) => {
            CoreError::transient("model_unavailable", detail.clone())
        }
        CapabilityError::Rejected(detail) => CoreError::permanent("model_rejected", detail.clone()),
    }
}

/// Invokes the model capability for one stage and parses the artifact.
///
/// This is the entire stage contract: typed input in, typed output out,
/// no side effects.
///
/// # Errors
///
/// Returns a classified [`CoreError`] on capability failure and a permanent
/// `capability_output_invalid` error on malformed artifacts.
pub fn run_stage(
    model: &dyn ModelCapability,
    stage: StageKind,
    tier: ModelTier,
    input: &StageInput,
    deadline_millis: u64,
) -> Result<StageOutput, CoreError> {
    let request = ModelRequest {
        stage,
        tier,
        input: serde_json::to_value(input)
            .map_err(|err| CoreError::internal(format!("stage input encode failed: {err}")))?,
        deadline_millis,
    };
    let response = model.invoke(&request).map_err(|err| classify_capability_error(&err))?;
    parse_stage_output(stage, &response.content)
}
