//! Structured error types with machine-readable codes
//!
//! Three error families, matching the three caller-facing surfaces:
//! - [`AllocationError`]: expected, frequent, non-fatal outcomes of
//!   `allocate()` (ineligible user, paused experiment). Callers branch on
//!   these for business logic (serve default experience); they are never
//!   system errors.
//! - [`ExperimentError`]: event-tracking and administration failures
//!   (unknown experiment, mismatched allocation reference, missing context).
//! - [`StatisticalError`]: degenerate inputs to the statistics modules.
//!   These are caller bugs and fail loudly instead of returning NaN or a
//!   divide-by-zero Infinity dressed up as a test result.
//!
//! Storage failures are opaque infrastructure errors (`anyhow::Error`)
//! wrapped into the `Storage` variants; this crate does not retry them.

use std::fmt;

/// Failures of the allocation path. Every variant carries enough context
/// for a machine-readable telemetry reason.
#[derive(Debug)]
pub enum AllocationError {
    /// Neither userId nor sessionId present on the user context.
    NoIdentity,
    /// Experiment id not found in the store.
    ExperimentNotFound(String),
    /// Experiment exists but is not in `Running` status.
    NotRunning { id: String, status: String },
    /// Context failed targeting/inclusion/exclusion/holdout checks.
    /// The reason string is one of the distinct values produced by the
    /// eligibility evaluator ("holdout", "targeting_country", ...).
    Ineligible { reason: String },
    /// Cumulative traffic weights never covered the bucket value.
    NoVariantSelected,
    /// Forced variant name does not exist on the experiment.
    UnknownVariant(String),
    /// Opaque storage-layer failure, propagated untouched.
    Storage(anyhow::Error),
}

impl AllocationError {
    /// Machine-readable reason code for telemetry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoIdentity => "NO_IDENTITY",
            Self::ExperimentNotFound(_) => "EXPERIMENT_NOT_FOUND",
            Self::NotRunning { .. } => "NOT_RUNNING",
            Self::Ineligible { .. } => "INELIGIBLE",
            Self::NoVariantSelected => "NO_VARIANT_SELECTED",
            Self::UnknownVariant(_) => "UNKNOWN_VARIANT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for AllocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoIdentity => write!(f, "no identity: userId or sessionId required"),
            Self::ExperimentNotFound(id) => write!(f, "experiment not found: {id}"),
            Self::NotRunning { id, status } => {
                write!(f, "experiment {id} is not running (status: {status})")
            }
            Self::Ineligible { reason } => write!(f, "context not eligible: {reason}"),
            Self::NoVariantSelected => {
                write!(f, "no variant selected: traffic weights did not cover bucket")
            }
            Self::UnknownVariant(name) => write!(f, "unknown variant: {name}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for AllocationError {}

impl From<anyhow::Error> for AllocationError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Failures of event tracking and experiment administration.
#[derive(Debug)]
pub enum ExperimentError {
    /// Experiment id not found in the store.
    ExperimentNotFound(String),
    /// Experiment already exists under this id.
    AlreadyExists(String),
    /// Experiment definition violates a structural invariant
    /// (weight sum > 1.0, duplicate variant names, no variants).
    InvalidExperiment(String),
    /// Lifecycle transition not permitted from the current status.
    InvalidTransition { id: String, from: String, to: String },
    /// Experiment is completed: terminal, no further event recording.
    ExperimentCompleted(String),
    /// Allocation reference does not belong to the named experiment.
    AllocationMismatch { allocation_id: String, experiment_id: String },
    /// No allocation exists for the derived allocation key.
    NoAllocation,
    /// Neither an allocation id nor a resolvable user context was given.
    MissingContext,
    /// Variant name not present on the experiment.
    UnknownVariant(String),
    /// Holdout group not found.
    HoldoutNotFound(String),
    /// Opaque storage-layer failure.
    Storage(anyhow::Error),
}

impl ExperimentError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExperimentNotFound(_) => "EXPERIMENT_NOT_FOUND",
            Self::AlreadyExists(_) => "EXPERIMENT_ALREADY_EXISTS",
            Self::InvalidExperiment(_) => "INVALID_EXPERIMENT",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::ExperimentCompleted(_) => "EXPERIMENT_COMPLETED",
            Self::AllocationMismatch { .. } => "ALLOCATION_MISMATCH",
            Self::NoAllocation => "NO_ALLOCATION",
            Self::MissingContext => "MISSING_CONTEXT",
            Self::UnknownVariant(_) => "UNKNOWN_VARIANT",
            Self::HoldoutNotFound(_) => "HOLDOUT_NOT_FOUND",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl fmt::Display for ExperimentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExperimentNotFound(id) => write!(f, "experiment not found: {id}"),
            Self::AlreadyExists(id) => write!(f, "experiment already exists: {id}"),
            Self::InvalidExperiment(reason) => write!(f, "invalid experiment: {reason}"),
            Self::InvalidTransition { id, from, to } => {
                write!(f, "experiment {id}: cannot transition {from} -> {to}")
            }
            Self::ExperimentCompleted(id) => {
                write!(f, "experiment {id} is completed; no further recording")
            }
            Self::AllocationMismatch { allocation_id, experiment_id } => write!(
                f,
                "allocation {allocation_id} does not belong to experiment {experiment_id}"
            ),
            Self::NoAllocation => write!(f, "no allocation found for identity"),
            Self::MissingContext => {
                write!(f, "missing context: allocation id or user context required")
            }
            Self::UnknownVariant(name) => write!(f, "unknown variant: {name}"),
            Self::HoldoutNotFound(id) => write!(f, "holdout group not found: {id}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for ExperimentError {}

impl From<anyhow::Error> for ExperimentError {
    fn from(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }
}

/// Degenerate statistical inputs. These never produce a "successful"
/// NaN/Infinity result; they fail immediately.
#[derive(Debug, Clone, PartialEq)]
pub enum StatisticalError {
    /// One of the groups has zero sample size.
    ZeroSampleSize,
    /// Standard error evaluated to zero (identical proportions at the
    /// boundary), so no test statistic exists.
    ZeroStandardError,
    /// Both groups have zero variance with positive sample sizes.
    ZeroVariance,
    /// Fewer variants supplied than the comparison needs.
    InsufficientVariants { needed: usize, got: usize },
    /// A rate, probability, or level outside its valid range.
    InvalidParameter { name: &'static str, value: f64 },
}

impl StatisticalError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ZeroSampleSize => "ZERO_SAMPLE_SIZE",
            Self::ZeroStandardError => "ZERO_STANDARD_ERROR",
            Self::ZeroVariance => "ZERO_VARIANCE",
            Self::InsufficientVariants { .. } => "INSUFFICIENT_VARIANTS",
            Self::InvalidParameter { .. } => "INVALID_PARAMETER",
        }
    }
}

impl fmt::Display for StatisticalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ZeroSampleSize => write!(f, "sample size must be positive"),
            Self::ZeroStandardError => {
                write!(f, "standard error is zero: proportions are degenerate")
            }
            Self::ZeroVariance => write!(f, "both groups have zero variance"),
            Self::InsufficientVariants { needed, got } => {
                write!(f, "need at least {needed} variants, got {got}")
            }
            Self::InvalidParameter { name, value } => {
                write!(f, "invalid parameter {name}: {value}")
            }
        }
    }
}

impl std::error::Error for StatisticalError {}

/// Result alias for allocation-path operations.
pub type AllocationResult<T> = std::result::Result<T, AllocationError>;

/// Result alias for tracking/administration operations.
pub type ExperimentResult<T> = std::result::Result<T, ExperimentError>;

/// Result alias for the statistics modules.
pub type StatsResult<T> = std::result::Result<T, StatisticalError>;
