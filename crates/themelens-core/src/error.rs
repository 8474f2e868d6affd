//! Error taxonomy
//!
//! Item-level failures ([`GroundingError`]) are logged and skipped by the stage
//! that hits them. Capability failures ([`CapabilityError`]) trigger the stage's
//! fallback. Only [`ConsolidateError`] ever reaches the caller of a pipeline run.

use std::fmt;

/// The five generative touchpoints the core consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    SpanClassifier,
    ThemeProposer,
    SpanAssigner,
    SimilarityScorer,
    MergeGrouper,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::SpanClassifier => "span classifier",
            Capability::ThemeProposer => "theme proposer",
            Capability::SpanAssigner => "span assigner",
            Capability::SimilarityScorer => "similarity scorer",
            Capability::MergeGrouper => "merge grouper",
        };
        f.write_str(name)
    }
}

/// Why a classifier candidate did not become a span.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroundingError {
    #[error("unknown extraction class `{0}`")]
    InvalidClass(String),
    #[error("phrase not found in response text: {0:?}")]
    GroundingMiss(String),
    #[error("empty phrase")]
    EmptyPhrase,
}

#[derive(Debug, thiserror::Error)]
pub enum CapabilityError {
    #[error("{capability} call failed: {source}")]
    Call {
        capability: Capability,
        #[source]
        source: anyhow::Error,
    },
    #[error("{capability} returned unusable output: {reason}")]
    Parse {
        capability: Capability,
        reason: String,
    },
}

impl CapabilityError {
    pub fn call(capability: Capability, source: anyhow::Error) -> Self {
        CapabilityError::Call { capability, source }
    }

    pub fn parse(capability: Capability, reason: impl Into<String>) -> Self {
        CapabilityError::Parse {
            capability,
            reason: reason.into(),
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            CapabilityError::Call { capability, .. } | CapabilityError::Parse { capability, .. } => {
                *capability
            }
        }
    }
}

/// Which stage ran out of usable input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyInput {
    NoResponses,
    NoSpans,
    NoThemes,
}

impl fmt::Display for EmptyInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            EmptyInput::NoResponses => "no responses to analyze",
            EmptyInput::NoSpans => "no phrases could be grounded in the responses",
            EmptyInput::NoThemes => "no themes survived clustering",
        };
        f.write_str(msg)
    }
}

/// Terminal, user-visible failures of a consolidation run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConsolidateError {
    #[error("empty input: {0}")]
    EmptyInput(EmptyInput),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
