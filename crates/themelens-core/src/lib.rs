//! Themelens Core: evidence-backed theme consolidation
//!
//! Turns batches of free-text answers into a small set of named themes, each
//! backed by exact character spans in the source answers, and folds every new
//! batch into the themes already persisted from earlier batches.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                      THEME CONSOLIDATION PIPELINE                        │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │                                                                          │
//! │  responses ──► SpanClassifier ──► grounding ──► clustering ──► builder   │
//! │                  (capability)        │        (ThemeProposer,     │      │
//! │                                      │         SpanAssigner)      ▼      │
//! │                                 misses dropped              intra-batch  │
//! │                                                               merge      │
//! │                                                           (MergeGrouper) │
//! │                                                                 │        │
//! │  persisted themes ──► cross-batch merge ◄──── span dedup ◄──────┘        │
//! │                      (SimilarityScorer)                                  │
//! │                             │                                            │
//! │                             ▼                                            │
//! │                  { updated themes, new themes } ──► caller persists      │
//! │                                                                          │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every generative touchpoint is an injectable trait returning raw text. The
//! core extracts the first bracketed array from that text and treats anything
//! unparseable as "no usable result", falling back per stage.
//!
//! Offsets on [`Span`] and [`Highlight`] are UTF-8 byte offsets into the
//! response text, so `&text[span.start..span.end]` is always valid.

pub mod builder;
pub mod clustering;
pub mod dedup;
pub mod error;
pub mod grounding;
pub mod highlight;
pub mod keywords;
pub mod merge;
pub mod parse;
pub mod pipeline;
pub mod providers;
pub mod reconciliation;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::sync::Arc;

pub use error::{
    Capability, CapabilityError, ConfigError, ConsolidateError, EmptyInput, GroundingError,
};

// ============================================================================
// Core Types
// ============================================================================

/// Identifier of a source response, owned by the caller.
pub type ResponseId = String;

/// Identifier of a persisted theme, owned by the external store.
pub type ThemeId = String;

/// Unique identifier for a pipeline run
pub type RunId = uuid::Uuid;

/// Fixed tag set a classifier may attach to a phrase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionClass {
    #[serde(alias = "goal")]
    UserGoal,
    #[serde(alias = "pain-point")]
    PainPoint,
    Emotion,
    Request,
    Insight,
    Suggestion,
    Concern,
}

impl ExtractionClass {
    pub const ALL: [ExtractionClass; 7] = [
        ExtractionClass::UserGoal,
        ExtractionClass::PainPoint,
        ExtractionClass::Emotion,
        ExtractionClass::Request,
        ExtractionClass::Insight,
        ExtractionClass::Suggestion,
        ExtractionClass::Concern,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionClass::UserGoal => "user_goal",
            ExtractionClass::PainPoint => "pain_point",
            ExtractionClass::Emotion => "emotion",
            ExtractionClass::Request => "request",
            ExtractionClass::Insight => "insight",
            ExtractionClass::Suggestion => "suggestion",
            ExtractionClass::Concern => "concern",
        }
    }
}

impl fmt::Display for ExtractionClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionClass {
    type Err = GroundingError;

    /// Case-insensitive; `-` and spaces are read as `_`, and `goal` means `user_goal`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        if normalized == "goal" {
            return Ok(ExtractionClass::UserGoal);
        }
        ExtractionClass::ALL
            .into_iter()
            .find(|class| class.as_str() == normalized)
            .ok_or_else(|| GroundingError::InvalidClass(s.to_string()))
    }
}

/// A free-text answer as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub id: ResponseId,
    pub text: String,
}

impl ResponseRecord {
    pub fn new(id: impl Into<ResponseId>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// Raw `{text, class}` proposal from the span classifier; neither field is trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanCandidate {
    pub text: String,
    #[serde(alias = "type", alias = "category")]
    pub class: String,
}

/// A phrase located verbatim in its source response.
///
/// Invariant: `start < end <= source.len()` and `&source[start..end] == text`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Span {
    pub text: String,
    pub class: ExtractionClass,
    pub start: usize,
    pub end: usize,
    pub source_response_id: ResponseId,
}

impl Span {
    pub fn key(&self) -> SpanKey {
        SpanKey {
            response_id: self.source_response_id.clone(),
            start: self.start,
            end: self.end,
        }
    }
}

/// Identity of a piece of evidence, independent of the theme that holds it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpanKey {
    pub response_id: ResponseId,
    pub start: usize,
    pub end: usize,
}

/// Theme proposal before any evidence is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateTheme {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(
        default,
        rename = "patternKeywords",
        alias = "spanPatterns",
        alias = "pattern_keywords",
        alias = "keywords"
    )]
    pub pattern_keywords: Vec<String>,
}

/// One response's evidence within a theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeResponse {
    pub id: ResponseId,
    pub text: String,
    pub spans: Vec<Span>,
}

/// A theme produced from one batch, with its evidence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Theme {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ThemeId>,
    pub name: String,
    pub description: String,
    pub spans: Vec<Span>,
    pub response_ids: Vec<ResponseId>,
    #[serde(default)]
    pub responses: Vec<ThemeResponse>,
}

impl Theme {
    /// A theme whose `response_ids` are derived from `spans`; responses are
    /// attached later by [`builder::attach_responses`].
    pub fn from_spans(name: impl Into<String>, description: impl Into<String>, spans: Vec<Span>) -> Self {
        let response_ids = distinct_response_ids(&spans);
        Self {
            id: None,
            name: name.into(),
            description: description.into(),
            spans,
            response_ids,
            responses: Vec::new(),
        }
    }

    pub fn response_count(&self) -> usize {
        self.response_ids.len()
    }

    /// Persistable shape: span texts become phrases, unique case-insensitively.
    pub fn to_record(&self) -> ThemeRecord {
        let mut phrases = Vec::new();
        for span in &self.spans {
            push_unique_phrase(
                &mut phrases,
                Phrase {
                    text: span.text.trim().to_string(),
                    class: span.class,
                },
            );
        }
        ThemeRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            phrases,
            response_count: self.response_count(),
        }
    }
}

/// Distinct response ids among `spans`, in first-seen order.
pub fn distinct_response_ids(spans: &[Span]) -> Vec<ResponseId> {
    let mut seen = HashSet::new();
    spans
        .iter()
        .filter(|span| seen.insert(span.source_response_id.as_str()))
        .map(|span| span.source_response_id.clone())
        .collect()
}

/// Evidence phrase as persisted with a theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phrase {
    pub text: String,
    pub class: ExtractionClass,
}

impl Phrase {
    pub fn new(text: impl Into<String>, class: ExtractionClass) -> Self {
        Self {
            text: text.into(),
            class,
        }
    }
}

/// Case-insensitive, trimmed key used for phrase and keyword uniqueness.
pub fn normalized_key(text: &str) -> String {
    text.trim().to_lowercase()
}

/// Appends `phrase` unless an equal phrase (trimmed, case-insensitive) is present.
pub(crate) fn push_unique_phrase(phrases: &mut Vec<Phrase>, phrase: Phrase) -> bool {
    let key = normalized_key(&phrase.text);
    if key.is_empty() || phrases.iter().any(|p| normalized_key(&p.text) == key) {
        return false;
    }
    phrases.push(phrase);
    true
}

/// Theme record shape shared with the external store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThemeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ThemeId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phrases: Vec<Phrase>,
    #[serde(default)]
    pub response_count: usize,
}

/// Representative texts for one class, shown to the theme proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSamples {
    pub class: ExtractionClass,
    pub total: usize,
    pub samples: Vec<String>,
}

/// What the similarity scorer sees of a theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeSummary {
    pub name: String,
    pub description: String,
    pub sample_phrases: Vec<String>,
}

/// What the merge grouper sees of a theme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThemeListing {
    pub index: usize,
    pub name: String,
    pub description: String,
}

/// A rendered, non-overlapping match of a phrase in a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Highlight {
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub class: ExtractionClass,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for a consolidation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Representative texts per class sent to the theme proposer
    pub samples_per_class: usize,
    /// Fewest themes to request from the proposer
    pub min_themes: usize,
    /// Most themes to request (and keep) from the proposer
    pub max_themes: usize,
    /// Spans per span-assigner call
    pub assign_batch_size: usize,
    /// Cross-batch similarity score at or above which themes merge
    pub merge_threshold: u8,
    /// Keyword overlap percentage that must be exceeded to merge
    pub keyword_overlap_threshold: f64,
    /// Phrases per theme sent to the similarity scorer
    pub sample_phrases: usize,
    /// Classifier calls in flight during grounding
    pub grounding_concurrency: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            samples_per_class: 10,
            min_themes: 3,
            max_themes: 7,
            assign_batch_size: 20,
            merge_threshold: 80,
            keyword_overlap_threshold: 50.0,
            sample_phrases: 3,
            grounding_concurrency: 4,
        }
    }
}

impl ConsolidationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.assign_batch_size == 0 {
            return Err(ConfigError::Invalid("assign_batch_size must be positive".into()));
        }
        if self.grounding_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "grounding_concurrency must be positive".into(),
            ));
        }
        if self.max_themes == 0 || self.min_themes > self.max_themes {
            return Err(ConfigError::Invalid(format!(
                "theme range {}..={} is empty",
                self.min_themes, self.max_themes
            )));
        }
        if self.merge_threshold > 100 {
            return Err(ConfigError::Invalid("merge_threshold must be within 0..=100".into()));
        }
        if !(0.0..=100.0).contains(&self.keyword_overlap_threshold) {
            return Err(ConfigError::Invalid(
                "keyword_overlap_threshold must be within 0..=100".into(),
            ));
        }
        Ok(())
    }

    pub fn theme_range(&self) -> RangeInclusive<usize> {
        self.min_themes..=self.max_themes
    }
}

// ============================================================================
// Capability Traits
// ============================================================================
//
// Each capability returns loosely structured text. Callers never trust it:
// see `parse` for the extraction rules and each stage for its fallback.

/// Proposes `{text, class}` phrases for one response.
#[async_trait::async_trait]
pub trait SpanClassifier: Send + Sync {
    async fn classify(&self, response_text: &str, question: &str) -> anyhow::Result<String>;
}

/// Proposes candidate themes `{name, description, patternKeywords}` from class samples.
#[async_trait::async_trait]
pub trait ThemeProposer: Send + Sync {
    async fn propose(
        &self,
        samples: &[ClassSamples],
        question: &str,
        theme_count: RangeInclusive<usize>,
    ) -> anyhow::Result<String>;
}

/// Returns an integer array aligned with `spans`: 0 for none, `1..=K` for a theme.
#[async_trait::async_trait]
pub trait SpanAssigner: Send + Sync {
    async fn assign(&self, themes: &[CandidateTheme], spans: &[Span]) -> anyhow::Result<String>;
}

/// Scores how closely two themes express the same message, 0..=100.
#[async_trait::async_trait]
pub trait SimilarityScorer: Send + Sync {
    async fn score(&self, a: &ThemeSummary, b: &ThemeSummary) -> anyhow::Result<String>;
}

/// Returns groups of 1-based theme indices judged equivalent.
#[async_trait::async_trait]
pub trait MergeGrouper: Send + Sync {
    async fn group(&self, themes: &[ThemeListing]) -> anyhow::Result<String>;
}

/// The full set of capabilities a pipeline run needs.
#[derive(Clone)]
pub struct Capabilities {
    pub classifier: Arc<dyn SpanClassifier>,
    pub proposer: Arc<dyn ThemeProposer>,
    pub assigner: Arc<dyn SpanAssigner>,
    pub scorer: Arc<dyn SimilarityScorer>,
    pub grouper: Arc<dyn MergeGrouper>,
}

impl Capabilities {
    /// Use one object for every capability.
    pub fn from_provider<P>(provider: Arc<P>) -> Self
    where
        P: SpanClassifier + ThemeProposer + SpanAssigner + SimilarityScorer + MergeGrouper + 'static,
    {
        Self {
            classifier: provider.clone(),
            proposer: provider.clone(),
            assigner: provider.clone(),
            scorer: provider.clone(),
            grouper: provider,
        }
    }
}

// ============================================================================
// Re-exports
// ============================================================================

pub use builder::attach_responses;
pub use clustering::{ClusteringOutcome, ThemeClusterer};
pub use dedup::{deduplicate_spans, deduplicate_spans_with};
pub use grounding::{ground_candidates, ground_candidate, GroundingReport};
pub use highlight::resolve_highlights;
pub use keywords::{
    consolidate_keywords, deduplicate_keywords, keyword_overlap, KeywordConsolidation,
    KeywordTheme,
};
pub use merge::{apply_merge_groups, merge_within_batch};
pub use pipeline::{ConsolidationPipeline, PipelineEvent, PipelineOutcome, PipelineStats};
pub use providers::{ScriptedProvider, ScriptedReplies};
pub use reconciliation::{CrossBatchMerger, CrossBatchOutcome, UpdatedTheme};
