//! Clustering: propose candidate themes, then assign grounded spans to them
//!
//! ```text
//! spans ──► per-class samples ──► ThemeProposer ──► candidate themes (3..=7)
//!   │                                                      │
//!   └──► batches of N ──► SpanAssigner ──┬──► [0, 2, 1, ...] ───┐
//!                                        │                      ▼
//!                                        └─ failure ──► keyword fallback ──► themes
//! ```
//!
//! The assigner path gives each span at most one theme. The keyword fallback
//! may give a span several themes; that divergence is intentional.

use crate::error::{Capability, CapabilityError};
use crate::parse;
use crate::{
    normalized_key, CandidateTheme, ClassSamples, ConsolidationConfig, ExtractionClass, Span,
    SpanAssigner, Theme, ThemeProposer,
};
use std::collections::{BTreeMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Result of a clustering pass, with counters for observability.
#[derive(Debug, Clone, Default)]
pub struct ClusteringOutcome {
    pub themes: Vec<Theme>,
    /// Candidate themes the proposer returned
    pub proposed: usize,
    /// Assignment batches resolved by keyword fallback
    pub fallback_batches: usize,
}

pub struct ThemeClusterer {
    proposer: Arc<dyn ThemeProposer>,
    assigner: Arc<dyn SpanAssigner>,
    samples_per_class: usize,
    theme_count: RangeInclusive<usize>,
    batch_size: usize,
}

impl ThemeClusterer {
    pub fn new(proposer: Arc<dyn ThemeProposer>, assigner: Arc<dyn SpanAssigner>) -> Self {
        let defaults = ConsolidationConfig::default();
        Self {
            proposer,
            assigner,
            samples_per_class: defaults.samples_per_class,
            theme_count: defaults.theme_range(),
            batch_size: defaults.assign_batch_size,
        }
    }

    pub fn with_config(mut self, config: &ConsolidationConfig) -> Self {
        self.samples_per_class = config.samples_per_class;
        self.theme_count = config.theme_range();
        self.batch_size = config.assign_batch_size.max(1);
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n.max(1);
        self
    }

    pub fn samples_per_class(mut self, n: usize) -> Self {
        self.samples_per_class = n;
        self
    }

    /// Propose, assign, and keep only themes that received evidence.
    pub async fn cluster(&self, spans: &[Span], question: &str) -> ClusteringOutcome {
        let candidates = self.propose(spans, question).await;
        if candidates.is_empty() {
            return ClusteringOutcome::default();
        }

        let (assignments, fallback_batches) = self.assign(&candidates, spans).await;
        let themes = build_themes(&candidates, spans, &assignments);

        tracing::info!(
            proposed = candidates.len(),
            kept = themes.len(),
            fallback_batches,
            "clustered spans into themes"
        );

        ClusteringOutcome {
            themes,
            proposed: candidates.len(),
            fallback_batches,
        }
    }

    /// Distinct representative texts per class, in class order.
    pub fn summarize(&self, spans: &[Span]) -> Vec<ClassSamples> {
        let mut by_class: BTreeMap<ExtractionClass, (usize, Vec<String>, HashSet<String>)> =
            BTreeMap::new();

        for span in spans {
            let (total, samples, seen) = by_class.entry(span.class).or_default();
            *total += 1;
            if samples.len() < self.samples_per_class && seen.insert(normalized_key(&span.text)) {
                samples.push(span.text.clone());
            }
        }

        by_class
            .into_iter()
            .map(|(class, (total, samples, _))| ClassSamples {
                class,
                total,
                samples,
            })
            .collect()
    }

    /// Phase 1. No fallback: without candidate themes there is nothing to assign to.
    pub async fn propose(&self, spans: &[Span], question: &str) -> Vec<CandidateTheme> {
        let samples = self.summarize(spans);
        let reply = match self
            .proposer
            .propose(&samples, question, self.theme_count.clone())
            .await
        {
            Ok(reply) => reply,
            Err(err) => {
                let err = CapabilityError::call(Capability::ThemeProposer, err);
                tracing::warn!(error = %err, "theme proposal failed");
                return Vec::new();
            }
        };

        match parse::parse_array_lenient::<CandidateTheme>(Capability::ThemeProposer, &reply) {
            Ok(candidates) => {
                let mut candidates: Vec<CandidateTheme> = candidates
                    .into_iter()
                    .filter(|c| !c.name.trim().is_empty())
                    .collect();
                candidates.truncate(*self.theme_count.end());
                candidates
            }
            Err(err) => {
                tracing::warn!(error = %err, "theme proposal unparseable");
                Vec::new()
            }
        }
    }

    /// Phase 2. Per span, the 0-based indices of the candidate themes it belongs to.
    pub async fn assign(&self, themes: &[CandidateTheme], spans: &[Span]) -> (Vec<Vec<usize>>, usize) {
        let mut assignments = Vec::with_capacity(spans.len());
        let mut fallback_batches = 0;

        for (batch_idx, batch) in spans.chunks(self.batch_size).enumerate() {
            match self.assign_batch(themes, batch).await {
                Ok(batch_assignments) => assignments.extend(batch_assignments),
                Err(err) => {
                    tracing::warn!(
                        batch = batch_idx,
                        spans = batch.len(),
                        error = %err,
                        "span assignment failed, falling back to keyword matching"
                    );
                    fallback_batches += 1;
                    assignments.extend(pattern_assign(themes, batch));
                }
            }
        }

        (assignments, fallback_batches)
    }

    async fn assign_batch(
        &self,
        themes: &[CandidateTheme],
        batch: &[Span],
    ) -> Result<Vec<Vec<usize>>, CapabilityError> {
        let reply = self
            .assigner
            .assign(themes, batch)
            .await
            .map_err(|err| CapabilityError::call(Capability::SpanAssigner, err))?;
        let indices: Vec<i64> = parse::parse_array(Capability::SpanAssigner, &reply)?;
        if indices.len() != batch.len() {
            return Err(CapabilityError::parse(
                Capability::SpanAssigner,
                format!("expected {} assignments, got {}", batch.len(), indices.len()),
            ));
        }

        Ok(indices
            .into_iter()
            .map(|index| match usize::try_from(index) {
                Ok(i) if (1..=themes.len()).contains(&i) => vec![i - 1],
                Ok(0) => Vec::new(),
                _ => {
                    tracing::debug!(index, themes = themes.len(), "ignoring out-of-range assignment");
                    Vec::new()
                }
            })
            .collect())
    }
}

/// Deterministic fallback: a span joins every theme with a keyword that
/// occurs in the span text (case-insensitive).
pub fn pattern_assign(themes: &[CandidateTheme], spans: &[Span]) -> Vec<Vec<usize>> {
    let keywords: Vec<Vec<String>> = themes
        .iter()
        .map(|theme| {
            theme
                .pattern_keywords
                .iter()
                .map(|k| normalized_key(k))
                .filter(|k| !k.is_empty())
                .collect()
        })
        .collect();

    spans
        .iter()
        .map(|span| {
            let text = normalized_key(&span.text);
            keywords
                .iter()
                .enumerate()
                .filter(|(_, kws)| kws.iter().any(|k| text.contains(k.as_str())))
                .map(|(idx, _)| idx)
                .collect()
        })
        .collect()
}

/// Materialize themes from assignments, dropping candidates without evidence.
pub fn build_themes(
    candidates: &[CandidateTheme],
    spans: &[Span],
    assignments: &[Vec<usize>],
) -> Vec<Theme> {
    candidates
        .iter()
        .enumerate()
        .filter_map(|(theme_idx, candidate)| {
            let contributing: Vec<Span> = spans
                .iter()
                .zip(assignments)
                .filter(|(_, assigned)| assigned.contains(&theme_idx))
                .map(|(span, _)| span.clone())
                .collect();
            if contributing.is_empty() {
                tracing::debug!(theme = %candidate.name, "dropping theme without evidence");
                return None;
            }
            Some(Theme::from_spans(
                candidate.name.trim(),
                candidate.description.trim(),
                contributing,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;

    fn span(text: &str, class: ExtractionClass, rid: &str) -> Span {
        Span {
            text: text.to_string(),
            class,
            start: 0,
            end: text.len(),
            source_response_id: rid.to_string(),
        }
    }

    fn theme(name: &str, keywords: &[&str]) -> CandidateTheme {
        CandidateTheme {
            name: name.to_string(),
            description: format!("{name} description"),
            pattern_keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }

    fn clusterer(provider: ScriptedProvider) -> ThemeClusterer {
        let provider = Arc::new(provider);
        ThemeClusterer::new(provider.clone(), provider)
    }

    #[test]
    fn test_summarize_caps_and_dedupes_samples() {
        let provider = ScriptedProvider::default();
        let clusterer = clusterer(provider).samples_per_class(2);
        let spans = vec![
            span("slow", ExtractionClass::PainPoint, "r1"),
            span("Slow", ExtractionClass::PainPoint, "r2"),
            span("crashes", ExtractionClass::PainPoint, "r3"),
            span("laggy", ExtractionClass::PainPoint, "r4"),
            span("dark mode", ExtractionClass::Request, "r1"),
        ];

        let summary = clusterer.summarize(&spans);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].class, ExtractionClass::PainPoint);
        assert_eq!(summary[0].total, 4);
        assert_eq!(summary[0].samples, vec!["slow", "crashes"]);
        assert_eq!(summary[1].class, ExtractionClass::Request);
    }

    #[test]
    fn test_pattern_assign_allows_multiple_themes() {
        let themes = vec![theme("Speed", &["slow"]), theme("Sync", &["slow sync"])];
        let spans = vec![
            span("Slow sync", ExtractionClass::PainPoint, "r1"),
            span("pricing", ExtractionClass::Concern, "r2"),
        ];

        let assigned = pattern_assign(&themes, &spans);
        assert_eq!(assigned, vec![vec![0, 1], vec![]]);
    }

    #[test]
    fn test_pattern_assign_keyword_must_occur_in_span() {
        let themes = vec![theme("Sync", &["slow sync"]), theme("Speed", &["SLOW"])];
        let spans = vec![span("slow", ExtractionClass::PainPoint, "r1")];

        // "slow sync" is longer than the span, so only "SLOW" matches.
        assert_eq!(pattern_assign(&themes, &spans), vec![vec![1]]);
    }

    #[tokio::test]
    async fn test_assigner_result_is_positional() {
        let provider = ScriptedProvider::default()
            .with_proposer(r#"[{"name": "Speed", "description": "d", "patternKeywords": ["slow"]},
                              {"name": "Pricing", "description": "d", "patternKeywords": ["price"]},
                              {"name": "Unused", "description": "d", "patternKeywords": []}]"#)
            .with_assigner("[2, 0, 1]");
        let spans = vec![
            span("too expensive", ExtractionClass::Concern, "r1"),
            span("meh", ExtractionClass::Emotion, "r2"),
            span("slow", ExtractionClass::PainPoint, "r3"),
        ];

        let outcome = clusterer(provider).cluster(&spans, "What bugs you?").await;
        assert_eq!(outcome.proposed, 3);
        assert_eq!(outcome.fallback_batches, 0);
        assert_eq!(outcome.themes.len(), 2);
        assert_eq!(outcome.themes[0].name, "Speed");
        assert_eq!(outcome.themes[0].response_ids, vec!["r3"]);
        assert_eq!(outcome.themes[1].name, "Pricing");
        assert_eq!(outcome.themes[1].spans[0].text, "too expensive");
    }

    #[tokio::test]
    async fn test_wrong_length_falls_back_per_batch() {
        let provider = ScriptedProvider::default()
            .with_proposer(r#"[{"name": "Speed", "description": "d", "patternKeywords": ["slow"]}]"#)
            .with_assigner("[1]")
            .with_assigner("no idea");
        let spans = vec![
            span("slow", ExtractionClass::PainPoint, "r1"),
            span("slow start", ExtractionClass::PainPoint, "r2"),
            span("very slow", ExtractionClass::PainPoint, "r3"),
        ];

        let outcome = clusterer(provider).batch_size(2).cluster(&spans, "q").await;
        // Both batches fail: the first reply is too short, the second has no array.
        assert_eq!(outcome.fallback_batches, 2);
        assert_eq!(outcome.themes.len(), 1);
        assert_eq!(outcome.themes[0].spans.len(), 3);
    }

    #[tokio::test]
    async fn test_unparseable_proposal_yields_no_themes() {
        let provider = ScriptedProvider::default().with_proposer("I found some themes!");
        let spans = vec![span("slow", ExtractionClass::PainPoint, "r1")];

        let outcome = clusterer(provider).cluster(&spans, "q").await;
        assert!(outcome.themes.is_empty());
        assert_eq!(outcome.proposed, 0);
    }

    #[tokio::test]
    async fn test_out_of_range_assignment_is_ignored() {
        let provider = ScriptedProvider::default()
            .with_proposer(r#"[{"name": "Speed", "patternKeywords": ["slow"]}]"#)
            .with_assigner("[1, 7, -1]");
        let spans = vec![
            span("slow", ExtractionClass::PainPoint, "r1"),
            span("slow too", ExtractionClass::PainPoint, "r2"),
            span("slow three", ExtractionClass::PainPoint, "r3"),
        ];

        let outcome = clusterer(provider).cluster(&spans, "q").await;
        assert_eq!(outcome.fallback_batches, 0);
        assert_eq!(outcome.themes[0].spans.len(), 1);
    }
}
