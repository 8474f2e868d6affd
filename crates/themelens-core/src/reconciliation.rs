//! Cross-batch reconciliation: fold a batch's themes into the persisted set
//!
//! ```text
//! new theme ──► score against every unmatched persisted theme
//!                    │
//!                    ├──► best score ≥ threshold ──► merge into it (it leaves the pool)
//!                    │
//!                    └──► otherwise ──────────────► new theme
//! ```
//!
//! Matching is greedy and one-to-one in input order, not a globally optimal
//! assignment. A scorer failure or unparseable score counts as 0.

use crate::error::{Capability, CapabilityError};
use crate::parse;
use crate::{
    push_unique_phrase, ConsolidationConfig, SimilarityScorer, ThemeId, ThemeRecord, ThemeSummary,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A persisted theme that absorbed a new one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatedTheme {
    pub id: ThemeId,
    pub theme: ThemeRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrossBatchOutcome {
    pub updated_themes: Vec<UpdatedTheme>,
    pub new_themes: Vec<ThemeRecord>,
}

pub struct CrossBatchMerger {
    scorer: Arc<dyn SimilarityScorer>,
    threshold: u8,
    sample_phrases: usize,
}

impl CrossBatchMerger {
    pub fn new(scorer: Arc<dyn SimilarityScorer>) -> Self {
        let defaults = ConsolidationConfig::default();
        Self {
            scorer,
            threshold: defaults.merge_threshold,
            sample_phrases: defaults.sample_phrases,
        }
    }

    pub fn with_config(mut self, config: &ConsolidationConfig) -> Self {
        self.threshold = config.merge_threshold;
        self.sample_phrases = config.sample_phrases;
        self
    }

    pub fn threshold(mut self, threshold: u8) -> Self {
        self.threshold = threshold;
        self
    }

    pub async fn merge(&self, existing: &[ThemeRecord], incoming: Vec<ThemeRecord>) -> CrossBatchOutcome {
        let mut outcome = CrossBatchOutcome::default();
        if existing.is_empty() {
            outcome.new_themes = incoming;
            return outcome;
        }

        // Records without an id cannot be updated in place.
        let mut available: Vec<Option<(&ThemeId, &ThemeRecord)>> = existing
            .iter()
            .map(|record| match &record.id {
                Some(id) => Some((id, record)),
                None => {
                    tracing::warn!(theme = %record.name, "persisted theme has no id, not a merge target");
                    None
                }
            })
            .collect();
        let existing_summaries: Vec<ThemeSummary> =
            existing.iter().map(|r| summarize(r, self.sample_phrases)).collect();

        for candidate in incoming {
            let summary = summarize(&candidate, self.sample_phrases);
            let mut best: Option<(usize, u8)> = None;

            for (idx, slot) in available.iter().enumerate() {
                if slot.is_none() {
                    continue;
                }
                let score = self.score(&summary, &existing_summaries[idx]).await;
                if best.map_or(true, |(_, top)| score > top) {
                    best = Some((idx, score));
                }
            }

            match best {
                Some((idx, score)) if score >= self.threshold => {
                    let Some((id, target)) = available[idx].take() else {
                        continue;
                    };
                    tracing::info!(
                        theme = %candidate.name,
                        into = %target.name,
                        score,
                        "merging into persisted theme"
                    );
                    outcome.updated_themes.push(UpdatedTheme {
                        id: id.clone(),
                        theme: merge_records(target, &candidate),
                    });
                }
                _ => {
                    tracing::debug!(
                        theme = %candidate.name,
                        best = ?best.map(|(_, s)| s),
                        "no persisted theme close enough, keeping as new"
                    );
                    outcome.new_themes.push(candidate);
                }
            }
        }

        outcome
    }

    async fn score(&self, a: &ThemeSummary, b: &ThemeSummary) -> u8 {
        let result = match self.scorer.score(a, b).await {
            Ok(reply) => parse::parse_score(&reply),
            Err(err) => Err(CapabilityError::call(Capability::SimilarityScorer, err)),
        };
        result.unwrap_or_else(|err| {
            tracing::warn!(a = %a.name, b = %b.name, error = %err, "similarity scoring failed, treating as 0");
            0
        })
    }
}

/// Scorer view of a record: name, description and the first `n` phrases.
pub fn summarize(record: &ThemeRecord, n: usize) -> ThemeSummary {
    ThemeSummary {
        name: record.name.clone(),
        description: record.description.clone(),
        sample_phrases: record.phrases.iter().take(n).map(|p| p.text.clone()).collect(),
    }
}

/// Existing identity wins; phrases union case-insensitively keeping first-seen
/// casing; response counts add up.
pub fn merge_records(existing: &ThemeRecord, incoming: &ThemeRecord) -> ThemeRecord {
    let mut phrases = Vec::with_capacity(existing.phrases.len() + incoming.phrases.len());
    for phrase in existing.phrases.iter().chain(&incoming.phrases) {
        let mut phrase = phrase.clone();
        phrase.text = phrase.text.trim().to_string();
        push_unique_phrase(&mut phrases, phrase);
    }

    ThemeRecord {
        id: existing.id.clone(),
        name: existing.name.clone(),
        description: existing.description.clone(),
        phrases,
        response_count: existing.response_count + incoming.response_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ScriptedProvider;
    use crate::{ExtractionClass, Phrase};

    fn record(id: Option<&str>, name: &str, phrases: &[&str], count: usize) -> ThemeRecord {
        ThemeRecord {
            id: id.map(String::from),
            name: name.to_string(),
            description: format!("{name} description"),
            phrases: phrases
                .iter()
                .map(|p| Phrase::new(*p, ExtractionClass::PainPoint))
                .collect(),
            response_count: count,
        }
    }

    fn scored_by(provider: ScriptedProvider) -> (Arc<ScriptedProvider>, CrossBatchMerger) {
        let provider = Arc::new(provider);
        (provider.clone(), CrossBatchMerger::new(provider))
    }

    #[tokio::test]
    async fn test_no_existing_means_all_new() {
        let (provider, merger) = scored_by(ScriptedProvider::default().with_scorer("100"));
        let out = merger.merge(&[], vec![record(None, "A", &["a"], 1)]).await;

        assert_eq!(out.new_themes.len(), 1);
        assert!(out.updated_themes.is_empty());
        assert_eq!(provider.calls(Capability::SimilarityScorer), 0);
    }

    #[tokio::test]
    async fn test_phrase_union_and_count_sum() {
        let (_, merger) = scored_by(ScriptedProvider::default().with_scorer("85"));
        let existing = vec![record(Some("t1"), "Support", &["A", "B"], 4)];
        let out = merger
            .merge(&existing, vec![record(None, "Help", &["b ", "C"], 3)])
            .await;

        assert!(out.new_themes.is_empty());
        let updated = &out.updated_themes[0];
        assert_eq!(updated.id, "t1");
        assert_eq!(updated.theme.name, "Support");
        let texts: Vec<&str> = updated.theme.phrases.iter().map(|p| p.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "B", "C"]);
        assert_eq!(updated.theme.response_count, 7);
    }

    #[tokio::test]
    async fn test_threshold_boundary() {
        let existing = vec![record(Some("t1"), "Support", &["A"], 1)];

        let (_, at) = scored_by(ScriptedProvider::default().with_scorer("80"));
        let out = at.merge(&existing, vec![record(None, "N", &["x"], 1)]).await;
        assert_eq!(out.updated_themes.len(), 1);

        let (_, below) = scored_by(ScriptedProvider::default().with_scorer("79"));
        let out = below.merge(&existing, vec![record(None, "N", &["x"], 1)]).await;
        assert!(out.updated_themes.is_empty());
        assert_eq!(out.new_themes.len(), 1);
    }

    #[tokio::test]
    async fn test_greedy_one_to_one() {
        // N1 vs E1=90, N1 vs E2=85 -> N1 takes E1.
        // N2 is only scored against E2 (E1 is taken): 95 -> N2 takes E2.
        // N3 has nothing left to match.
        let (provider, merger) = scored_by(
            ScriptedProvider::default()
                .with_scorer("90")
                .with_scorer("85")
                .with_scorer("95"),
        );
        let existing = vec![
            record(Some("e1"), "E1", &["a"], 1),
            record(Some("e2"), "E2", &["b"], 1),
        ];
        let incoming = vec![
            record(None, "N1", &["c"], 1),
            record(None, "N2", &["d"], 1),
            record(None, "N3", &["e"], 1),
        ];

        let out = merger.merge(&existing, incoming).await;
        let ids: Vec<&str> = out.updated_themes.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(out.new_themes[0].name, "N3");
        assert_eq!(provider.calls(Capability::SimilarityScorer), 3);
    }

    #[tokio::test]
    async fn test_scorer_failure_counts_as_zero() {
        let (_, merger) = scored_by(
            ScriptedProvider::default().with_failure(Capability::SimilarityScorer, "down"),
        );
        let existing = vec![record(Some("t1"), "Support", &["A"], 1)];
        let out = merger.merge(&existing, vec![record(None, "N", &["x"], 1)]).await;
        assert_eq!(out.new_themes.len(), 1);

        let (_, merger) = merger_with_reply("they look similar");
        let out = merger.merge(&existing, vec![record(None, "N", &["x"], 1)]).await;
        assert_eq!(out.new_themes.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_score_does_not_merge() {
        let existing = vec![record(Some("t1"), "Support", &["A"], 1)];
        for reply in ["250", "-5", "[140]"] {
            let (_, merger) = merger_with_reply(reply);
            let out = merger.merge(&existing, vec![record(None, "N", &["x"], 1)]).await;
            assert!(out.updated_themes.is_empty(), "{reply}");
            assert_eq!(out.new_themes.len(), 1, "{reply}");
        }
    }

    #[tokio::test]
    async fn test_score_after_scale_marker_is_used() {
        let existing = vec![record(Some("t1"), "Support", &["A"], 1)];
        let (_, merger) = merger_with_reply("On a 0-100 scale: 92");
        let out = merger.merge(&existing, vec![record(None, "N", &["x"], 1)]).await;
        assert_eq!(out.updated_themes.len(), 1);
        assert_eq!(out.updated_themes[0].id, "t1");
    }

    fn merger_with_reply(reply: &str) -> (Arc<ScriptedProvider>, CrossBatchMerger) {
        scored_by(ScriptedProvider::default().with_scorer(reply))
    }

    #[test]
    fn test_summary_samples_three_phrases() {
        let summary = summarize(&record(Some("t"), "T", &["a", "b", "c", "d"], 1), 3);
        assert_eq!(summary.sample_phrases, vec!["a", "b", "c"]);
    }
}
