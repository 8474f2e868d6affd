//! Pipeline: orchestrates one consolidation run over a batch of responses
//!
//! The pipeline coordinates:
//! 1. Span classification and grounding (concurrent, reassembled in input order)
//! 2. Theme clustering
//! 3. Response attachment and intra-batch merging
//! 4. Evidence deduplication
//! 5. Reconciliation against persisted themes
//!
//! Nothing is persisted here. The caller stores `PipelineOutcome::merge` once
//! the run returns, so dropping a run midway leaves no partial state behind.

use crate::clustering::ThemeClusterer;
use crate::error::{Capability, CapabilityError, EmptyInput};
use crate::grounding::{ground_candidates, GroundingReport};
use crate::reconciliation::{CrossBatchMerger, CrossBatchOutcome};
use crate::{
    attach_responses, dedup, merge, parse, Capabilities, ConfigError, ConsolidateError,
    ConsolidationConfig, ResponseRecord, RunId, SpanCandidate, Theme, ThemeRecord,
};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Pipeline Events
// ============================================================================

/// Milestones emitted during a run. `Display` renders the progress message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PipelineEvent {
    Started {
        run_id: RunId,
        responses: usize,
    },
    Grounded {
        spans: usize,
        misses: usize,
        invalid_classes: usize,
        empty: usize,
        failed_responses: usize,
    },
    Clustered {
        proposed: usize,
        kept: usize,
        fallback_batches: usize,
    },
    Merged {
        before: usize,
        after: usize,
    },
    Deduplicated {
        themes: usize,
    },
    Reconciled {
        updated: usize,
        created: usize,
    },
    Failed {
        reason: String,
    },
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::Started { responses, .. } => {
                write!(f, "Analyzing {responses} responses")
            }
            PipelineEvent::Grounded {
                spans,
                misses,
                invalid_classes,
                empty,
                failed_responses,
            } => {
                write!(f, "Found {spans} phrases")?;
                if misses + invalid_classes + empty + failed_responses > 0 {
                    write!(
                        f,
                        " ({misses} not found verbatim, {invalid_classes} with unknown class, {empty} blank, {failed_responses} responses unclassified)"
                    )?;
                }
                Ok(())
            }
            PipelineEvent::Clustered {
                proposed,
                kept,
                fallback_batches,
            } => {
                write!(f, "Grouped phrases into {kept} of {proposed} proposed themes")?;
                if *fallback_batches > 0 {
                    write!(f, " ({fallback_batches} batches matched by keyword)")?;
                }
                Ok(())
            }
            PipelineEvent::Merged { before, after } => {
                write!(f, "Merged similar themes: {before} -> {after}")
            }
            PipelineEvent::Deduplicated { themes } => {
                write!(f, "Assigned each phrase to one theme, {themes} themes remain")
            }
            PipelineEvent::Reconciled { updated, created } => {
                write!(f, "Updated {updated} existing themes, created {created} new themes")
            }
            PipelineEvent::Failed { reason } => write!(f, "Analysis failed: {reason}"),
        }
    }
}

/// Callback for pipeline events
pub type PipelineEventHandler = Box<dyn Fn(&PipelineEvent) + Send + Sync>;

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub responses: usize,
    pub classifier_failures: usize,
    pub spans: usize,
    pub grounding_misses: usize,
    pub invalid_classes: usize,
    pub empty_candidates: usize,
    pub proposed_themes: usize,
    pub fallback_batches: usize,
    pub clustered_themes: usize,
    pub merged_themes: usize,
    pub final_themes: usize,
    pub updated_themes: usize,
    pub new_themes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// This batch's themes with their evidence, after deduplication
    pub themes: Vec<Theme>,
    /// What the caller should persist
    pub merge: CrossBatchOutcome,
    pub stats: PipelineStats,
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct ConsolidationPipeline {
    capabilities: Capabilities,
    config: ConsolidationConfig,
    handlers: Vec<PipelineEventHandler>,
}

impl ConsolidationPipeline {
    pub fn new(capabilities: Capabilities, config: ConsolidationConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            capabilities,
            config,
            handlers: Vec::new(),
        })
    }

    pub fn config(&self) -> &ConsolidationConfig {
        &self.config
    }

    /// Add an event handler
    pub fn on_event(&mut self, handler: PipelineEventHandler) {
        self.handlers.push(handler);
    }

    /// Receive milestones as plain progress strings.
    pub fn on_progress<F>(&mut self, progress: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_event(Box::new(move |event| progress(&event.to_string())));
    }

    fn emit(&self, event: PipelineEvent) {
        for handler in &self.handlers {
            handler(&event);
        }
    }

    fn fail(&self, empty: EmptyInput) -> ConsolidateError {
        let err = ConsolidateError::EmptyInput(empty);
        tracing::warn!(error = %err, "consolidation run stopped");
        self.emit(PipelineEvent::Failed {
            reason: empty.to_string(),
        });
        err
    }

    /// Run the full pipeline for one batch.
    pub async fn run(
        &self,
        question: &str,
        responses: &[ResponseRecord],
        existing: &[ThemeRecord],
    ) -> Result<PipelineOutcome, ConsolidateError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let mut stats = PipelineStats {
            responses: responses.len(),
            ..Default::default()
        };

        self.emit(PipelineEvent::Started {
            run_id,
            responses: responses.len(),
        });
        if responses.is_empty() {
            return Err(self.fail(EmptyInput::NoResponses));
        }

        // Step 1: classify and ground
        let (grounding, classifier_failures) = self.ground_responses(question, responses).await;
        stats.classifier_failures = classifier_failures;
        stats.spans = grounding.spans.len();
        stats.grounding_misses = grounding.misses;
        stats.invalid_classes = grounding.invalid_classes;
        stats.empty_candidates = grounding.empty;
        self.emit(PipelineEvent::Grounded {
            spans: grounding.spans.len(),
            misses: grounding.misses,
            invalid_classes: grounding.invalid_classes,
            empty: grounding.empty,
            failed_responses: classifier_failures,
        });
        if grounding.spans.is_empty() {
            return Err(self.fail(EmptyInput::NoSpans));
        }

        // Step 2: cluster
        let clusterer = ThemeClusterer::new(
            self.capabilities.proposer.clone(),
            self.capabilities.assigner.clone(),
        )
        .with_config(&self.config);
        let clustering = clusterer.cluster(&grounding.spans, question).await;
        stats.proposed_themes = clustering.proposed;
        stats.fallback_batches = clustering.fallback_batches;
        stats.clustered_themes = clustering.themes.len();
        self.emit(PipelineEvent::Clustered {
            proposed: clustering.proposed,
            kept: clustering.themes.len(),
            fallback_batches: clustering.fallback_batches,
        });
        if clustering.themes.is_empty() {
            return Err(self.fail(EmptyInput::NoThemes));
        }

        // Step 3: attach responses, merge equivalents
        let themes = attach_responses(clustering.themes, responses);
        let before = themes.len();
        let themes = merge::merge_within_batch(themes, self.capabilities.grouper.as_ref()).await;
        stats.merged_themes = themes.len();
        self.emit(PipelineEvent::Merged {
            before,
            after: themes.len(),
        });

        // Step 4: one theme per span
        let themes = dedup::deduplicate_spans(themes);
        stats.final_themes = themes.len();
        self.emit(PipelineEvent::Deduplicated {
            themes: themes.len(),
        });

        // Step 5: reconcile with persisted themes
        let records: Vec<ThemeRecord> = themes.iter().map(Theme::to_record).collect();
        let merger =
            CrossBatchMerger::new(self.capabilities.scorer.clone()).with_config(&self.config);
        let merge = merger.merge(existing, records).await;
        stats.updated_themes = merge.updated_themes.len();
        stats.new_themes = merge.new_themes.len();
        self.emit(PipelineEvent::Reconciled {
            updated: merge.updated_themes.len(),
            created: merge.new_themes.len(),
        });

        tracing::info!(%run_id, ?stats, "consolidation run finished");

        Ok(PipelineOutcome {
            run_id,
            started_at,
            finished_at: Utc::now(),
            themes,
            merge,
            stats,
        })
    }

    /// Classify and ground every response. Results keep input order no matter
    /// how the classifier calls interleave. Returns the merged report and the
    /// number of responses whose classification failed.
    pub async fn ground_responses(
        &self,
        question: &str,
        responses: &[ResponseRecord],
    ) -> (GroundingReport, usize) {
        let per_response: Vec<Option<GroundingReport>> = stream::iter(responses)
            .map(|response| self.ground_response(question, response))
            .buffered(self.config.grounding_concurrency.max(1))
            .collect()
            .await;

        let mut report = GroundingReport::default();
        let mut failures = 0;
        for result in per_response {
            match result {
                Some(single) => report.absorb(single),
                None => failures += 1,
            }
        }
        (report, failures)
    }

    /// `None` when the classifier call or its output failed for this response.
    async fn ground_response(&self, question: &str, response: &ResponseRecord) -> Option<GroundingReport> {
        let candidates = match self.classify(question, response).await {
            Ok(candidates) => candidates,
            Err(err) => {
                tracing::warn!(response_id = %response.id, error = %err, "skipping response");
                return None;
            }
        };
        Some(ground_candidates(response, &candidates))
    }

    async fn classify(
        &self,
        question: &str,
        response: &ResponseRecord,
    ) -> Result<Vec<SpanCandidate>, CapabilityError> {
        let reply = self
            .capabilities
            .classifier
            .classify(&response.text, question)
            .await
            .map_err(|err| CapabilityError::call(Capability::SpanClassifier, err))?;
        parse::parse_array_lenient(Capability::SpanClassifier, &reply)
    }
}
