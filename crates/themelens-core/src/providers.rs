//! Capability providers
//!
//! Concrete model integrations live outside this crate. What ships here is a
//! scripted provider that replays canned raw replies, used by the test suite
//! and by the CLI to replay a recorded run offline.

use crate::error::Capability;
use crate::{
    CandidateTheme, ClassSamples, MergeGrouper, SimilarityScorer, Span, SpanAssigner,
    SpanClassifier, ThemeListing, ThemeProposer, ThemeSummary,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A canned reply: raw text, or a simulated call failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    Text(String),
    Fail { fail: String },
}

/// Per-capability reply queues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptedReplies {
    pub classifier: Vec<Reply>,
    pub proposer: Vec<Reply>,
    pub assigner: Vec<Reply>,
    pub scorer: Vec<Reply>,
    pub grouper: Vec<Reply>,
}

/// Replays replies in call order per capability, cycling once exhausted.
/// A capability with no replies fails every call.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: ScriptedReplies,
    cursors: [AtomicUsize; 5],
}

impl ScriptedProvider {
    pub fn new(replies: ScriptedReplies) -> Self {
        Self {
            replies,
            cursors: Default::default(),
        }
    }

    pub fn with_classifier(mut self, reply: &str) -> Self {
        self.replies.classifier.push(Reply::Text(reply.to_string()));
        self
    }

    pub fn with_proposer(mut self, reply: &str) -> Self {
        self.replies.proposer.push(Reply::Text(reply.to_string()));
        self
    }

    pub fn with_assigner(mut self, reply: &str) -> Self {
        self.replies.assigner.push(Reply::Text(reply.to_string()));
        self
    }

    pub fn with_scorer(mut self, reply: &str) -> Self {
        self.replies.scorer.push(Reply::Text(reply.to_string()));
        self
    }

    pub fn with_grouper(mut self, reply: &str) -> Self {
        self.replies.grouper.push(Reply::Text(reply.to_string()));
        self
    }

    /// Queue a simulated transport failure for `capability`.
    pub fn with_failure(mut self, capability: Capability, message: &str) -> Self {
        let reply = Reply::Fail {
            fail: message.to_string(),
        };
        self.queue_mut(capability).push(reply);
        self
    }

    /// How many times `capability` has been called.
    pub fn calls(&self, capability: Capability) -> usize {
        self.cursors[Self::slot(capability)].load(Ordering::SeqCst)
    }

    fn slot(capability: Capability) -> usize {
        match capability {
            Capability::SpanClassifier => 0,
            Capability::ThemeProposer => 1,
            Capability::SpanAssigner => 2,
            Capability::SimilarityScorer => 3,
            Capability::MergeGrouper => 4,
        }
    }

    fn queue(&self, capability: Capability) -> &[Reply] {
        match capability {
            Capability::SpanClassifier => &self.replies.classifier,
            Capability::ThemeProposer => &self.replies.proposer,
            Capability::SpanAssigner => &self.replies.assigner,
            Capability::SimilarityScorer => &self.replies.scorer,
            Capability::MergeGrouper => &self.replies.grouper,
        }
    }

    fn queue_mut(&mut self, capability: Capability) -> &mut Vec<Reply> {
        match capability {
            Capability::SpanClassifier => &mut self.replies.classifier,
            Capability::ThemeProposer => &mut self.replies.proposer,
            Capability::SpanAssigner => &mut self.replies.assigner,
            Capability::SimilarityScorer => &mut self.replies.scorer,
            Capability::MergeGrouper => &mut self.replies.grouper,
        }
    }

    fn next(&self, capability: Capability) -> anyhow::Result<String> {
        let idx = self.cursors[Self::slot(capability)].fetch_add(1, Ordering::SeqCst);
        let queue = self.queue(capability);
        if queue.is_empty() {
            anyhow::bail!("no scripted reply for {capability}");
        }
        match &queue[idx % queue.len()] {
            Reply::Text(text) => Ok(text.clone()),
            Reply::Fail { fail } => Err(anyhow::anyhow!("{fail}")),
        }
    }
}

#[async_trait]
impl SpanClassifier for ScriptedProvider {
    async fn classify(&self, _response_text: &str, _question: &str) -> anyhow::Result<String> {
        self.next(Capability::SpanClassifier)
    }
}

#[async_trait]
impl ThemeProposer for ScriptedProvider {
    async fn propose(
        &self,
        _samples: &[ClassSamples],
        _question: &str,
        _theme_count: RangeInclusive<usize>,
    ) -> anyhow::Result<String> {
        self.next(Capability::ThemeProposer)
    }
}

#[async_trait]
impl SpanAssigner for ScriptedProvider {
    async fn assign(&self, _themes: &[CandidateTheme], _spans: &[Span]) -> anyhow::Result<String> {
        self.next(Capability::SpanAssigner)
    }
}

#[async_trait]
impl SimilarityScorer for ScriptedProvider {
    async fn score(&self, _a: &ThemeSummary, _b: &ThemeSummary) -> anyhow::Result<String> {
        self.next(Capability::SimilarityScorer)
    }
}

#[async_trait]
impl MergeGrouper for ScriptedProvider {
    async fn group(&self, _themes: &[ThemeListing]) -> anyhow::Result<String> {
        self.next(Capability::MergeGrouper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replies_cycle_in_order() {
        let provider = ScriptedProvider::default().with_scorer("10").with_scorer("90");
        let summary = ThemeSummary {
            name: "a".into(),
            description: String::new(),
            sample_phrases: vec![],
        };

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(provider.score(&summary, &summary).await.unwrap());
        }
        assert_eq!(seen, vec!["10", "90", "10"]);
        assert_eq!(provider.calls(Capability::SimilarityScorer), 3);
    }

    #[tokio::test]
    async fn test_empty_queue_and_failures_are_errors() {
        let provider = ScriptedProvider::default().with_failure(Capability::MergeGrouper, "timeout");

        let err = provider.group(&[]).await.unwrap_err();
        assert_eq!(err.to_string(), "timeout");
        assert!(provider.classify("text", "q").await.is_err());
    }

    #[test]
    fn test_replies_from_json() {
        let replies: ScriptedReplies = serde_json::from_str(
            r#"{"scorer": ["85", {"fail": "rate limited"}], "grouper": ["[]"]}"#,
        )
        .unwrap();
        assert_eq!(replies.scorer.len(), 2);
        assert_eq!(
            replies.scorer[1],
            Reply::Fail {
                fail: "rate limited".to_string()
            }
        );
        assert!(replies.classifier.is_empty());
    }
}
