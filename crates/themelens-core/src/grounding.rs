//! Grounding: pin classifier phrases to exact positions in the response text
//!
//! The classifier is not trusted to quote verbatim. A candidate becomes a
//! [`Span`] only when its (trimmed) text occurs case-insensitively in the
//! response; the span text is then re-sliced from the response so it keeps
//! the author's casing. Overlapping spans are allowed here.

use crate::{ExtractionClass, GroundingError, ResponseRecord, Span, SpanCandidate};
use regex::{Regex, RegexBuilder};
use std::ops::Range;

/// Compiled-size cap for a single phrase matcher.
const MATCHER_SIZE_LIMIT: usize = 1 << 20;

/// Case-insensitive literal search over a haystack, reporting byte ranges.
pub struct PhraseMatcher {
    regex: Regex,
}

impl PhraseMatcher {
    /// `None` for empty needles or needles over the compiled-size cap.
    pub fn new(needle: &str) -> Option<Self> {
        if needle.is_empty() {
            return None;
        }
        match RegexBuilder::new(&regex::escape(needle))
            .case_insensitive(true)
            .size_limit(MATCHER_SIZE_LIMIT)
            .build()
        {
            Ok(regex) => Some(Self { regex }),
            Err(err) => {
                tracing::debug!(error = %err, "phrase could not be compiled into a matcher");
                None
            }
        }
    }

    pub fn find_at(&self, haystack: &str, from: usize) -> Option<Range<usize>> {
        if from > haystack.len() {
            return None;
        }
        self.regex
            .find_at(haystack, from)
            .map(|m| m.range())
            .filter(|range| !range.is_empty())
    }

    pub fn first_in(&self, haystack: &str) -> Option<Range<usize>> {
        self.find_at(haystack, 0)
    }
}

/// Outcome of grounding one response's candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroundingReport {
    pub spans: Vec<Span>,
    /// Candidates whose text does not occur in the response
    pub misses: usize,
    /// Candidates tagged with a class outside the fixed set
    pub invalid_classes: usize,
    /// Candidates with blank text
    pub empty: usize,
}

impl GroundingReport {
    pub fn rejected(&self) -> usize {
        self.misses + self.invalid_classes + self.empty
    }

    pub fn absorb(&mut self, other: GroundingReport) {
        self.spans.extend(other.spans);
        self.misses += other.misses;
        self.invalid_classes += other.invalid_classes;
        self.empty += other.empty;
    }
}

/// Ground a single candidate against its response.
pub fn ground_candidate(
    response: &ResponseRecord,
    candidate: &SpanCandidate,
) -> Result<Span, GroundingError> {
    let class: ExtractionClass = candidate.class.parse()?;
    let needle = candidate.text.trim();
    if needle.is_empty() {
        return Err(GroundingError::EmptyPhrase);
    }
    // A needle the matcher cannot compile cannot be found either.
    let range = PhraseMatcher::new(needle)
        .and_then(|matcher| matcher.first_in(&response.text))
        .ok_or_else(|| GroundingError::GroundingMiss(candidate.text.clone()))?;

    Ok(Span {
        text: response.text[range.clone()].to_string(),
        class,
        start: range.start,
        end: range.end,
        source_response_id: response.id.clone(),
    })
}

/// Ground every candidate, dropping (and counting) the ones that fail.
pub fn ground_candidates(response: &ResponseRecord, candidates: &[SpanCandidate]) -> GroundingReport {
    let mut report = GroundingReport::default();

    for candidate in candidates {
        match ground_candidate(response, candidate) {
            Ok(span) => report.spans.push(span),
            Err(err) => {
                tracing::debug!(
                    response_id = %response.id,
                    candidate = %candidate.text,
                    error = %err,
                    "dropping ungrounded candidate"
                );
                match err {
                    GroundingError::InvalidClass(_) => report.invalid_classes += 1,
                    GroundingError::GroundingMiss(_) => report.misses += 1,
                    GroundingError::EmptyPhrase => report.empty += 1,
                }
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(text: &str, class: &str) -> SpanCandidate {
        SpanCandidate {
            text: text.to_string(),
            class: class.to_string(),
        }
    }

    #[test]
    fn test_preserves_source_casing() {
        let response = ResponseRecord::new("r1", "The Onboarding Flow is confusing");
        let span = ground_candidate(&response, &candidate("onboarding flow", "pain_point")).unwrap();

        assert_eq!(span.text, "Onboarding Flow");
        assert_eq!((span.start, span.end), (4, 19));
        assert_eq!(&response.text[span.start..span.end], span.text);
        assert_eq!(span.source_response_id, "r1");
    }

    #[test]
    fn test_first_occurrence_wins() {
        let response = ResponseRecord::new("r1", "slow, really slow");
        let span = ground_candidate(&response, &candidate("SLOW", "pain_point")).unwrap();
        assert_eq!(span.start, 0);
    }

    #[test]
    fn test_rejections_are_counted_not_fatal() {
        let response = ResponseRecord::new("r1", "I want dark mode and faster sync");
        let report = ground_candidates(
            &response,
            &[
                candidate("dark mode", "request"),
                candidate("light mode", "request"),
                candidate("faster sync", "wish"),
                candidate("   ", "request"),
                candidate("faster sync", "user-goal"),
            ],
        );

        assert_eq!(report.spans.len(), 2);
        assert_eq!(report.misses, 1);
        assert_eq!(report.invalid_classes, 1);
        assert_eq!(report.empty, 1);
        assert_eq!(report.rejected(), 3);
    }

    #[test]
    fn test_overlapping_candidates_coexist() {
        let response = ResponseRecord::new("r1", "support team assistance");
        let report = ground_candidates(
            &response,
            &[candidate("support team", "request"), candidate("team", "request")],
        );
        assert_eq!(report.spans.len(), 2);
        assert_eq!((report.spans[1].start, report.spans[1].end), (8, 12));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let response = ResponseRecord::new("r1", "costs $5 (per month)?");
        let span = ground_candidate(&response, &candidate("$5 (per month)?", "concern")).unwrap();
        assert_eq!(span.text, "$5 (per month)?");
    }

    #[test]
    fn test_multibyte_offsets_slice_cleanly() {
        let response = ResponseRecord::new("r1", "Café crème is GREAT");
        let span = ground_candidate(&response, &candidate("crème", "emotion")).unwrap();
        assert_eq!(&response.text[span.start..span.end], "crème");
    }

    #[test]
    fn test_oversized_phrase_is_a_miss() {
        let response = ResponseRecord::new("r1", "short answer");
        let huge = "a".repeat(500_000);
        assert!(PhraseMatcher::new(&huge).is_none());

        let report = ground_candidates(&response, &[candidate(&huge, "insight")]);
        assert!(report.spans.is_empty());
        assert_eq!(report.misses, 1);
        assert_eq!(report.empty, 0);
    }
}
