//! Span deduplication: each piece of evidence belongs to at most one theme
//!
//! Themes are visited in order and the first one to hold a span key
//! `(response, start, end)` keeps it. The set of consumed keys is threaded
//! through explicitly so callers can continue a pass across several calls.

use crate::{distinct_response_ids, SpanKey, Theme};
use std::collections::HashSet;

/// Single pass with a fresh consumed-key set. Idempotent.
pub fn deduplicate_spans(themes: Vec<Theme>) -> Vec<Theme> {
    let mut consumed = HashSet::new();
    deduplicate_spans_with(themes, &mut consumed)
}

/// Keep only spans whose key is not yet in `consumed`, recording the kept ones.
/// Response lists and ids are rebuilt from what survives; themes left without
/// spans are dropped.
pub fn deduplicate_spans_with(themes: Vec<Theme>, consumed: &mut HashSet<SpanKey>) -> Vec<Theme> {
    let before = themes.len();
    let mut removed_spans = 0usize;

    let kept: Vec<Theme> = themes
        .into_iter()
        .filter_map(|mut theme| {
            let total = theme.spans.len();
            theme.spans.retain(|span| consumed.insert(span.key()));
            removed_spans += total - theme.spans.len();

            if theme.spans.is_empty() {
                tracing::debug!(theme = %theme.name, "theme lost all evidence to earlier themes");
                return None;
            }

            let retained: HashSet<SpanKey> = theme.spans.iter().map(|s| s.key()).collect();
            for entry in &mut theme.responses {
                let mut seen = HashSet::new();
                entry.spans.retain(|span| {
                    let key = span.key();
                    retained.contains(&key) && seen.insert(key)
                });
            }
            theme.responses.retain(|entry| !entry.spans.is_empty());
            theme.response_ids = distinct_response_ids(&theme.spans);
            Some(theme)
        })
        .collect();

    if removed_spans > 0 {
        tracing::info!(
            removed_spans,
            dropped_themes = before - kept.len(),
            "deduplicated evidence across themes"
        );
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{attach_responses, ExtractionClass, ResponseRecord, Span};

    fn span(rid: &str, start: usize, end: usize) -> Span {
        Span {
            text: "xy".to_string(),
            class: ExtractionClass::Concern,
            start,
            end,
            source_response_id: rid.to_string(),
        }
    }

    fn responses() -> Vec<ResponseRecord> {
        vec![
            ResponseRecord::new("r1", "0123456789"),
            ResponseRecord::new("r2", "0123456789"),
        ]
    }

    #[test]
    fn test_first_theme_wins() {
        let themes = attach_responses(
            vec![
                Theme::from_spans("A", "", vec![span("r1", 0, 2)]),
                Theme::from_spans("B", "", vec![span("r1", 0, 2), span("r2", 4, 6)]),
            ],
            &responses(),
        );

        let out = deduplicate_spans(themes);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].spans, vec![span("r2", 4, 6)]);
        assert_eq!(out[1].response_ids, vec!["r2"]);
        assert_eq!(out[1].responses.len(), 1);
        assert_eq!(out[1].responses[0].id, "r2");
    }

    #[test]
    fn test_theme_emptied_is_dropped() {
        let themes = vec![
            Theme::from_spans("A", "", vec![span("r1", 0, 2), span("r2", 0, 2)]),
            Theme::from_spans("B", "", vec![span("r2", 0, 2)]),
            Theme::from_spans("C", "", vec![span("r2", 0, 3)]),
        ];

        let out = deduplicate_spans(themes);
        let names: Vec<&str> = out.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["A", "C"]);
    }

    #[test]
    fn test_duplicates_within_one_theme_collapse() {
        let themes = attach_responses(
            vec![Theme::from_spans("A", "", vec![span("r1", 0, 2), span("r1", 0, 2)])],
            &responses(),
        );

        let out = deduplicate_spans(themes);
        assert_eq!(out[0].spans.len(), 1);
        assert_eq!(out[0].responses[0].spans.len(), 1);
    }

    #[test]
    fn test_idempotent() {
        let themes = attach_responses(
            vec![
                Theme::from_spans("A", "", vec![span("r1", 0, 2), span("r2", 1, 3)]),
                Theme::from_spans("B", "", vec![span("r2", 1, 3), span("r1", 0, 2)]),
                Theme::from_spans("C", "", vec![span("r1", 5, 7), span("r1", 0, 2)]),
            ],
            &responses(),
        );

        let once = deduplicate_spans(themes);
        let twice = deduplicate_spans(once.clone());
        assert_eq!(once, twice);
        assert_eq!(once.len(), 2);
    }

    #[test]
    fn test_accumulator_carries_across_calls() {
        let mut consumed = HashSet::new();
        let first = deduplicate_spans_with(
            vec![Theme::from_spans("A", "", vec![span("r1", 0, 2)])],
            &mut consumed,
        );
        let second = deduplicate_spans_with(
            vec![Theme::from_spans("B", "", vec![span("r1", 0, 2)])],
            &mut consumed,
        );

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert_eq!(consumed.len(), 1);
    }
}
