//! Highlight resolution for presenting a theme's phrases inside a response.
//!
//! Phrases are tried in the order given, which is their priority: an
//! occurrence is accepted only if it does not touch any range accepted before
//! it. Earlier phrases therefore win every overlap, including containment.

use crate::grounding::PhraseMatcher;
use crate::{Highlight, Phrase};
use std::ops::Range;

/// Non-overlapping highlights of `phrases` in `text`, sorted by start offset.
pub fn resolve_highlights(text: &str, phrases: &[Phrase]) -> Vec<Highlight> {
    let mut accepted: Vec<Highlight> = Vec::new();

    for phrase in phrases {
        let Some(matcher) = PhraseMatcher::new(phrase.text.trim()) else {
            continue;
        };

        let mut from = 0;
        while let Some(range) = matcher.find_at(text, from) {
            if !accepted.iter().any(|h| overlaps(&(h.start..h.end), &range)) {
                accepted.push(Highlight {
                    text: text[range.clone()].to_string(),
                    start: range.start,
                    end: range.end,
                    class: phrase.class,
                });
            }
            // Resume one character past the match start so overlapping
            // occurrences of the same phrase are still considered.
            from = range.start + text[range.start..].chars().next().map_or(1, char::len_utf8);
        }
    }

    accepted.sort_by_key(|h| h.start);
    accepted
}

fn overlaps(a: &Range<usize>, b: &Range<usize>) -> bool {
    a.start < b.end && b.start < a.end
}
