//! Keyword-overlap consolidation: the simpler path for themes that carry
//! keyword lists instead of grounded spans.
//!
//! Overlap is `|A ∩ B| / min(|A|, |B|) × 100` over case-insensitive keyword
//! sets. Consolidation merges the first pair (in scan order) whose overlap
//! exceeds the threshold, then rescans from the start, until a full scan finds
//! nothing. Every merge shortens the list, so the loop terminates.

use crate::{normalized_key, ResponseId, ThemeId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordTheme {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ThemeId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub keywords: Vec<String>,
    #[serde(default)]
    pub response_ids: Vec<ResponseId>,
    /// Already stored; its description is no longer rewritten by merges.
    #[serde(default)]
    pub persisted: bool,
}

impl KeywordTheme {
    pub fn new(name: impl Into<String>, keywords: &[&str]) -> Self {
        Self {
            id: None,
            name: name.into(),
            description: String::new(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            response_ids: Vec::new(),
            persisted: false,
        }
    }

    fn keyword_set(&self) -> HashSet<String> {
        self.keywords
            .iter()
            .map(|k| normalized_key(k))
            .filter(|k| !k.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordConsolidation {
    pub themes: Vec<KeywordTheme>,
    pub merges: usize,
}

/// Percentage of the smaller keyword set shared with the other; 0 if either is empty.
pub fn keyword_overlap(a: &KeywordTheme, b: &KeywordTheme) -> f64 {
    set_overlap(&a.keyword_set(), &b.keyword_set())
}

fn set_overlap(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let smaller = a.len().min(b.len());
    if smaller == 0 {
        return 0.0;
    }
    let shared = a.intersection(b).count();
    shared as f64 / smaller as f64 * 100.0
}

/// Merge overlapping themes until a full pass finds no pair above `threshold`.
pub fn consolidate_keywords(mut themes: Vec<KeywordTheme>, threshold: f64) -> KeywordConsolidation {
    let mut merges = 0;

    'scan: loop {
        let sets: Vec<HashSet<String>> = themes.iter().map(KeywordTheme::keyword_set).collect();
        for i in 0..themes.len() {
            for j in (i + 1)..themes.len() {
                let overlap = set_overlap(&sets[i], &sets[j]);
                if overlap > threshold {
                    let absorbed = themes.remove(j);
                    tracing::debug!(
                        into = %themes[i].name,
                        absorbed = %absorbed.name,
                        overlap,
                        "merging keyword themes"
                    );
                    absorb(&mut themes[i], absorbed);
                    merges += 1;
                    continue 'scan;
                }
            }
        }
        break;
    }

    KeywordConsolidation { themes, merges }
}

fn absorb(into: &mut KeywordTheme, other: KeywordTheme) {
    let mut seen: HashSet<String> = into.keywords.iter().map(|k| normalized_key(k)).collect();
    for keyword in other.keywords {
        if seen.insert(normalized_key(&keyword)) {
            into.keywords.push(keyword);
        }
    }

    for rid in other.response_ids {
        if !into.response_ids.contains(&rid) {
            into.response_ids.push(rid);
        }
    }

    if !into.persisted && !other.persisted {
        into.description = match (into.description.trim(), other.description.trim()) {
            (a, "") => a.to_string(),
            ("", b) => b.to_string(),
            (a, b) => format!("{a} {b}"),
        };
    }
    if into.id.is_none() {
        into.id = other.id;
    }
    into.persisted |= other.persisted;
}

/// Each keyword stays only with the first theme listing it; themes left with
/// no keywords are dropped.
pub fn deduplicate_keywords(themes: Vec<KeywordTheme>) -> Vec<KeywordTheme> {
    let mut claimed = HashSet::new();
    themes
        .into_iter()
        .filter_map(|mut theme| {
            theme.keywords.retain(|keyword| {
                let key = normalized_key(keyword);
                !key.is_empty() && claimed.insert(key)
            });
            if theme.keywords.is_empty() {
                tracing::debug!(theme = %theme.name, "dropping theme without unique keywords");
                None
            } else {
                Some(theme)
            }
        })
        .collect()
}
