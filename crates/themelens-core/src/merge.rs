//! Intra-batch merge: combine themes from one batch that the grouper judges equivalent
//!
//! Groups are 1-based index lists; the first valid index of a group is the
//! primary and keeps its name and description. Groups are applied in the order
//! returned, each one reading from the input list. An index that shows up in
//! two groups therefore contributes its original evidence to both merged
//! themes; [`crate::dedup`] later settles who keeps each span.

use crate::error::{Capability, CapabilityError};
use crate::parse;
use crate::{MergeGrouper, Theme, ThemeListing};
use std::collections::HashSet;

/// Ask the grouper for merge groups and apply them. Any failure, or an empty
/// group list, returns `themes` unchanged.
pub async fn merge_within_batch(themes: Vec<Theme>, grouper: &dyn MergeGrouper) -> Vec<Theme> {
    if themes.len() < 2 {
        return themes;
    }

    let listings: Vec<ThemeListing> = themes
        .iter()
        .enumerate()
        .map(|(i, theme)| ThemeListing {
            index: i + 1,
            name: theme.name.clone(),
            description: theme.description.clone(),
        })
        .collect();

    let groups = match request_groups(grouper, &listings).await {
        Ok(groups) => groups,
        Err(err) => {
            tracing::warn!(error = %err, "merge grouping failed, keeping themes as-is");
            return themes;
        }
    };
    if groups.is_empty() {
        return themes;
    }

    apply_merge_groups(themes, &groups)
}

async fn request_groups(
    grouper: &dyn MergeGrouper,
    listings: &[ThemeListing],
) -> Result<Vec<Vec<i64>>, CapabilityError> {
    let reply = grouper
        .group(listings)
        .await
        .map_err(|err| CapabilityError::call(Capability::MergeGrouper, err))?;
    parse::parse_array(Capability::MergeGrouper, &reply)
}

/// Keep groups with at least two distinct in-range indices, as 0-based indices.
pub fn validate_groups(groups: &[Vec<i64>], theme_count: usize) -> Vec<Vec<usize>> {
    groups
        .iter()
        .filter(|group| group.len() >= 2)
        .filter_map(|group| {
            let mut seen = HashSet::new();
            let valid: Vec<usize> = group
                .iter()
                .filter_map(|&index| usize::try_from(index).ok())
                .filter(|index| (1..=theme_count).contains(index))
                .map(|index| index - 1)
                .filter(|index| seen.insert(*index))
                .collect();
            if valid.len() < 2 {
                tracing::debug!(?group, "ignoring merge group with fewer than two valid indices");
                return None;
            }
            Some(valid)
        })
        .collect()
}

/// Merged themes come first, in group order, followed by every theme no
/// valid group referenced, in input order.
pub fn apply_merge_groups(themes: Vec<Theme>, groups: &[Vec<i64>]) -> Vec<Theme> {
    let valid = validate_groups(groups, themes.len());
    if valid.is_empty() {
        return themes;
    }

    let mut referenced = HashSet::new();
    let mut merged = Vec::with_capacity(valid.len());

    for group in &valid {
        let mut primary = themes[group[0]].clone();
        for &secondary in &group[1..] {
            absorb(&mut primary, &themes[secondary]);
        }
        tracing::debug!(
            primary = %primary.name,
            members = group.len(),
            "merged equivalent themes"
        );
        referenced.extend(group.iter().copied());
        merged.push(primary);
    }

    merged.extend(
        themes
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !referenced.contains(i))
            .map(|(_, theme)| theme),
    );
    merged
}

/// Fold `secondary`'s evidence into `primary`.
fn absorb(primary: &mut Theme, secondary: &Theme) {
    primary.spans.extend(secondary.spans.iter().cloned());

    for rid in &secondary.response_ids {
        if !primary.response_ids.contains(rid) {
            primary.response_ids.push(rid.clone());
        }
    }

    for entry in &secondary.responses {
        match primary.responses.iter_mut().find(|e| e.id == entry.id) {
            Some(existing) => {
                for span in &entry.spans {
                    let present = existing
                        .spans
                        .iter()
                        .any(|s| s.start == span.start && s.end == span.end);
                    if !present {
                        existing.spans.push(span.clone());
                    }
                }
            }
            None => primary.responses.push(entry.clone()),
        }
    }
}
