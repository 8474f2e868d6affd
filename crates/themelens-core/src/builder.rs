//! Join themes back onto their source responses.

use crate::{ResponseRecord, Theme, ThemeResponse};
use std::collections::HashMap;

/// For each theme, one [`ThemeResponse`] per distinct response id among its
/// spans. Ids missing from `responses` are skipped.
pub fn attach_responses(themes: Vec<Theme>, responses: &[ResponseRecord]) -> Vec<Theme> {
    let lookup: HashMap<&str, &ResponseRecord> =
        responses.iter().map(|r| (r.id.as_str(), r)).collect();

    themes
        .into_iter()
        .map(|mut theme| {
            theme.responses = theme
                .response_ids
                .iter()
                .filter_map(|rid| {
                    let Some(response) = lookup.get(rid.as_str()) else {
                        tracing::debug!(theme = %theme.name, response_id = %rid, "response not found");
                        return None;
                    };
                    Some(ThemeResponse {
                        id: response.id.clone(),
                        text: response.text.clone(),
                        spans: theme
                            .spans
                            .iter()
                            .filter(|s| &s.source_response_id == rid)
                            .cloned()
                            .collect(),
                    })
                })
                .collect();
            theme
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ExtractionClass, Span};

    fn span(rid: &str, start: usize, end: usize) -> Span {
        Span {
            text: "x".repeat(end - start),
            class: ExtractionClass::Insight,
            start,
            end,
            source_response_id: rid.to_string(),
        }
    }

    #[test]
    fn test_groups_spans_by_response() {
        let theme = Theme::from_spans("T", "d", vec![span("r2", 0, 3), span("r1", 1, 2), span("r2", 5, 9)]);
        let responses = vec![
            ResponseRecord::new("r1", "abcdefghij"),
            ResponseRecord::new("r2", "0123456789"),
        ];

        let built = attach_responses(vec![theme], &responses);
        let entries = &built[0].responses;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].id, "r2");
        assert_eq!(entries[0].spans.len(), 2);
        assert_eq!(entries[0].text, "0123456789");
        assert_eq!(entries[1].id, "r1");
    }

    #[test]
    fn test_unknown_response_is_skipped() {
        let theme = Theme::from_spans("T", "d", vec![span("ghost", 0, 1), span("r1", 0, 1)]);
        let built = attach_responses(vec![theme], &[ResponseRecord::new("r1", "abc")]);

        assert_eq!(built[0].responses.len(), 1);
        assert_eq!(built[0].response_ids, vec!["ghost", "r1"]);
    }
}
