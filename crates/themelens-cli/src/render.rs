//! Terminal rendering of highlights and theme summaries.

use colored::{ColoredString, Colorize};
use std::collections::BTreeSet;
use themelens_core::{ExtractionClass, Highlight, Theme, ThemeRecord};

/// Plain and highlighted runs of `text`, in order.
///
/// Expects highlights sorted by start and non-overlapping, which is what
/// `resolve_highlights` returns; anything else is skipped.
pub fn segments<'a>(
    text: &'a str,
    highlights: &[Highlight],
) -> Vec<(&'a str, Option<ExtractionClass>)> {
    let mut out = Vec::new();
    let mut cursor = 0;

    for h in highlights {
        if h.start < cursor {
            continue;
        }
        let (Some(gap), Some(marked)) = (text.get(cursor..h.start), text.get(h.start..h.end)) else {
            continue;
        };
        if !gap.is_empty() {
            out.push((gap, None));
        }
        out.push((marked, Some(h.class)));
        cursor = h.end;
    }

    if let Some(rest) = text.get(cursor..) {
        if !rest.is_empty() {
            out.push((rest, None));
        }
    }
    out
}

fn class_color(class: ExtractionClass, s: &str) -> ColoredString {
    let colored = match class {
        ExtractionClass::UserGoal => s.green(),
        ExtractionClass::PainPoint => s.red(),
        ExtractionClass::Emotion => s.magenta(),
        ExtractionClass::Request => s.cyan(),
        ExtractionClass::Insight => s.blue(),
        ExtractionClass::Suggestion => s.yellow(),
        ExtractionClass::Concern => s.bright_red(),
    };
    colored.bold().underline()
}

pub fn paint(text: &str, highlights: &[Highlight]) -> String {
    segments(text, highlights)
        .into_iter()
        .map(|(run, class)| match class {
            Some(class) => class_color(class, run).to_string(),
            None => run.to_string(),
        })
        .collect()
}

/// One colored entry per class present, in class order.
pub fn legend(highlights: &[Highlight]) -> String {
    let classes: BTreeSet<ExtractionClass> = highlights.iter().map(|h| h.class).collect();
    classes
        .into_iter()
        .map(|class| class_color(class, class.as_str()).to_string())
        .collect::<Vec<_>>()
        .join("  ")
}

pub fn theme_line(theme: &Theme) -> String {
    format!(
        "{} {} ({} phrases, {} responses)",
        "•".cyan(),
        theme.name.bold(),
        theme.spans.len(),
        theme.response_ids.len()
    )
}

pub fn record_line(record: &ThemeRecord) -> String {
    let phrases: Vec<&str> = record.phrases.iter().take(3).map(|p| p.text.as_str()).collect();
    let more = record.phrases.len().saturating_sub(phrases.len());
    let mut line = format!(
        "{} ({} responses): {}",
        record.name.bold(),
        record.response_count,
        phrases.join(", ")
    );
    if more > 0 {
        line.push_str(&format!(" +{more} more"));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use themelens_core::{resolve_highlights, Phrase};

    fn joined(text: &str, highlights: &[Highlight]) -> String {
        segments(text, highlights).into_iter().map(|(run, _)| run).collect()
    }

    #[test]
    fn test_segments_mark_highlighted_runs() {
        let text = "I need support with this issue";
        let highlights = resolve_highlights(
            text,
            &[
                Phrase::new("support", ExtractionClass::Request),
                Phrase::new("issue", ExtractionClass::PainPoint),
            ],
        );

        let runs = segments(text, &highlights);
        assert_eq!(
            runs,
            vec![
                ("I need ", None),
                ("support", Some(ExtractionClass::Request)),
                (" with this ", None),
                ("issue", Some(ExtractionClass::PainPoint)),
            ]
        );
    }

    #[test]
    fn test_segments_skip_overlapping_input() {
        let text = "abcdef";
        let highlights = vec![
            Highlight {
                text: "abc".into(),
                start: 0,
                end: 3,
                class: ExtractionClass::Insight,
            },
            Highlight {
                text: "bcd".into(),
                start: 1,
                end: 4,
                class: ExtractionClass::Insight,
            },
        ];
        assert_eq!(joined(text, &highlights), text);
    }

    proptest! {
        #[test]
        fn segments_cover_text(text in "[ab é]{0,30}", needle in "[ab é]{1,3}") {
            let highlights = resolve_highlights(&text, &[Phrase::new(needle, ExtractionClass::Emotion)]);
            prop_assert_eq!(joined(&text, &highlights), text);
        }
    }
}
