//! Themelens CLI
//!
//! Offline tooling over JSON files:
//! - Highlighting a theme's phrases inside one response
//! - Keyword-overlap consolidation of keyword themes
//! - Deduplicating span evidence across a batch's themes
//! - Replaying a full consolidation run from recorded capability replies

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use themelens_core::{
    consolidate_keywords, deduplicate_keywords, deduplicate_spans, resolve_highlights,
    Capabilities, ConsolidationConfig, ConsolidationPipeline, KeywordTheme, Phrase,
    ResponseRecord, ScriptedProvider, ScriptedReplies, Theme, ThemeRecord,
};
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser)]
#[command(name = "themelens")]
#[command(
    author,
    version,
    about = "Themelens: evidence-backed theme consolidation"
)]
struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Highlight phrases inside a response, earlier phrases winning overlaps
    Highlight {
        /// Response text
        #[arg(long)]
        text: String,
        /// JSON array of `{"text", "class"}` phrases in priority order
        #[arg(long)]
        phrases: PathBuf,
        /// Print highlights as JSON instead of colored text
        #[arg(long)]
        json: bool,
    },

    /// Merge keyword themes by keyword overlap, then give each keyword one theme
    Keywords {
        /// JSON array of keyword themes
        #[arg(short, long)]
        input: PathBuf,
        /// Overlap percentage that must be exceeded to merge
        #[arg(long)]
        threshold: Option<f64>,
        /// Output JSON (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Keep each span with the first theme that claims it
    Dedupe {
        /// JSON array of batch themes
        #[arg(short, long)]
        input: PathBuf,
        /// Output JSON (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Run the full pipeline against recorded capability replies
    Run {
        /// The question the responses answer
        #[arg(short, long)]
        question: String,
        /// JSON array of `{"id", "text"}` responses
        #[arg(long)]
        responses: PathBuf,
        /// JSON array of persisted theme records
        #[arg(long)]
        existing: Option<PathBuf>,
        /// JSON object of per-capability reply queues
        #[arg(long)]
        replies: PathBuf,
        /// JSON consolidation config (missing fields use defaults)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Output JSON (default: stdout)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Highlight {
            text,
            phrases,
            json,
        } => cmd_highlight(&text, &phrases, json),
        Commands::Keywords {
            input,
            threshold,
            out,
        } => cmd_keywords(&input, threshold, out.as_deref()),
        Commands::Dedupe { input, out } => cmd_dedupe(&input, out.as_deref()),
        Commands::Run {
            question,
            responses,
            existing,
            replies,
            config,
            out,
        } => cmd_run(
            &question,
            &responses,
            existing.as_deref(),
            &replies,
            config.as_deref(),
            out.as_deref(),
        ),
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    // Already installed when embedded; nothing to do then.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: Serialize>(out: Option<&Path>, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, json)?;
            eprintln!("{} {}", "wrote".green().bold(), path.display().to_string().bold());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn cmd_highlight(text: &str, phrases_path: &Path, json: bool) -> Result<()> {
    let phrases: Vec<Phrase> = read_json(phrases_path)?;
    let highlights = resolve_highlights(text, &phrases);

    if json {
        return write_json(None, &highlights);
    }

    println!("{}", render::paint(text, &highlights));
    if highlights.is_empty() {
        eprintln!("{} no phrase occurs in the text", "info:".yellow().bold());
    } else {
        eprintln!(
            "{} {} highlights  {}",
            "ok".green().bold(),
            highlights.len(),
            render::legend(&highlights)
        );
    }
    Ok(())
}

fn cmd_keywords(input: &Path, threshold: Option<f64>, out: Option<&Path>) -> Result<()> {
    let threshold =
        threshold.unwrap_or_else(|| ConsolidationConfig::default().keyword_overlap_threshold);
    if !(0.0..=100.0).contains(&threshold) {
        return Err(anyhow!("threshold must be within 0..=100, got {threshold}"));
    }

    let themes: Vec<KeywordTheme> = read_json(input)?;
    let before = themes.len();
    let consolidated = consolidate_keywords(themes, threshold);
    let merges = consolidated.merges;
    let themes = deduplicate_keywords(consolidated.themes);

    eprintln!(
        "{} {} themes -> {} ({} merges above {}%)",
        "ok".green().bold(),
        before,
        themes.len(),
        merges,
        threshold
    );
    write_json(out, &themes)
}

fn cmd_dedupe(input: &Path, out: Option<&Path>) -> Result<()> {
    let themes: Vec<Theme> = read_json(input)?;
    let spans_before: usize = themes.iter().map(|t| t.spans.len()).sum();
    let themes_before = themes.len();

    let themes = deduplicate_spans(themes);
    let spans_after: usize = themes.iter().map(|t| t.spans.len()).sum();

    for theme in &themes {
        eprintln!("  {}", render::theme_line(theme));
    }
    eprintln!(
        "{} {} spans -> {}, {} themes -> {}",
        "ok".green().bold(),
        spans_before,
        spans_after,
        themes_before,
        themes.len()
    );
    write_json(out, &themes)
}

fn cmd_run(
    question: &str,
    responses_path: &Path,
    existing_path: Option<&Path>,
    replies_path: &Path,
    config_path: Option<&Path>,
    out: Option<&Path>,
) -> Result<()> {
    let responses: Vec<ResponseRecord> = read_json(responses_path)?;
    let existing: Vec<ThemeRecord> = match existing_path {
        Some(path) => read_json(path)?,
        None => Vec::new(),
    };
    let replies: ScriptedReplies = read_json(replies_path)?;
    let config: ConsolidationConfig = match config_path {
        Some(path) => read_json(path)?,
        None => ConsolidationConfig::default(),
    };

    let provider = Arc::new(ScriptedProvider::new(replies));
    let mut pipeline = ConsolidationPipeline::new(Capabilities::from_provider(provider), config)?;
    pipeline.on_progress(|message| eprintln!("  {} {}", "→".cyan(), message));

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| anyhow!("failed to initialize tokio runtime: {e}"))?;
    let outcome = rt.block_on(pipeline.run(question, &responses, &existing))?;

    eprintln!("{} run {}", "ok".green().bold(), outcome.run_id);
    for theme in &outcome.themes {
        eprintln!("  {}", render::theme_line(theme));
    }
    for updated in &outcome.merge.updated_themes {
        eprintln!(
            "  {} {} {}",
            "updated".yellow().bold(),
            updated.id,
            render::record_line(&updated.theme)
        );
    }
    for created in &outcome.merge.new_themes {
        eprintln!("  {} {}", "new".green().bold(), render::record_line(created));
    }

    write_json(out, &outcome)
}
