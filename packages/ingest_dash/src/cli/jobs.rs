//! `ingest analyze` and `ingest monitor`.

use std::io::IsTerminal;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use job_feed::protocol::TargetSystem;
use job_feed::{JobPhase, JobSubscription, JobTracker, Scope};
use serde::Deserialize;

use super::Context;
use super::render::{progress_line, recommendation_report, summary_text};
use crate::api::{IncrementalMode, PreviewData, Schedule, SourceConfig, SourceType};
use crate::wizard::{PipelineDraft, Wizard, follow_job};

/// Wizard input read from disk.
#[derive(Debug, Deserialize)]
pub struct DraftFile {
    #[serde(rename = "sourceType")]
    pub source_type: SourceType,
    pub source: SourceConfig,
    /// Sampled rows; fetched from `/api/preview` when absent.
    #[serde(default)]
    pub preview: Option<PreviewData>,
    #[serde(default)]
    pub schedule: Option<Schedule>,
}

impl DraftFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read draft file: {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse draft file: {}", path.display()))
    }
}

pub struct AnalyzeOptions {
    /// Also create the pipeline once the analysis is done.
    pub create: bool,
    pub cron: Option<String>,
    pub incremental: Option<IncrementalMode>,
    pub incremental_column: Option<String>,
    pub target: Option<TargetSystem>,
}

/// Progress output that rewrites one line on a terminal and prints only
/// phase changes otherwise.
struct ProgressPrinter {
    interactive: bool,
    last_phase: Option<JobPhase>,
    printed: usize,
}

impl ProgressPrinter {
    fn new() -> Self {
        Self {
            interactive: std::io::stderr().is_terminal(),
            last_phase: None,
            printed: 0,
        }
    }

    fn update(&mut self, state: &JobSubscription, show_logs: bool) {
        if show_logs {
            for line in state.log_lines().skip(self.printed) {
                if self.interactive {
                    eprint!("\r\x1b[K");
                }
                eprintln!("  | {line}");
            }
            self.printed = state.log_lines().count();
        }

        if self.interactive {
            eprint!("\r\x1b[K{}", progress_line(state));
            if state.is_terminal() {
                eprintln!();
            }
        } else if self.last_phase != Some(state.phase()) {
            eprintln!("{}", progress_line(state));
        }
        self.last_phase = Some(state.phase());
    }
}

pub async fn analyze_command(ctx: &Context, draft_path: &Path, opts: AnalyzeOptions) -> Result<()> {
    let draft = DraftFile::load(draft_path)?;
    let transport = ctx.open_feed().await;
    let wizard = Wizard::new(ctx.api_client()?, transport.clone(), ctx.feed.tracker.clone());

    let preview = match draft.preview {
        Some(preview) => preview,
        None => {
            eprintln!("[ingest: sampling source]");
            wizard.preview(draft.source_type, &draft.source).await?
        }
    };

    let mut printer = ProgressPrinter::new();
    let result = wizard
        .analyze(&preview, |state| printer.update(state, false))
        .await;
    let analysis = match result {
        Ok(analysis) => analysis,
        Err(e) => {
            transport.close().await;
            return Err(e.into());
        }
    };

    println!("{}", recommendation_report(&analysis.result));

    if opts.create {
        let mut schedule = draft.schedule.unwrap_or(Schedule {
            cron: String::new(),
            incremental_mode: IncrementalMode::None,
            incremental_column: None,
        });
        if let Some(cron) = opts.cron {
            schedule.cron = cron;
        }
        if let Some(mode) = opts.incremental {
            schedule.incremental_mode = mode;
        }
        if opts.incremental_column.is_some() {
            schedule.incremental_column = opts.incremental_column;
        }

        let pipeline_draft = PipelineDraft {
            source_type: draft.source_type,
            source: draft.source,
            preview: Some(preview),
            schedule,
        };
        let id = wizard
            .create_pipeline(pipeline_draft, &analysis.result, opts.target)
            .await;
        transport.close().await;
        println!("Pipeline created: {}", id?);
    } else {
        transport.close().await;
    }
    Ok(())
}

/// Follow an already-running job until it finishes.
pub async fn monitor_command(ctx: &Context, scope: Scope, job_id: &str, show_logs: bool) -> Result<()> {
    let transport = ctx.open_feed().await;
    let tracker = JobTracker::start(&transport, scope, job_id, ctx.feed.tracker.clone());

    let mut printer = ProgressPrinter::new();
    let finished = tokio::select! {
        state = follow_job(&tracker, |state| printer.update(state, show_logs)) => Some(state),
        _ = tokio::signal::ctrl_c() => None,
    };
    drop(tracker);
    transport.close().await;

    let Some(finished) = finished else {
        eprintln!();
        return Ok(());
    };
    match finished.phase() {
        JobPhase::Error => bail!(
            "{} {} failed: {}",
            scope,
            job_id,
            finished.error_reason().unwrap_or("unknown error")
        ),
        _ => {
            if let Some(summary) = finished.run_summary() {
                println!("{}", summary_text(summary));
            }
            if let Some(result) = finished.analysis() {
                println!("{}", recommendation_report(result));
            }
            Ok(())
        }
    }
}
