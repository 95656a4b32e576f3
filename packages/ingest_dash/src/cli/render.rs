//! Plain-text rendering of feed events and job state for the terminal.

use std::fmt::Write;

use job_feed::protocol::{AnalysisResult, DoneEvent, RunSummary};
use job_feed::{JobPhase, JobSubscription, ServerEvent};

/// One status line for a job, e.g. `analyze job-1 progress  40% [transform] reading rows`.
pub fn progress_line(state: &JobSubscription) -> String {
    let mut line = format!("{} {} {}", state.scope(), state.job_id(), state.phase());
    if let Some(percent) = state.progress_percent() {
        let _ = write!(line, " {percent:>3.0}%");
    }
    if let Some(stage) = state.stage() {
        let _ = write!(line, " [{stage}]");
    }
    if let Some(message) = state.message() {
        let _ = write!(line, " {message}");
    }
    if state.is_cancelled() {
        line.push_str(" (cancelled)");
    }
    if state.phase() == JobPhase::Error {
        let _ = write!(line, ": {}", state.error_reason().unwrap_or("unknown error"));
    }
    line
}

pub fn event_line(event: &ServerEvent) -> String {
    let kind = event.kind();
    match event {
        ServerEvent::Connected => kind.to_string(),
        ServerEvent::Queued(job) | ServerEvent::Started(job) | ServerEvent::Cancelled(job) => {
            format!("{kind} {}{}", scope_prefix(job.scope), job.id)
        }
        ServerEvent::Progress(p) => {
            let mut line = format!("{kind} {}{}", scope_prefix(p.scope), p.id);
            if let Some(percent) = p.percent {
                let _ = write!(line, " {percent:.0}%");
            }
            if let Some(stage) = p.stage {
                let _ = write!(line, " [{stage}]");
            }
            if let Some(message) = &p.message {
                let _ = write!(line, " {message}");
            }
            line
        }
        ServerEvent::Log(l) => format!("{kind} {}{}: {}", scope_prefix(l.scope), l.id, l.line),
        ServerEvent::Error(e) => format!("{kind} {}{}: {}", scope_prefix(e.scope), e.id, e.reason),
        ServerEvent::Done(done) => {
            let detail = match done {
                DoneEvent::Analyze {
                    payload: Some(result),
                    ..
                } => format!(
                    " -> {} ({}%)",
                    result.recommendation.target,
                    result.recommendation.confidence_percent()
                ),
                DoneEvent::Pipeline {
                    payload: Some(summary),
                    ..
                } => format!(" -> {}", summary_text(summary)),
                _ => String::new(),
            };
            format!("{kind} {}/{}{detail}", done.scope(), done.id())
        }
        ServerEvent::Paused(p) | ServerEvent::Resumed(p) => format!("{kind} {}", p.pipeline_id),
    }
}

fn scope_prefix(scope: Option<job_feed::Scope>) -> String {
    scope.map(|s| format!("{s}/")).unwrap_or_default()
}

pub fn summary_text(summary: &RunSummary) -> String {
    format!(
        "run {}: {} rows in, {} rows out, {:.1}s",
        summary.run_id,
        summary.rows_in,
        summary.rows_out,
        summary.duration_ms / 1000.0
    )
}

/// Multi-line recommendation report with the DDL for the picked target.
pub fn recommendation_report(result: &AnalysisResult) -> String {
    let rec = &result.recommendation;
    let mut out = format!(
        "Recommended target: {} (confidence {}%)\n",
        rec.target,
        rec.confidence_percent()
    );
    let _ = writeln!(out, "Rationale: {}", rec.rationale);
    if let Some(hint) = &rec.schedule_hint {
        let _ = writeln!(out, "Schedule hint: {hint}");
    }
    let ddl = result.ddl.for_target(rec.target);
    if !ddl.is_empty() {
        let _ = writeln!(out, "\n{ddl}");
    }
    out
}
