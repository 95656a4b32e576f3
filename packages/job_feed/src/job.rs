//! Job Subscription State Machine
//!
//! Turns the correlated slice of the event stream into one progress
//! narrative per job.
//!
//! ```text
//! Idle → Queued → Started → Progress ⟲ → Done
//!   └───────┴────────┴──────────┴──────→ Error
//! ```
//!
//! Phases only move forward. `Done` and `Error` are terminal and absorb
//! each other: whichever arrives first wins. `cancelled` is a side flag that
//! never changes the phase.

use std::collections::VecDeque;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::bus::{Subscription, handler};
use crate::protocol::{
    AnalysisResult, ClientCommand, DoneEvent, EventKind, ProgressEvent, RunSummary, Scope,
    ServerEvent, Stage,
};
use crate::transport::Transport;

/// Log lines kept per job unless configured otherwise.
pub const DEFAULT_MAX_LOG_LINES: usize = 500;

/// Event kinds a job subscription consumes.
const JOB_EVENT_KINDS: [EventKind; 7] = [
    EventKind::Queued,
    EventKind::Started,
    EventKind::Progress,
    EventKind::Log,
    EventKind::Done,
    EventKind::Error,
    EventKind::Cancelled,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPhase {
    Idle,
    Queued,
    Started,
    Progress,
    Done,
    Error,
}

impl JobPhase {
    fn rank(self) -> u8 {
        match self {
            JobPhase::Idle => 0,
            JobPhase::Queued => 1,
            JobPhase::Started => 2,
            JobPhase::Progress => 3,
            JobPhase::Done | JobPhase::Error => 4,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobPhase::Done | JobPhase::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobPhase::Idle => "idle",
            JobPhase::Queued => "queued",
            JobPhase::Started => "started",
            JobPhase::Progress => "progress",
            JobPhase::Done => "done",
            JobPhase::Error => "error",
        }
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result carried by a `done` event, narrowed by scope.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobOutcome {
    Analysis(AnalysisResult),
    Run(RunSummary),
}

/// State of one outstanding unit of server-side work.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobSubscription {
    scope: Scope,
    job_id: String,
    phase: JobPhase,
    progress_percent: Option<f64>,
    stage: Option<Stage>,
    message: Option<String>,
    outcome: Option<JobOutcome>,
    error_reason: Option<String>,
    cancelled: bool,
    log: VecDeque<String>,
    #[serde(skip)]
    max_log_lines: usize,
}

impl JobSubscription {
    pub fn new(scope: Scope, job_id: impl Into<String>) -> Self {
        Self {
            scope,
            job_id: job_id.into(),
            phase: JobPhase::Idle,
            progress_percent: None,
            stage: None,
            message: None,
            outcome: None,
            error_reason: None,
            cancelled: false,
            log: VecDeque::new(),
            max_log_lines: DEFAULT_MAX_LOG_LINES,
        }
    }

    pub fn with_max_log_lines(mut self, max: usize) -> Self {
        self.max_log_lines = max;
        self
    }

    /// Apply one event. Returns true if the state changed; events for other
    /// jobs, other scopes, or arriving after a terminal phase return false
    /// and leave the state untouched.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        if !event.concerns(&self.job_id, self.scope) {
            return false;
        }
        match event {
            ServerEvent::Queued(_) => self.advance(JobPhase::Queued),
            ServerEvent::Started(_) => self.advance(JobPhase::Started),
            ServerEvent::Progress(progress) => self.apply_progress(progress),
            ServerEvent::Log(log) => self.push_log(&log.line),
            ServerEvent::Done(done) => self.finish(done),
            ServerEvent::Error(error) => self.fail(&error.reason),
            ServerEvent::Cancelled(_) => !std::mem::replace(&mut self.cancelled, true),
            ServerEvent::Connected | ServerEvent::Paused(_) | ServerEvent::Resumed(_) => false,
        }
    }

    fn advance(&mut self, next: JobPhase) -> bool {
        if self.phase.rank() >= next.rank() {
            return false;
        }
        self.phase = next;
        self.message = None;
        true
    }

    fn apply_progress(&mut self, progress: &ProgressEvent) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        let before = (
            self.phase,
            self.progress_percent,
            self.stage,
            self.message.clone(),
        );

        self.phase = JobPhase::Progress;
        if let Some(percent) = progress.percent.filter(|p| p.is_finite()) {
            self.progress_percent = Some(percent.clamp(0.0, 100.0));
        }
        if progress.stage.is_some() {
            self.stage = progress.stage;
        }
        if progress.message.is_some() {
            self.message = progress.message.clone();
        }

        before
            != (
                self.phase,
                self.progress_percent,
                self.stage,
                self.message.clone(),
            )
    }

    fn finish(&mut self, done: &DoneEvent) -> bool {
        if self.phase.is_terminal() {
            debug!(job_id = %self.job_id, phase = %self.phase, "late done ignored");
            return false;
        }
        self.phase = JobPhase::Done;
        match done {
            DoneEvent::Analyze {
                payload: Some(result),
                ..
            } => self.outcome = Some(JobOutcome::Analysis(result.clone())),
            DoneEvent::Pipeline {
                payload: Some(summary),
                ..
            } => self.outcome = Some(JobOutcome::Run(summary.clone())),
            // No payload: keep whatever we had.
            _ => {}
        }
        true
    }

    fn fail(&mut self, reason: &str) -> bool {
        if self.phase.is_terminal() {
            debug!(job_id = %self.job_id, phase = %self.phase, "late error ignored");
            return false;
        }
        self.phase = JobPhase::Error;
        self.error_reason = Some(reason.to_string());
        true
    }

    /// Log lines do not alter the lifecycle, so they are kept even after a
    /// terminal phase (servers flush trailing output after `done`).
    fn push_log(&mut self, line: &str) -> bool {
        if self.max_log_lines == 0 {
            return false;
        }
        while self.log.len() >= self.max_log_lines {
            self.log.pop_front();
        }
        self.log.push_back(line.to_string());
        true
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn phase(&self) -> JobPhase {
        self.phase
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    pub fn progress_percent(&self) -> Option<f64> {
        self.progress_percent
    }

    pub fn stage(&self) -> Option<Stage> {
        self.stage
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn error_reason(&self) -> Option<&str> {
        self.error_reason.as_deref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn log_lines(&self) -> impl Iterator<Item = &str> {
        self.log.iter().map(String::as_str)
    }

    pub fn outcome(&self) -> Option<&JobOutcome> {
        self.outcome.as_ref()
    }

    pub fn analysis(&self) -> Option<&AnalysisResult> {
        match &self.outcome {
            Some(JobOutcome::Analysis(result)) => Some(result),
            _ => None,
        }
    }

    pub fn run_summary(&self) -> Option<&RunSummary> {
        match &self.outcome {
            Some(JobOutcome::Run(summary)) => Some(summary),
            _ => None,
        }
    }
}

/// Tunables for [`JobTracker`].
#[derive(Clone, Debug)]
pub struct TrackerOptions {
    pub max_log_lines: usize,
    /// Re-send `subscribe` after every `connected` event so the server
    /// resumes pushing this job after a reconnect.
    pub resubscribe_on_connect: bool,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            max_log_lines: DEFAULT_MAX_LOG_LINES,
            resubscribe_on_connect: true,
        }
    }
}

/// Owns one [`JobSubscription`] on its own task.
///
/// Bus listeners forward correlated events into a channel; the task applies
/// them in order and publishes snapshots. Dropping the tracker removes the
/// listeners, which closes the channel and ends the task.
pub struct JobTracker {
    scope: Scope,
    job_id: String,
    snapshots: watch::Receiver<JobSubscription>,
    subscriptions: Vec<Subscription>,
    task: JoinHandle<()>,
}

impl JobTracker {
    /// Start tracking `job_id`, whose id came back from an out-of-band start
    /// call, and send the `subscribe` command. Must be called inside a tokio
    /// runtime.
    pub fn start(
        transport: &Transport,
        scope: Scope,
        job_id: impl Into<String>,
        options: TrackerOptions,
    ) -> Self {
        let job_id = job_id.into();
        let initial = JobSubscription::new(scope, job_id.clone())
            .with_max_log_lines(options.max_log_lines);
        let (snapshot_tx, snapshots) = watch::channel(initial.clone());
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();

        let mut subscriptions = Vec::with_capacity(JOB_EVENT_KINDS.len() + 1);
        for kind in JOB_EVENT_KINDS {
            let tx = events_tx.clone();
            let id = job_id.clone();
            subscriptions.push(transport.on(
                kind,
                handler(move |event| {
                    if event.concerns(&id, scope) {
                        let _ = tx.send(event.clone());
                    }
                }),
            ));
        }
        drop(events_tx);

        if options.resubscribe_on_connect {
            let feed = transport.clone();
            let command = ClientCommand::subscribe(scope, job_id.clone());
            subscriptions.push(transport.on(
                EventKind::Connected,
                handler(move |_| {
                    let sent = feed.send(command.clone());
                    debug!(command = command.name(), sent, "resubscribing after connect");
                }),
            ));
        }

        let task_job_id = job_id.clone();
        let task = tokio::spawn(async move {
            let mut state = initial;
            while let Some(event) = events_rx.recv().await {
                if state.apply(&event) {
                    debug!(job_id = %task_job_id, phase = %state.phase(), kind = %event.kind(), "job updated");
                    snapshot_tx.send_replace(state.clone());
                }
            }
        });

        let sent = transport.send(ClientCommand::subscribe(scope, job_id.clone()));
        info!(scope = %scope, job_id = %job_id, sent, "tracking job");

        Self {
            scope,
            job_id,
            snapshots,
            subscriptions,
            task,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn snapshot(&self) -> JobSubscription {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<JobSubscription> {
        self.snapshots.clone()
    }

    /// Wait for `Done` or `Error`. There is no built-in timeout; wrap in
    /// `tokio::time::timeout` if the caller needs one.
    pub async fn wait_terminal(&self) -> JobSubscription {
        let mut snapshots = self.snapshots.clone();
        let result = snapshots.wait_for(JobSubscription::is_terminal).await;
        match result {
            Ok(state) => state.clone(),
            Err(_) => self.snapshot(),
        }
    }
}

impl Drop for JobTracker {
    fn drop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        // The task exits on its own once the listeners (and their senders)
        // are gone; abort covers an emit still holding a listener snapshot.
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        DdlSet, ErrorEvent, JobRef, LogEvent, PipelineRef, Recommendation, TargetSystem,
    };

    fn job_ref(id: &str, scope: Option<Scope>) -> JobRef {
        JobRef {
            scope,
            id: id.to_string(),
        }
    }

    fn queued(id: &str) -> ServerEvent {
        ServerEvent::Queued(job_ref(id, None))
    }

    fn started(id: &str) -> ServerEvent {
        ServerEvent::Started(job_ref(id, None))
    }

    fn progress(id: &str, percent: Option<f64>, stage: Option<Stage>) -> ServerEvent {
        ServerEvent::Progress(ProgressEvent {
            scope: None,
            id: id.to_string(),
            percent,
            stage,
            message: None,
        })
    }

    fn error(id: &str, reason: &str) -> ServerEvent {
        ServerEvent::Error(ErrorEvent {
            scope: None,
            id: id.to_string(),
            reason: reason.to_string(),
        })
    }

    fn analysis_result() -> AnalysisResult {
        AnalysisResult {
            recommendation: Recommendation {
                target: TargetSystem::Clickhouse,
                confidence: 0.82,
                rationale: "high cardinality numeric columns".into(),
                schedule_hint: None,
            },
            ddl: DdlSet {
                clickhouse: "CREATE TABLE ...".into(),
                postgresql: String::new(),
                hdfs: String::new(),
            },
        }
    }

    fn analyze_done(id: &str, payload: Option<AnalysisResult>) -> ServerEvent {
        ServerEvent::Done(DoneEvent::Analyze {
            id: id.to_string(),
            payload,
        })
    }

    fn analyze_job() -> JobSubscription {
        JobSubscription::new(Scope::Analyze, "job-1")
    }

    #[test]
    fn test_new_subscription_is_idle() {
        let job = analyze_job();
        assert_eq!(job.phase(), JobPhase::Idle);
        assert!(!job.is_terminal());
        assert!(job.outcome().is_none());
    }

    #[test]
    fn test_analyze_happy_path() {
        let mut job = analyze_job();
        assert!(job.apply(&queued("job-1")));
        assert!(job.apply(&started("job-1")));
        assert!(job.apply(&progress("job-1", Some(40.0), Some(Stage::Transform))));
        assert!(job.apply(&analyze_done("job-1", Some(analysis_result()))));

        assert_eq!(job.phase(), JobPhase::Done);
        assert_eq!(job.progress_percent(), Some(40.0));
        assert_eq!(job.stage(), Some(Stage::Transform));
        let result = job.analysis().unwrap();
        assert_eq!(result.recommendation.target, TargetSystem::Clickhouse);
        assert!(job.run_summary().is_none());
    }

    #[test]
    fn test_error_then_done_keeps_error() {
        let mut job = analyze_job();
        job.apply(&queued("job-1"));
        assert!(job.apply(&error("job-1", "source unreachable")));
        assert!(!job.apply(&analyze_done("job-1", None)));

        assert_eq!(job.phase(), JobPhase::Error);
        assert_eq!(job.error_reason(), Some("source unreachable"));
    }

    #[test]
    fn test_done_then_error_keeps_done() {
        let mut job = analyze_job();
        job.apply(&analyze_done("job-1", Some(analysis_result())));
        assert!(!job.apply(&error("job-1", "late failure")));

        assert_eq!(job.phase(), JobPhase::Done);
        assert!(job.error_reason().is_none());
        assert!(job.analysis().is_some());
    }

    #[test]
    fn test_second_error_does_not_overwrite_reason() {
        let mut job = analyze_job();
        job.apply(&error("job-1", "first"));
        assert!(!job.apply(&error("job-1", "second")));
        assert_eq!(job.error_reason(), Some("first"));
    }

    #[test]
    fn test_error_from_idle() {
        let mut job = analyze_job();
        assert!(job.apply(&error("job-1", "rejected")));
        assert_eq!(job.phase(), JobPhase::Error);
    }

    #[test]
    fn test_terminal_ignores_progress() {
        let mut job = analyze_job();
        job.apply(&progress("job-1", Some(10.0), None));
        job.apply(&error("job-1", "boom"));
        let before = job.clone();
        assert!(!job.apply(&progress("job-1", Some(90.0), None)));
        assert!(!job.apply(&queued("job-1")));
        assert_eq!(job, before);
    }

    #[test]
    fn test_phase_never_moves_backward() {
        let mut job = analyze_job();
        job.apply(&started("job-1"));
        assert!(!job.apply(&queued("job-1")));
        assert_eq!(job.phase(), JobPhase::Started);

        job.apply(&progress("job-1", Some(5.0), None));
        assert!(!job.apply(&started("job-1")));
        assert_eq!(job.phase(), JobPhase::Progress);
    }

    #[test]
    fn test_progress_replay_is_idempotent() {
        let mut job = analyze_job();
        let event = progress("job-1", Some(40.0), Some(Stage::Extract));
        assert!(job.apply(&event));
        let once = job.clone();
        assert!(!job.apply(&event));
        assert_eq!(job, once);
    }

    #[test]
    fn test_progress_keeps_fields_absent_from_event() {
        let mut job = analyze_job();
        job.apply(&progress("job-1", Some(40.0), Some(Stage::Load)));
        job.apply(&ServerEvent::Progress(ProgressEvent {
            scope: None,
            id: "job-1".into(),
            percent: None,
            stage: None,
            message: Some("writing".into()),
        }));
        assert_eq!(job.progress_percent(), Some(40.0));
        assert_eq!(job.stage(), Some(Stage::Load));
        assert_eq!(job.message(), Some("writing"));
    }

    #[test]
    fn test_progress_percent_is_clamped() {
        let mut job = analyze_job();
        job.apply(&progress("job-1", Some(140.0), None));
        assert_eq!(job.progress_percent(), Some(100.0));
        job.apply(&progress("job-1", Some(f64::NAN), None));
        assert_eq!(job.progress_percent(), Some(100.0));
    }

    #[test]
    fn test_other_job_id_is_ignored() {
        let mut job = analyze_job();
        job.apply(&queued("job-1"));
        let before = job.clone();
        assert!(!job.apply(&progress("job-2", Some(10.0), None)));
        assert!(!job.apply(&error("job-2", "not ours")));
        assert_eq!(job, before);
    }

    #[test]
    fn test_other_scope_is_ignored() {
        let mut job = analyze_job();
        let before = job.clone();
        assert!(!job.apply(&ServerEvent::Queued(job_ref("job-1", Some(Scope::Pipeline)))));
        assert!(!job.apply(&ServerEvent::Done(DoneEvent::Pipeline {
            id: "job-1".into(),
            payload: None,
        })));
        assert_eq!(job, before);
    }

    #[test]
    fn test_done_without_payload_keeps_previous_outcome() {
        let mut job = analyze_job();
        job.apply(&analyze_done("job-1", None));
        assert_eq!(job.phase(), JobPhase::Done);
        assert!(job.outcome().is_none());
    }

    #[test]
    fn test_pipeline_done_carries_run_summary() {
        let mut job = JobSubscription::new(Scope::Pipeline, "run-9");
        job.apply(&ServerEvent::Done(DoneEvent::Pipeline {
            id: "run-9".into(),
            payload: Some(RunSummary {
                run_id: "run-9".into(),
                rows_in: 10.0,
                rows_out: 9.0,
                duration_ms: 120.0,
            }),
        }));
        let summary = job.run_summary().unwrap();
        assert_eq!(summary.rows_out, 9.0);
        assert!(job.analysis().is_none());
    }

    #[test]
    fn test_fractional_run_summary_frame_finishes_job() {
        let frame = r#"{"type":"done","data":{"scope":"pipeline","id":"run-1","payload":{"runId":"run-1","rowsIn":100,"rowsOut":98,"durationMs":1500.5}}}"#;
        let Ok(crate::protocol::Inbound::Event(event)) = crate::protocol::decode_frame(frame) else {
            panic!("done frame should decode");
        };
        let mut job = JobSubscription::new(Scope::Pipeline, "run-1");
        assert!(job.apply(&event));
        assert_eq!(job.phase(), JobPhase::Done);
        assert_eq!(job.run_summary().unwrap().duration_ms, 1500.5);
    }

    #[test]
    fn test_cancelled_sets_flag_without_phase_change() {
        let mut job = JobSubscription::new(Scope::Pipeline, "run-1");
        job.apply(&started("run-1"));
        assert!(job.apply(&ServerEvent::Cancelled(job_ref("run-1", Some(Scope::Pipeline)))));
        assert!(job.is_cancelled());
        assert_eq!(job.phase(), JobPhase::Started);
        assert!(!job.apply(&ServerEvent::Cancelled(job_ref("run-1", None))));
    }

    #[test]
    fn test_pause_events_never_touch_jobs() {
        let mut job = JobSubscription::new(Scope::Pipeline, "p-1");
        let before = job.clone();
        assert!(!job.apply(&ServerEvent::Paused(PipelineRef {
            pipeline_id: "p-1".into()
        })));
        assert!(!job.apply(&ServerEvent::Connected));
        assert_eq!(job, before);
    }

    #[test]
    fn test_log_lines_are_bounded() {
        let mut job = analyze_job().with_max_log_lines(2);
        for n in 0..3 {
            job.apply(&ServerEvent::Log(LogEvent {
                scope: None,
                id: "job-1".into(),
                line: format!("line {n}"),
            }));
        }
        assert_eq!(job.log_lines().collect::<Vec<_>>(), vec!["line 1", "line 2"]);
    }

    #[test]
    fn test_log_retention_disabled() {
        let mut job = analyze_job().with_max_log_lines(0);
        assert!(!job.apply(&ServerEvent::Log(LogEvent {
            scope: None,
            id: "job-1".into(),
            line: "ignored".into(),
        })));
        assert_eq!(job.log_lines().count(), 0);
    }
}
