//! New-pipeline wizard: sample a source, get a storage recommendation, and
//! create the scheduled pipeline.
//!
//! Every long step is an HTTP start call that returns a job id, followed by a
//! [`JobTracker`] on the feed for that id. Trackers are only created once the
//! id is known.

use job_feed::protocol::{AnalysisResult, TargetSystem};
use job_feed::{JobPhase, JobSubscription, JobTracker, Scope, TrackerOptions, Transport};
use tracing::{debug, info};

use crate::api::{ApiClient, ApiError, NewPipeline, PreviewData, Schedule, SourceConfig, SourceType};

#[derive(Debug, thiserror::Error)]
pub enum WizardError {
    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("job {job_id} failed: {reason}")]
    JobFailed { job_id: String, reason: String },

    #[error("job {job_id} finished without a result")]
    NoResult { job_id: String },

    #[error("no schedule given and the recommendation has no schedule hint")]
    NoSchedule,
}

/// A finished analysis.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub job_id: String,
    pub result: AnalysisResult,
}

/// What the operator picked before asking for a recommendation.
#[derive(Clone, Debug)]
pub struct PipelineDraft {
    pub source_type: SourceType,
    pub source: SourceConfig,
    pub preview: Option<PreviewData>,
    /// An empty cron falls back to the recommendation's schedule hint.
    pub schedule: Schedule,
}

pub struct Wizard {
    api: ApiClient,
    transport: Transport,
    tracker: TrackerOptions,
}

impl Wizard {
    pub fn new(api: ApiClient, transport: Transport, tracker: TrackerOptions) -> Self {
        Self {
            api,
            transport,
            tracker,
        }
    }

    pub async fn preview(
        &self,
        source_type: SourceType,
        source: &SourceConfig,
    ) -> Result<PreviewData, WizardError> {
        Ok(self.api.preview(source_type, source).await?)
    }

    /// Queue an analysis of `preview` and follow it until it finishes.
    /// `on_update` sees every state change, including the final one.
    pub async fn analyze<F>(
        &self,
        preview: &PreviewData,
        on_update: F,
    ) -> Result<Analysis, WizardError>
    where
        F: FnMut(&JobSubscription),
    {
        let job_id = self.api.start_analyze(preview).await?;
        info!(job_id = %job_id, columns = preview.columns.len(), "analysis queued");

        let tracker = JobTracker::start(
            &self.transport,
            Scope::Analyze,
            job_id.clone(),
            self.tracker.clone(),
        );
        let finished = follow_job(&tracker, on_update).await;

        match finished.phase() {
            JobPhase::Error => Err(WizardError::JobFailed {
                job_id,
                reason: finished.error_reason().unwrap_or("unknown").to_string(),
            }),
            _ => match finished.analysis() {
                Some(result) => Ok(Analysis {
                    job_id,
                    result: result.clone(),
                }),
                None => Err(WizardError::NoResult { job_id }),
            },
        }
    }

    /// Create the pipeline from a draft and a finished analysis. Returns
    /// the new pipeline id.
    pub async fn create_pipeline(
        &self,
        draft: PipelineDraft,
        analysis: &AnalysisResult,
        target: Option<TargetSystem>,
    ) -> Result<String, WizardError> {
        let pipeline = build_pipeline(draft, analysis, target)?;
        let id = self.api.create_pipeline(&pipeline).await?;
        info!(pipeline_id = %id, target = ?pipeline.target, "pipeline created");
        Ok(id)
    }
}

/// Assemble the create request. The target defaults to the recommended one.
pub fn build_pipeline(
    draft: PipelineDraft,
    analysis: &AnalysisResult,
    target: Option<TargetSystem>,
) -> Result<NewPipeline, WizardError> {
    let mut schedule = draft.schedule;
    if schedule.cron.trim().is_empty() {
        schedule.cron = analysis
            .recommendation
            .schedule_hint
            .clone()
            .filter(|hint| !hint.trim().is_empty())
            .ok_or(WizardError::NoSchedule)?;
    }

    Ok(NewPipeline {
        source_type: draft.source_type,
        source: draft.source,
        preview: draft.preview,
        target: Some(target.unwrap_or(analysis.recommendation.target)),
        ddl: analysis.ddl.clone(),
        schedule,
    })
}

/// Wait for `tracker` to reach a terminal phase, reporting each snapshot.
pub async fn follow_job<F>(tracker: &JobTracker, mut on_update: F) -> JobSubscription
where
    F: FnMut(&JobSubscription),
{
    let mut snapshots = tracker.watch();
    loop {
        let state = snapshots.borrow_and_update().clone();
        on_update(&state);
        if state.is_terminal() {
            debug!(job_id = tracker.job_id(), phase = %state.phase(), "job finished");
            return state;
        }
        if snapshots.changed().await.is_err() {
            return tracker.snapshot();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::IncrementalMode;
    use crate::config::ApiConfig;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures::{SinkExt, StreamExt};
    use job_feed::protocol::{DdlSet, Recommendation};
    use job_feed::{NoToken, TransportConfig};
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn analysis(hint: Option<&str>) -> AnalysisResult {
        AnalysisResult {
            recommendation: Recommendation {
                target: TargetSystem::Clickhouse,
                confidence: 0.7,
                rationale: "append-only events".into(),
                schedule_hint: hint.map(str::to_owned),
            },
            ddl: DdlSet {
                clickhouse: "CREATE TABLE events ()".into(),
                ..Default::default()
            },
        }
    }

    fn draft(cron: &str) -> PipelineDraft {
        PipelineDraft {
            source_type: SourceType::Csv,
            source: SourceConfig::File {
                file_type: SourceType::Csv,
                path_or_url: "/data/events.csv".into(),
            },
            preview: None,
            schedule: Schedule {
                cron: cron.into(),
                incremental_mode: IncrementalMode::None,
                incremental_column: None,
            },
        }
    }

    fn preview() -> PreviewData {
        serde_json::from_value(json!({"columns": [], "rows": [], "rowCount": 0})).unwrap()
    }

    #[test]
    fn test_build_pipeline_uses_recommended_target() {
        let pipeline = build_pipeline(draft("0 * * * *"), &analysis(None), None).unwrap();
        assert_eq!(pipeline.target, Some(TargetSystem::Clickhouse));
        assert_eq!(pipeline.ddl.clickhouse, "CREATE TABLE events ()");
        assert_eq!(pipeline.schedule.cron, "0 * * * *");
    }

    #[test]
    fn test_build_pipeline_target_override() {
        let pipeline = build_pipeline(
            draft("0 * * * *"),
            &analysis(None),
            Some(TargetSystem::Hdfs),
        )
        .unwrap();
        assert_eq!(pipeline.target, Some(TargetSystem::Hdfs));
    }

    #[test]
    fn test_build_pipeline_falls_back_to_schedule_hint() {
        let pipeline = build_pipeline(draft(""), &analysis(Some("*/30 * * * *")), None).unwrap();
        assert_eq!(pipeline.schedule.cron, "*/30 * * * *");

        let err = build_pipeline(draft(" "), &analysis(None), None).unwrap_err();
        assert!(matches!(err, WizardError::NoSchedule));
    }

    // ── end to end against mock API + feed ─────────────────────────────

    /// Feed server that answers each `subscribe` with the frames `script`
    /// returns for that id.
    async fn feed_server(script: fn(&str) -> Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else { continue };
                let command: Value = serde_json::from_str(&text).unwrap();
                if command["type"] != "subscribe" {
                    continue;
                }
                let id = command["data"]["id"].as_str().unwrap_or_default().to_string();
                for frame in script(&id) {
                    ws.send(Message::Text(frame.into())).await.unwrap();
                }
            }
        });
        url
    }

    async fn api_server() -> ApiClient {
        let router = Router::new().route(
            "/api/analyze",
            post(|| async { Json(json!({"job_id": "job-5"})) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        ApiClient::new(&ApiConfig {
            base_url: format!("http://{addr}"),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    async fn wizard(script: fn(&str) -> Vec<String>) -> (Wizard, Transport) {
        let transport = Transport::spawn(
            TransportConfig::new(feed_server(script).await),
            Arc::new(NoToken),
        );
        transport.connect();
        assert!(transport.wait_online(Duration::from_secs(5)).await);
        let wizard = Wizard::new(api_server().await, transport.clone(), TrackerOptions::default());
        (wizard, transport)
    }

    fn successful_run(id: &str) -> Vec<String> {
        vec![
            json!({"type": "queued", "data": {"scope": "analyze", "id": id}}).to_string(),
            json!({"type": "progress", "data": {"id": id, "percent": 50, "stage": "transform"}})
                .to_string(),
            json!({"type": "done", "data": {"scope": "analyze", "id": id, "payload": {
                "recommendation": {"target": "hdfs", "confidence": 64, "rationale": "wide rows"},
                "ddl": {"hdfs": "CREATE EXTERNAL TABLE t"}
            }}})
            .to_string(),
        ]
    }

    fn failed_run(id: &str) -> Vec<String> {
        vec![
            json!({"type": "started", "data": {"id": id}}).to_string(),
            json!({"type": "error", "data": {"id": id, "reason": "source unreachable"}})
                .to_string(),
        ]
    }

    #[tokio::test]
    async fn test_analyze_follows_job_to_result() {
        let (wizard, transport) = wizard(successful_run).await;
        let mut phases = Vec::new();

        let analysis = tokio::time::timeout(
            Duration::from_secs(5),
            wizard.analyze(&preview(), |state| phases.push(state.phase())),
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(analysis.job_id, "job-5");
        assert_eq!(analysis.result.recommendation.target, TargetSystem::Hdfs);
        assert_eq!(analysis.result.recommendation.confidence_percent(), 64);
        assert_eq!(phases.first(), Some(&JobPhase::Idle));
        assert_eq!(phases.last(), Some(&JobPhase::Done));

        transport.disconnect();
    }

    #[tokio::test]
    async fn test_analyze_reports_job_failure() {
        let (wizard, transport) = wizard(failed_run).await;

        let err = tokio::time::timeout(Duration::from_secs(5), wizard.analyze(&preview(), |_| {}))
            .await
            .unwrap()
            .unwrap_err();

        match err {
            WizardError::JobFailed { job_id, reason } => {
                assert_eq!(job_id, "job-5");
                assert_eq!(reason, "source unreachable");
            }
            other => panic!("unexpected error {other:?}"),
        }

        transport.disconnect();
    }
}
