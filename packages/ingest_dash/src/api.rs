//! HTTP calls that start work on the pipeline service.
//!
//! The service answers a start call with the id of the job it queued; all
//! progress for that job then arrives over the event feed.

use job_feed::protocol::{DdlSet, TargetSystem};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ApiConfig;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("API server is unavailable")]
    Unavailable(#[source] reqwest::Error),

    /// Non-2xx answer. The message is the body's `message` field, or
    /// `HTTP <status>` when there is none.
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("malformed API response")]
    Decode(#[source] reqwest::Error),

    #[error(transparent)]
    Request(reqwest::Error),
}

impl ApiError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable(err)
        } else {
            Self::Request(err)
        }
    }
}

#[derive(Deserialize)]
struct JsonErrorShape {
    #[serde(default)]
    message: Option<String>,
}

/// Human-readable message for a failed response body.
pub fn error_message(status: u16, body: &[u8]) -> String {
    serde_json::from_slice::<JsonErrorShape>(body)
        .ok()
        .and_then(|shape| shape.message)
        .unwrap_or_else(|| format!("HTTP {status}"))
}

// =============================================================================
// Request / response shapes
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Csv,
    Json,
    Xml,
    Postgresql,
}

/// Where the data to ingest lives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SourceConfig {
    File {
        #[serde(rename = "type")]
        file_type: SourceType,
        #[serde(rename = "pathOrUrl")]
        path_or_url: String,
    },
    Pg {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dsn: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        database: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        table: Option<String>,
        #[serde(
            rename = "updatedAtColumn",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        updated_at_column: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferredType {
    String,
    Number,
    Bool,
    Datetime,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: InferredType,
}

/// Sample of the source the analyzer works from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PreviewData {
    pub columns: Vec<PreviewColumn>,
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
    #[serde(rename = "rowCount")]
    pub row_count: u64,
}

#[derive(Serialize)]
struct PreviewRequest<'a> {
    #[serde(rename = "sourceType")]
    source_type: SourceType,
    source: &'a SourceConfig,
}

#[derive(Serialize)]
struct AnalyzeRequest<'a> {
    preview: &'a PreviewData,
}

#[derive(Debug, Deserialize)]
struct AnalyzeStarted {
    job_id: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum IncrementalMode {
    #[default]
    None,
    UpdatedAt,
    Id,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    pub cron: String,
    #[serde(rename = "incrementalMode")]
    pub incremental_mode: IncrementalMode,
    #[serde(
        rename = "incrementalColumn",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub incremental_column: Option<String>,
}

/// Body of `POST /api/pipelines`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewPipeline {
    #[serde(rename = "sourceType")]
    pub source_type: SourceType,
    pub source: SourceConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview: Option<PreviewData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<TargetSystem>,
    pub ddl: DdlSet,
    pub schedule: Schedule,
}

#[derive(Debug, Deserialize)]
struct PipelineCreated {
    id: String,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Clone, Debug)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(ApiError::Request)?;
        Ok(Self {
            http,
            base_url: config.base_url.clone(),
        })
    }

    /// Sample the source so it can be analyzed.
    pub async fn preview(
        &self,
        source_type: SourceType,
        source: &SourceConfig,
    ) -> Result<PreviewData, ApiError> {
        self.post_json(
            "/api/preview",
            &PreviewRequest {
                source_type,
                source,
            },
        )
        .await
    }

    /// Queue a schema recommendation job. Returns its job id.
    pub async fn start_analyze(&self, preview: &PreviewData) -> Result<String, ApiError> {
        let started: AnalyzeStarted = self
            .post_json("/api/analyze", &AnalyzeRequest { preview })
            .await?;
        Ok(started.job_id)
    }

    /// Create a scheduled pipeline. Returns the pipeline id.
    pub async fn create_pipeline(&self, pipeline: &NewPipeline) -> Result<String, ApiError> {
        let created: PipelineCreated = self.post_json("/api/pipelines", pipeline).await?;
        Ok(created.id)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "POST");

        let resp = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.bytes().await.unwrap_or_default();
            let message = error_message(status.as_u16(), &body);
            debug!(%url, status = status.as_u16(), %message, "request rejected");
            return Err(ApiError::Status {
                status: status.as_u16(),
                message,
            });
        }

        resp.json().await.map_err(ApiError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::time::Duration;

    async fn serve(router: Router) -> ApiClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        client_for(format!("http://{addr}"))
    }

    fn client_for(base_url: String) -> ApiClient {
        ApiClient::new(&ApiConfig {
            base_url,
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn sample_preview() -> PreviewData {
        serde_json::from_value(json!({
            "columns": [{"name": "id", "type": "number"}, {"name": "email", "type": "string"}],
            "rows": [{"id": 1, "email": "a@example.com"}],
            "rowCount": 1
        }))
        .unwrap()
    }

    #[test]
    fn test_error_message_prefers_json_message() {
        assert_eq!(
            error_message(422, br#"{"message":"preview is empty"}"#),
            "preview is empty"
        );
    }

    #[test]
    fn test_error_message_falls_back_to_status() {
        assert_eq!(error_message(500, b"Internal Server Error"), "HTTP 500");
        assert_eq!(error_message(404, br#"{"detail":"nope"}"#), "HTTP 404");
        assert_eq!(error_message(502, b""), "HTTP 502");
    }

    #[test]
    fn test_source_config_wire_shape() {
        let file = SourceConfig::File {
            file_type: SourceType::Csv,
            path_or_url: "s3://bucket/users.csv".into(),
        };
        assert_eq!(
            serde_json::to_value(&file).unwrap(),
            json!({"kind": "file", "type": "csv", "pathOrUrl": "s3://bucket/users.csv"})
        );

        let pg: SourceConfig =
            serde_json::from_value(json!({"kind": "pg", "host": "db", "port": 5432, "table": "users"}))
                .unwrap();
        assert!(matches!(pg, SourceConfig::Pg { port: Some(5432), .. }));
    }

    #[test]
    fn test_schedule_wire_shape() {
        let schedule = Schedule {
            cron: "*/30 * * * *".into(),
            incremental_mode: IncrementalMode::UpdatedAt,
            incremental_column: Some("updated_at".into()),
        };
        assert_eq!(
            serde_json::to_value(&schedule).unwrap(),
            json!({"cron": "*/30 * * * *", "incrementalMode": "updated_at", "incrementalColumn": "updated_at"})
        );
    }

    #[tokio::test]
    async fn test_start_analyze_returns_job_id() {
        let router = Router::new().route(
            "/api/analyze",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["preview"]["rowCount"], 1);
                Json(json!({"job_id": "job-77"}))
            }),
        );
        let client = serve(router).await;
        let job_id = client.start_analyze(&sample_preview()).await.unwrap();
        assert_eq!(job_id, "job-77");
    }

    #[tokio::test]
    async fn test_rejection_carries_server_message() {
        let router = Router::new().route(
            "/api/analyze",
            post(|| async {
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({"message": "preview has no rows"})),
                )
            }),
        );
        let client = serve(router).await;
        match client.start_analyze(&sample_preview()).await {
            Err(ApiError::Status { status, message }) => {
                assert_eq!(status, 422);
                assert_eq!(message, "preview has no rows");
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rejection_without_json_uses_status() {
        let router = Router::new().route(
            "/api/pipelines",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let client = serve(router).await;
        let pipeline = NewPipeline {
            source_type: SourceType::Csv,
            source: SourceConfig::File {
                file_type: SourceType::Csv,
                path_or_url: "/data/a.csv".into(),
            },
            preview: None,
            target: Some(TargetSystem::Postgresql),
            ddl: DdlSet::default(),
            schedule: Schedule {
                cron: "0 * * * *".into(),
                incremental_mode: IncrementalMode::None,
                incremental_column: None,
            },
        };
        let err = client.create_pipeline(&pipeline).await.unwrap_err();
        assert_eq!(err.to_string(), "HTTP 500");
    }

    #[tokio::test]
    async fn test_create_pipeline_returns_id() {
        let router = Router::new().route(
            "/api/pipelines",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["target"], "clickhouse");
                assert_eq!(body["schedule"]["incrementalMode"], "none");
                Json(json!({"id": "pl-3"}))
            }),
        );
        let client = serve(router).await;
        let pipeline = NewPipeline {
            source_type: SourceType::Json,
            source: SourceConfig::File {
                file_type: SourceType::Json,
                path_or_url: "/data/a.json".into(),
            },
            preview: Some(sample_preview()),
            target: Some(TargetSystem::Clickhouse),
            ddl: DdlSet::default(),
            schedule: Schedule {
                cron: "0 * * * *".into(),
                incremental_mode: IncrementalMode::None,
                incremental_column: None,
            },
        };
        assert_eq!(client.create_pipeline(&pipeline).await.unwrap(), "pl-3");
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = client_for(format!("http://{addr}"));
        let err = client.start_analyze(&sample_preview()).await.unwrap_err();
        assert!(matches!(err, ApiError::Unavailable(_)));
    }
}
