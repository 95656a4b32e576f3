//! Job Feed Wire Protocol
//!
//! JSON envelopes exchanged with the pipeline service over the feed socket.
//!
//! Inbound frames look like `{ "type": <kind>, "data"?: <payload> }` and are
//! decoded into [`ServerEvent`], a closed enum with one variant per event
//! kind. The payload of `done` is itself a tagged union on `scope`
//! ([`DoneEvent`]), so callers must match on the scope before touching the
//! result. Outbound frames are [`ClientCommand`]s with the same envelope shape.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Heartbeat frame written while online when heartbeat frames are enabled.
pub const PING_FRAME: &str = r#"{"type":"ping"}"#;

/// Domain of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    /// ML schema recommendation job
    Analyze,
    /// Scheduled data-movement run
    Pipeline,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Analyze => "analyze",
            Scope::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event kinds a listener can register for. `ping`/`pong` are not listed:
/// the transport consumes them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    Queued,
    Started,
    Progress,
    Log,
    Done,
    Error,
    Cancelled,
    Paused,
    Resumed,
}

impl EventKind {
    pub const ALL: [EventKind; 10] = [
        EventKind::Connected,
        EventKind::Queued,
        EventKind::Started,
        EventKind::Progress,
        EventKind::Log,
        EventKind::Done,
        EventKind::Error,
        EventKind::Cancelled,
        EventKind::Paused,
        EventKind::Resumed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Queued => "queued",
            EventKind::Started => "started",
            EventKind::Progress => "progress",
            EventKind::Log => "log",
            EventKind::Done => "done",
            EventKind::Error => "error",
            EventKind::Cancelled => "cancelled",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of `queued`, `started` and `cancelled`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRef {
    /// Older servers omit the scope; such events match on id alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub id: String,
}

/// Pipeline stage reported by `progress`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Extract,
    Transform,
    Load,
    Validate,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::Transform => "transform",
            Stage::Load => "load",
            Stage::Validate => "validate",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub id: String,
    pub line: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<Scope>,
    pub id: String,
    pub reason: String,
}

/// Storage systems the recommender can pick.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSystem {
    Clickhouse,
    Postgresql,
    Hdfs,
}

impl TargetSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetSystem::Clickhouse => "clickhouse",
            TargetSystem::Postgresql => "postgresql",
            TargetSystem::Hdfs => "hdfs",
        }
    }
}

impl fmt::Display for TargetSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TargetSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clickhouse" => Ok(TargetSystem::Clickhouse),
            "postgresql" | "postgres" => Ok(TargetSystem::Postgresql),
            "hdfs" => Ok(TargetSystem::Hdfs),
            other => Err(format!("unknown target system: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub target: TargetSystem,
    /// Usually 0..1; some model versions report 0..100.
    pub confidence: f64,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_hint: Option<String>,
}

impl Recommendation {
    /// Confidence as a whole percentage regardless of which scale the
    /// service used.
    pub fn confidence_percent(&self) -> u8 {
        let pct = if self.confidence <= 1.0 {
            self.confidence * 100.0
        } else {
            self.confidence
        };
        pct.clamp(0.0, 100.0).round() as u8
    }
}

/// Generated schema definitions, one per target system.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DdlSet {
    #[serde(default)]
    pub clickhouse: String,
    #[serde(default)]
    pub postgresql: String,
    #[serde(default)]
    pub hdfs: String,
}

impl DdlSet {
    pub fn for_target(&self, target: TargetSystem) -> &str {
        match target {
            TargetSystem::Clickhouse => &self.clickhouse,
            TargetSystem::Postgresql => &self.postgresql,
            TargetSystem::Hdfs => &self.hdfs,
        }
    }
}

/// Result of a finished analyze job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub recommendation: Recommendation,
    pub ddl: DdlSet,
}

/// Result of a finished pipeline run. Counts are plain JSON numbers on the
/// wire; a fractional value must not reject the terminal event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "rowsIn")]
    pub rows_in: f64,
    #[serde(rename = "rowsOut")]
    pub rows_out: f64,
    #[serde(rename = "durationMs")]
    pub duration_ms: f64,
}

/// Payload of `done`; the shape of `payload` is selected by `scope`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "lowercase")]
pub enum DoneEvent {
    Analyze {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<AnalysisResult>,
    },
    Pipeline {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<RunSummary>,
    },
}

impl DoneEvent {
    pub fn id(&self) -> &str {
        match self {
            DoneEvent::Analyze { id, .. } | DoneEvent::Pipeline { id, .. } => id,
        }
    }

    pub fn scope(&self) -> Scope {
        match self {
            DoneEvent::Analyze { .. } => Scope::Analyze,
            DoneEvent::Pipeline { .. } => Scope::Pipeline,
        }
    }
}

/// Payload of `paused` / `resumed`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PipelineRef {
    #[serde(rename = "pipelineId")]
    pub pipeline_id: String,
}

/// A decoded server-push event.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    Connected,
    Queued(JobRef),
    Started(JobRef),
    Progress(ProgressEvent),
    Log(LogEvent),
    Done(DoneEvent),
    Error(ErrorEvent),
    Cancelled(JobRef),
    Paused(PipelineRef),
    Resumed(PipelineRef),
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::Connected => EventKind::Connected,
            ServerEvent::Queued(_) => EventKind::Queued,
            ServerEvent::Started(_) => EventKind::Started,
            ServerEvent::Progress(_) => EventKind::Progress,
            ServerEvent::Log(_) => EventKind::Log,
            ServerEvent::Done(_) => EventKind::Done,
            ServerEvent::Error(_) => EventKind::Error,
            ServerEvent::Cancelled(_) => EventKind::Cancelled,
            ServerEvent::Paused(_) => EventKind::Paused,
            ServerEvent::Resumed(_) => EventKind::Resumed,
        }
    }

    /// The `(id, scope)` pair a job-scoped event is correlated by.
    /// `None` for `connected`, `paused` and `resumed`.
    pub fn job_key(&self) -> Option<(&str, Option<Scope>)> {
        match self {
            ServerEvent::Queued(r) | ServerEvent::Started(r) | ServerEvent::Cancelled(r) => {
                Some((&r.id, r.scope))
            }
            ServerEvent::Progress(p) => Some((&p.id, p.scope)),
            ServerEvent::Log(l) => Some((&l.id, l.scope)),
            ServerEvent::Error(e) => Some((&e.id, e.scope)),
            ServerEvent::Done(d) => Some((d.id(), Some(d.scope()))),
            ServerEvent::Connected | ServerEvent::Paused(_) | ServerEvent::Resumed(_) => None,
        }
    }

    /// True when this event is addressed to the job `(id, scope)`.
    /// Events without a scope match on id alone.
    pub fn concerns(&self, job_id: &str, scope: Scope) -> bool {
        match self.job_key() {
            Some((id, event_scope)) => id == job_id && event_scope.is_none_or(|s| s == scope),
            None => false,
        }
    }
}

/// Keep-alive frames the transport consumes without forwarding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlFrame {
    Ping,
    Pong,
}

/// Result of decoding one inbound frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Inbound {
    Event(ServerEvent),
    Control(ControlFrame),
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame has no string `type` field")]
    MissingType,

    #[error("unknown event type `{0}`")]
    UnknownType(String),

    #[error("invalid `{kind}` payload: {source}")]
    Payload {
        kind: EventKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a text frame into an event or a control frame.
pub fn decode_frame(text: &str) -> Result<Inbound, FrameError> {
    let Value::Object(mut envelope) = serde_json::from_str::<Value>(text)? else {
        return Err(FrameError::MissingType);
    };
    let kind = match envelope.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(FrameError::MissingType),
    };
    let data = envelope.remove("data").unwrap_or(Value::Null);

    let event = match kind.as_str() {
        "ping" => return Ok(Inbound::Control(ControlFrame::Ping)),
        "pong" => return Ok(Inbound::Control(ControlFrame::Pong)),
        "connected" => ServerEvent::Connected,
        "queued" => ServerEvent::Queued(payload(EventKind::Queued, data)?),
        "started" => ServerEvent::Started(payload(EventKind::Started, data)?),
        "progress" => ServerEvent::Progress(payload(EventKind::Progress, data)?),
        "log" => ServerEvent::Log(payload(EventKind::Log, data)?),
        "done" => ServerEvent::Done(payload(EventKind::Done, data)?),
        "error" => ServerEvent::Error(payload(EventKind::Error, data)?),
        "cancelled" => ServerEvent::Cancelled(payload(EventKind::Cancelled, data)?),
        "paused" => ServerEvent::Paused(payload(EventKind::Paused, data)?),
        "resumed" => ServerEvent::Resumed(payload(EventKind::Resumed, data)?),
        _ => return Err(FrameError::UnknownType(kind)),
    };
    Ok(Inbound::Event(event))
}

fn payload<T: DeserializeOwned>(kind: EventKind, data: Value) -> Result<T, FrameError> {
    serde_json::from_value(data).map_err(|source| FrameError::Payload { kind, source })
}

/// Commands sent FROM the client TO the pipeline service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Start receiving events for a job. There is no acknowledgement; the
    /// first correlated event is the confirmation.
    Subscribe { topic: Scope, id: String },
    RunNow {
        #[serde(rename = "pipelineId")]
        pipeline_id: String,
    },
    Retry {
        #[serde(rename = "runId")]
        run_id: String,
    },
    Cancel {
        #[serde(rename = "runId")]
        run_id: String,
    },
    Pause {
        #[serde(rename = "pipelineId")]
        pipeline_id: String,
    },
    Resume {
        #[serde(rename = "pipelineId")]
        pipeline_id: String,
    },
}

impl ClientCommand {
    pub fn subscribe(topic: Scope, id: impl Into<String>) -> Self {
        ClientCommand::Subscribe {
            topic,
            id: id.into(),
        }
    }

    /// Wire name of the command, used for logging.
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Subscribe { .. } => "subscribe",
            ClientCommand::RunNow { .. } => "run_now",
            ClientCommand::Retry { .. } => "retry",
            ClientCommand::Cancel { .. } => "cancel",
            ClientCommand::Pause { .. } => "pause",
            ClientCommand::Resume { .. } => "resume",
        }
    }

    pub fn to_frame(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
