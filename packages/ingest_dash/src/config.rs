use anyhow::{Context, Result};
use job_feed::credentials::{CookieToken, CredentialSource, EnvToken, NoToken};
use job_feed::{HeartbeatPolicy, TrackerOptions, TransportConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / ingest.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   ingest.toml:     [feed]
//                    url = "ws://pipelines.internal/ws"
//
//   env var:         INGEST_FEED__URL=ws://...   (double underscore = nesting)
//
//   (single underscore stays within field names: INGEST_FEED__MAX_LOG_LINES)

pub const CONFIG_FILE: &str = "ingest.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub feed: FeedFileConfig,
    #[serde(default)]
    pub api: ApiFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
}

/// Event feed tunables (lives under `[feed]` in ingest.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedFileConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    /// Reconnect delays in milliseconds; the last one repeats.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Write `ping` frames while online. Off by default; the service does
    /// not need them.
    #[serde(default)]
    pub heartbeat_enabled: bool,
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: usize,
    /// How long pause/resume/cancel wait for the server's acknowledgement.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    /// How long a command waits for the feed to come online before giving up.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for FeedFileConfig {
    fn default() -> Self {
        Self {
            url: default_feed_url(),
            backoff_ms: default_backoff_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            heartbeat_enabled: false,
            max_log_lines: default_max_log_lines(),
            ack_timeout_secs: default_ack_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// HTTP API tunables (lives under `[api]` in ingest.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiFileConfig {
    #[serde(default = "default_api_base_url")]
    pub base_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ApiFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_api_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Where the session token comes from (lives under `[session]`).
/// Checked in order: `token`, `cookie`, `token_env`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default)]
    pub token: Option<String>,
    /// A browser `Cookie:` header value holding the session cookie.
    #[serde(default)]
    pub cookie: Option<String>,
    /// Environment variable read at every dial.
    #[serde(default)]
    pub token_env: Option<String>,
}

fn default_feed_url() -> String {
    "ws://127.0.0.1:8000/ws".to_string()
}
fn default_backoff_ms() -> Vec<u64> {
    vec![1000, 2000, 5000, 10000]
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_max_log_lines() -> usize {
    job_feed::job::DEFAULT_MAX_LOG_LINES
}
fn default_ack_timeout_secs() -> u64 {
    10
}
fn default_connect_timeout_secs() -> u64 {
    15
}
fn default_api_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_request_timeout_secs() -> u64 {
    30
}

/// Build a figment that layers: defaults → ingest.toml → INGEST_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `INGEST_FEED__URL=ws://...`  →  `feed.url = "ws://..."`
///   `INGEST_API__BASE_URL=http://...`  →  `api.base_url = "http://..."`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join(CONFIG_FILE)))
        .merge(Env::prefixed("INGEST_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig)
// =============================================================================

/// Feed connection and job tracking (runtime view).
#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub transport: TransportConfig,
    pub tracker: TrackerOptions,
    pub ack_timeout: Duration,
    pub connect_timeout: Duration,
}

impl FeedConfig {
    pub fn from_file(fc: &FeedFileConfig, session: &SessionFileConfig) -> Self {
        let transport = TransportConfig {
            token: session.token.clone().filter(|t| !t.is_empty()),
            backoff_steps: fc
                .backoff_ms
                .iter()
                .map(|ms| Duration::from_millis(*ms))
                .collect(),
            heartbeat: HeartbeatPolicy {
                interval: Duration::from_secs(fc.heartbeat_secs),
                send_frames: fc.heartbeat_enabled,
            },
            ..TransportConfig::new(fc.url.clone())
        };
        Self {
            transport,
            tracker: TrackerOptions {
                max_log_lines: fc.max_log_lines,
                ..TrackerOptions::default()
            },
            ack_timeout: Duration::from_secs(fc.ack_timeout_secs),
            connect_timeout: Duration::from_secs(fc.connect_timeout_secs),
        }
    }
}

/// HTTP API configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Base URL without a trailing slash
    pub base_url: String,
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn from_file(fc: &ApiFileConfig) -> Self {
        Self {
            base_url: fc.base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(fc.request_timeout_secs),
        }
    }
}

/// Ambient credential source for the feed. An explicit `token` is carried in
/// [`TransportConfig::token`] instead and wins over whatever this returns.
pub fn credential_source(session: &SessionFileConfig) -> Arc<dyn CredentialSource> {
    if let Some(cookie) = session.cookie.as_deref().filter(|c| !c.is_empty()) {
        return Arc::new(CookieToken::new(cookie));
    }
    if let Some(var) = session.token_env.as_deref().filter(|v| !v.is_empty()) {
        return Arc::new(EnvToken::new(var));
    }
    Arc::new(NoToken)
}

/// Resolve the config directory: `--config-dir` if given, else
/// `<platform config dir>/ingest`.
pub fn config_dir(custom_dir: Option<PathBuf>) -> Result<PathBuf> {
    match custom_dir {
        Some(dir) => Ok(dir),
        None => dirs::config_dir()
            .map(|dir| dir.join("ingest"))
            .context("Could not find a config directory; pass --config-dir"),
    }
}
