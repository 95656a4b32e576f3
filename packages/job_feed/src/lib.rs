//! Job Feed - Reconnecting WebSocket client for pipeline service events
//!
//! This crate keeps one long-lived connection to the pipeline service, decodes
//! its event frames, fans them out to in-process listeners, and folds the
//! events that concern a single job into a progress state machine.
//! It has no HTTP client: jobs are started elsewhere and only their ids are
//! handed to this crate.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use job_feed::{JobTracker, NoToken, Scope, TrackerOptions, Transport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = Transport::spawn(
//!         TransportConfig::new("ws://localhost:8080/ws"),
//!         Arc::new(NoToken),
//!     );
//!     transport.connect();
//!
//!     // The id came back from the HTTP start call.
//!     let tracker = JobTracker::start(&transport, Scope::Analyze, "job-42", TrackerOptions::default());
//!     let finished = tracker.wait_terminal().await;
//!     println!("job ended in {}", finished.phase());
//!
//!     transport.disconnect();
//! }
//! ```

pub mod backoff;
pub mod bus;
pub mod controls;
pub mod credentials;
pub mod job;
pub mod protocol;
pub mod transport;

pub use backoff::{Backoff, DEFAULT_BACKOFF_STEPS};
pub use bus::{EventBus, Handler, Subscription, handler};
pub use controls::{ControlOutcome, ControlRequest, PipelineControls, send_request};
pub use credentials::{CookieToken, CredentialSource, EnvToken, NoToken, StaticToken};
pub use job::{JobOutcome, JobPhase, JobSubscription, JobTracker, TrackerOptions};
pub use protocol::{
    AnalysisResult, ClientCommand, DoneEvent, EventKind, RunSummary, Scope, ServerEvent, Stage,
};
pub use transport::{ConnectionStatus, HeartbeatPolicy, Transport, TransportConfig};
