//! Pipeline control commands and the paused/resumed state they produce.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::bus::handler;
use crate::protocol::{ClientCommand, EventKind, ServerEvent};
use crate::transport::Transport;

/// Paused flag per pipeline, driven by `paused`/`resumed` events.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PipelineControls {
    paused: HashMap<String, bool>,
}

impl PipelineControls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a pipeline's flag changed.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::Paused(target) => self.set(&target.pipeline_id, true),
            ServerEvent::Resumed(target) => self.set(&target.pipeline_id, false),
            _ => false,
        }
    }

    fn set(&mut self, pipeline_id: &str, paused: bool) -> bool {
        self.paused.insert(pipeline_id.to_string(), paused) != Some(paused)
    }

    /// `None` until a paused/resumed event has been seen for the pipeline.
    pub fn is_paused(&self, pipeline_id: &str) -> Option<bool> {
        self.paused.get(pipeline_id).copied()
    }

    pub fn paused_pipelines(&self) -> impl Iterator<Item = &str> {
        self.paused
            .iter()
            .filter(|(_, paused)| **paused)
            .map(|(id, _)| id.as_str())
    }
}

/// An operator action on a pipeline or a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    RunNow { pipeline_id: String },
    Retry { run_id: String },
    Cancel { run_id: String },
    Pause { pipeline_id: String },
    Resume { pipeline_id: String },
}

impl ControlRequest {
    pub fn command(&self) -> ClientCommand {
        match self.clone() {
            ControlRequest::RunNow { pipeline_id } => ClientCommand::RunNow { pipeline_id },
            ControlRequest::Retry { run_id } => ClientCommand::Retry { run_id },
            ControlRequest::Cancel { run_id } => ClientCommand::Cancel { run_id },
            ControlRequest::Pause { pipeline_id } => ClientCommand::Pause { pipeline_id },
            ControlRequest::Resume { pipeline_id } => ClientCommand::Resume { pipeline_id },
        }
    }

    /// Event kind the server answers with, if any. `run_now` and `retry`
    /// start a new run whose id is not known in advance, so they have none.
    pub fn ack_kind(&self) -> Option<EventKind> {
        match self {
            ControlRequest::Cancel { .. } => Some(EventKind::Cancelled),
            ControlRequest::Pause { .. } => Some(EventKind::Paused),
            ControlRequest::Resume { .. } => Some(EventKind::Resumed),
            ControlRequest::RunNow { .. } | ControlRequest::Retry { .. } => None,
        }
    }

    /// Whether `event` acknowledges this request.
    pub fn is_ack(&self, event: &ServerEvent) -> bool {
        match (self, event) {
            (ControlRequest::Cancel { run_id }, ServerEvent::Cancelled(job)) => job.id == *run_id,
            (ControlRequest::Pause { pipeline_id }, ServerEvent::Paused(target))
            | (ControlRequest::Resume { pipeline_id }, ServerEvent::Resumed(target)) => {
                target.pipeline_id == *pipeline_id
            }
            _ => false,
        }
    }
}

/// What happened to a request sent with [`send_request`].
#[derive(Clone, Debug, PartialEq)]
pub enum ControlOutcome {
    /// Transport was not online; nothing was written.
    Dropped,
    /// Written; the request has no acknowledgement event.
    Sent,
    Confirmed(ServerEvent),
    /// Written, but no acknowledgement arrived in time.
    Unconfirmed,
}

/// Send `request` and, when it has an acknowledgement event, wait up to
/// `timeout` for it. The listener is registered before the command is
/// written so a fast reply cannot slip past.
pub async fn send_request(
    transport: &Transport,
    request: &ControlRequest,
    timeout: Duration,
) -> ControlOutcome {
    let command = request.command();
    let Some(kind) = request.ack_kind() else {
        return if transport.send(command) {
            ControlOutcome::Sent
        } else {
            ControlOutcome::Dropped
        };
    };

    let (ack_tx, ack_rx) = oneshot::channel();
    let slot = Mutex::new(Some(ack_tx));
    let expected = request.clone();
    let subscription = transport.on(
        kind,
        handler(move |event| {
            if !expected.is_ack(event) {
                return;
            }
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(event.clone());
            }
        }),
    );

    let name = command.name();
    let outcome = if !transport.send(command) {
        ControlOutcome::Dropped
    } else {
        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(event)) => ControlOutcome::Confirmed(event),
            _ => {
                warn!(command = name, ?timeout, "no acknowledgement from server");
                ControlOutcome::Unconfirmed
            }
        }
    };
    subscription.unsubscribe();
    debug!(command = name, ?outcome, "control request finished");
    outcome
}
