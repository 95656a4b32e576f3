pub mod control;
pub mod jobs;
pub mod render;
pub mod watch;

use std::sync::Arc;

use anyhow::Result;
use job_feed::{CredentialSource, Transport};
use tracing::warn;

use crate::api::ApiClient;
use crate::config::{ApiConfig, FeedConfig};

pub use control::control_command;
pub use jobs::{analyze_command, monitor_command};
pub use watch::watch_command;

/// Everything a command needs, resolved from config and flags.
pub struct Context {
    pub feed: FeedConfig,
    pub api: ApiConfig,
    pub credentials: Arc<dyn CredentialSource>,
}

impl Context {
    /// Start the feed and give it `connect_timeout` to come online. Commands
    /// still proceed when it does not: the transport keeps retrying and
    /// trackers resubscribe once it connects.
    pub async fn open_feed(&self) -> Transport {
        let transport = Transport::spawn(self.feed.transport.clone(), self.credentials.clone());
        transport.connect();
        if !transport.wait_online(self.feed.connect_timeout).await {
            warn!(url = %self.feed.transport.url, "feed not reachable yet, still retrying");
        }
        transport
    }

    pub fn api_client(&self) -> Result<ApiClient> {
        Ok(ApiClient::new(&self.api)?)
    }
}
