//! Network surfaces: the HTTP report API and the WebSocket stream.

pub mod report;
pub mod stream;

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::jobs::JobManager;

pub use report::router;
pub use stream::{handle_request, Subscription};

/// Serve both protocols until either listener fails.
pub async fn serve(cfg: &ServerConfig, jobs: Arc<JobManager>) -> anyhow::Result<()> {
    let http = report::serve(&cfg.http_addr, Arc::clone(&jobs));
    let ws = stream::serve(&cfg.ws_addr, jobs);
    tokio::try_join!(http, ws)?;
    Ok(())
}
