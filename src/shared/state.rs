use crate::config::AppConfig;
use crate::realtime::RealtimePublisher;
use crate::shared::utils::DbPool;
use std::sync::Arc;
use std::time::Duration;

/// Shared process state, injected into every handler and service. The
/// realtime publisher lives here rather than in a global so tests can build
/// an isolated instance.
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    /// Shared HTTP client for provider calls and external forwarding.
    pub http: reqwest::Client,
    pub realtime: Arc<RealtimePublisher>,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            conn,
            config,
            http,
            realtime: Arc::new(RealtimePublisher::new()),
        })
    }
}

impl Clone for AppState {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            config: self.config.clone(),
            http: self.http.clone(),
            realtime: Arc::clone(&self.realtime),
        }
    }
}
