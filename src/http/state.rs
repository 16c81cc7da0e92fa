//! Application state for the HTTP server.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::correlator::{AlertNotifier, NoopNotifier};
use crate::db::repository::FullRepository;
use crate::services::job_tracker::JobTracker;
use crate::services::tiler::{GreedyAllocator, TileAllocator};

/// Shared application state passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Repository instance for storage operations
    pub repository: Arc<dyn FullRepository>,
    /// Static configuration: telescope roster, galaxy catalog, retry policy
    pub config: Arc<AppConfig>,
    /// Registry of background pipeline runs
    pub job_tracker: JobTracker,
    /// Coverage optimizer used by plan generation
    pub allocator: Arc<dyn TileAllocator>,
    /// Receiver for alert-worthiness notifications
    pub notifier: Arc<dyn AlertNotifier>,
    /// Shared HTTP client for map fetches and queue submissions
    pub client: reqwest::Client,
}

impl AppState {
    /// Create application state with the built-in allocator and a no-op
    /// notifier. The fields are public, so deployments with a custom
    /// allocator or notifier set them after construction.
    pub fn new(repository: Arc<dyn FullRepository>, config: AppConfig) -> Self {
        Self {
            repository,
            config: Arc::new(config),
            job_tracker: JobTracker::new(),
            allocator: Arc::new(GreedyAllocator),
            notifier: Arc::new(NoopNotifier),
            client: reqwest::Client::new(),
        }
    }
}
