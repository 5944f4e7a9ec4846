//! Application state.

use std::sync::Arc;

use tape_manager::{JobStateManager, ManagerConfig, RecoverySweeper, SweeperConfig};
use tape_store::{JobStore, LockStore, ProgressChannel};

use crate::config::ApiConfig;
use crate::ws::SubscriberRegistry;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub manager: Arc<JobStateManager>,
    pub sweeper: Arc<RecoverySweeper>,
    pub subscribers: Arc<SubscriberRegistry>,
}

impl AppState {
    /// Create new application state.
    pub fn new(config: ApiConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let jobs = Arc::new(JobStore::from_env()?);
        let locks = Arc::new(LockStore::from_env()?);
        let progress = Arc::new(ProgressChannel::from_env()?);

        let manager = Arc::new(JobStateManager::new(
            jobs,
            locks,
            progress,
            ManagerConfig::from_env(),
        ));
        let sweeper = Arc::new(RecoverySweeper::new(
            Arc::clone(&manager),
            SweeperConfig::from_env(),
        ));

        Ok(Self {
            config,
            manager,
            sweeper,
            subscribers: Arc::new(SubscriberRegistry::new()),
        })
    }
}
