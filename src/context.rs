use std::sync::Arc;

use tokio_rusqlite::Connection;

use crate::config::AppConfig;
use crate::core::TransferLocks;
use crate::remote::{self, RemoteStorage};

/// Everything a pipeline operation needs, cheap to clone.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub db: Connection,
    pub remote: Arc<dyn RemoteStorage>,
    pub locks: TransferLocks,
}

impl AppContext {
    pub fn new(config: AppConfig, db: Connection, remote: Arc<dyn RemoteStorage>) -> Self {
        Self {
            config: Arc::new(config),
            db,
            remote,
            locks: TransferLocks::new(),
        }
    }

    /// Context with the storage client the config asks for.
    pub fn from_config(config: AppConfig, db: Connection) -> crate::Result<Self> {
        let remote = remote::create_remote(&config)?;
        Ok(Self::new(config, db, remote))
    }
}
