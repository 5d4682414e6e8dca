mod http;
pub mod protocol;
mod simulated;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::error::Result;

pub use http::HttpStorageClient;
pub use protocol::{FinishUploadRequest, HeaderEntry, InitUploadResponse, StatusResponse, UploadSlot};
pub use simulated::{SimulatedStorage, SlotMode};

/// The gateway's storage API: init, per-blob upload, finish, status.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// POST the signed InitUpload metadata.
    async fn init_upload_signed(&self, signed_metadata: Vec<u8>) -> Result<InitUploadResponse>;

    /// PUT one ciphertext part to its slot.
    async fn put_chunk(&self, slot: &UploadSlot, body: Vec<u8>) -> Result<()>;

    async fn finish_upload(&self, request: &FinishUploadRequest) -> Result<()>;

    async fn status(&self, reference_number: &str) -> Result<StatusResponse>;
}

/// Factory function to create the storage client based on config
pub fn create_remote(config: &AppConfig) -> Result<Arc<dyn RemoteStorage>> {
    if config.simulation {
        return Ok(Arc::new(SimulatedStorage::new()));
    }
    Ok(Arc::new(HttpStorageClient::new(&config.settings)?))
}
