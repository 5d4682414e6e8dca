use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

use super::RemoteStorage;
use super::protocol::{FinishUploadRequest, InitUploadResponse, StatusResponse, UploadSlot};
use crate::config::TransferSettings;
use crate::error::{Result, TransferError};

const INIT_UPLOAD_PATH: &str = "/api/Storage/InitUploadSigned";
const FINISH_UPLOAD_PATH: &str = "/api/Storage/FinishUpload";
const STATUS_PATH: &str = "/api/Storage/Status/";

pub struct HttpStorageClient {
    settings: TransferSettings,
    client: reqwest::Client,
}

impl HttpStorageClient {
    pub fn new(settings: &TransferSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(settings.accept_invalid_certs)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;

        Ok(Self {
            settings: settings.clone(),
            client,
        })
    }

    fn url(&self, path: &str) -> Result<String> {
        Ok(format!("{}{path}", self.settings.endpoint()?))
    }
}

/// Body of a successful response, or a protocol error carrying it.
async fn read_body(endpoint: &'static str, response: reqwest::Response) -> Result<String> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(TransferError::RemoteProtocol {
            endpoint,
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl RemoteStorage for HttpStorageClient {
    async fn init_upload_signed(&self, signed_metadata: Vec<u8>) -> Result<InitUploadResponse> {
        let url = self.url(INIT_UPLOAD_PATH)?;
        debug!(%url, bytes = signed_metadata.len(), "POST InitUploadSigned");

        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/xml")
            .body(signed_metadata)
            .send()
            .await?;

        let body = read_body("InitUploadSigned", response).await?;
        Ok(InitUploadResponse::parse(&body)?)
    }

    async fn put_chunk(&self, slot: &UploadSlot, body: Vec<u8>) -> Result<()> {
        debug!(file = %slot.file_name, blob = %slot.blob_name, bytes = body.len(), "PUT chunk");

        let mut request = self.client.put(&slot.url).body(body);
        for header in &slot.header_list {
            request = request.header(header.key.as_str(), header.value.as_str());
        }

        let chunk_error = |message: String| TransferError::ChunkUpload {
            file: slot.file_name.clone(),
            message,
        };

        let response = request.send().await.map_err(|e| chunk_error(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        Err(chunk_error(format!("HTTP {}: {}", status.as_u16(), text)))
    }

    async fn finish_upload(&self, request: &FinishUploadRequest) -> Result<()> {
        let url = self.url(FINISH_UPLOAD_PATH)?;
        debug!(%url, blobs = request.azure_blob_name_list.len(), "POST FinishUpload");

        let response = self.client.post(url).json(request).send().await?;
        read_body("FinishUpload", response).await?;
        Ok(())
    }

    async fn status(&self, reference_number: &str) -> Result<StatusResponse> {
        let url = self.url(&format!("{STATUS_PATH}{reference_number}"))?;

        let response = self.client.get(url).send().await?;
        let body = read_body("Status", response).await?;
        debug!(%reference_number, %body, "Status response");

        Ok(serde_json::from_str(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn builds_urls_without_double_slash() {
        let settings = TransferSettings {
            endpoint_url: "https://test-e-dokumenty.mf.gov.pl/".into(),
            ..Default::default()
        };
        let client = HttpStorageClient::new(&settings).unwrap();

        assert_eq!(
            client.url(INIT_UPLOAD_PATH).unwrap(),
            "https://test-e-dokumenty.mf.gov.pl/api/Storage/InitUploadSigned"
        );
        assert_eq!(
            client.url(&format!("{STATUS_PATH}abc")).unwrap(),
            "https://test-e-dokumenty.mf.gov.pl/api/Storage/Status/abc"
        );
    }

    #[tokio::test]
    async fn missing_endpoint_is_a_validation_error() {
        let client = HttpStorageClient::new(&TransferSettings::default()).unwrap();

        let err = client.status("ref").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.to_string(), "Missing API endpoint URL in settings");
    }
}
