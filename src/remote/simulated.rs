//! In-process stand-in for the gateway.
//!
//! Clones share one state, so a test keeps a clone as its controller while
//! the pipeline owns another: script failures and status answers up front,
//! then inspect what was uploaded and finalized.

use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tracing::info;
use uuid::Uuid;

use super::RemoteStorage;
use super::protocol::{
    FinishUploadRequest, HeaderEntry, InitUploadResponse, StatusResponse, UploadSlot,
};
use crate::error::{Result, TransferError};

static PART_FILE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"<FileName>([^<]+\.\d{3}\.aes)</FileName>").expect("valid regex")
});

static PART_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\d{3}\.aes$").expect("valid regex"));

/// How upload slots are issued on init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotMode {
    /// One slot per declared part file, as the live gateway does.
    #[default]
    PerPart,
    /// One slot per document archive, shared by all its parts.
    PerDocument,
}

enum ScriptedStatus {
    Answer(StatusResponse),
    Failure(String),
}

#[derive(Default)]
struct SimState {
    slot_mode: SlotMode,
    statuses: VecDeque<ScriptedStatus>,
    fail_init: Option<String>,
    fail_finish: Option<String>,
    /// PUTs allowed to succeed before the next one fails.
    fail_put_after: Option<usize>,
    init_calls: usize,
    status_calls: usize,
    uploads: Vec<(String, Vec<u8>)>,
    finished: Vec<FinishUploadRequest>,
}

#[derive(Clone, Default)]
pub struct SimulatedStorage {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_slot_mode(&self, mode: SlotMode) {
        self.state().slot_mode = mode;
    }

    /// Queue the answer for the next status call.
    pub fn push_status(&self, code: i32, description: &str, upo: Option<&str>) {
        self.state()
            .statuses
            .push_back(ScriptedStatus::Answer(StatusResponse {
                code,
                description: Some(description.to_string()),
                upo: upo.map(str::to_string),
            }));
    }

    /// Queue a transport-level failure (HTTP 503 with `body`) for the next
    /// status call.
    pub fn push_status_failure(&self, body: &str) {
        self.state()
            .statuses
            .push_back(ScriptedStatus::Failure(body.to_string()));
    }

    pub fn fail_next_init(&self, body: &str) {
        self.state().fail_init = Some(body.to_string());
    }

    pub fn fail_next_finish(&self, body: &str) {
        self.state().fail_finish = Some(body.to_string());
    }

    /// Let `successes` more PUTs through, then fail exactly one.
    pub fn fail_put_after(&self, successes: usize) {
        self.state().fail_put_after = Some(successes);
    }

    pub fn init_calls(&self) -> usize {
        self.state().init_calls
    }

    pub fn status_calls(&self) -> usize {
        self.state().status_calls
    }

    /// Blob names in the order their PUTs succeeded.
    pub fn uploaded_blobs(&self) -> Vec<String> {
        self.state().uploads.iter().map(|(blob, _)| blob.clone()).collect()
    }

    /// Last body stored under `blob_name`.
    pub fn blob(&self, blob_name: &str) -> Option<Vec<u8>> {
        self.state()
            .uploads
            .iter()
            .rev()
            .find(|(blob, _)| blob == blob_name)
            .map(|(_, body)| body.clone())
    }

    pub fn finished(&self) -> Vec<FinishUploadRequest> {
        self.state().finished.clone()
    }
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// File names the metadata declares slots for, deduplicated, in order.
fn slot_file_names(metadata: &str, mode: SlotMode) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for capture in PART_FILE_NAME.captures_iter(metadata) {
        let part = unescape(&capture[1]);
        let name = match mode {
            SlotMode::PerPart => part,
            SlotMode::PerDocument => PART_SUFFIX.replace(&part, "").into_owned(),
        };
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

fn receipt(reference_number: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><Potwierdzenie><NumerReferencyjny>{reference_number}</NumerReferencyjny><Opis>Simulated receipt</Opis></Potwierdzenie>"#
    )
}

#[async_trait]
impl RemoteStorage for SimulatedStorage {
    async fn init_upload_signed(&self, signed_metadata: Vec<u8>) -> Result<InitUploadResponse> {
        let mut state = self.state();
        state.init_calls += 1;

        if let Some(body) = state.fail_init.take() {
            return Err(TransferError::RemoteProtocol {
                endpoint: "InitUploadSigned",
                status: 400,
                body,
            });
        }

        let metadata = String::from_utf8_lossy(&signed_metadata);
        let reference_number = format!("SIM-{}", Uuid::now_v7().simple());

        let slots: Vec<UploadSlot> = slot_file_names(&metadata, state.slot_mode)
            .into_iter()
            .map(|file_name| {
                let blob_name = Uuid::now_v7().to_string();
                UploadSlot {
                    url: format!("sim://blob/{blob_name}"),
                    header_list: vec![HeaderEntry {
                        key: "x-ms-blob-type".into(),
                        value: "BlockBlob".into(),
                    }],
                    file_name,
                    blob_name,
                }
            })
            .collect();

        info!(%reference_number, slots = slots.len(), "(SimulatedStorage) InitUploadSigned");

        let response = InitUploadResponse {
            reference_number,
            request_to_upload_file_list: slots,
            raw: String::new(),
        };
        let raw = serde_json::to_string(&response)?;
        Ok(InitUploadResponse { raw, ..response })
    }

    async fn put_chunk(&self, slot: &UploadSlot, body: Vec<u8>) -> Result<()> {
        let mut state = self.state();

        match state.fail_put_after {
            Some(0) => {
                state.fail_put_after = None;
                return Err(TransferError::ChunkUpload {
                    file: slot.file_name.clone(),
                    message: "HTTP 403: AuthenticationFailed".into(),
                });
            }
            Some(n) => state.fail_put_after = Some(n - 1),
            None => {}
        }

        state.uploads.push((slot.blob_name.clone(), body));
        Ok(())
    }

    async fn finish_upload(&self, request: &FinishUploadRequest) -> Result<()> {
        let mut state = self.state();

        if let Some(body) = state.fail_finish.take() {
            return Err(TransferError::RemoteProtocol {
                endpoint: "FinishUpload",
                status: 400,
                body,
            });
        }

        info!(
            reference_number = %request.reference_number,
            blobs = request.azure_blob_name_list.len(),
            "(SimulatedStorage) FinishUpload"
        );
        state.finished.push(request.clone());
        Ok(())
    }

    async fn status(&self, reference_number: &str) -> Result<StatusResponse> {
        let mut state = self.state();
        state.status_calls += 1;

        match state.statuses.pop_front() {
            Some(ScriptedStatus::Answer(answer)) => Ok(answer),
            Some(ScriptedStatus::Failure(body)) => Err(TransferError::RemoteProtocol {
                endpoint: "Status",
                status: 503,
                body,
            }),
            None => Ok(StatusResponse {
                code: 200,
                description: Some("Processing completed successfully".into()),
                upo: Some(receipt(reference_number)),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const METADATA: &str = r#"<InitUpload>
        <FileName>A&amp;B.xml</FileName>
        <FileName>A&amp;B.xml.zip.001.aes</FileName>
        <FileName>A&amp;B.xml.zip.002.aes</FileName>
        <FileName>C.xml</FileName>
        <FileName>C.xml.zip.001.aes</FileName>
    </InitUpload>"#;

    #[test]
    fn issues_slot_names_per_mode() {
        assert_eq!(
            slot_file_names(METADATA, SlotMode::PerPart),
            vec![
                "A&B.xml.zip.001.aes",
                "A&B.xml.zip.002.aes",
                "C.xml.zip.001.aes"
            ]
        );
        assert_eq!(
            slot_file_names(METADATA, SlotMode::PerDocument),
            vec!["A&B.xml.zip", "C.xml.zip"]
        );
    }

    #[tokio::test]
    async fn scripted_failures_fire_once() {
        let sim = SimulatedStorage::new();
        sim.fail_next_init("bad signature");

        assert!(sim.init_upload_signed(METADATA.as_bytes().to_vec()).await.is_err());
        let response = sim
            .init_upload_signed(METADATA.as_bytes().to_vec())
            .await
            .unwrap();
        assert_eq!(sim.init_calls(), 2);
        assert_eq!(response.request_to_upload_file_list.len(), 3);
        assert!(response.raw.contains(&response.reference_number));

        let slot = &response.request_to_upload_file_list[0];
        sim.fail_put_after(1);
        sim.put_chunk(slot, vec![1]).await.unwrap();
        assert!(sim.put_chunk(slot, vec![2]).await.is_err());
        sim.put_chunk(slot, vec![3]).await.unwrap();
        assert_eq!(sim.blob(&slot.blob_name), Some(vec![3]));
        assert_eq!(sim.uploaded_blobs().len(), 2);
    }

    #[tokio::test]
    async fn status_defaults_to_confirmation() {
        let sim = SimulatedStorage::new();
        sim.push_status(120, "Processing", None);
        sim.push_status_failure("gateway timeout");

        assert_eq!(sim.status("ref").await.unwrap().code, 120);
        assert!(sim.status("ref").await.is_err());

        let done = sim.status("ref").await.unwrap();
        assert_eq!(done.code, 200);
        assert!(done.upo.unwrap().contains("ref"));
        assert_eq!(sim.status_calls(), 3);
    }
}
