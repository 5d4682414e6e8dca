//! The upload pipeline for one transfer: prepare (zip, encrypt, chunk,
//! render metadata), then send (init, per-part PUT, finalize).
//!
//! Every step is explicit composition of the encryptor, the metadata
//! renderer, the storage client and the database. Steps invoked in a state
//! that does not allow them return `Ok` without doing anything.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use base64::{Engine, engine::general_purpose::STANDARD};
use tokio::sync::mpsc;
use tracing::{Instrument, debug, info, info_span, warn};

use super::archive;
use super::encryptor::{ChunkEncryptor, StagedPart};
use super::keys;
use super::metadata::{self, DocumentEntry, InitUploadContext, PartEntry, Template};
use super::models::{
    Artifact, Document, DocumentUpload, JpkType, NewDocument, NewFilePart, NewTransfer,
    SlotAssignment, Transfer,
};
use super::poller::StatusPoller;
use super::state::{TransferState, Transition};
use crate::config::TransferSettings;
use crate::context::AppContext;
use crate::db::{self, artifacts::NewArtifact};
use crate::error::{Result, TransferError};
use crate::remote::{FinishUploadRequest, UploadSlot};

#[derive(Clone)]
pub struct TransferPipeline {
    ctx: AppContext,
}

fn join_error(e: tokio::task::JoinError) -> TransferError {
    TransferError::Io(std::io::Error::other(e))
}

impl TransferPipeline {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    fn settings(&self) -> &TransferSettings {
        &self.ctx.config.settings
    }

    pub async fn load(&self, transfer_id: &str) -> Result<Transfer> {
        db::transfers::get(&self.ctx.db, transfer_id.to_string())
            .await?
            .ok_or_else(|| TransferError::NotFound(transfer_id.to_string()))
    }

    pub async fn create_transfer(&self, name: &str, jpk_type: JpkType) -> Result<Transfer> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TransferError::validation("JPK Transfer name is required"));
        }

        let transfer = db::transfers::create(
            &self.ctx.db,
            NewTransfer {
                name: name.to_string(),
                jpk_type,
            },
        )
        .await?;

        info!(transfer_id = %transfer.id, name, "Transfer created");
        Ok(transfer)
    }

    /// Attach a declaration to a draft transfer. The file name is normalized
    /// for the gateway; length and uniqueness are checked when preparing.
    pub async fn add_document(&self, transfer_id: &str, upload: DocumentUpload) -> Result<Document> {
        let transfer = self.load(transfer_id).await?;
        if transfer.state != TransferState::Draft {
            return Err(TransferError::validation(
                "Documents can only be added to draft JPK Transfers.",
            ));
        }

        let name = archive::normalize_file_name(&upload.file_name);
        if name.is_empty() {
            return Err(TransferError::validation("Document file name is required"));
        }

        let hash = archive::sha256_base64(&upload.data);
        let original_file_id = db::artifacts::create(
            &self.ctx.db,
            NewArtifact::new(name.clone(), upload.data).with_hash(hash),
        )
        .await?;

        let document = db::documents::create(
            &self.ctx.db,
            NewDocument {
                transfer_id: transfer.id.clone(),
                name,
                form: upload.form,
                original_file_id,
            },
        )
        .await?;

        info!(transfer_id = %transfer.id, document = %document.name, "Document attached");
        Ok(document)
    }

    pub async fn create_with_document(
        &self,
        name: &str,
        jpk_type: JpkType,
        upload: DocumentUpload,
    ) -> Result<(Transfer, Document)> {
        let transfer = self.create_transfer(name, jpk_type).await?;
        let document = self.add_document(&transfer.id, upload).await?;
        Ok((transfer, document))
    }

    pub async fn documents(&self, transfer_id: &str) -> Result<Vec<Document>> {
        Ok(db::documents::list_for_transfer(&self.ctx.db, transfer_id.to_string()).await?)
    }

    /// Checks the transfer's documents against the gateway's naming rules and
    /// returns them in upload order.
    pub async fn validate_documents(&self, transfer_id: &str) -> Result<Vec<Document>> {
        let documents = self.documents(transfer_id).await?;
        validate_names(&documents, self.settings())?;
        Ok(documents)
    }

    /// Prepare a draft transfer: zip and encrypt every document into parts,
    /// wrap the transfer key and render the unsigned metadata. Moves the
    /// transfer to `to_sign`.
    pub async fn create_transfer_request(&self, transfer_id: &str) -> Result<()> {
        let _guard = self.ctx.locks.acquire(transfer_id).await;

        let transfer = self.load(transfer_id).await?;
        if !transfer.state.can_initialize() {
            debug!(transfer_id, state = %transfer.state, "Not a draft, nothing to prepare");
            return Ok(());
        }

        let span = info_span!("prepare", transfer_id = %transfer.id);
        self.prepare(transfer).instrument(span).await
    }

    async fn prepare(&self, transfer: Transfer) -> Result<()> {
        let settings = self.settings().clone();
        settings.validate()?;

        let documents = self.validate_documents(&transfer.id).await?;
        let public_key = {
            let path = settings.public_key_path()?;
            let pem = tokio::fs::read(path).await.map_err(|e| {
                TransferError::validation(format!(
                    "Cannot read gateway public key {}: {e}",
                    path.display()
                ))
            })?;
            keys::load_public_key(&pem)?
        };

        // Leftovers of an interrupted run
        db::documents::reset_encryption(&self.ctx.db, transfer.id.clone()).await?;

        info!(documents = documents.len(), "Preparing transfer");

        let secret = keys::generate_secret(settings.key_size);
        let metadata_id = match self
            .encrypt_documents(&transfer, &documents, &secret, &public_key, &settings)
            .await
        {
            Ok(metadata_id) => metadata_id,
            Err(e) => {
                if let Err(cleanup) =
                    db::documents::reset_encryption(&self.ctx.db, transfer.id.clone()).await
                {
                    warn!(error = %cleanup, "Failed to drop partial encryption output");
                }
                return Err(e);
            }
        };

        db::transfers::mark_prepared(
            &self.ctx.db,
            transfer.id.clone(),
            STANDARD.encode(&secret),
            metadata_id,
        )
        .await?;
        db::transfers::add_message(
            &self.ctx.db,
            transfer.id.clone(),
            "Unsigned metadata generated, waiting for signature".to_string(),
        )
        .await?;

        info!("Transfer prepared, waiting for signature");
        Ok(())
    }

    /// Encrypts every document and stores the rendered unsigned metadata.
    /// Returns the metadata artifact id.
    async fn encrypt_documents(
        &self,
        transfer: &Transfer,
        documents: &[Document],
        secret: &[u8],
        public_key: &rsa::RsaPublicKey,
        settings: &TransferSettings,
    ) -> Result<String> {
        let staging = tempfile::tempdir()?;

        let mut entries = Vec::with_capacity(documents.len());
        for document in documents {
            let entry = self
                .encrypt_document(document, secret, settings, staging.path())
                .instrument(info_span!("document", name = %document.name))
                .await?;
            entries.push(entry);
        }

        let context = InitUploadContext {
            jpk_type: transfer.jpk_type,
            encryption_key: keys::wrap_key(public_key, secret)?,
            key_bits: settings.key_bits(),
            block_size: settings.block_size,
            iv_size: settings.iv_size,
            documents: entries,
        };
        let xml = metadata::render(Template::InitUpload, &context);

        Ok(db::artifacts::create(
            &self.ctx.db,
            NewArtifact::new(Template::InitUpload.file_name(), xml.into_bytes()),
        )
        .await?)
    }

    async fn encrypt_document(
        &self,
        document: &Document,
        secret: &[u8],
        settings: &TransferSettings,
        staging: &Path,
    ) -> Result<DocumentEntry> {
        let original = db::artifacts::content(&self.ctx.db, document.original_file_id.clone()).await?;
        let content_length = original.len() as u64;
        let original_hash = archive::sha256_base64(&original);
        let iv = keys::generate_secret(settings.iv_size);

        let zip_name = archive::zip_archive_name(&document.name);
        let zip_path = staging.join(&zip_name);

        let zip_bytes = {
            let entry_name = document.name.clone();
            let path = zip_path.clone();
            tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
                archive::write_zip(&original, &entry_name, &path)?;
                Ok(std::fs::read(&path)?)
            })
            .await
            .map_err(join_error)??
        };
        debug!(archive = %zip_name, size = zip_bytes.len(), "Archive written");

        let zip_hash = archive::sha256_base64(&zip_bytes);
        let zip_file_id = db::artifacts::create(
            &self.ctx.db,
            NewArtifact::new(zip_name.clone(), zip_bytes).with_hash(zip_hash),
        )
        .await?;

        // Linked before encrypting so an interrupted run can be reset
        let iv_text = STANDARD.encode(&iv);
        db::documents::set_encryption(
            &self.ctx.db,
            document.id.clone(),
            zip_file_id,
            iv_text.clone(),
            original_hash.clone(),
        )
        .await?;

        let (tx, mut rx) = mpsc::channel::<Result<StagedPart>>(1);
        let worker = spawn_encryptor(
            zip_path,
            secret.to_vec(),
            iv,
            settings.max_chunk_size,
            staging.to_path_buf(),
            zip_name,
            tx,
        );

        let stored = self.store_parts(document, &mut rx).await;
        let parts = join_encryptor(stored, rx, worker).await?;

        info!(parts = parts.len(), "Document encrypted");

        Ok(DocumentEntry {
            form: document.form.clone(),
            file_name: document.name.clone(),
            content_length,
            hash: original_hash,
            iv: iv_text,
            parts,
        })
    }

    /// Persists each staged part as it arrives and removes its staging file.
    async fn store_parts(
        &self,
        document: &Document,
        rx: &mut mpsc::Receiver<Result<StagedPart>>,
    ) -> Result<Vec<PartEntry>> {
        let mut parts = Vec::new();
        while let Some(staged) = rx.recv().await {
            let staged = staged?;
            let bytes = tokio::fs::read(&staged.path).await?;

            let file_part_id = db::artifacts::create(
                &self.ctx.db,
                NewArtifact::new(staged.file_name.clone(), bytes).with_hash(staged.digest.clone()),
            )
            .await?;
            db::documents::create_part(
                &self.ctx.db,
                NewFilePart {
                    document_id: document.id.clone(),
                    part_number: staged.part_number,
                    name: staged.file_name.clone(),
                    file_part_id,
                },
            )
            .await?;
            tokio::fs::remove_file(&staged.path).await?;

            parts.push(PartEntry {
                ordinal: staged.part_number,
                file_name: staged.file_name,
                content_length: staged.size,
                hash: staged.digest,
            });
        }
        Ok(parts)
    }

    pub async fn unsigned_metadata(&self, transfer_id: &str) -> Result<Option<Artifact>> {
        let transfer = self.load(transfer_id).await?;
        match transfer.unsigned_metadata_id {
            Some(id) => Ok(Some(db::artifacts::get(&self.ctx.db, id).await?)),
            None => Ok(None),
        }
    }

    /// Store the externally signed metadata for a transfer awaiting signature.
    pub async fn attach_signed_metadata(
        &self,
        transfer_id: &str,
        file_name: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let transfer = self.load(transfer_id).await?;
        if transfer.state != TransferState::ToSign {
            return Err(TransferError::validation(
                "Signed metadata can only be attached to JPK Transfers waiting for signature.",
            ));
        }
        if content.is_empty() {
            return Err(TransferError::validation("Signed metadata file is empty"));
        }

        let hash = archive::sha256_base64(&content);
        let artifact_id = db::artifacts::create(
            &self.ctx.db,
            NewArtifact::new(file_name, content).with_hash(hash),
        )
        .await?;
        db::transfers::set_signed_metadata(&self.ctx.db, transfer.id.clone(), artifact_id).await?;

        info!(transfer_id = %transfer.id, file = file_name, "Signed metadata attached");
        Ok(())
    }

    /// Initialize the upload (unless a reference number already exists),
    /// upload every part not yet uploaded, finalize and poll once.
    pub async fn send_initial_request(&self, transfer_id: &str) -> Result<()> {
        let _guard = self.ctx.locks.acquire(transfer_id).await;

        let transfer = self.load(transfer_id).await?;
        if !transfer.state.can_send() {
            debug!(transfer_id, state = %transfer.state, "Not waiting for upload, nothing to send");
            return Ok(());
        }

        let span = info_span!("send", transfer_id = %transfer.id);
        self.send(transfer).instrument(span).await
    }

    async fn send(&self, transfer: Transfer) -> Result<()> {
        match &transfer.reference_number {
            Some(reference_number) => {
                info!(%reference_number, "Resuming upload");
            }
            None => {
                self.initialize_upload(&transfer).await?;
            }
        }

        let parts = db::documents::parts_for_transfer(&self.ctx.db, transfer.id.clone()).await?;
        let pending: Vec<_> = parts.into_iter().filter(|p| !p.uploaded).collect();
        info!(pending = pending.len(), "Uploading parts");

        for part in &pending {
            self.upload_file_part(part).await?;
        }

        self.check_transfer_completeness(&transfer.id).await?;
        Ok(())
    }

    async fn initialize_upload(&self, transfer: &Transfer) -> Result<String> {
        let signed_id = transfer.signed_metadata_id.clone().ok_or_else(|| {
            TransferError::validation("Signed metadata is missing, sign the unsigned metadata first")
        })?;
        let signed = db::artifacts::content(&self.ctx.db, signed_id).await?;

        let response = self.ctx.remote.init_upload_signed(signed).await?;
        if response.reference_number.is_empty() {
            return Err(TransferError::RemoteProtocol {
                endpoint: "InitUploadSigned",
                status: 200,
                body: response.raw,
            });
        }

        let documents = self.documents(&transfer.id).await?;
        let parts = db::documents::parts_for_transfer(&self.ctx.db, transfer.id.clone()).await?;

        let slots: HashMap<&str, &UploadSlot> = response
            .request_to_upload_file_list
            .iter()
            .map(|slot| (slot.file_name.as_str(), slot))
            .collect();
        let archive_names: HashMap<&str, String> = documents
            .iter()
            .map(|d| (d.id.as_str(), archive::zip_archive_name(&d.name)))
            .collect();

        let mut assignments = Vec::with_capacity(parts.len());
        for part in &parts {
            let slot = slots
                .get(part.name.as_str())
                .or_else(|| {
                    archive_names
                        .get(part.document_id.as_str())
                        .and_then(|archive| slots.get(archive.as_str()))
                })
                .ok_or_else(|| TransferError::MissingUploadSlot(part.name.clone()))?;

            assignments.push(SlotAssignment {
                part_id: part.id.clone(),
                cloud_meta: serde_json::to_string(slot)?,
                blob_name: slot.blob_name.clone(),
            });
        }

        let reference_number = response.reference_number.clone();
        db::transfers::record_init_response(
            &self.ctx.db,
            transfer.id.clone(),
            reference_number.clone(),
            response.raw,
            assignments,
        )
        .await?;
        db::transfers::add_message(
            &self.ctx.db,
            transfer.id.clone(),
            format!("Upload initialized, reference number {reference_number}"),
        )
        .await?;

        info!(%reference_number, slots = slots.len(), "Upload initialized");
        Ok(reference_number)
    }

    async fn upload_file_part(&self, part: &super::models::FilePart) -> Result<()> {
        let cloud_meta = part
            .cloud_meta
            .as_deref()
            .ok_or_else(|| TransferError::MissingUploadSlot(part.name.clone()))?;
        let slot: UploadSlot = serde_json::from_str(cloud_meta)?;
        let body = db::artifacts::content(&self.ctx.db, part.file_part_id.clone()).await?;

        self.ctx.remote.put_chunk(&slot, body).await?;
        db::documents::mark_uploaded(&self.ctx.db, part.id.clone()).await?;

        info!(part = part.part_number, file = %part.name, blob = %slot.blob_name, "Part uploaded");
        Ok(())
    }

    /// Finalize once every part of every document is uploaded. Returns
    /// whether the finalize request was sent. Callers hold the transfer lock.
    pub async fn check_transfer_completeness(&self, transfer_id: &str) -> Result<bool> {
        let transfer = self.load(transfer_id).await?;
        if !transfer.state.can_send() {
            return Ok(false);
        }

        let parts = db::documents::parts_for_transfer(&self.ctx.db, transfer.id.clone()).await?;
        let missing = parts.iter().filter(|p| !p.uploaded).count();
        if parts.is_empty() || missing > 0 {
            debug!(transfer_id, missing, "Upload incomplete");
            return Ok(false);
        }

        self.send_final_request(&transfer).await?;
        Ok(true)
    }

    /// POST the blob names (document order, then part order) for the
    /// reference number, move to `sent` and poll once.
    pub async fn send_final_request(&self, transfer: &Transfer) -> Result<()> {
        let reference_number = transfer.reference_number.clone().ok_or_else(|| {
            TransferError::validation("JPK Transfer has no reference number, initialize the upload first")
        })?;

        let parts = db::documents::parts_for_transfer(&self.ctx.db, transfer.id.clone()).await?;
        let azure_blob_name_list = parts
            .into_iter()
            .map(|p| p.blob_name.ok_or(TransferError::MissingUploadSlot(p.name)))
            .collect::<Result<Vec<_>>>()?;

        let request = FinishUploadRequest {
            reference_number,
            azure_blob_name_list,
        };
        self.ctx.remote.finish_upload(&request).await?;

        db::transfers::transition(&self.ctx.db, transfer.id.clone(), Transition::Sent).await?;
        db::transfers::add_message(
            &self.ctx.db,
            transfer.id.clone(),
            "Upload finished, waiting for processing".to_string(),
        )
        .await?;
        info!(blobs = request.azure_blob_name_list.len(), "Upload finalized");

        StatusPoller::new(self.ctx.clone())
            .poll_transfer(&transfer.id)
            .await?;
        Ok(())
    }

    /// Manually decline a transfer that has not been sent yet.
    pub async fn abandon(&self, transfer_id: &str) -> Result<bool> {
        let _guard = self.ctx.locks.acquire(transfer_id).await;

        let transfer = self.load(transfer_id).await?;
        if !transfer.state.can_abandon() {
            return Ok(false);
        }

        let declined =
            db::transfers::transition(&self.ctx.db, transfer.id.clone(), Transition::Abandoned)
                .await?;
        if declined {
            db::transfers::add_message(&self.ctx.db, transfer.id.clone(), "Transfer abandoned".into())
                .await?;
            info!(transfer_id, "Transfer abandoned");
        }
        Ok(declined)
    }

    pub async fn delete(&self, transfer_id: &str) -> Result<()> {
        let _guard = self.ctx.locks.acquire(transfer_id).await;

        let transfer = self.load(transfer_id).await?;
        if !transfer.state.can_delete() {
            return Err(TransferError::validation(
                "You can only delete declined JPK Transfers.",
            ));
        }

        db::transfers::delete(&self.ctx.db, transfer.id).await?;
        info!(transfer_id, "Transfer deleted");
        Ok(())
    }

    pub async fn archive(&self, transfer_id: &str) -> Result<()> {
        let transfer = self.load(transfer_id).await?;
        if !transfer.state.can_archive() {
            return Err(TransferError::validation(
                "You can only archive confirmed and declined JPK Transfers.",
            ));
        }

        db::transfers::set_active(&self.ctx.db, transfer.id, false).await?;
        info!(transfer_id, "Transfer archived");
        Ok(())
    }

    pub async fn unarchive(&self, transfer_id: &str) -> Result<()> {
        let transfer = self.load(transfer_id).await?;
        db::transfers::set_active(&self.ctx.db, transfer.id, true).await?;
        Ok(())
    }
}

fn spawn_encryptor(
    archive_path: PathBuf,
    key: Vec<u8>,
    iv: Vec<u8>,
    max_chunk_size: u64,
    staging_dir: PathBuf,
    archive_name: String,
    tx: mpsc::Sender<Result<StagedPart>>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let encryptor = File::open(&archive_path)
            .map_err(TransferError::from)
            .and_then(|file| {
                ChunkEncryptor::new(file, &key, &iv, max_chunk_size, &staging_dir, &archive_name)
            });

        let encryptor = match encryptor {
            Ok(encryptor) => encryptor,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        for part in encryptor {
            // Receiver gone: the pipeline already failed
            if tx.blocking_send(part).is_err() {
                break;
            }
        }
    })
}

/// Stops the encryptor by closing its channel and waits for it, so nothing
/// writes to the staging directory once this returns. The consumer's result
/// wins over a failed join.
async fn join_encryptor<T>(
    result: Result<T>,
    rx: mpsc::Receiver<Result<StagedPart>>,
    worker: tokio::task::JoinHandle<()>,
) -> Result<T> {
    drop(rx);
    let joined = worker.await.map_err(join_error);
    let value = result?;
    joined?;
    Ok(value)
}

fn validate_names(documents: &[Document], settings: &TransferSettings) -> Result<()> {
    if documents.is_empty() {
        return Err(TransferError::validation("JPK Transfer has no documents to send"));
    }

    let mut seen = std::collections::HashSet::new();
    if !documents.iter().all(|d| seen.insert(d.name.as_str())) {
        return Err(TransferError::validation(
            "Selected files do not have unique file names!",
        ));
    }

    let mut archives = std::collections::HashSet::new();
    for document in documents {
        if !archives.insert(archive::zip_archive_name(&document.name)) {
            return Err(TransferError::validation(format!(
                "File {} shares its first {} characters with another file, \
                 archive names must be unique",
                document.name,
                archive::ARCHIVE_STEM_CHARS
            )));
        }
    }

    for document in documents {
        let len = document.name.chars().count();
        if len < settings.min_filename_length {
            return Err(TransferError::validation(format!(
                "File {} has too short name, minimum is {}",
                document.name, settings.min_filename_length
            )));
        }
        if len > settings.max_filename_length {
            return Err(TransferError::validation(format!(
                "File {} has too long name, maximum is {}",
                document.name, settings.max_filename_length
            )));
        }
    }

    Ok(())
}
