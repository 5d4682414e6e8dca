use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::state::TransferState;
use crate::error::TransferError;

/// Declaration family, sent as `DocumentType` in the InitUpload metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum JpkType {
    /// Documents sent cyclically
    #[default]
    #[serde(rename = "JPK")]
    #[value(name = "JPK")]
    Jpk,
    /// Ad-hoc sending of documents during an inspection
    #[serde(rename = "JPKAH")]
    #[value(name = "JPKAH")]
    Jpkah,
}

impl FromStr for JpkType {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "JPK" => Ok(Self::Jpk),
            "JPKAH" => Ok(Self::Jpkah),
            _ => Err(TransferError::validation(format!("unknown JPK type '{s}'"))),
        }
    }
}

impl JpkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Jpk => "JPK",
            Self::Jpkah => "JPKAH",
        }
    }
}

/// Form identification of a declaration, e.g. `JPK_VAT` / `JPK_V7M (1)` / `1-2E`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormCode {
    pub form_code: String,
    pub system_code: String,
    pub schema_version: String,
}

impl Default for FormCode {
    fn default() -> Self {
        Self {
            form_code: "JPK_VAT".to_string(),
            system_code: "JPK_V7M (1)".to_string(),
            schema_version: "1-2E".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transfer {
    pub id: String,
    pub name: String,
    pub jpk_type: JpkType,
    pub state: TransferState,
    pub active: bool,
    /// Base64 of the per-transfer AES key.
    pub secret_key: Option<String>,
    pub reference_number: Option<String>,
    pub last_description: Option<String>,
    pub error_description: Option<String>,
    pub initial_response: Option<String>,
    pub unsigned_metadata_id: Option<String>,
    pub signed_metadata_id: Option<String>,
    pub confirmation_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub name: String,
    pub jpk_type: JpkType,
}

#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub transfer_id: String,
    pub name: String,
    pub form: FormCode,
    pub original_file_id: String,
    pub zip_file_id: Option<String>,
    /// Base64 IV, unique per document.
    pub iv: Option<String>,
    /// Base64 SHA-256 of the original file.
    pub original_hash: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub transfer_id: String,
    pub name: String,
    pub form: FormCode,
    pub original_file_id: String,
}

/// A declaration file handed to the pipeline.
#[derive(Debug, Clone)]
pub struct DocumentUpload {
    pub file_name: String,
    pub data: Vec<u8>,
    pub form: FormCode,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilePart {
    pub id: String,
    pub document_id: String,
    pub part_number: u32,
    pub name: String,
    pub file_part_id: String,
    /// JSON of the upload slot issued for this part.
    pub cloud_meta: Option<String>,
    pub blob_name: Option<String>,
    pub uploaded: bool,
}

#[derive(Debug, Clone)]
pub struct NewFilePart {
    pub document_id: String,
    pub part_number: u32,
    pub name: String,
    pub file_part_id: String,
}

/// Stored binary attachment.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub id: String,
    pub name: String,
    pub content: Vec<u8>,
    pub hash: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferMessage {
    pub id: String,
    pub transfer_id: String,
    pub body: String,
    pub created_at: String,
}

/// Slot to be written onto a part once the gateway has answered init.
#[derive(Debug, Clone)]
pub struct SlotAssignment {
    pub part_id: String,
    pub cloud_meta: String,
    pub blob_name: String,
}
