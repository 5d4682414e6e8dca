//! Packaging of a declaration before encryption.

use std::io::Write;
use std::path::Path;

use base64::{Engine, engine::general_purpose::STANDARD};
use deunicode::deunicode;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Characters of the document name kept in the archive name.
pub const ARCHIVE_STEM_CHARS: usize = 43;

/// Make an uploaded file name safe for the gateway: non-ASCII characters are
/// transliterated, whitespace and path separators become `_`.
pub fn normalize_file_name(name: &str) -> String {
    deunicode(name.trim())
        .chars()
        .map(|c| match c {
            c if c.is_whitespace() => '_',
            '/' | '\\' => '_',
            c => c,
        })
        .collect()
}

/// Archive name of a document: its first [`ARCHIVE_STEM_CHARS`] characters
/// plus `.zip`. Two documents of one transfer must not share it.
pub fn zip_archive_name(document_name: &str) -> String {
    let stem: String = document_name.chars().take(ARCHIVE_STEM_CHARS).collect();
    format!("{stem}.zip")
}

/// Base64 SHA-256, the hash format declared for original files.
pub fn sha256_base64(data: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(data))
}

/// Write a deflate zip at `dest` holding `content` as `entry_name`.
pub fn write_zip(content: &[u8], entry_name: &str, dest: &Path) -> Result<u64> {
    let file = std::fs::File::create(dest)?;
    let mut zip = zip::ZipWriter::new(file);

    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    zip.start_file(entry_name, options)?;
    zip.write_all(content)?;
    let file = zip.finish()?;
    file.sync_all()?;

    Ok(file.metadata()?.len())
}
