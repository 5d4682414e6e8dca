//! Streaming AES-CBC encryption of a document archive into size-bounded parts.
//!
//! Every part is an independent CBC stream started from the document IV and
//! closed with PKCS#7 padding, so each `.aes` file decrypts on its own. Part
//! boundaries are decided by plaintext bytes consumed: every part except the
//! last carries exactly `max_chunk_size` plaintext bytes, and padding adds
//! between 1 and 16 bytes to each part.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use aes::{Aes128, Aes192, Aes256};
use base64::{Engine, engine::general_purpose::STANDARD};
use cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit, block_padding::Pkcs7,
    generic_array::GenericArray,
};
use md5::{Digest, Md5};
use tracing::debug;

use crate::config::AES_BLOCK_SIZE;
use crate::error::{Result, TransferError};

/// Read granularity for the archive stream.
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Digest algorithm declared for parts in the upload metadata.
pub const PART_DIGEST_ALGORITHM: &str = "MD5";

/// One encrypted part, written to the staging directory.
#[derive(Debug, Clone)]
pub struct StagedPart {
    pub part_number: u32,
    pub file_name: String,
    pub path: PathBuf,
    /// Ciphertext length in bytes.
    pub size: u64,
    /// Plaintext bytes of the archive covered by this part.
    pub plaintext_size: u64,
    /// Base64 MD5 of the ciphertext.
    pub digest: String,
}

/// `<archive>.<NNN>.aes`, the name the gateway knows a part by.
pub fn part_file_name(archive_name: &str, part_number: u32) -> String {
    format!("{archive_name}.{part_number:03}.aes")
}

/// Number of parts an archive of `len` bytes is split into.
pub fn expected_part_count(len: u64, max_chunk_size: u64) -> u64 {
    len.div_ceil(max_chunk_size).max(1)
}

/// Lazy sequence of [`StagedPart`]s for one archive.
///
/// A part's file is flushed and synced before the next part is started.
/// The staging directory belongs to the caller, which removes it.
pub struct ChunkEncryptor<R> {
    reader: R,
    key: Vec<u8>,
    iv: Vec<u8>,
    max_chunk_size: u64,
    staging_dir: PathBuf,
    archive_name: String,
    buffer: Vec<u8>,
    /// Bytes sitting in `buffer` from probing for more input.
    lookahead: usize,
    next_part: u32,
    done: bool,
}

impl<R: Read> ChunkEncryptor<R> {
    pub fn new(
        reader: R,
        key: &[u8],
        iv: &[u8],
        max_chunk_size: u64,
        staging_dir: &Path,
        archive_name: &str,
    ) -> Result<Self> {
        if max_chunk_size == 0 {
            return Err(TransferError::validation("Maximum chunk size must be positive"));
        }
        // Fail on bad key material before any file is created.
        CbcEncryptor::new(key, iv)?;

        Ok(Self {
            reader,
            key: key.to_vec(),
            iv: iv.to_vec(),
            max_chunk_size,
            staging_dir: staging_dir.to_path_buf(),
            archive_name: archive_name.to_string(),
            buffer: vec![0u8; READ_BUFFER_SIZE],
            lookahead: 0,
            next_part: 1,
            done: false,
        })
    }

    fn read_budget(&self, remaining: u64) -> usize {
        remaining.min(READ_BUFFER_SIZE as u64) as usize
    }

    fn read_some(&mut self, len: usize) -> io::Result<usize> {
        loop {
            match self.reader.read(&mut self.buffer[..len]) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                other => return other,
            }
        }
    }

    fn encrypt_part(&mut self, part_number: u32) -> Result<StagedPart> {
        let file_name = part_file_name(&self.archive_name, part_number);
        let path = self.staging_dir.join(&file_name);
        let mut writer = BufWriter::new(File::create(&path)?);

        let mut cipher = PartCipher::new(&self.key, &self.iv)?;
        let mut hasher = Md5::new();
        let mut out = Vec::with_capacity(READ_BUFFER_SIZE + AES_BLOCK_SIZE);
        let mut plaintext_size: u64 = 0;
        let mut size: u64 = 0;

        while plaintext_size < self.max_chunk_size {
            let n = if self.lookahead > 0 {
                std::mem::take(&mut self.lookahead)
            } else {
                let want = self.read_budget(self.max_chunk_size - plaintext_size);
                self.read_some(want)?
            };

            if n == 0 {
                self.done = true;
                break;
            }

            out.clear();
            cipher.update(&self.buffer[..n], &mut out);
            hasher.update(&out);
            writer.write_all(&out)?;

            plaintext_size += n as u64;
            size += out.len() as u64;
        }

        let tail = cipher.finalize();
        hasher.update(&tail);
        writer.write_all(&tail)?;
        size += tail.len() as u64;

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        debug!(
            part = part_number,
            file = %file_name,
            plaintext_size,
            size,
            "Encrypted part staged"
        );

        Ok(StagedPart {
            part_number,
            file_name,
            path,
            size,
            plaintext_size,
            digest: STANDARD.encode(hasher.finalize()),
        })
    }
}

impl<R: Read> Iterator for ChunkEncryptor<R> {
    type Item = Result<StagedPart>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // The first part always exists (an empty archive still yields a
        // padding-only part); later parts only if input remains.
        if self.next_part > 1 {
            let probe = self.read_budget(self.max_chunk_size);
            match self.read_some(probe) {
                Ok(0) => {
                    self.done = true;
                    return None;
                }
                Ok(n) => self.lookahead = n,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
            }
        }

        let part_number = self.next_part;
        self.next_part += 1;

        let result = self.encrypt_part(part_number);
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Decrypt one part and strip its padding.
pub fn decrypt_part(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let invalid = |_| TransferError::Crypto("invalid key or IV length".to_string());
    let unpad = |_| TransferError::Crypto("invalid PKCS#7 padding".to_string());

    match key.len() {
        16 => cbc::Decryptor::<Aes128>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        24 => cbc::Decryptor::<Aes192>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        32 => cbc::Decryptor::<Aes256>::new_from_slices(key, iv)
            .map_err(invalid)?
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(unpad),
        n => Err(TransferError::Crypto(format!("unsupported AES key length {n}"))),
    }
}

enum CbcEncryptor {
    Aes128(cbc::Encryptor<Aes128>),
    Aes192(cbc::Encryptor<Aes192>),
    Aes256(cbc::Encryptor<Aes256>),
}

impl CbcEncryptor {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        let invalid = |_| {
            TransferError::Crypto(format!(
                "invalid IV length {} for AES-CBC",
                iv.len()
            ))
        };

        match key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(key, iv)
                .map(Self::Aes128)
                .map_err(invalid),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(key, iv)
                .map(Self::Aes192)
                .map_err(invalid),
            32 => cbc::Encryptor::<Aes256>::new_from_slices(key, iv)
                .map(Self::Aes256)
                .map_err(invalid),
            n => Err(TransferError::Crypto(format!("unsupported AES key length {n}"))),
        }
    }

    /// `data` must be a whole number of blocks.
    fn encrypt_blocks(&mut self, data: &mut [u8]) {
        for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(block);
            match self {
                Self::Aes128(c) => c.encrypt_block_mut(block),
                Self::Aes192(c) => c.encrypt_block_mut(block),
                Self::Aes256(c) => c.encrypt_block_mut(block),
            }
        }
    }

    fn finish_padded(self, tail: &[u8]) -> Vec<u8> {
        match self {
            Self::Aes128(c) => c.encrypt_padded_vec_mut::<Pkcs7>(tail),
            Self::Aes192(c) => c.encrypt_padded_vec_mut::<Pkcs7>(tail),
            Self::Aes256(c) => c.encrypt_padded_vec_mut::<Pkcs7>(tail),
        }
    }
}

/// CBC encryptor that accepts arbitrary-length updates.
struct PartCipher {
    inner: CbcEncryptor,
    pending: Vec<u8>,
}

impl PartCipher {
    fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        Ok(Self {
            inner: CbcEncryptor::new(key, iv)?,
            pending: Vec::with_capacity(AES_BLOCK_SIZE),
        })
    }

    fn update(&mut self, data: &[u8], out: &mut Vec<u8>) {
        self.pending.extend_from_slice(data);
        let whole = self.pending.len() - self.pending.len() % AES_BLOCK_SIZE;
        if whole == 0 {
            return;
        }

        let start = out.len();
        out.extend_from_slice(&self.pending[..whole]);
        self.pending.drain(..whole);
        self.inner.encrypt_blocks(&mut out[start..]);
    }

    fn finalize(self) -> Vec<u8> {
        self.inner.finish_padded(&self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const KEY: [u8; 32] = [7u8; 32];
    const IV: [u8; 16] = [9u8; 16];

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn encrypt_all(data: &[u8], max_chunk_size: u64, dir: &Path) -> Vec<StagedPart> {
        ChunkEncryptor::new(data, &KEY, &IV, max_chunk_size, dir, "doc.zip")
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    /// Reader that hands out at most `step` bytes per call.
    struct TrickleReader<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for TrickleReader<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn splits_130k_into_three_parts_at_60k() {
        let temp = tempdir().unwrap();
        let data = sample(130 * 1024);

        let parts = encrypt_all(&data, 60 * 1024, temp.path());

        assert_eq!(parts.len(), 3);
        assert_eq!(
            parts.iter().map(|p| p.part_number).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(parts[0].plaintext_size, 60 * 1024);
        assert_eq!(parts[1].plaintext_size, 60 * 1024);
        assert_eq!(parts[2].plaintext_size, 10 * 1024);
        // block-aligned plaintext gets a full padding block
        assert_eq!(parts[0].size, 60 * 1024 + 16);
        assert_eq!(parts[2].size, 10 * 1024 + 16);
        assert_eq!(parts[0].file_name, "doc.zip.001.aes");
        assert_eq!(parts[2].file_name, "doc.zip.003.aes");
    }

    #[test]
    fn empty_archive_yields_single_padding_part() {
        let temp = tempdir().unwrap();
        let parts = encrypt_all(&[], 1024, temp.path());

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].size, 16);
        assert_eq!(parts[0].plaintext_size, 0);

        let ciphertext = std::fs::read(&parts[0].path).unwrap();
        assert!(decrypt_part(&KEY, &IV, &ciphertext).unwrap().is_empty());
    }

    #[test]
    fn part_count_is_ceiling_of_size_over_chunk() {
        let temp = tempdir().unwrap();
        for (len, max) in [(1000usize, 1000u64), (1001, 1000), (3000, 1000), (5, 64)] {
            let dir = temp.path().join(format!("{len}-{max}"));
            std::fs::create_dir(&dir).unwrap();
            let parts = encrypt_all(&sample(len), max, &dir);
            assert_eq!(
                parts.len() as u64,
                expected_part_count(len as u64, max),
                "len={len} max={max}"
            );
        }
        assert_eq!(expected_part_count(0, 10), 1);
    }

    #[test]
    fn decrypting_parts_reproduces_archive() {
        let temp = tempdir().unwrap();
        let data = sample(200 * 1024 + 7);

        for max in [17u64, 64 * 1024, 100 * 1024] {
            let dir = temp.path().join(max.to_string());
            std::fs::create_dir(&dir).unwrap();

            let mut restored = Vec::new();
            for part in encrypt_all(&data, max, &dir) {
                let ciphertext = std::fs::read(&part.path).unwrap();
                restored.extend(decrypt_part(&KEY, &IV, &ciphertext).unwrap());
            }
            assert_eq!(restored, data, "max={max}");
        }
    }

    #[test]
    fn fixed_key_and_iv_is_deterministic() {
        let temp = tempdir().unwrap();
        let (a, b) = (temp.path().join("a"), temp.path().join("b"));
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let data = sample(90 * 1024);

        let first = encrypt_all(&data, 32 * 1024, &a);
        let second = encrypt_all(&data, 32 * 1024, &b);

        assert_eq!(first.len(), second.len());
        for (x, y) in first.iter().zip(&second) {
            assert_eq!(x.digest, y.digest);
            assert_eq!(
                std::fs::read(&x.path).unwrap(),
                std::fs::read(&y.path).unwrap()
            );
        }
    }

    #[test]
    fn short_reads_do_not_move_boundaries() {
        let temp = tempdir().unwrap();
        let (a, b) = (temp.path().join("a"), temp.path().join("b"));
        std::fs::create_dir(&a).unwrap();
        std::fs::create_dir(&b).unwrap();
        let data = sample(70 * 1024);

        let whole = encrypt_all(&data, 30 * 1024, &a);
        let trickled: Vec<_> = ChunkEncryptor::new(
            TrickleReader {
                data: &data,
                step: 999,
            },
            &KEY,
            &IV,
            30 * 1024,
            &b,
            "doc.zip",
        )
        .unwrap()
        .collect::<Result<_>>()
        .unwrap();

        assert_eq!(whole.len(), trickled.len());
        for (x, y) in whole.iter().zip(&trickled) {
            assert_eq!(x.plaintext_size, y.plaintext_size);
            assert_eq!(x.digest, y.digest);
        }
    }

    #[test]
    fn digest_is_md5_of_ciphertext() {
        let temp = tempdir().unwrap();
        let parts = encrypt_all(&sample(5000), 4096, temp.path());

        for part in parts {
            let bytes = std::fs::read(&part.path).unwrap();
            assert_eq!(bytes.len() as u64, part.size);
            assert_eq!(part.digest, STANDARD.encode(Md5::digest(&bytes)));
        }
    }

    #[test]
    fn supports_shorter_keys() {
        let temp = tempdir().unwrap();
        let key = [3u8; 16];
        let data = sample(100);

        let parts: Vec<_> = ChunkEncryptor::new(&data[..], &key, &IV, 64, temp.path(), "k.zip")
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(parts.len(), 2);

        let mut restored = Vec::new();
        for part in parts {
            restored.extend(decrypt_part(&key, &IV, &std::fs::read(&part.path).unwrap()).unwrap());
        }
        assert_eq!(restored, data);
    }

    #[test]
    fn rejects_bad_key_material() {
        let temp = tempdir().unwrap();
        assert!(ChunkEncryptor::new(&b""[..], &[0u8; 20], &IV, 10, temp.path(), "x").is_err());
        assert!(ChunkEncryptor::new(&b""[..], &KEY, &[0u8; 8], 10, temp.path(), "x").is_err());
        assert!(ChunkEncryptor::new(&b""[..], &KEY, &IV, 0, temp.path(), "x").is_err());
    }
}
