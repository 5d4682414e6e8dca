//! Key material: per-transfer secrets and wrapping for the gateway.

use base64::{Engine, engine::general_purpose::STANDARD};
use rand::RngCore;
use rand::rngs::OsRng;
use rsa::{Pkcs1v15Encrypt, RsaPublicKey, pkcs8::DecodePublicKey};
use x509_cert::{
    Certificate,
    der::{DecodePem, Encode},
};

use crate::error::{Result, TransferError};

/// Fresh random bytes from the OS generator. Used for transfer keys and IVs,
/// never reused.
pub fn generate_secret(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Parse the gateway key: a PEM X.509 certificate, or a bare PEM public key.
pub fn load_public_key(pem: &[u8]) -> Result<RsaPublicKey> {
    let text = std::str::from_utf8(pem)
        .map_err(|_| TransferError::validation("Gateway public key is not a PEM file"))?;

    if text.contains("BEGIN CERTIFICATE") {
        let certificate = Certificate::from_pem(pem)
            .map_err(|e| TransferError::Crypto(format!("invalid gateway certificate: {e}")))?;
        let spki = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| TransferError::Crypto(format!("invalid certificate key info: {e}")))?;
        RsaPublicKey::from_public_key_der(&spki)
            .map_err(|e| TransferError::Crypto(format!("gateway certificate key is not RSA: {e}")))
    } else {
        RsaPublicKey::from_public_key_pem(text)
            .map_err(|e| TransferError::Crypto(format!("invalid gateway public key: {e}")))
    }
}

/// RSA PKCS#1 v1.5 encryption of `secret`, base64 encoded.
pub fn wrap_key(public_key: &RsaPublicKey, secret: &[u8]) -> Result<String> {
    let wrapped = public_key
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, secret)
        .map_err(|e| TransferError::Crypto(format!("key wrapping failed: {e}")))?;
    Ok(STANDARD.encode(wrapped))
}
