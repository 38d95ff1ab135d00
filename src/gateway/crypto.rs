//! Hashing helpers shared by auth, billing and telemetry.

use std::sync::atomic::{AtomicU64, Ordering};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

/// First `len` hex chars of the SHA-256 digest.
pub fn short_hash(value: &str, len: usize) -> String {
    let mut digest = sha256_hex(value.as_bytes());
    digest.truncate(len.min(digest.len()));
    digest
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length; the error arm is unreachable for Sha256.
    match HmacSha256::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Sha256::digest([key, data].concat()).to_vec(),
    }
}

pub fn hmac_sha256_verify(key: &[u8], data: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(key) else {
        return false;
    };
    mac.update(data);
    mac.verify_slice(signature).is_ok()
}

/// `hex(HMAC-SHA256(secret, "type:id"))`, the only subject identity kept in audit rows.
pub fn anonymize_subject(secret: &str, subject_key: &str) -> String {
    hex_encode(&hmac_sha256(secret.as_bytes(), subject_key.as_bytes()))
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn new_request_id() -> String {
    let mut bytes = [0u8; 16];
    if getrandom::fill(&mut bytes).is_err() {
        let ts_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|duration| duration.as_millis())
            .unwrap_or(0);
        let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
        return format!("req_{ts_ms}_{seq}");
    }
    format!("req_{}", hex_encode(&bytes))
}
