#![forbid(unsafe_code)]

use thiserror::Error;

/// Decryption errors.
#[derive(Debug, Error)]
pub enum DrmError {
    #[error("AES-128-CBC decryption failed: {0}")]
    DecryptFailed(String),

    #[error("Invalid key length: expected 16 bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("ciphertext length {0} is not aligned to the AES block size")]
    BlockAlignment(usize),

    #[error("decryption task was cancelled")]
    Cancelled,
}
