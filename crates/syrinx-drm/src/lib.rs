#![forbid(unsafe_code)]

//! AES-128 decryption support for the syrinx transmuxing pipeline.
//!
//! Two independent layers:
//!
//! - [`Decrypter`]: whole-segment AES-128-CBC, either progressively
//!   (synchronous, block-aligned chunks as they arrive) or as a single
//!   asynchronous shot over the full segment.
//! - [`sample_aes`]: per-sample decryption for SAMPLE-AES streams, where
//!   individual audio frames and video NAL units carry their own encrypted
//!   block runs while the container plumbing stays in the clear.

mod decrypter;
mod error;
mod key;
pub mod sample_aes;

pub use decrypter::Decrypter;
pub use error::DrmError;
pub use key::{KeyData, KeyMethod, SegmentKey};

/// AES block size in bytes.
pub const AES_BLOCK_SIZE: usize = 16;

/// Result alias for decryption operations.
pub type DrmResult<T> = Result<T, DrmError>;
