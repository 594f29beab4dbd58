#![forbid(unsafe_code)]

//! Whole-segment AES-128-CBC decryption in two modes.

use aes::Aes128;
use bytes::Bytes;
use cbc::{
    Decryptor,
    cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding},
};
use tracing::trace;

use crate::{AES_BLOCK_SIZE, DrmError, DrmResult};

/// Chained cipher state carried across progressive calls.
#[derive(Debug)]
struct CipherState {
    key: [u8; 16],
    /// IV for the next chunk: the last ciphertext block already consumed.
    next_iv: [u8; 16],
}

/// AES-128-CBC segment decrypter.
///
/// One instance serves a whole segment in one of two mutually exclusive
/// modes per call:
///
/// - **Progressive** ([`software_decrypt`](Self::software_decrypt)):
///   ciphertext arrives in arbitrary slices; whole 16-byte blocks are
///   decrypted as soon as they are available and any unaligned tail is
///   buffered. The most recent decrypted run is held back one call so that
///   [`flush`](Self::flush) can strip PKCS#7 padding from the true final
///   block. Concatenating the non-`None` returns therefore yields a strict
///   prefix of the plaintext; `flush` yields the remaining suffix.
/// - **Single-shot** ([`full_decrypt`](Self::full_decrypt)): the complete
///   segment ciphertext is decrypted and unpadded off the async runtime in
///   one blocking task.
#[derive(Debug, Default)]
pub struct Decrypter {
    /// Ciphertext tail shorter than one block, waiting for more data.
    remainder: Vec<u8>,
    /// Decrypted blocks withheld until the next call or flush.
    held: Option<Vec<u8>>,
    cipher: Option<CipherState>,
}

impl Decrypter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decrypt progressively, returning plaintext released by this call.
    ///
    /// Returns `None` while no full block is decryptable yet (the bytes are
    /// retained internally) and on the first call that produces output
    /// (that output is held for the next call or [`flush`](Self::flush)).
    /// The caller-supplied IV is only used when the cipher (re)starts;
    /// afterwards the chained IV takes precedence.
    pub fn software_decrypt(
        &mut self,
        data: &[u8],
        key: [u8; 16],
        iv: [u8; 16],
    ) -> Option<Bytes> {
        let rekey = match &self.cipher {
            Some(state) => state.key != key,
            None => true,
        };
        if rekey {
            self.remainder.clear();
            self.held = None;
            self.cipher = Some(CipherState { key, next_iv: iv });
        }

        let mut buf = std::mem::take(&mut self.remainder);
        buf.extend_from_slice(data);
        let aligned = buf.len() - buf.len() % AES_BLOCK_SIZE;
        if aligned == 0 {
            self.remainder = buf;
            return None;
        }
        self.remainder = buf.split_off(aligned);

        let state = self.cipher.as_mut()?;
        let chunk_iv = state.next_iv;
        state.next_iv.copy_from_slice(&buf[aligned - AES_BLOCK_SIZE..]);

        let decryptor = Decryptor::<Aes128>::new((&state.key).into(), (&chunk_iv).into());
        decryptor.decrypt_padded_mut::<NoPadding>(&mut buf).ok()?;
        trace!(
            decrypted = buf.len(),
            pending = self.remainder.len(),
            "progressive AES-128 chunk decrypted"
        );

        self.held.replace(buf).map(Bytes::from)
    }

    /// Drain the held plaintext at end of segment, stripping PKCS#7 padding.
    ///
    /// Returns `None` when nothing was decrypted or when an unaligned
    /// ciphertext remainder is still pending (the stream was truncated or
    /// corrupt). Always resets the cipher state.
    pub fn flush(&mut self) -> Option<Bytes> {
        if self.held.is_none() || !self.remainder.is_empty() {
            self.reset();
            return None;
        }
        let tail = self.held.take().map(remove_pkcs7_padding);
        self.reset();
        tail.map(Bytes::from)
    }

    /// True when ciphertext short of a whole block is still buffered.
    ///
    /// At end of segment this means the cipher stream was truncated:
    /// [`flush`](Self::flush) will yield nothing and the caller may want
    /// to report the loss.
    pub fn has_remainder(&self) -> bool {
        !self.remainder.is_empty()
    }

    /// Clear remainder, held output, and chained cipher state.
    pub fn reset(&mut self) {
        self.remainder.clear();
        self.held = None;
        self.cipher = None;
    }

    /// Decrypt a complete segment in one asynchronous shot.
    ///
    /// The ciphertext must be block-aligned; PKCS#7 padding is removed from
    /// the result. The CBC work runs on a blocking task so the async
    /// runtime is not stalled by large segments.
    pub async fn full_decrypt(
        &mut self,
        data: Bytes,
        key: [u8; 16],
        iv: [u8; 16],
    ) -> DrmResult<Bytes> {
        if data.len() % AES_BLOCK_SIZE != 0 {
            return Err(DrmError::BlockAlignment(data.len()));
        }
        let plaintext = tokio::task::spawn_blocking(move || {
            let mut buf = data.to_vec();
            let decryptor = Decryptor::<Aes128>::new((&key).into(), (&iv).into());
            decryptor
                .decrypt_padded_mut::<NoPadding>(&mut buf)
                .map_err(|e| DrmError::DecryptFailed(e.to_string()))?;
            Ok::<_, DrmError>(remove_pkcs7_padding(buf))
        })
        .await
        .map_err(|_| DrmError::Cancelled)??;
        trace!(decrypted = plaintext.len(), "full-segment AES-128 decrypted");
        Ok(Bytes::from(plaintext))
    }
}

/// Strip valid PKCS#7 padding; malformed padding leaves the data untouched.
fn remove_pkcs7_padding(mut data: Vec<u8>) -> Vec<u8> {
    if let Some(&last) = data.last() {
        let pad = last as usize;
        if (1..=AES_BLOCK_SIZE).contains(&pad)
            && pad <= data.len()
            && data[data.len() - pad..].iter().all(|&b| b == last)
        {
            data.truncate(data.len() - pad);
        }
    }
    data
}
