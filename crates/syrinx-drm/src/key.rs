#![forbid(unsafe_code)]

//! Segment key model, as carried over from the playlist layer.

use bytes::Bytes;

use crate::{DrmError, DrmResult};

/// Encryption method declared for a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMethod {
    /// AES-128 CBC encryption of the whole segment.
    Aes128,
    /// Per-sample AES encryption (audio frames / video NAL payloads).
    SampleAes,
    /// Any other method, stored as a raw string.
    Other(String),
}

/// Key material attached to a segment by the caller.
///
/// Mirrors what an `#EXT-X-KEY` tag resolves to once the key URI has been
/// fetched: the key bytes and IV may each be missing independently.
#[derive(Debug, Clone)]
pub struct SegmentKey {
    /// The encryption method to be used.
    pub method: KeyMethod,
    /// The raw key, if it has been resolved.
    pub key: Option<Bytes>,
    /// The initialization vector, if specified.
    pub iv: Option<[u8; 16]>,
}

/// Fully resolved key data: method, key, and IV are all present.
///
/// Derived from a [`SegmentKey`] only when the segment payload is non-empty
/// and every field is populated; anything less means the segment is treated
/// as clear.
#[derive(Debug, Clone)]
pub struct KeyData {
    pub method: KeyMethod,
    pub key: Bytes,
    pub iv: [u8; 16],
}

impl KeyData {
    /// Derive key data for a segment payload, or `None` if the segment
    /// should be handled as clear.
    pub fn derive(payload: &[u8], key: Option<&SegmentKey>) -> Option<Self> {
        let key = key?;
        if payload.is_empty() {
            return None;
        }
        match (&key.key, &key.iv) {
            (Some(k), Some(iv)) => Some(Self {
                method: key.method.clone(),
                key: k.clone(),
                iv: *iv,
            }),
            _ => None,
        }
    }

    /// The key as a fixed 16-byte array, validating its length.
    pub fn key_bytes(&self) -> DrmResult<[u8; 16]> {
        self.key
            .as_ref()
            .try_into()
            .map_err(|_| DrmError::InvalidKeyLength(self.key.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_key(method: KeyMethod) -> SegmentKey {
        SegmentKey {
            method,
            key: Some(Bytes::from_static(&[0x42; 16])),
            iv: Some([0x13; 16]),
        }
    }

    #[test]
    fn derives_when_complete() {
        let key = full_key(KeyMethod::Aes128);
        let data = KeyData::derive(b"payload", Some(&key)).unwrap();
        assert_eq!(data.method, KeyMethod::Aes128);
        assert_eq!(data.key_bytes().unwrap(), [0x42; 16]);
        assert_eq!(data.iv, [0x13; 16]);
    }

    #[test]
    fn clear_when_payload_empty() {
        let key = full_key(KeyMethod::Aes128);
        assert!(KeyData::derive(b"", Some(&key)).is_none());
    }

    #[test]
    fn clear_when_iv_missing() {
        let key = SegmentKey {
            method: KeyMethod::Aes128,
            key: Some(Bytes::from_static(&[0x42; 16])),
            iv: None,
        };
        assert!(KeyData::derive(b"payload", Some(&key)).is_none());
    }

    #[test]
    fn clear_when_no_key_supplied() {
        assert!(KeyData::derive(b"payload", None).is_none());
    }

    #[test]
    fn short_key_is_rejected() {
        let data = KeyData {
            method: KeyMethod::Aes128,
            key: Bytes::from_static(&[1, 2, 3]),
            iv: [0; 16],
        };
        assert!(matches!(
            data.key_bytes(),
            Err(DrmError::InvalidKeyLength(3))
        ));
    }
}
