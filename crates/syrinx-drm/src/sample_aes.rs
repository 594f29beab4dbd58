#![forbid(unsafe_code)]

//! Per-sample decryption for SAMPLE-AES streams.
//!
//! SAMPLE-AES leaves the container plumbing in the clear and encrypts only
//! the elementary payloads: audio frames keep a 16-byte clear lead-in and
//! encrypt the whole trailing block run; video NAL payloads keep a 32-byte
//! lead-in and encrypt one of every ten 16-byte blocks. CBC chaining runs
//! across the encrypted blocks of a single sample and restarts at the
//! segment IV for the next one.

use aes::Aes128;
use bytes::{Bytes, BytesMut};
use cbc::{
    Decryptor,
    cipher::{BlockDecryptMut, KeyIvInit, block_padding::NoPadding},
};

use crate::{AES_BLOCK_SIZE, DrmError, DrmResult};

/// Clear lead-in before the encrypted region of an audio frame.
const AUDIO_CLEAR_LEAD: usize = 16;
/// Clear lead-in before the patterned region of a video NAL payload.
const VIDEO_CLEAR_LEAD: usize = 32;
/// One encrypted block followed by nine clear ones.
const VIDEO_PATTERN_STRIDE: usize = AES_BLOCK_SIZE * 10;

/// Which SAMPLE-AES layout a payload uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    /// Audio frame (ADTS payload without its header).
    Audio,
    /// Video NAL unit payload.
    Video,
}

/// Decrypt one sample payload in place.
pub fn decrypt_sample(kind: SampleKind, data: &mut [u8], key: [u8; 16], iv: [u8; 16]) {
    match kind {
        SampleKind::Audio => decrypt_audio_frame(data, key, iv),
        SampleKind::Video => decrypt_video_unit(data, key, iv),
    }
}

/// Decrypt a batch of sample payloads on a blocking task.
///
/// The demuxer hands over the encrypted payloads it collected and receives
/// them back decrypted, in order.
pub async fn decrypt_samples(
    kind: SampleKind,
    payloads: Vec<Bytes>,
    key: [u8; 16],
    iv: [u8; 16],
) -> DrmResult<Vec<Bytes>> {
    tokio::task::spawn_blocking(move || {
        payloads
            .into_iter()
            .map(|payload| {
                let mut buf = BytesMut::from(payload.as_ref());
                decrypt_sample(kind, &mut buf, key, iv);
                buf.freeze()
            })
            .collect()
    })
    .await
    .map_err(|_| DrmError::Cancelled)
}

fn decrypt_audio_frame(data: &mut [u8], key: [u8; 16], iv: [u8; 16]) {
    if data.len() <= AUDIO_CLEAR_LEAD {
        return;
    }
    let run = (data.len() - AUDIO_CLEAR_LEAD) / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
    if run == 0 {
        return;
    }
    let region = &mut data[AUDIO_CLEAR_LEAD..AUDIO_CLEAR_LEAD + run];
    let decryptor = Decryptor::<Aes128>::new((&key).into(), (&iv).into());
    // aligned NoPadding decrypt cannot fail
    let _ = decryptor.decrypt_padded_mut::<NoPadding>(region);
}

fn decrypt_video_unit(data: &mut [u8], key: [u8; 16], iv: [u8; 16]) {
    let mut chain = iv;
    let mut offset = VIDEO_CLEAR_LEAD;
    while offset + AES_BLOCK_SIZE <= data.len() {
        let mut cipher_block = [0u8; AES_BLOCK_SIZE];
        cipher_block.copy_from_slice(&data[offset..offset + AES_BLOCK_SIZE]);

        let block = &mut data[offset..offset + AES_BLOCK_SIZE];
        let decryptor = Decryptor::<Aes128>::new((&key).into(), (&chain).into());
        let _ = decryptor.decrypt_padded_mut::<NoPadding>(block);

        chain = cipher_block;
        offset += VIDEO_PATTERN_STRIDE;
    }
}
