//! End-to-end transmuxer scenarios: probing, progressive ingest,
//! decryption, and state transitions across segments.

use std::sync::Arc;

use bytes::Bytes;
use syrinx_transmux::{
    ChunkMetadata, Event, EventBus, KeyMethod, MonotonicClock, SegmentKey, StreamKind,
    TransmuxConfig, TransmuxEvent, TransmuxState, Transmuxer, TransmuxerOptions, TypeSupported,
};

mod support {
    use bytes::Bytes;

    pub const PACKET_LEN: usize = 188;
    pub const PMT_PID: u16 = 0x0100;
    pub const AUDIO_PID: u16 = 0x0101;

    /// ADTS frame: AAC-LC, 44.1 kHz, mono, `payload_len` payload bytes.
    pub fn adts_frame(payload_len: usize) -> Vec<u8> {
        let frame_len = payload_len + 7;
        let mut frame = vec![
            0xFF,
            0xF1,
            (0x01 << 6) | (4 << 2),
            0x40 | ((frame_len >> 11) & 0x03) as u8,
            ((frame_len >> 3) & 0xFF) as u8,
            (((frame_len & 0x07) << 5) | 0x1F) as u8,
            0xFC,
        ];
        frame.extend(std::iter::repeat_n(0xA5u8, payload_len));
        frame
    }

    fn packet(pid: u16, pusi: bool, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= PACKET_LEN - 4);
        let mut p = vec![
            0x47,
            (if pusi { 0x40 } else { 0 }) | ((pid >> 8) as u8 & 0x1F),
            (pid & 0xFF) as u8,
            0x10,
        ];
        p.extend_from_slice(payload);
        p.resize(PACKET_LEN, 0xFF);
        p
    }

    fn pat_packet() -> Vec<u8> {
        let mut table = vec![0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00];
        table.extend_from_slice(&[0x00, 0x01]);
        table.extend_from_slice(&[0xE0 | (PMT_PID >> 8) as u8, (PMT_PID & 0xFF) as u8]);
        table.extend_from_slice(&[0, 0, 0, 0]);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&table);
        packet(0, true, &payload)
    }

    fn pmt_packet() -> Vec<u8> {
        // one AAC/ADTS elementary stream
        let es = [
            0x0F,
            0xE0 | (AUDIO_PID >> 8) as u8,
            (AUDIO_PID & 0xFF) as u8,
            0xF0,
            0x00,
        ];
        let section_len = 9 + es.len() + 4;
        let mut table = vec![
            0x02,
            0xB0 | ((section_len >> 8) as u8 & 0x0F),
            (section_len & 0xFF) as u8,
            0x00,
            0x01,
            0xC1,
            0x00,
            0x00,
            0xE0 | (AUDIO_PID >> 8) as u8,
            (AUDIO_PID & 0xFF) as u8,
            0xF0,
            0x00,
        ];
        table.extend_from_slice(&es);
        table.extend_from_slice(&[0, 0, 0, 0]);
        let mut payload = vec![0u8];
        payload.extend_from_slice(&table);
        packet(PMT_PID, true, &payload)
    }

    fn write_pts(pts: i64) -> [u8; 5] {
        [
            0x21 | (((pts >> 30) & 0x07) as u8) << 1,
            ((pts >> 22) & 0xFF) as u8,
            0x01 | (((pts >> 15) & 0x7F) as u8) << 1,
            ((pts >> 7) & 0xFF) as u8,
            0x01 | ((pts & 0x7F) as u8) << 1,
        ]
    }

    fn pes_packet(pid: u16, pts: i64, payload: &[u8]) -> Vec<u8> {
        let mut pes = vec![0x00, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x80, 0x80, 0x05];
        pes.extend_from_slice(&write_pts(pts));
        pes.extend_from_slice(payload);
        let mut out = Vec::new();
        for (i, chunk) in pes.chunks(PACKET_LEN - 4).enumerate() {
            out.extend(packet(pid, i == 0, chunk));
        }
        out
    }

    /// Audio-only transport stream: PAT, PMT, then `pes_count` PES packets
    /// carrying two copies of `frame` each.
    pub fn ts_segment_with_frames(frame: &[u8], pes_count: usize, base_pts: i64) -> Vec<u8> {
        let mut stream = pat_packet();
        stream.extend(pmt_packet());
        for i in 0..pes_count {
            let mut frames = frame.to_vec();
            frames.extend_from_slice(frame);
            stream.extend(pes_packet(
                AUDIO_PID,
                base_pts + i as i64 * 2 * 2089,
                &frames,
            ));
        }
        stream
    }

    /// Audio-only transport stream of clear AAC frames.
    pub fn aac_ts_segment(pes_count: usize, base_pts: i64) -> Vec<u8> {
        ts_segment_with_frames(&adts_frame(64), pes_count, base_pts)
    }

    /// Elementary ADTS segment of `frames` AAC frames.
    pub fn adts_segment(frames: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for _ in 0..frames {
            out.extend(adts_frame(64));
        }
        out
    }

    /// A fragmented-MP4 init segment plus one video media fragment.
    pub fn fmp4_init_and_media(base_time: u64) -> (Bytes, Bytes) {
        use syrinx_remux::mp4_generator::{self, FragmentSample, SAMPLE_FLAGS_SYNC, TrackSpec};

        let sps = [Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAA])];
        let pps = [Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80])];
        let init = mp4_generator::init_segment(&[TrackSpec::Video {
            id: 1,
            timescale: 90_000,
            duration: 0,
            width: 1280,
            height: 720,
            sps: &sps,
            pps: &pps,
        }]);

        let samples = [FragmentSample {
            duration: 3_000,
            size: 96,
            flags: SAMPLE_FLAGS_SYNC,
            cts: 0,
        }; 30];
        let media = mp4_generator::fragment(
            1,
            1,
            base_time,
            &samples,
            &vec![0x42u8; 30 * 96],
            true,
        );
        (init, media)
    }

    pub fn aes_encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
        use aes::Aes128;
        use cbc::{
            Encryptor,
            cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7},
        };
        let padded = plaintext.len() + (16 - plaintext.len() % 16);
        let mut buf = vec![0u8; padded];
        buf[..plaintext.len()].copy_from_slice(plaintext);
        Encryptor::<Aes128>::new(key.into(), iv.into())
            .encrypt_padded_mut::<Pkcs7>(&mut buf, plaintext.len())
            .expect("encrypt")
            .to_vec()
    }
}

fn transmuxer(observer: &EventBus) -> Transmuxer {
    Transmuxer::new(
        observer.clone(),
        TransmuxerOptions::default(),
        TypeSupported::default(),
        "syrinx-tests",
        StreamKind::Main,
        Arc::new(MonotonicClock::new()),
    )
}

fn meta(sn: u64, size: usize) -> ChunkMetadata {
    ChunkMetadata::new(0, sn, -1, size)
}

fn fresh_state(time_offset: f64) -> TransmuxState {
    TransmuxState::new(false, false, true, false, time_offset, false)
}

#[tokio::test]
async fn plain_fmp4_single_push() {
    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);
    let (init, media) = support::fmp4_init_and_media(0);
    assert!(media.len() >= 1024);

    tx.configure(TransmuxConfig {
        init_segment_data: Some(init),
        duration: 10.0,
        ..TransmuxConfig::default()
    });

    let result = tx
        .push(media.clone(), None, meta(0, media.len()), Some(fresh_state(0.0)))
        .await
        .unwrap();
    let video = result.remux_result.video.expect("passthrough track");
    assert_eq!(video.data, media);
    assert!(result.remux_result.init_segment.is_some());

    let flushed = tx.flush(meta(0, 0)).await.unwrap();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].remux_result.audio.is_none());
    assert!(flushed[0].remux_result.video.is_none());
}

#[tokio::test]
async fn ts_three_chunk_progressive() {
    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);
    let stream = support::aac_ts_segment(5, 900_000);
    assert!(stream.len() >= 1200);

    let first = tx
        .push(
            Bytes::copy_from_slice(&stream[..300]),
            None,
            meta(1, 300),
            Some(fresh_state(0.0)),
        )
        .await
        .unwrap();
    assert!(first.remux_result.is_empty());

    let second = tx
        .push(
            Bytes::copy_from_slice(&stream[300..600]),
            None,
            meta(1, 300),
            None,
        )
        .await
        .unwrap();
    assert!(second.remux_result.is_empty());

    let third = tx
        .push(
            Bytes::copy_from_slice(&stream[600..]),
            None,
            meta(1, stream.len() - 600),
            None,
        )
        .await
        .unwrap();
    let audio = third.remux_result.audio.expect("audio fragment");
    assert_eq!(audio.sample_count, 10);
    assert!(third.remux_result.init_segment.is_some());

    let flushed = tx.flush(meta(1, 0)).await.unwrap();
    assert_eq!(flushed.len(), 1);
}

#[tokio::test]
async fn aes128_software_chunked() {
    let key = [0x42u8; 16];
    let iv = [0x13u8; 16];
    let plaintext = support::adts_segment(15);
    assert!(plaintext.len() >= 1024);
    let ciphertext = support::aes_encrypt(&plaintext, &key, &iv);

    let segment_key = SegmentKey {
        method: KeyMethod::Aes128,
        key: Some(Bytes::copy_from_slice(&key)),
        iv: Some(iv),
    };

    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);

    // a sub-block first chunk exercises remainder buffering
    let first = tx
        .push(
            Bytes::copy_from_slice(&ciphertext[..8]),
            Some(segment_key.clone()),
            meta(2, 8),
            Some(fresh_state(0.0)),
        )
        .await
        .unwrap();
    assert!(first.remux_result.is_empty());

    let mut total_samples = 0usize;
    for chunk in ciphertext[8..].chunks(512) {
        let result = tx
            .push(
                Bytes::copy_from_slice(chunk),
                Some(segment_key.clone()),
                meta(2, chunk.len()),
                None,
            )
            .await
            .unwrap();
        if let Some(audio) = result.remux_result.audio {
            total_samples += audio.sample_count;
        }
    }

    let flushed = tx.flush(meta(2, 0)).await.unwrap();
    assert!(!flushed.is_empty());
    for result in &flushed {
        if let Some(audio) = &result.remux_result.audio {
            total_samples += audio.sample_count;
        }
    }
    assert_eq!(total_samples, 15);
}

#[tokio::test]
async fn truncated_cipher_stream_reports_nonfatal_decrypt_error_at_flush() {
    let key = [0x42u8; 16];
    let iv = [0x13u8; 16];
    let ciphertext = support::aes_encrypt(&support::adts_segment(15), &key, &iv);

    let segment_key = SegmentKey {
        method: KeyMethod::Aes128,
        key: Some(Bytes::copy_from_slice(&key)),
        iv: Some(iv),
    };

    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let mut tx = transmuxer(&bus);

    // lose the tail of the segment: 37 bytes leaves a 5-byte partial block
    let result = tx
        .push(
            Bytes::copy_from_slice(&ciphertext[..37]),
            Some(segment_key),
            meta(11, 37),
            Some(fresh_state(0.0)),
        )
        .await
        .unwrap();
    assert!(result.remux_result.is_empty());

    let flushed = tx.flush(meta(11, 0)).await.unwrap();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].remux_result.is_empty());

    let event = rx.try_recv().expect("decrypt loss reported");
    let Event::Transmux(TransmuxEvent::Error {
        kind,
        details,
        fatal,
        ..
    }) = event;
    assert_eq!(kind, syrinx_transmux::ErrorKind::Media);
    assert_eq!(details, syrinx_transmux::ErrorDetails::FragDecrypt);
    assert!(!fatal);
}

#[tokio::test]
async fn sample_aes_ts_push_resolves() {
    use aes::Aes128;
    use cbc::{
        Encryptor,
        cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding},
    };

    let key = [0x24u8; 16];
    let iv = [0x42u8; 16];

    // encrypt one AAC frame payload past its 16-byte clear lead-in, then
    // build a transport stream carrying it
    let mut frame = support::adts_frame(64);
    {
        let region = &mut frame[7 + 16..7 + 64];
        let n = region.len();
        let _ = Encryptor::<Aes128>::new((&key).into(), (&iv).into())
            .encrypt_padded_mut::<NoPadding>(region, n);
    }
    let stream = support::ts_segment_with_frames(&frame, 5, 90_000);

    let segment_key = SegmentKey {
        method: KeyMethod::SampleAes,
        key: Some(Bytes::copy_from_slice(&key)),
        iv: Some(iv),
    };

    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);
    let result = tx
        .push(
            Bytes::from(stream),
            Some(segment_key),
            meta(3, 0),
            Some(fresh_state(1.0)),
        )
        .await
        .unwrap();
    let audio = result.remux_result.audio.expect("decrypted audio fragment");
    assert_eq!(audio.sample_count, 10);

    let flushed = tx.flush(meta(3, 0)).await.unwrap();
    assert_eq!(flushed.len(), 1);
}

#[tokio::test]
async fn unknown_content_reports_fatal_parse_error_at_flush() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let mut tx = transmuxer(&bus);

    let junk = Bytes::from(vec![0x55u8; 4096]);
    let result = tx
        .push(junk, None, meta(4, 4096), Some(fresh_state(0.0)))
        .await
        .unwrap();
    assert!(result.remux_result.is_empty());

    let flushed = tx.flush(meta(4, 0)).await.unwrap();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].remux_result.is_empty());

    let event = rx.try_recv().expect("fatal event published");
    let Event::Transmux(TransmuxEvent::Error {
        fatal, details, ..
    }) = event;
    assert!(fatal);
    assert_eq!(details, syrinx_transmux::ErrorDetails::FragParsing);
}

#[tokio::test]
async fn discontinuity_switches_container_family() {
    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);

    let ts = support::aac_ts_segment(5, 0);
    let first = tx
        .push(
            Bytes::from(ts),
            None,
            meta(5, 0),
            Some(fresh_state(0.0)),
        )
        .await
        .unwrap();
    assert!(first.remux_result.audio.is_some());

    // new segment family arrives with discontinuity + track switch
    let (init, media) = support::fmp4_init_and_media(90_000);
    tx.configure(TransmuxConfig {
        init_segment_data: Some(init),
        duration: 10.0,
        ..TransmuxConfig::default()
    });
    let state = TransmuxState::new(true, false, true, true, 1.0, true);
    let second = tx
        .push(media.clone(), None, meta(6, media.len()), Some(state))
        .await
        .unwrap();
    let video = second.remux_result.video.expect("fmp4 passthrough output");
    assert_eq!(video.data, media);
    assert!(second.remux_result.init_segment.is_some());
}

#[tokio::test]
async fn results_are_stamped_and_monotonic() {
    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);
    let (init, media) = support::fmp4_init_and_media(0);
    tx.configure(TransmuxConfig {
        init_segment_data: Some(init),
        ..TransmuxConfig::default()
    });

    let result = tx
        .push(media, None, meta(7, 0), Some(fresh_state(0.0)))
        .await
        .unwrap();
    let timing = result.chunk_meta.transmuxing;
    assert!(timing.execute_end >= timing.execute_start);

    let flushed = tx.flush(meta(7, 0)).await.unwrap();
    for result in flushed {
        let timing = result.chunk_meta.transmuxing;
        assert!(timing.execute_end >= timing.execute_start);
    }
}

#[tokio::test]
async fn destroy_silences_the_transmuxer() {
    let bus = EventBus::default();
    let mut rx = bus.subscribe();
    let mut tx = transmuxer(&bus);

    let stream = support::aac_ts_segment(5, 0);
    let first = tx
        .push(
            Bytes::from(stream.clone()),
            None,
            meta(8, 0),
            Some(fresh_state(0.0)),
        )
        .await
        .unwrap();
    assert!(!first.remux_result.is_empty());

    tx.destroy();
    let after = tx
        .push(Bytes::from(stream), None, meta(9, 0), None)
        .await
        .unwrap();
    assert!(after.remux_result.is_empty());

    let flushed = tx.flush(meta(9, 0)).await.unwrap();
    assert_eq!(flushed.len(), 1);
    assert!(flushed[0].remux_result.is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn repeated_configure_is_observationally_idempotent() {
    let bus = EventBus::default();
    let mut tx = transmuxer(&bus);
    let (init, media) = support::fmp4_init_and_media(0);

    let config = TransmuxConfig {
        init_segment_data: Some(init),
        duration: 10.0,
        ..TransmuxConfig::default()
    };
    tx.configure(config.clone());
    tx.configure(config);

    let result = tx
        .push(media.clone(), None, meta(10, 0), Some(fresh_state(0.0)))
        .await
        .unwrap();
    assert_eq!(result.remux_result.video.expect("video").data, media);
}
