#![forbid(unsafe_code)]

//! MPEG-TS demuxing: PAT/PMT discovery, PES assembly, and elementary
//! stream extraction for AVC video, AAC/MP3 audio, and ID3 metadata.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use syrinx_drm::{KeyData, sample_aes};
use syrinx_events::{ErrorDetails, ErrorKind, EventBus, TransmuxEvent};
use tracing::{debug, trace, warn};

use crate::{
    AudioCodecKind, Demuxer, DemuxError, DemuxerResult, MPEG_TS_TIMESCALE, MediaTimestamp,
    MetadataSample, TypeSupported, UserdataSample, VideoSample, adts, mpa,
};

/// Transport packet size.
pub const PACKET_LEN: usize = 188;

/// Bytes the probe wants: five packets to confirm sync-byte cadence.
pub const MIN_PROBE_LEN: usize = 5 * PACKET_LEN;

const SYNC_BYTE: u8 = 0x47;

// PMT stream types
const STREAM_TYPE_MPEG1_AUDIO: u8 = 0x03;
const STREAM_TYPE_MPEG2_AUDIO: u8 = 0x04;
const STREAM_TYPE_AAC_ADTS: u8 = 0x0F;
const STREAM_TYPE_METADATA: u8 = 0x15;
const STREAM_TYPE_H264: u8 = 0x1B;

/// Container probe: five consecutive sync bytes at packet stride, allowing
/// the stream to start mid-packet.
pub fn probe(data: &[u8]) -> bool {
    sync_offset(data).is_some()
}

fn sync_offset(data: &[u8]) -> Option<usize> {
    if data.len() < MIN_PROBE_LEN {
        return None;
    }
    let scan = (data.len() - MIN_PROBE_LEN).min(PACKET_LEN);
    (0..=scan).find(|&i| (0..5).all(|k| data[i + k * PACKET_LEN] == SYNC_BYTE))
}

/// One partially assembled PES packet.
#[derive(Debug, Default)]
struct PesBuffer {
    chunks: Vec<Bytes>,
    len: usize,
}

impl PesBuffer {
    fn push(&mut self, data: Bytes) {
        self.len += data.len();
        self.chunks.push(data);
    }

    fn take(&mut self) -> Option<Vec<u8>> {
        if self.chunks.is_empty() {
            return None;
        }
        let mut buf = Vec::with_capacity(self.len);
        for chunk in self.chunks.drain(..) {
            buf.extend_from_slice(&chunk);
        }
        self.len = 0;
        Some(buf)
    }
}

/// A parsed PES packet.
struct Pes {
    pts: Option<i64>,
    dts: Option<i64>,
    payload: Bytes,
}

fn parse_pes(raw: Vec<u8>) -> Option<Pes> {
    if raw.len() < 9 || raw[0] != 0 || raw[1] != 0 || raw[2] != 1 {
        return None;
    }
    let flags = raw[7];
    let header_len = usize::from(raw[8]);
    let mut pts = None;
    let mut dts = None;
    if flags & 0x80 != 0 && raw.len() >= 14 {
        pts = Some(read_timestamp(&raw[9..14]));
        if flags & 0x40 != 0 && raw.len() >= 19 {
            dts = Some(read_timestamp(&raw[14..19]));
        }
    }
    let start = 9 + header_len;
    if start > raw.len() {
        return None;
    }
    Some(Pes {
        pts,
        dts,
        payload: Bytes::from(raw).slice(start..),
    })
}

/// 33-bit timestamp packed into 5 bytes.
fn read_timestamp(b: &[u8]) -> i64 {
    (i64::from(b[0] & 0x0E) << 29)
        | (i64::from(b[1]) << 22)
        | (i64::from(b[2] & 0xFE) << 14)
        | (i64::from(b[3]) << 7)
        | i64::from(b[4] >> 1)
}

/// Split an Annex-B byte stream into NAL unit payloads.
fn split_nal_units(data: &[u8]) -> Vec<Bytes> {
    let mut units = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0usize;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                units.push(Bytes::copy_from_slice(&data[s..code_start]));
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start
        && s < data.len()
    {
        units.push(Bytes::copy_from_slice(&data[s..]));
    }
    units
}

/// Demuxer for MPEG transport streams.
pub struct TsDemuxer {
    observer: EventBus,
    type_supported: TypeSupported,
    pmt_pid: Option<u16>,
    video_pid: Option<u16>,
    audio_pid: Option<u16>,
    id3_pid: Option<u16>,
    audio_kind: AudioCodecKind,
    video_pes: PesBuffer,
    audio_pes: PesBuffer,
    id3_pes: PesBuffer,
    /// Trailing partial transport packet carried between chunks.
    packet_remainder: BytesMut,
    sps: Vec<Bytes>,
    pps: Vec<Bytes>,
    video_codec: Option<String>,
    audio_codec_hint: Option<String>,
    last_video_dts: Option<i64>,
}

impl TsDemuxer {
    pub fn new(observer: EventBus, type_supported: TypeSupported) -> Self {
        Self {
            observer,
            type_supported,
            pmt_pid: None,
            video_pid: None,
            audio_pid: None,
            id3_pid: None,
            audio_kind: AudioCodecKind::Aac,
            video_pes: PesBuffer::default(),
            audio_pes: PesBuffer::default(),
            id3_pes: PesBuffer::default(),
            packet_remainder: BytesMut::new(),
            sps: Vec::new(),
            pps: Vec::new(),
            video_codec: None,
            audio_codec_hint: None,
            last_video_dts: None,
        }
    }

    fn parse_pat(&mut self, payload: &[u8], pusi: bool) {
        let section = section_bytes(payload, pusi);
        let Some(section) = section else { return };
        if section.len() < 12 {
            return;
        }
        let section_len = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
        let end = (3 + section_len).saturating_sub(4).min(section.len());
        let mut pos = 8;
        while pos + 4 <= end {
            let program = (u16::from(section[pos]) << 8) | u16::from(section[pos + 1]);
            let pid = ((u16::from(section[pos + 2]) & 0x1F) << 8) | u16::from(section[pos + 3]);
            if program != 0 {
                if self.pmt_pid != Some(pid) {
                    debug!(pmt_pid = pid, "program map table located");
                }
                self.pmt_pid = Some(pid);
                return;
            }
            pos += 4;
        }
    }

    fn parse_pmt(&mut self, payload: &[u8], pusi: bool) {
        let Some(section) = section_bytes(payload, pusi) else {
            return;
        };
        if section.len() < 12 {
            return;
        }
        let section_len = (usize::from(section[1] & 0x0F) << 8) | usize::from(section[2]);
        let end = (3 + section_len).saturating_sub(4).min(section.len());
        let program_info_len = (usize::from(section[10] & 0x0F) << 8) | usize::from(section[11]);
        let mut pos = 12 + program_info_len;
        while pos + 5 <= end {
            let stream_type = section[pos];
            let pid = ((u16::from(section[pos + 1]) & 0x1F) << 8) | u16::from(section[pos + 2]);
            let es_info_len =
                (usize::from(section[pos + 3] & 0x0F) << 8) | usize::from(section[pos + 4]);
            match stream_type {
                STREAM_TYPE_AAC_ADTS if self.audio_pid.is_none() => {
                    self.audio_pid = Some(pid);
                    self.audio_kind = AudioCodecKind::Aac;
                }
                STREAM_TYPE_MPEG1_AUDIO | STREAM_TYPE_MPEG2_AUDIO
                    if self.audio_pid.is_none()
                        && (self.type_supported.mpeg || self.type_supported.mp3) =>
                {
                    self.audio_pid = Some(pid);
                    self.audio_kind = AudioCodecKind::Mp3;
                }
                STREAM_TYPE_H264 if self.video_pid.is_none() => {
                    self.video_pid = Some(pid);
                }
                STREAM_TYPE_METADATA if self.id3_pid.is_none() => {
                    self.id3_pid = Some(pid);
                }
                other => {
                    trace!(stream_type = other, pid, "ignoring elementary stream");
                }
            }
            pos += 5 + es_info_len;
        }
    }

    fn dispatch_video_pes(&mut self, raw: Vec<u8>, result: &mut DemuxerResult) {
        let Some(pes) = parse_pes(raw) else { return };
        let units = split_nal_units(&pes.payload);
        if units.is_empty() {
            return;
        }
        let mut key = false;
        let mut kept = Vec::with_capacity(units.len());
        for unit in units {
            let Some(&first) = unit.first() else { continue };
            match first & 0x1F {
                5 => {
                    key = true;
                    kept.push(unit);
                }
                7 => {
                    if unit.len() >= 4 && self.video_codec.is_none() {
                        self.video_codec = Some(format!(
                            "avc1.{:02x}{:02x}{:02x}",
                            unit[1], unit[2], unit[3]
                        ));
                    }
                    if !self.sps.contains(&unit) {
                        self.sps.push(unit.clone());
                    }
                    kept.push(unit);
                }
                8 => {
                    if !self.pps.contains(&unit) {
                        self.pps.push(unit.clone());
                    }
                    kept.push(unit);
                }
                6 => {
                    if let Some(pts) = pes.pts {
                        result.text.samples.push(UserdataSample {
                            pts,
                            data: unit.clone(),
                        });
                    }
                    kept.push(unit);
                }
                9 => {} // access unit delimiter carries nothing
                _ => kept.push(unit),
            }
        }
        let Some(pts) = pes.pts else {
            result.video.dropped += 1;
            return;
        };
        let dts = pes.dts.unwrap_or(pts);
        self.last_video_dts = Some(dts);
        result.video.samples.push(VideoSample {
            pts,
            dts,
            key,
            units: kept,
        });
    }

    fn dispatch_audio_pes(&mut self, raw: Vec<u8>, result: &mut DemuxerResult) {
        let Some(pes) = parse_pes(raw) else { return };
        let Some(pts) = pes.pts else { return };
        match self.audio_kind {
            AudioCodecKind::Aac => {
                adts::parse_frames(&mut result.audio, &pes.payload, pts);
            }
            AudioCodecKind::Mp3 => {
                mpa::parse_frames(&mut result.audio, &pes.payload, pts);
            }
        }
    }

    fn dispatch_id3_pes(&mut self, raw: Vec<u8>, result: &mut DemuxerResult) {
        let Some(pes) = parse_pes(raw) else { return };
        let Some(pts) = pes.pts else { return };
        if !pes.payload.is_empty() {
            result.id3.samples.push(MetadataSample {
                pts,
                data: pes.payload,
            });
        }
    }

    fn finalize_pending(&mut self, result: &mut DemuxerResult) {
        if let Some(raw) = self.video_pes.take() {
            self.dispatch_video_pes(raw, result);
        }
        if let Some(raw) = self.audio_pes.take() {
            self.dispatch_audio_pes(raw, result);
        }
        if let Some(raw) = self.id3_pes.take() {
            self.dispatch_id3_pes(raw, result);
        }
    }

    fn seed_result(&self, result: &mut DemuxerResult) {
        result.audio.id = u32::from(self.audio_pid.unwrap_or(0));
        result.audio.input_timescale = MPEG_TS_TIMESCALE;
        result.audio.segment_codec = self.audio_kind;
        result.video.id = u32::from(self.video_pid.unwrap_or(0));
        result.video.input_timescale = MPEG_TS_TIMESCALE;
    }

    fn finish_result(&self, result: &mut DemuxerResult) {
        if result.video.codec.is_none() {
            result.video.codec = self.video_codec.clone();
        }
        result.video.sps = self.sps.clone();
        result.video.pps = self.pps.clone();
        if result.audio.codec.is_none() {
            result.audio.codec = self.audio_codec_hint.clone();
        }
    }
}

/// Strip the pointer field from a PSI payload when the unit starts here.
fn section_bytes(payload: &[u8], pusi: bool) -> Option<&[u8]> {
    if pusi {
        let pointer = usize::from(*payload.first()?);
        payload.get(1 + pointer..)
    } else {
        Some(payload)
    }
}

#[async_trait]
impl Demuxer for TsDemuxer {
    fn demux(
        &mut self,
        data: Bytes,
        _time_offset: f64,
        _contiguous: bool,
        flush: bool,
    ) -> DemuxerResult {
        let mut result = DemuxerResult::default();

        let buf: Bytes = if self.packet_remainder.is_empty() {
            data
        } else {
            let mut joined = std::mem::take(&mut self.packet_remainder);
            joined.extend_from_slice(&data);
            joined.freeze()
        };

        // align on the sync byte; tolerate a leading partial packet
        let mut pos = match buf.iter().position(|&b| b == SYNC_BYTE) {
            Some(p) => p,
            None => {
                if !buf.is_empty() {
                    self.observer.publish(TransmuxEvent::Error {
                        kind: ErrorKind::Mux,
                        details: ErrorDetails::FragParsing,
                        fatal: false,
                        reason: "no transport stream sync byte found".into(),
                    });
                    warn!(len = buf.len(), "dropping chunk without TS sync byte");
                }
                return result;
            }
        };

        while pos + PACKET_LEN <= buf.len() {
            let packet = &buf[pos..pos + PACKET_LEN];
            if packet[0] != SYNC_BYTE {
                // resync
                match buf[pos..].iter().position(|&b| b == SYNC_BYTE) {
                    Some(step) if step > 0 => {
                        pos += step;
                        continue;
                    }
                    _ => break,
                }
            }
            pos += PACKET_LEN;

            let transport_error = packet[1] & 0x80 != 0;
            if transport_error {
                continue;
            }
            let pusi = packet[1] & 0x40 != 0;
            let pid = (u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]);
            let afc = (packet[3] >> 4) & 0x03;
            if afc & 0x01 == 0 {
                continue; // no payload
            }
            let mut offset = 4;
            if afc & 0x02 != 0 {
                offset += 1 + usize::from(packet[4]);
            }
            if offset >= PACKET_LEN {
                continue;
            }
            let payload = &packet[offset..];

            if pid == 0 {
                self.parse_pat(payload, pusi);
            } else if Some(pid) == self.pmt_pid {
                self.parse_pmt(payload, pusi);
            } else if Some(pid) == self.video_pid {
                if pusi && let Some(raw) = self.video_pes.take() {
                    self.dispatch_video_pes(raw, &mut result);
                }
                self.video_pes.push(Bytes::copy_from_slice(payload));
            } else if Some(pid) == self.audio_pid {
                if pusi && let Some(raw) = self.audio_pes.take() {
                    self.dispatch_audio_pes(raw, &mut result);
                }
                self.audio_pes.push(Bytes::copy_from_slice(payload));
            } else if Some(pid) == self.id3_pid {
                if pusi && let Some(raw) = self.id3_pes.take() {
                    self.dispatch_id3_pes(raw, &mut result);
                }
                self.id3_pes.push(Bytes::copy_from_slice(payload));
            }
        }

        if pos < buf.len() {
            self.packet_remainder.extend_from_slice(&buf[pos..]);
        }
        if flush {
            self.finalize_pending(&mut result);
            self.packet_remainder.clear();
        }

        self.seed_result(&mut result);
        self.finish_result(&mut result);
        trace!(
            video = result.video.samples.len(),
            audio = result.audio.samples.len(),
            id3 = result.id3.samples.len(),
            "ts chunk demuxed"
        );
        result
    }

    async fn demux_sample_aes(
        &mut self,
        data: Bytes,
        key_data: KeyData,
        time_offset: f64,
    ) -> Result<DemuxerResult, DemuxError> {
        let mut result = self.demux(data, time_offset, true, true);
        let key = key_data.key_bytes()?;

        let audio_payloads: Vec<Bytes> =
            result.audio.samples.iter().map(|s| s.data.clone()).collect();
        let decrypted =
            sample_aes::decrypt_samples(sample_aes::SampleKind::Audio, audio_payloads, key, key_data.iv)
                .await?;
        for (sample, plain) in result.audio.samples.iter_mut().zip(decrypted) {
            sample.data = plain;
        }

        // flatten the slice NAL units into one batch, then scatter back
        let mut encrypted_units = Vec::new();
        let mut slots = Vec::new();
        for (si, sample) in result.video.samples.iter().enumerate() {
            for (ui, unit) in sample.units.iter().enumerate() {
                if matches!(unit.first().map(|b| b & 0x1F), Some(1) | Some(5)) {
                    slots.push((si, ui));
                    encrypted_units.push(unit.clone());
                }
            }
        }
        let decrypted =
            sample_aes::decrypt_samples(sample_aes::SampleKind::Video, encrypted_units, key, key_data.iv)
                .await?;
        for ((si, ui), plain) in slots.into_iter().zip(decrypted) {
            result.video.samples[si].units[ui] = plain;
        }
        Ok(result)
    }

    async fn flush(&mut self, _time_offset: f64) -> DemuxerResult {
        let mut result = DemuxerResult::default();
        self.packet_remainder.clear();
        self.finalize_pending(&mut result);
        self.seed_result(&mut result);
        self.finish_result(&mut result);
        result
    }

    fn reset_init_segment(
        &mut self,
        _init_segment: Option<&Bytes>,
        audio_codec: Option<&str>,
        _video_codec: Option<&str>,
        _track_duration: f64,
    ) {
        self.pmt_pid = None;
        self.video_pid = None;
        self.audio_pid = None;
        self.id3_pid = None;
        self.audio_codec_hint = audio_codec.map(str::to_owned);
        self.sps.clear();
        self.pps.clear();
        self.video_codec = None;
        self.video_pes = PesBuffer::default();
        self.audio_pes = PesBuffer::default();
        self.id3_pes = PesBuffer::default();
        self.packet_remainder.clear();
    }

    fn reset_timestamp(&mut self, _default_init_pts: Option<MediaTimestamp>) {
        self.last_video_dts = None;
    }

    fn reset_contiguity(&mut self) {
        self.video_pes = PesBuffer::default();
        self.audio_pes = PesBuffer::default();
        self.id3_pes = PesBuffer::default();
        self.packet_remainder.clear();
        self.last_video_dts = None;
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn probe_needs_five_packets() {
        let stream = make_stream(900_000);
        assert!(stream.len() >= MIN_PROBE_LEN);
        assert!(probe(&stream));
        assert!(!probe(&stream[..600]));
        assert!(!probe(&[0x55; 2048]));
    }

    #[test]
    fn pts_roundtrip() {
        for pts in [0i64, 90_000, 0x1_2345_6789 & 0x1_FFFF_FFFF] {
            let raw = write_pts(pts);
            assert_eq!(read_timestamp(&raw), pts);
        }
    }

    #[test]
    fn demuxes_audio_and_video() {
        let stream = make_stream(900_000);
        let mut demuxer = TsDemuxer::new(EventBus::default(), TypeSupported::default());
        let result = demuxer.demux(Bytes::from(stream), 10.0, true, true);

        // two frames from the first audio PES + one from the closing PES
        assert_eq!(result.audio.samples.len(), 3);
        assert_eq!(result.audio.samples[0].pts, 900_000);
        assert_eq!(result.audio.sample_rate, Some(44_100));

        assert_eq!(result.video.samples.len(), 1);
        let video = &result.video.samples[0];
        assert!(video.key);
        assert_eq!(video.pts, 900_000);
        assert_eq!(result.video.codec.as_deref(), Some("avc1.64001f"));
        assert_eq!(result.video.sps.len(), 1);
        assert_eq!(result.video.pps.len(), 1);
    }

    #[test]
    fn chunked_delivery_reassembles_packets() {
        let stream = make_stream(0);
        let (head, tail) = stream.split_at(500);
        let mut demuxer = TsDemuxer::new(EventBus::default(), TypeSupported::default());
        let first = demuxer.demux(Bytes::copy_from_slice(head), 0.0, true, false);
        let second = demuxer.demux(Bytes::copy_from_slice(tail), 0.0, true, true);

        let total_audio = first.audio.samples.len() + second.audio.samples.len();
        let total_video = first.video.samples.len() + second.video.samples.len();
        assert_eq!(total_audio, 3);
        assert_eq!(total_video, 1);
    }

    #[test]
    fn garbage_chunk_publishes_nonfatal_mux_error() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut demuxer = TsDemuxer::new(bus, TypeSupported::default());
        let result = demuxer.demux(Bytes::from_static(&[0x00; 64]), 0.0, true, true);
        assert!(result.is_empty());
        assert!(matches!(
            rx.try_recv(),
            Ok(syrinx_events::Event::Transmux(TransmuxEvent::Error {
                kind: ErrorKind::Mux,
                fatal: false,
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn sample_aes_roundtrip_on_clear_header_frames() {
        // encrypt the audio frame payloads the way a packager would, then
        // confirm demux_sample_aes restores them
        use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::NoPadding};
        type Enc = cbc::Encryptor<aes::Aes128>;

        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];

        let clear = make_stream(90_000);
        let mut demuxer = TsDemuxer::new(EventBus::default(), TypeSupported::default());
        let clear_result = demuxer.demux(Bytes::from(clear), 1.0, true, true);

        // re-build the stream with encrypted audio payloads
        let encrypt_frame = |payload: &[u8]| -> Vec<u8> {
            let mut frame = payload.to_vec();
            if frame.len() > 16 {
                let run = (frame.len() - 16) / 16 * 16;
                if run > 0 {
                    let region = &mut frame[16..16 + run];
                    let n = region.len();
                    let _ = Enc::new((&key).into(), (&iv).into())
                        .encrypt_padded_mut::<NoPadding>(region, n);
                }
            }
            let mut adts = crate::adts::make_frame(frame.len(), 4);
            adts.truncate(7);
            adts.extend_from_slice(&frame);
            adts
        };
        let mut encrypted_frames = Vec::new();
        for sample in &clear_result.audio.samples[..2] {
            encrypted_frames.extend(encrypt_frame(&sample.data));
        }
        let mut stream = pat_packet();
        stream.extend(pmt_packet(0x0F));
        stream.extend(pes_packets(AUDIO_PID, 90_000, &encrypted_frames));
        stream.extend(pes_packets(
            AUDIO_PID,
            99_000,
            &encrypt_frame(&clear_result.audio.samples[2].data),
        ));

        let key_data = KeyData {
            method: syrinx_drm::KeyMethod::SampleAes,
            key: Bytes::copy_from_slice(&key),
            iv,
        };
        let mut demuxer = TsDemuxer::new(EventBus::default(), TypeSupported::default());
        let result = demuxer
            .demux_sample_aes(Bytes::from(stream), key_data, 1.0)
            .await
            .unwrap();
        assert_eq!(result.audio.samples.len(), 3);
        for (decrypted, original) in result.audio.samples.iter().zip(&clear_result.audio.samples) {
            assert_eq!(decrypted.data, original.data);
        }
    }
}
