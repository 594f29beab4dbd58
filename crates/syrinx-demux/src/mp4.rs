#![forbid(unsafe_code)]

//! Fragmented MP4 probing, box parsing, and the passthrough demuxer.
//!
//! Already-fragmented segments do not need elementary-stream extraction;
//! the demuxer forwards the raw bytes for passthrough remuxing and only
//! digs into the boxes for what the pipeline needs: init-segment track
//! info, the first `tfdt` (timestamp anchoring), fragment durations, and
//! `emsg`-carried ID3 metadata.

use async_trait::async_trait;
use bytes::Bytes;
use syrinx_events::EventBus;
use tracing::trace;

use crate::{
    Demuxer, DemuxerResult, MPEG_TS_TIMESCALE, MediaTimestamp, MetadataSample,
};

/// Bytes the probe wants before its verdict is trustworthy.
pub const MIN_PROBE_LEN: usize = 1024;

/// Box types that prove the payload is ISO-BMFF.
const PROBE_TARGETS: [&[u8; 4]; 5] = [b"ftyp", b"styp", b"moov", b"moof", b"sidx"];

/// Other box types tolerated at the top level while walking.
const TOP_LEVEL: [&[u8; 4]; 7] = [b"mdat", b"free", b"skip", b"emsg", b"prft", b"mfra", b"uuid"];

/// Container probe: walk top-level boxes and accept on the first
/// unmistakably ISO-BMFF type. The final box may be truncated (large
/// `mdat`s usually are, mid-download).
pub fn probe(data: &[u8]) -> bool {
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]]);
        let fourcc: [u8; 4] = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];
        if PROBE_TARGETS.iter().any(|t| **t == fourcc) {
            return true;
        }
        if !TOP_LEVEL.iter().any(|t| **t == fourcc) {
            return false;
        }
        match size {
            0 => return false,          // box extends to EOF and proved nothing
            1 => {
                // 64-bit size; skip header + largesize
                let Some(large) = data.get(pos + 8..pos + 16) else {
                    return false;
                };
                let mut raw = [0u8; 8];
                raw.copy_from_slice(large);
                let size = u64::from_be_bytes(raw) as usize;
                if size < 16 {
                    return false;
                }
                pos += size;
            }
            s if s < 8 => return false,
            s => pos += s as usize,
        }
    }
    false
}

/// Find the payloads of all boxes matching `path`, searching recursively
/// one path component per container level.
pub fn find_box<'a>(data: &'a [u8], path: &[&[u8; 4]]) -> Vec<&'a [u8]> {
    let Some((first, rest)) = path.split_first() else {
        return vec![data];
    };
    let mut found = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let size = u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
            as usize;
        if size < 8 || pos + size > data.len() {
            break;
        }
        if &data[pos + 4..pos + 8] == *first {
            let payload = &data[pos + 8..pos + size];
            if rest.is_empty() {
                found.push(payload);
            } else {
                found.extend(find_box(payload, rest));
            }
        }
        pos += size;
    }
    found
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let raw = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let hi = read_u32(data, offset)?;
    let lo = read_u32(data, offset + 4)?;
    Some(u64::from(hi) << 32 | u64::from(lo))
}

/// Which medium an init-segment track carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackType {
    Audio,
    Video,
}

/// Track description decoded from an init segment's `moov`.
#[derive(Debug, Clone)]
pub struct InitTrackInfo {
    pub id: u32,
    pub timescale: u32,
    pub kind: TrackType,
    pub codec: String,
}

/// Per-medium track info from an init segment.
#[derive(Debug, Clone, Default)]
pub struct InitData {
    pub audio: Option<InitTrackInfo>,
    pub video: Option<InitTrackInfo>,
}

impl InitData {
    pub fn track(&self, kind: TrackType) -> Option<&InitTrackInfo> {
        match kind {
            TrackType::Audio => self.audio.as_ref(),
            TrackType::Video => self.video.as_ref(),
        }
    }
}

/// Decode track ids, timescales, and codec strings from an init segment.
pub fn parse_init_segment(data: &[u8]) -> InitData {
    let mut init = InitData::default();
    for trak in find_box(data, &[b"moov", b"trak"]) {
        let Some(tkhd) = find_box(trak, &[b"tkhd"]).first().copied() else {
            continue;
        };
        let version = tkhd.first().copied().unwrap_or(0);
        let id_offset = if version == 0 { 12 } else { 20 };
        let Some(track_id) = read_u32(tkhd, id_offset) else {
            continue;
        };
        let Some(mdhd) = find_box(trak, &[b"mdia", b"mdhd"]).first().copied() else {
            continue;
        };
        let mdhd_version = mdhd.first().copied().unwrap_or(0);
        let ts_offset = if mdhd_version == 0 { 12 } else { 20 };
        let Some(timescale) = read_u32(mdhd, ts_offset) else {
            continue;
        };
        let Some(hdlr) = find_box(trak, &[b"mdia", b"hdlr"]).first().copied() else {
            continue;
        };
        let handler = hdlr.get(8..12);
        let Some(stsd) = find_box(trak, &[b"mdia", b"minf", b"stbl", b"stsd"])
            .first()
            .copied()
        else {
            continue;
        };
        match handler {
            Some(b"soun") => {
                init.audio = Some(InitTrackInfo {
                    id: track_id,
                    timescale,
                    kind: TrackType::Audio,
                    codec: audio_codec_string(stsd),
                });
            }
            Some(b"vide") => {
                init.video = Some(InitTrackInfo {
                    id: track_id,
                    timescale,
                    kind: TrackType::Video,
                    codec: video_codec_string(stsd),
                });
            }
            _ => {}
        }
    }
    init
}

/// RFC 6381 codec string for the first video sample entry in an `stsd`.
fn video_codec_string(stsd: &[u8]) -> String {
    // stsd payload: version/flags + entry_count, then sample entries
    let Some(entry) = stsd.get(8..) else {
        return "avc1".into();
    };
    let fourcc = entry.get(4..8).unwrap_or(b"avc1");
    if fourcc == b"avc1" || fourcc == b"avc3" {
        // visual sample entry is 78 bytes + 8 header before child boxes
        if let Some(children) = entry.get(8 + 78..)
            && let Some(avcc) = find_box(children, &[b"avcC"]).first()
            && avcc.len() >= 4
        {
            return format!(
                "avc1.{:02x}{:02x}{:02x}",
                avcc[1], avcc[2], avcc[3]
            );
        }
        return "avc1.42e01e".into();
    }
    String::from_utf8_lossy(fourcc).into_owned()
}

/// RFC 6381 codec string for the first audio sample entry in an `stsd`.
fn audio_codec_string(stsd: &[u8]) -> String {
    let Some(entry) = stsd.get(8..) else {
        return "mp4a.40.2".into();
    };
    let fourcc = entry.get(4..8).unwrap_or(b"mp4a");
    if fourcc == b"mp4a" {
        // audio sample entry is 28 bytes + 8 header before child boxes
        if let Some(children) = entry.get(8 + 28..)
            && let Some(esds) = find_box(children, &[b"esds"]).first()
            && let Some(object_type) = esds_audio_object_type(esds)
        {
            return format!("mp4a.40.{object_type}");
        }
        return "mp4a.40.2".into();
    }
    String::from_utf8_lossy(fourcc).into_owned()
}

/// Audio object type from the DecoderSpecificInfo descriptor inside `esds`.
fn esds_audio_object_type(esds: &[u8]) -> Option<u8> {
    // skip version/flags, then walk descriptors looking for tag 0x05
    let mut pos = 4usize;
    while pos + 2 <= esds.len() {
        let tag = esds[pos];
        let mut len = 0usize;
        let mut cursor = pos + 1;
        loop {
            let byte = *esds.get(cursor)?;
            cursor += 1;
            len = (len << 7) | usize::from(byte & 0x7F);
            if byte & 0x80 == 0 {
                break;
            }
        }
        match tag {
            0x05 => return Some(esds.get(cursor)? >> 3),
            // descriptors that nest further: ES (0x03) carries 3 fixed
            // bytes, DecoderConfig (0x04) carries 13 before children
            0x03 => pos = cursor + 3,
            0x04 => pos = cursor + 13,
            _ => pos = cursor + len,
        }
    }
    None
}

/// Base media decode time of the first `traf` in the segment.
pub fn first_tfdt(segment: &[u8]) -> Option<u64> {
    let tfdt = *find_box(segment, &[b"moof", b"traf", b"tfdt"]).first()?;
    let version = tfdt.first().copied()?;
    if version == 1 {
        read_u64(tfdt, 4)
    } else {
        read_u32(tfdt, 4).map(u64::from)
    }
}

/// Aggregate duration and sample count of a segment's fragments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FragmentStats {
    /// Sum of sample durations in media timescale ticks.
    pub duration: u64,
    /// Number of samples across all `trun`s.
    pub samples: usize,
}

/// Walk `moof`/`traf`/`trun` boxes, summing sample durations (with the
/// `tfhd` default as fallback) and counting samples.
pub fn fragment_stats(segment: &[u8]) -> FragmentStats {
    let mut stats = FragmentStats::default();
    for traf in find_box(segment, &[b"moof", b"traf"]) {
        let default_duration = find_box(traf, &[b"tfhd"]).first().and_then(|tfhd| {
            let flags = read_u32(tfhd, 0)? & 0x00FF_FFFF;
            let mut offset = 8; // version/flags + track id
            if flags & 0x01 != 0 {
                offset += 8; // base data offset
            }
            if flags & 0x02 != 0 {
                offset += 4; // sample description index
            }
            if flags & 0x08 != 0 {
                return read_u32(tfhd, offset);
            }
            None
        });
        for trun in find_box(traf, &[b"trun"]) {
            let Some(flags) = read_u32(trun, 0).map(|v| v & 0x00FF_FFFF) else {
                continue;
            };
            let Some(sample_count) = read_u32(trun, 4) else {
                continue;
            };
            stats.samples += sample_count as usize;
            let mut offset = 8;
            if flags & 0x01 != 0 {
                offset += 4; // data offset
            }
            if flags & 0x04 != 0 {
                offset += 4; // first sample flags
            }
            if flags & 0x100 != 0 {
                let mut per_sample = 0usize;
                for bit in [0x100u32, 0x200, 0x400, 0x800] {
                    if flags & bit != 0 {
                        per_sample += 4;
                    }
                }
                for i in 0..sample_count as usize {
                    if let Some(d) = read_u32(trun, offset + i * per_sample) {
                        stats.duration += u64::from(d);
                    }
                }
            } else if let Some(default) = default_duration {
                stats.duration += u64::from(sample_count) * u64::from(default);
            }
        }
    }
    stats
}

/// Extract ID3 metadata samples carried in `emsg` boxes.
fn extract_emsg_id3(segment: &[u8], time_offset: f64, id3: &mut Vec<MetadataSample>) {
    for emsg in find_box(segment, &[b"emsg"]) {
        let Some(version) = emsg.first().copied() else {
            continue;
        };
        let parsed = if version == 1 {
            parse_emsg_v1(emsg, time_offset)
        } else {
            parse_emsg_v0(emsg, time_offset)
        };
        if let Some((scheme, pts, data)) = parsed
            && scheme.to_ascii_lowercase().contains("id3")
        {
            id3.push(MetadataSample { pts, data });
        }
    }
}

fn read_cstr(data: &[u8], pos: usize) -> Option<(String, usize)> {
    let end = data[pos..].iter().position(|&b| b == 0)? + pos;
    let s = String::from_utf8_lossy(&data[pos..end]).into_owned();
    Some((s, end + 1))
}

fn parse_emsg_v0(emsg: &[u8], time_offset: f64) -> Option<(String, i64, Bytes)> {
    let (scheme, pos) = read_cstr(emsg, 4)?;
    let (_value, pos) = read_cstr(emsg, pos)?;
    let timescale = read_u32(emsg, pos)?;
    let delta = read_u32(emsg, pos + 4)?;
    // event_duration + id precede the message payload
    let message = emsg.get(pos + 16..)?;
    let pts = (time_offset * f64::from(MPEG_TS_TIMESCALE)) as i64
        + i64::from(delta) * i64::from(MPEG_TS_TIMESCALE) / i64::from(timescale.max(1));
    Some((scheme, pts, Bytes::copy_from_slice(message)))
}

fn parse_emsg_v1(emsg: &[u8], _time_offset: f64) -> Option<(String, i64, Bytes)> {
    let timescale = read_u32(emsg, 4)?;
    let presentation_time = read_u64(emsg, 8)?;
    let (scheme, pos) = read_cstr(emsg, 24)?;
    let (_value, pos) = read_cstr(emsg, pos)?;
    let message = emsg.get(pos..)?;
    let pts = presentation_time as i64 * i64::from(MPEG_TS_TIMESCALE)
        / i64::from(timescale.max(1));
    Some((scheme, pts, Bytes::copy_from_slice(message)))
}

/// Passthrough demuxer for segments that are already fragmented MP4.
///
/// Keeps the init-segment track info as parser state; the segment bytes
/// travel through untouched in `VideoTrack::raw`.
pub struct Mp4Demuxer {
    #[allow(dead_code)]
    observer: EventBus,
    init: Option<InitData>,
}

impl Mp4Demuxer {
    pub fn new(observer: EventBus) -> Self {
        Self {
            observer,
            init: None,
        }
    }
}

#[async_trait]
impl Demuxer for Mp4Demuxer {
    fn demux(
        &mut self,
        data: Bytes,
        time_offset: f64,
        _contiguous: bool,
        _flush: bool,
    ) -> DemuxerResult {
        let mut result = DemuxerResult::default();
        extract_emsg_id3(&data, time_offset, &mut result.id3.samples);
        if let Some(init) = &self.init {
            if let Some(video) = &init.video {
                result.video.id = video.id;
                result.video.input_timescale = video.timescale;
                result.video.codec = Some(video.codec.clone());
            }
            if let Some(audio) = &init.audio {
                result.audio.id = audio.id;
                result.audio.input_timescale = audio.timescale;
                result.audio.codec = Some(audio.codec.clone());
            }
        }
        result.video.raw = Some(data);
        result
    }

    async fn flush(&mut self, _time_offset: f64) -> DemuxerResult {
        DemuxerResult::default()
    }

    fn reset_init_segment(
        &mut self,
        init_segment: Option<&Bytes>,
        _audio_codec: Option<&str>,
        _video_codec: Option<&str>,
        _track_duration: f64,
    ) {
        self.init = init_segment.map(|data| {
            let init = parse_init_segment(data);
            trace!(
                audio = init.audio.is_some(),
                video = init.video.is_some(),
                "init segment parsed"
            );
            init
        });
    }

    fn reset_timestamp(&mut self, _default_init_pts: Option<MediaTimestamp>) {}

    fn reset_contiguity(&mut self) {}
}


#[cfg(test)]
mod tests {
    use super::test_support::{make_box, make_tfdt_v1};
    use super::*;

    #[test]
    fn probe_accepts_ftyp_and_moof() {
        let ftyp = make_box(b"ftyp", b"isom\x00\x00\x02\x00isomiso2");
        assert!(probe(&ftyp));

        let mut segment = make_box(b"styp", b"msdh\x00\x00\x00\x00msdh");
        segment.extend(make_box(b"moof", &[]));
        assert!(probe(&segment));
    }

    #[test]
    fn probe_walks_over_tolerated_boxes() {
        let mut segment = make_box(b"free", &[0u8; 32]);
        segment.extend(make_box(b"moof", &[]));
        assert!(probe(&segment));
    }

    #[test]
    fn probe_rejects_garbage() {
        assert!(!probe(&[0x55u8; 4096]));
        assert!(!probe(b"\x00\x00\x00\x08abcd"));
    }

    #[test]
    fn find_box_walks_nested_paths() {
        let tfdt = make_tfdt_v1(1234);
        let traf = make_box(b"traf", &tfdt);
        let moof = make_box(b"moof", &traf);
        let found = find_box(&moof, &[b"moof", b"traf", b"tfdt"]);
        assert_eq!(found.len(), 1);
        assert_eq!(first_tfdt(&moof), Some(1234));
    }

    #[test]
    fn trun_durations_sum() {
        // trun with per-sample durations (flag 0x100), two samples
        let mut trun = vec![0, 0, 1, 0]; // version 0, flags 0x000100
        trun.extend_from_slice(&2u32.to_be_bytes());
        trun.extend_from_slice(&1024u32.to_be_bytes());
        trun.extend_from_slice(&1024u32.to_be_bytes());
        let traf = make_box(b"traf", &make_box(b"trun", &trun));
        let moof = make_box(b"moof", &traf);
        let stats = fragment_stats(&moof);
        assert_eq!(stats.duration, 2048);
        assert_eq!(stats.samples, 2);
    }

    #[test]
    fn demux_forwards_raw_bytes() {
        let mut demuxer = Mp4Demuxer::new(syrinx_events::EventBus::default());
        let segment = Bytes::from(make_box(b"moof", &[]));
        let result = demuxer.demux(segment.clone(), 0.0, true, true);
        assert_eq!(result.video.raw.as_ref(), Some(&segment));
    }
}
