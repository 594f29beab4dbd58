#![forbid(unsafe_code)]

//! Passthrough remuxing for segments that are already fragmented MP4.

use bytes::Bytes;
use syrinx_demux::{DemuxerResult, MediaTimestamp, mp4};
use syrinx_events::EventBus;
use tracing::{debug, warn};

use crate::{
    InitSegmentData, InitSegmentTrack, RemuxResult, RemuxedTrack, Remuxer, StreamKind, TrackKind,
};

/// Remuxer that forwards fragmented-MP4 segments with minimal touch-up:
/// it derives the timing window from `tfdt`/`trun` and replays the cached
/// init segment, but never rewrites media bytes.
pub struct PassthroughRemuxer {
    #[allow(dead_code)]
    observer: EventBus,
    init_segment: Option<Bytes>,
    init_data: Option<mp4::InitData>,
    init_pts: Option<MediaTimestamp>,
    emit_init: bool,
}

impl PassthroughRemuxer {
    pub fn new(observer: EventBus) -> Self {
        Self {
            observer,
            init_segment: None,
            init_data: None,
            init_pts: None,
            emit_init: true,
        }
    }

    /// Media timescale for timing math: the video track's when present,
    /// else the audio track's, else the MPEG-TS default.
    fn timescale(&self) -> u32 {
        self.init_data
            .as_ref()
            .and_then(|init| {
                init.video
                    .as_ref()
                    .or(init.audio.as_ref())
                    .map(|t| t.timescale)
            })
            .filter(|&ts| ts > 0)
            .unwrap_or(syrinx_demux::MPEG_TS_TIMESCALE)
    }

    fn build_init(&self) -> InitSegmentData {
        let data = self.init_segment.clone().unwrap_or_default();
        let track = |info: Option<&mp4::InitTrackInfo>, container: &'static str| {
            info.map(|t| InitSegmentTrack {
                id: t.id,
                container,
                codec: t.codec.clone(),
                data: data.clone(),
            })
        };
        InitSegmentData {
            audio: track(
                self.init_data.as_ref().and_then(|i| i.audio.as_ref()),
                "audio/mp4",
            ),
            video: track(
                self.init_data.as_ref().and_then(|i| i.video.as_ref()),
                "video/mp4",
            ),
            init_pts: self.init_pts,
        }
    }
}

impl Remuxer for PassthroughRemuxer {
    fn remux(
        &mut self,
        tracks: DemuxerResult,
        time_offset: f64,
        _accurate_time_offset: bool,
        _flush: bool,
        _stream: StreamKind,
    ) -> RemuxResult {
        let mut result = RemuxResult::default();
        if !tracks.id3.samples.is_empty() {
            result.id3 = Some(tracks.id3);
        }
        if !tracks.text.samples.is_empty() {
            result.text = Some(tracks.text);
        }
        let Some(raw) = tracks.video.raw else {
            return result;
        };

        // a self-initializing segment carries its own moov
        if self.init_data.is_none() {
            let parsed = mp4::parse_init_segment(&raw);
            if parsed.audio.is_some() || parsed.video.is_some() {
                debug!("segment is self-initializing, adopting its moov");
                self.init_segment = Some(raw.clone());
                self.init_data = Some(parsed);
            }
        }

        let timescale = self.timescale();
        let tfdt = mp4::first_tfdt(&raw);
        if self.init_pts.is_none() {
            if let Some(tfdt) = tfdt {
                let base = tfdt as i64 - (time_offset * f64::from(timescale)) as i64;
                self.init_pts = Some(MediaTimestamp::new(base, timescale));
                debug!(base, timescale, "init PTS derived from segment tfdt");
            } else {
                warn!("fragmented segment without tfdt, timing will be estimated");
            }
        }

        if self.emit_init && self.init_data.is_some() {
            result.init_segment = Some(self.build_init());
            self.emit_init = false;
        }

        let anchor = self.init_pts.map(|ts| ts.base_time).unwrap_or(0);
        let stats = mp4::fragment_stats(&raw);
        let start = (tfdt.unwrap_or(0) as i64 - anchor) as f64 / f64::from(timescale);
        let duration = stats.duration as f64 / f64::from(timescale);
        result.video = Some(RemuxedTrack {
            kind: TrackKind::Video,
            data: raw,
            start_pts: start,
            end_pts: start + duration,
            start_dts: start,
            end_dts: start + duration,
            sample_count: stats.samples,
            dropped: 0,
        });
        result
    }

    fn reset_init_segment(
        &mut self,
        init_segment: Option<&Bytes>,
        _audio_codec: Option<&str>,
        _video_codec: Option<&str>,
    ) {
        self.init_segment = init_segment.cloned();
        self.init_data = init_segment.map(|data| mp4::parse_init_segment(data));
        self.emit_init = true;
    }

    fn reset_timestamp(&mut self, default_init_pts: Option<MediaTimestamp>) {
        self.init_pts = default_init_pts;
    }

    fn reset_next_timestamp(&mut self) {
        self.init_pts = None;
    }
}

#[cfg(test)]
mod tests {
    use syrinx_demux::MPEG_TS_TIMESCALE;

    use super::*;
    use crate::mp4_generator::{self, FragmentSample, SAMPLE_FLAGS_SYNC, TrackSpec};

    fn video_init() -> Bytes {
        let sps = [Bytes::from_static(&[0x67, 0x64, 0x00, 0x1F, 0xAA])];
        let pps = [Bytes::from_static(&[0x68, 0xEE, 0x3C, 0x80])];
        mp4_generator::init_segment(&[TrackSpec::Video {
            id: 1,
            timescale: MPEG_TS_TIMESCALE,
            duration: 0,
            width: 1920,
            height: 1080,
            sps: &sps,
            pps: &pps,
        }])
    }

    fn media_segment(base_time: u64) -> Bytes {
        let samples = [FragmentSample {
            duration: 9_000,
            size: 4,
            flags: SAMPLE_FLAGS_SYNC,
            cts: 0,
        }; 10];
        mp4_generator::fragment(1, 1, base_time, &samples, &[0u8; 40], true)
    }

    fn demuxed(raw: Bytes) -> DemuxerResult {
        let mut tracks = DemuxerResult::default();
        tracks.video.raw = Some(raw);
        tracks
    }

    #[test]
    fn forwards_raw_and_derives_timing() {
        let mut remuxer = PassthroughRemuxer::new(EventBus::default());
        remuxer.reset_init_segment(Some(&video_init()), None, Some("avc1.64001f"));

        let segment = media_segment(900_000);
        let result = remuxer.remux(demuxed(segment.clone()), 10.0, true, false, StreamKind::Main);

        let init = result.init_segment.expect("init emitted once");
        let video_init_track = init.video.expect("video entry");
        assert_eq!(video_init_track.codec, "avc1.64001f");
        assert_eq!(init.init_pts.unwrap().base_time, 0);

        let video = result.video.expect("forwarded track");
        assert_eq!(video.data, segment);
        assert!((video.start_pts - 10.0).abs() < 1e-9);
        assert!((video.end_pts - 11.0).abs() < 1e-9);
        assert_eq!(video.sample_count, 10);
    }

    #[test]
    fn init_replayed_only_once_per_reset() {
        let mut remuxer = PassthroughRemuxer::new(EventBus::default());
        remuxer.reset_init_segment(Some(&video_init()), None, None);

        let r1 = remuxer.remux(demuxed(media_segment(0)), 0.0, true, false, StreamKind::Main);
        assert!(r1.init_segment.is_some());
        let r2 = remuxer.remux(
            demuxed(media_segment(90_000)),
            0.0,
            true,
            false,
            StreamKind::Main,
        );
        assert!(r2.init_segment.is_none());
        // successive fragments continue the timeline
        assert!((r2.video.unwrap().start_pts - 1.0).abs() < 1e-9);
    }

    #[test]
    fn self_initializing_segment_adopts_moov() {
        let mut init_plus_media = video_init().to_vec();
        init_plus_media.extend_from_slice(&media_segment(0));

        let mut remuxer = PassthroughRemuxer::new(EventBus::default());
        let result = remuxer.remux(
            demuxed(Bytes::from(init_plus_media)),
            0.0,
            true,
            false,
            StreamKind::Main,
        );
        let init = result.init_segment.expect("adopted init");
        assert!(init.video.is_some());
    }

    #[test]
    fn empty_input_produces_empty_result() {
        let mut remuxer = PassthroughRemuxer::new(EventBus::default());
        let result = remuxer.remux(
            DemuxerResult::default(),
            0.0,
            true,
            true,
            StreamKind::Main,
        );
        assert!(result.is_empty());
    }
}
