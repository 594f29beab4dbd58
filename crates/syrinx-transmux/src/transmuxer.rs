#![forbid(unsafe_code)]

//! The transmuxer orchestrator: probe, decrypt, demux, remux.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use syrinx_demux::{ContainerFormat, Demuxer, TypeSupported};
use syrinx_drm::{Decrypter, KeyData, KeyMethod, SegmentKey};
use syrinx_events::{ErrorDetails, ErrorKind, EventBus, TransmuxEvent};
use syrinx_remux::{RemuxResult, Remuxer, StreamKind};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
    ChunkCache, ChunkMetadata, Clock, ProbeRegistry, TransmuxConfig, TransmuxState,
    TransmuxerOptions,
};

/// Errors that cross the transmuxer's public surface.
///
/// Ordinary operational conditions (insufficient bytes, unidentifiable
/// content) never surface here; they come back as empty results or events.
#[derive(Debug, Error)]
pub enum TransmuxError {
    #[error("decryption failed: {0}")]
    Drm(#[from] syrinx_drm::DrmError),

    #[error("demuxing failed: {0}")]
    Demux(#[from] syrinx_demux::DemuxError),
}

/// Output of one push or flush pass: the remuxed payloads plus the chunk
/// cookie with timing stamped.
#[derive(Debug, Clone)]
pub struct TransmuxerResult {
    pub remux_result: RemuxResult,
    pub chunk_meta: ChunkMetadata,
}

impl TransmuxerResult {
    fn empty(chunk_meta: ChunkMetadata) -> Self {
        Self {
            remux_result: RemuxResult::default(),
            chunk_meta,
        }
    }
}

/// Stateful segment transmuxer.
///
/// Owns the pre-probe chunk cache, the probe registry, the lazily created
/// decrypter, and the demuxer/remuxer pair selected for the current
/// content family. One instance serves one playlist level; the host
/// serializes `push`/`flush` calls.
pub struct Transmuxer {
    observer: EventBus,
    options: TransmuxerOptions,
    type_supported: TypeSupported,
    vendor: String,
    stream: StreamKind,
    clock: Arc<dyn Clock>,
    registry: ProbeRegistry,
    config: TransmuxConfig,
    state: TransmuxState,
    cache: ChunkCache,
    decrypter: Option<Decrypter>,
    demuxer: Option<Box<dyn Demuxer>>,
    remuxer: Option<Box<dyn Remuxer>>,
    container: Option<ContainerFormat>,
    terminated: bool,
}

impl Transmuxer {
    pub fn new(
        observer: EventBus,
        options: TransmuxerOptions,
        type_supported: TypeSupported,
        vendor: impl Into<String>,
        stream: StreamKind,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            observer,
            options,
            type_supported,
            vendor: vendor.into(),
            stream,
            clock,
            registry: ProbeRegistry::standard(),
            config: TransmuxConfig::default(),
            state: TransmuxState::default(),
            cache: ChunkCache::new(),
            decrypter: None,
            demuxer: None,
            remuxer: None,
            container: None,
            terminated: false,
        }
    }

    /// Replace the segment configuration.
    ///
    /// Resets the decrypter's cipher state (a new segment means a new key
    /// stream) but leaves the demuxer/remuxer pair alone; the next push
    /// decides whether they survive.
    pub fn configure(&mut self, config: TransmuxConfig) {
        self.config = config;
        if let Some(decrypter) = &mut self.decrypter {
            decrypter.reset();
        }
    }

    /// Feed one chunk of segment bytes through the pipeline.
    ///
    /// Returns an empty result while bytes are being accumulated (probing
    /// not yet conclusive, or a sub-block encrypted chunk); decryption
    /// failures are the only errors.
    pub async fn push(
        &mut self,
        data: Bytes,
        key: Option<SegmentKey>,
        mut chunk_meta: ChunkMetadata,
        state: Option<TransmuxState>,
    ) -> Result<TransmuxerResult, TransmuxError> {
        chunk_meta.transmuxing.execute_start = self.clock.now_millis();
        if self.terminated {
            return Ok(self.finish_empty(chunk_meta));
        }
        if let Some(state) = state {
            self.state = state;
        }
        let TransmuxState {
            discontinuity,
            contiguous,
            accurate_time_offset,
            track_switch,
            time_offset,
            init_segment_change,
        } = self.state;

        let mut data = data;
        let mut key_data = KeyData::derive(&data, key.as_ref());
        if let Some(kd) = key_data.take_if(|kd| kd.method == KeyMethod::Aes128) {
            let key_bytes = kd.key_bytes()?;
            let decrypter = self.decrypter.get_or_insert_with(Decrypter::new);
            if self.options.enable_software_aes {
                match decrypter.software_decrypt(&data, key_bytes, kd.iv) {
                    None => return Ok(self.finish_empty(chunk_meta)),
                    Some(plaintext) => data = plaintext,
                }
            } else {
                let plaintext = decrypter.full_decrypt(data, key_bytes, kd.iv).await?;
                if self.terminated {
                    return Ok(self.finish_empty(chunk_meta));
                }
                data = plaintext;
            }
        }

        if discontinuity || track_switch || init_segment_change {
            self.reset_init_segment();
        }
        if discontinuity || init_segment_change {
            self.reset_initial_timestamp();
        }
        if !contiguous {
            self.reset_contiguity();
        }

        if self.needs_probing(discontinuity, track_switch) {
            if !self.cache.is_empty() {
                let cached = self.cache.flush();
                let mut joined = BytesMut::with_capacity(cached.len() + data.len());
                joined.extend_from_slice(&cached);
                joined.extend_from_slice(&data);
                data = joined.freeze();
            }
            if !self.configure_transmuxer(&data) {
                // not decidable yet; keep accumulating
                self.cache.append(data);
                return Ok(self.finish_empty(chunk_meta));
            }
        }

        let mut result = match key_data {
            Some(kd) if kd.method == KeyMethod::SampleAes => {
                let result = self
                    .transmux_sample_aes(data, kd, time_offset, accurate_time_offset, chunk_meta)
                    .await?;
                if self.terminated {
                    // a destroy raced the per-sample decryption
                    return Ok(self.finish_empty(result.chunk_meta));
                }
                result
            }
            _ => self.transmux(data, time_offset, accurate_time_offset, contiguous, chunk_meta),
        };

        self.state.contiguous = true;
        self.state.discontinuity = false;
        self.state.track_switch = false;

        result.chunk_meta.transmuxing.execute_end = self.clock.now_millis();
        Ok(result)
    }

    /// Finish the current segment.
    ///
    /// Drains the decrypter residue through a final push, reports content
    /// that never probed successfully as a fatal parsing error, and flushes
    /// the demuxer/remuxer pair.
    pub async fn flush(
        &mut self,
        mut chunk_meta: ChunkMetadata,
    ) -> Result<Vec<TransmuxerResult>, TransmuxError> {
        chunk_meta.transmuxing.execute_start = self.clock.now_millis();
        if self.terminated {
            return Ok(vec![self.finish_empty(chunk_meta)]);
        }
        let TransmuxState {
            accurate_time_offset,
            time_offset,
            ..
        } = self.state;

        let mut results = Vec::new();
        let residue = match self.decrypter.as_mut() {
            Some(decrypter) => {
                let truncated = decrypter.has_remainder();
                let residue = decrypter.flush();
                if truncated && residue.is_none() {
                    self.observer.publish(TransmuxEvent::Error {
                        kind: ErrorKind::Media,
                        details: ErrorDetails::FragDecrypt,
                        fatal: false,
                        reason: "encrypted segment ended on a partial cipher block".into(),
                    });
                }
                residue
            }
            None => None,
        };
        if let Some(residue) = residue {
            results.push(self.push(residue, None, chunk_meta.clone(), None).await?);
        }

        let cached_len = self.cache.len();
        self.cache.reset();
        if self.demuxer.is_none() || self.remuxer.is_none() {
            if cached_len >= self.registry.min_probe_byte_length() {
                error!(
                    cached_len,
                    "no demuxer matched the segment after seeing enough bytes"
                );
                self.observer.publish(TransmuxEvent::Error {
                    kind: ErrorKind::Media,
                    details: ErrorDetails::FragParsing,
                    fatal: true,
                    reason: "no demuxer matching with content found".into(),
                });
            }
            return Ok(vec![self.finish_empty(chunk_meta)]);
        }

        let (Some(demuxer), Some(remuxer)) = (&mut self.demuxer, &mut self.remuxer) else {
            return Ok(vec![self.finish_empty(chunk_meta)]);
        };
        let tracks = demuxer.flush(time_offset).await;
        let remux_result = remuxer.remux(tracks, time_offset, accurate_time_offset, true, self.stream);
        results.push(TransmuxerResult {
            remux_result,
            chunk_meta,
        });

        let end = self.clock.now_millis();
        for result in &mut results {
            result.chunk_meta.transmuxing.execute_end = end;
        }
        Ok(results)
    }

    /// Tear down the muxer pair. Later pushes and flushes are no-ops.
    pub fn destroy(&mut self) {
        self.demuxer = None;
        self.remuxer = None;
        self.container = None;
        self.terminated = true;
    }

    fn needs_probing(&self, discontinuity: bool, track_switch: bool) -> bool {
        self.demuxer.is_none() || self.remuxer.is_none() || discontinuity || track_switch
    }

    /// Select a muxer pair for the bytes at hand.
    ///
    /// Fresh streams probe strictly: an inconclusive result returns `false`
    /// and the caller accumulates. When a pair is already bound (re-probe
    /// after a discontinuity or track switch) unmatched content falls back
    /// to passthrough so the pipeline keeps moving.
    fn configure_transmuxer(&mut self, data: &[u8]) -> bool {
        let bound = self.demuxer.is_some() && self.remuxer.is_some();
        let entry = if bound {
            let (entry, _fell_back) = self.registry.select_or_fallback(data);
            entry
        } else {
            match self.registry.select(data) {
                Some(entry) => entry,
                None => return false,
            }
        };

        if self.container != Some(entry.container) || !bound {
            debug!(container = ?entry.container, "instantiating demuxer/remuxer pair");
            self.demuxer = Some((entry.demuxer)(&self.observer, self.type_supported));
            self.remuxer = Some((entry.remuxer)(
                &self.observer,
                self.type_supported,
                &self.vendor,
            ));
            self.container = Some(entry.container);
        }

        // fresh instances carry no init state; seed them unconditionally
        self.reset_init_segment();
        self.reset_initial_timestamp();
        true
    }

    fn transmux(
        &mut self,
        data: Bytes,
        time_offset: f64,
        accurate_time_offset: bool,
        contiguous: bool,
        chunk_meta: ChunkMetadata,
    ) -> TransmuxerResult {
        let (Some(demuxer), Some(remuxer)) = (&mut self.demuxer, &mut self.remuxer) else {
            return TransmuxerResult::empty(chunk_meta);
        };
        let flush = !self.options.progressive;
        let tracks = demuxer.demux(data, time_offset, contiguous, flush);
        let remux_result =
            remuxer.remux(tracks, time_offset, accurate_time_offset, false, self.stream);
        TransmuxerResult {
            remux_result,
            chunk_meta,
        }
    }

    async fn transmux_sample_aes(
        &mut self,
        data: Bytes,
        key_data: KeyData,
        time_offset: f64,
        accurate_time_offset: bool,
        chunk_meta: ChunkMetadata,
    ) -> Result<TransmuxerResult, TransmuxError> {
        let (Some(demuxer), Some(remuxer)) = (&mut self.demuxer, &mut self.remuxer) else {
            return Ok(TransmuxerResult::empty(chunk_meta));
        };
        let tracks = demuxer.demux_sample_aes(data, key_data, time_offset).await?;
        let remux_result =
            remuxer.remux(tracks, time_offset, accurate_time_offset, false, self.stream);
        Ok(TransmuxerResult {
            remux_result,
            chunk_meta,
        })
    }

    fn reset_init_segment(&mut self) {
        let (Some(demuxer), Some(remuxer)) = (&mut self.demuxer, &mut self.remuxer) else {
            return;
        };
        demuxer.reset_init_segment(
            self.config.init_segment_data.as_ref(),
            self.config.audio_codec.as_deref(),
            self.config.video_codec.as_deref(),
            self.config.duration,
        );
        remuxer.reset_init_segment(
            self.config.init_segment_data.as_ref(),
            self.config.audio_codec.as_deref(),
            self.config.video_codec.as_deref(),
        );
    }

    fn reset_initial_timestamp(&mut self) {
        let (Some(demuxer), Some(remuxer)) = (&mut self.demuxer, &mut self.remuxer) else {
            return;
        };
        demuxer.reset_timestamp(self.config.default_init_pts);
        remuxer.reset_timestamp(self.config.default_init_pts);
    }

    fn reset_contiguity(&mut self) {
        let (Some(demuxer), Some(remuxer)) = (&mut self.demuxer, &mut self.remuxer) else {
            return;
        };
        demuxer.reset_contiguity();
        remuxer.reset_next_timestamp();
    }

    fn finish_empty(&self, mut chunk_meta: ChunkMetadata) -> TransmuxerResult {
        chunk_meta.transmuxing.execute_end = self.clock.now_millis();
        TransmuxerResult::empty(chunk_meta)
    }
}
