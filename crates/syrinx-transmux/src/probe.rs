#![forbid(unsafe_code)]

//! Ordered registry of container probes and muxer factories.

use syrinx_demux::{
    ContainerFormat, Demuxer, TypeSupported, adts, mp4, mpa, ts,
};
use syrinx_events::EventBus;
use syrinx_remux::{Mp4Remuxer, PassthroughRemuxer, Remuxer};
use tracing::warn;

/// Registry-wide probe floor: below this many bytes no verdict is final.
const MIN_PROBE_FLOOR: usize = 1024;

pub type DemuxerFactory = fn(&EventBus, TypeSupported) -> Box<dyn Demuxer>;
pub type RemuxerFactory = fn(&EventBus, TypeSupported, &str) -> Box<dyn Remuxer>;

/// One probe-table row: a container family, its probe predicate, and the
/// factories for the demuxer/remuxer pair that handles it.
#[derive(Clone, Copy)]
pub struct ProbeEntry {
    pub container: ContainerFormat,
    pub min_probe_len: usize,
    pub probe: fn(&[u8]) -> bool,
    pub demuxer: DemuxerFactory,
    pub remuxer: RemuxerFactory,
}

fn mp4_remuxer(observer: &EventBus, type_supported: TypeSupported, vendor: &str) -> Box<dyn Remuxer> {
    Box::new(Mp4Remuxer::new(observer.clone(), type_supported, vendor))
}

/// First-match-wins probe table.
///
/// Precedence puts fragmented MP4 first so the common passthrough path
/// short-circuits, then MPEG-TS, then the elementary audio formats.
pub struct ProbeRegistry {
    entries: Vec<ProbeEntry>,
}

impl ProbeRegistry {
    /// The standard four-family table.
    pub fn standard() -> Self {
        Self {
            entries: vec![
                ProbeEntry {
                    container: ContainerFormat::Fmp4,
                    min_probe_len: mp4::MIN_PROBE_LEN,
                    probe: mp4::probe,
                    demuxer: |observer, _| Box::new(mp4::Mp4Demuxer::new(observer.clone())),
                    remuxer: |observer, _, _| Box::new(PassthroughRemuxer::new(observer.clone())),
                },
                ProbeEntry {
                    container: ContainerFormat::MpegTs,
                    min_probe_len: ts::MIN_PROBE_LEN,
                    probe: ts::probe,
                    demuxer: |observer, type_supported| {
                        Box::new(ts::TsDemuxer::new(observer.clone(), type_supported))
                    },
                    remuxer: mp4_remuxer,
                },
                ProbeEntry {
                    container: ContainerFormat::Adts,
                    min_probe_len: adts::MIN_PROBE_LEN,
                    probe: adts::probe,
                    demuxer: |observer, _| Box::new(adts::AdtsDemuxer::new(observer.clone())),
                    remuxer: mp4_remuxer,
                },
                ProbeEntry {
                    container: ContainerFormat::Mp3,
                    min_probe_len: mpa::MIN_PROBE_LEN,
                    probe: mpa::probe,
                    demuxer: |observer, _| Box::new(mpa::MpaDemuxer::new(observer.clone())),
                    remuxer: mp4_remuxer,
                },
            ],
        }
    }

    /// Bytes needed before a failed probe is conclusive: the largest
    /// per-entry requirement, floored at 1024.
    pub fn min_probe_byte_length(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.min_probe_len)
            .max()
            .unwrap_or(0)
            .max(MIN_PROBE_FLOOR)
    }

    /// Strict selection: the first entry whose probe accepts the bytes.
    pub fn select(&self, data: &[u8]) -> Option<ProbeEntry> {
        self.entries.iter().copied().find(|e| (e.probe)(data))
    }

    /// Selection with fallback: unmatched content maps to the passthrough
    /// pair so the pipeline keeps moving; the second element reports
    /// whether the fallback was taken.
    pub fn select_or_fallback(&self, data: &[u8]) -> (ProbeEntry, bool) {
        match self.select(data) {
            Some(entry) => (entry, false),
            None => {
                warn!(
                    len = data.len(),
                    "no demuxer matched segment bytes, treating as mp4 passthrough"
                );
                (self.entries[0], true)
            }
        }
    }
}

impl Default for ProbeRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_dominates_entry_minimums() {
        let registry = ProbeRegistry::standard();
        assert_eq!(registry.min_probe_byte_length(), 1024);
    }

    #[test]
    fn fmp4_wins_precedence() {
        let registry = ProbeRegistry::standard();
        // an ftyp box and nothing else
        let mut data = 16u32.to_be_bytes().to_vec();
        data.extend_from_slice(b"ftypisom");
        data.extend_from_slice(&[0u8; 4]);
        let entry = registry.select(&data).expect("fmp4 probe");
        assert_eq!(entry.container, ContainerFormat::Fmp4);
    }

    #[test]
    fn unknown_content_selects_nothing_strictly() {
        let registry = ProbeRegistry::standard();
        assert!(registry.select(&[0x55; 4096]).is_none());
    }

    #[test]
    fn fallback_lands_on_passthrough() {
        let registry = ProbeRegistry::standard();
        let (entry, fell_back) = registry.select_or_fallback(&[0x55; 4096]);
        assert!(fell_back);
        assert_eq!(entry.container, ContainerFormat::Fmp4);
    }
}
