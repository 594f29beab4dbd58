#![forbid(unsafe_code)]

//! Segment transmuxer core.
//!
//! Ingests media segment bytes from an adaptive streaming client —
//! possibly encrypted, possibly in arbitrary-sized chunks — identifies the
//! container family by probing, demuxes the elementary streams, and
//! remuxes everything into fragmented MP4 for a media source buffer.
//!
//! The [`Transmuxer`] is the single entry point; the host drives it with
//! `configure`/`push`/`flush`/`destroy`. Collaborating demuxers and
//! remuxers live in `syrinx-demux` / `syrinx-remux` and are selected
//! through the [`ProbeRegistry`].

mod cache;
mod clock;
mod meta;
mod probe;
mod state;
mod transmuxer;

pub use cache::ChunkCache;
pub use clock::{Clock, MonotonicClock, SystemClock};
pub use meta::{ChunkMetadata, TimingInfo};
pub use probe::{DemuxerFactory, ProbeEntry, ProbeRegistry, RemuxerFactory};
pub use state::{TransmuxConfig, TransmuxState, TransmuxerOptions};
pub use transmuxer::{TransmuxError, Transmuxer, TransmuxerResult};

// the vocabulary hosts need to drive the transmuxer
pub use syrinx_demux::{ContainerFormat, MediaTimestamp, TypeSupported};
pub use syrinx_drm::{KeyMethod, SegmentKey};
pub use syrinx_events::{ErrorDetails, ErrorKind, Event, EventBus, TransmuxEvent};
pub use syrinx_remux::StreamKind;
