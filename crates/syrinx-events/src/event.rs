#![forbid(unsafe_code)]

use crate::TransmuxEvent;

/// Unified event for the transmuxing pipeline.
///
/// Hierarchical: each subsystem has its own variant with a sub-enum.
#[derive(Clone, Debug)]
pub enum Event {
    /// Transmuxer event.
    Transmux(TransmuxEvent),
}

impl From<TransmuxEvent> for Event {
    fn from(e: TransmuxEvent) -> Self {
        Self::Transmux(e)
    }
}
