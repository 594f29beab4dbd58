#![forbid(unsafe_code)]

//! Unified event bus for the syrinx transmuxing pipeline.

mod bus;
mod event;
mod transmux;

pub use bus::EventBus;
pub use event::Event;
pub use transmux::{ErrorDetails, ErrorKind, TransmuxEvent};
