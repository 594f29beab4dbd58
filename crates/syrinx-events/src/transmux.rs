#![forbid(unsafe_code)]

/// Broad classification of a pipeline error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The media payload itself is at fault: the whole segment could not
    /// be identified or its cipher stream was cut short.
    Media,
    /// A muxing component choked on its input stream mid-segment, e.g.
    /// the transport stream demuxer losing sync.
    Mux,
}

/// Specific error condition, stable across releases for callers that match on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorDetails {
    /// Segment bytes could not be parsed as any supported container.
    FragParsing,
    /// Segment decryption left unusable data behind (ciphertext ended on
    /// a partial block).
    FragDecrypt,
}

/// Events emitted while transmuxing segments.
///
/// Fatal errors mean the current segment cannot produce output; the caller
/// decides whether to retry, switch renditions, or give up.
#[derive(Clone, Debug)]
pub enum TransmuxEvent {
    /// An error surfaced by the transmuxer or one of its muxers.
    Error {
        kind: ErrorKind,
        details: ErrorDetails,
        fatal: bool,
        reason: String,
    },
}
