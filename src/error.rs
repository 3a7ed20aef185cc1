use thiserror::Error;

/// Catch-all failure type for the crate.
///
/// Most error conditions described by the wire protocol (malformed JSON,
/// unknown gossip subjects, replayed/gapped sequence numbers) are not
/// represented here at all — they are swallowed at the event-loop boundary
/// with a debug log, per the error handling design. Only the handful of
/// genuinely user-visible failures get a variant.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic capture failure, mirrors the reference `CaptureError`.
    #[error("capture error: {0}")]
    Capture(String),

    /// Subkind of capture failure: unsupported video format code, a
    /// `get_newest_data_frame` timeout, or an unknown event encoding code.
    #[error("stream error: {0}")]
    Stream(String),

    /// A data-plane operation (`has_data`, `fetch_data`, ...) was invoked on
    /// a session with no data socket.
    #[error("sensor session has no data subscription")]
    NotDataSubSupported,

    /// A formatter was requested for a (sensor kind, wire format) pair that
    /// has no decoder.
    #[error("unsupported data format")]
    UnsupportedFormat,

    /// The façade or a node was asked for a sensor uuid it does not know.
    #[error("unknown sensor: {0}")]
    UnknownSensor(String),

    /// A binary payload was shorter than its fixed layout requires.
    #[error("malformed payload: {0}")]
    Malformed(&'static str),

    #[error("zmq error: {0}")]
    Zmq(#[from] zmq::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
