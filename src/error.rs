//! Error types for the relay.
//!
//! Each component owns a small error enum; the session and the binary wrap
//! them. Shutdown is never an error: a closed ring buffer surfaces as
//! end-of-stream on the read side and as [`BufferError::Closed`] on the
//! write side, which the producer treats as a clean stop.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("ring buffer is closed")]
    Closed,

    #[error("seek to {requested} outside of rewindable span {low}..={high}")]
    SeekOutOfRange { requested: i128, low: u64, high: u64 },

    #[error("no mark is set on the ring buffer")]
    NoMark,
}

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("the producer address cannot be changed while it is running")]
    AlreadyRunning,

    #[error("the producer has no socket; call bind() first")]
    NotBound,

    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("upload session is not connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum DestinationError {
    #[error("local file error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error("upload server {server} rejected {filename}")]
    Rejected { server: String, filename: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no output streams were configured")]
    NoOutputStreams,

    #[error("output was not opened before writing")]
    NotOpen,
}

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("stream probing exhausted at probe size {probe_size} bytes / analyze duration {analyze_duration_us}us: {cause}")]
    ProbeExhausted {
        probe_size: u64,
        analyze_duration_us: u64,
        cause: String,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("switch rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("the consumer stopped before the switch completed")]
    ConsumerStopped,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("configuration validation error: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::Load(Box::new(err))
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Producer(#[from] ProducerError),

    #[error(transparent)]
    Destination(#[from] DestinationError),

    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}
