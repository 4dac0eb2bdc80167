use thiserror::Error;

/// All errors produced by auricle-core.
#[derive(Debug, Error)]
pub enum AuricleError {
    #[error("config error: {0}")]
    Config(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("backend load error: {0}")]
    BackendLoad(String),

    #[error("transcription error: {0}")]
    Transcription(String),

    #[error("queue error: {0}")]
    Queue(#[from] rusqlite::Error),

    #[error("queue item not found: {0}")]
    ItemNotFound(String),

    #[error("invalid queue transition for item {0}")]
    InvalidTransition(String),

    #[error("pipeline is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AuricleError>;
