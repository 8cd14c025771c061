use thiserror::Error;

/// Errors produced while recording segments.
#[derive(Debug, Error)]
pub enum RecordError {
    /// Storage failure while creating, writing, seeking or closing a file.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An expected box was not found where the file layout requires it.
    #[error("{expected} box not found")]
    BoxNotFound { expected: &'static str },

    /// The movie header uses a layout we do not know how to patch.
    #[error("unsupported mvhd version {0}")]
    UnsupportedHeaderVersion(u8),

    /// The recording configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A sample referenced a track the recorder was not created with.
    #[error("unknown track {0}")]
    UnknownTrack(u32),

    /// A sample decode timestamp went backwards.
    #[error("sample dts is lower than the previous one on track {0}")]
    NonMonotonicDts(u32),
}

pub type Result<T> = std::result::Result<T, RecordError>;
