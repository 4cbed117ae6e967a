use thiserror::Error;

#[derive(Debug, Error)]
pub enum TapeError {
    #[error("Not a RIFF/WAVE file")]
    InvalidWavHeader,

    #[error("Unsupported WAV format id {0}")]
    UnsupportedWavFormat(u16),

    #[error("Sample rate {0} out of range 11025..=48000")]
    SampleRateOutOfRange(u32),

    #[error("Invalid T9X header")]
    InvalidT9xHeader,

    #[error("Invalid baud rate {0}")]
    InvalidBaudRate(i32),

    #[error("Insufficient data")]
    InsufficientData,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TapeError>;
