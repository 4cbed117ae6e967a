//! Cassette tape data recovery and synthesis library
//!
//! Converts between FSK audio, carrier bits, serial bit frames, raw bytes and
//! named tape sections, in both directions, with baud auto-detection and
//! waveform correction for degraded recordings.

pub mod error;
pub mod sample;
pub mod milestone;
pub mod dft;
pub mod resample;
pub mod wave;
pub mod carrier;
pub mod serial;
pub mod binary;
pub mod report;
pub mod pipeline;

pub use error::{Result, TapeError};
pub use pipeline::{
    ChkWave, FileType, PipelineInput, PipelineOrchestrator, PipelineParams, StageSignal,
};
pub use sample::{Sample, SampleStream};

// Configuration constants
pub const DATA_ARRAY_SIZE: usize = 131072;

/// Baud rates by pattern tier index (600, 1200, 2400, 300)
pub const BAUD_RATE: [u32; 4] = [600, 1200, 2400, 300];
/// Slowest-first order to tier index
pub const BAUD_MIN_TO_TIER: [usize; 4] = [3, 0, 1, 2];
/// Tier index to slowest-first order
pub const BAUD_TIER_TO_MIN: [usize; 4] = [1, 2, 3, 0];

/// FSK tone pair at standard speed (space, mark)
pub const FSK_FREQ_LOW: u32 = 1200;
pub const FSK_FREQ_HIGH: u32 = 2400;

pub const T9X_IDENTIFIER: &[u8; 32] = b"eMB-689X CassetteTapeImageFile  ";
