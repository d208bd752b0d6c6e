//! Single-producer, multi-reader frame ring.
//!
//! The region is a header followed by `max_entries` fixed-size slots. Slots
//! are addressed by index only. The producer appends with
//! [`RingWriter::write`]; readers copy slots out by index with
//! [`RingReader::read`] and re-validate the readable range on every access.
//! No lock guards the region: a read racing a write may observe the newer
//! contents, and overruns are detected after the fact through
//! `num_frames_written`.

mod buffer;
pub mod record;

use thiserror::Error;

pub use buffer::{create, RingReader, RingWriter, WriteOutcome};
pub use record::{DecodeError, FrameRecord, RECORD_SIZE};

/// Errors returned by ring operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("index {index} outside readable range [{head}, {tail})")]
    OutOfBoundsIndex {
        index: usize,
        head: usize,
        tail: usize,
    },

    #[error("producer is no longer active")]
    ProducerGone,

    #[error("ring capacity must be at least 2, got {capacity}")]
    InvalidCapacity { capacity: usize },

    #[error("qpc frequency must be non-zero")]
    InvalidQpcFrequency,

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Replay-mode flags published in the header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaybackFlags {
    pub is_playback: bool,
    pub paced: bool,
    pub retimed: bool,
    /// The producer refuses to overwrite unread slots.
    pub backpressured: bool,
    /// Consumers anchor at the oldest slot instead of the newest.
    pub reset_oldest: bool,
}

/// Parameters for a new ring region.
#[derive(Debug, Clone)]
pub struct RingOptions {
    pub name: String,
    pub capacity: usize,
    pub qpc_frequency: u64,
    pub flags: PlaybackFlags,
}

/// GPU telemetry capabilities, one bit each in the header bitset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GpuTelemetryCap {
    TimeStamp = 0,
    GpuPower,
    GpuSustainedPowerLimit,
    GpuVoltage,
    GpuFrequency,
    GpuTemperature,
    GpuUtilization,
    GpuRenderComputeUtilization,
    GpuMediaUtilization,
    VramPower,
    VramVoltage,
    VramFrequency,
    VramEffectiveFrequency,
    VramTemperature,
    FanSpeed0,
    FanSpeed1,
    FanSpeed2,
    FanSpeed3,
    FanSpeed4,
    PsuInfo0,
    PsuInfo1,
    PsuInfo2,
    PsuInfo3,
    PsuInfo4,
    GpuMemSize,
    GpuMemUsed,
    GpuMemMaxBandwidth,
    GpuMemWriteBandwidth,
    GpuMemReadBandwidth,
    GpuPowerLimited,
    GpuTemperatureLimited,
    GpuCurrentLimited,
    GpuVoltageLimited,
    GpuUtilizationLimited,
    VramPowerLimited,
    VramTemperatureLimited,
    VramCurrentLimited,
    VramVoltageLimited,
    VramUtilizationLimited,
}

impl GpuTelemetryCap {
    #[inline]
    pub fn mask(self) -> u64 {
        1u64 << (self as u8)
    }
}

/// CPU telemetry capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuTelemetryCap {
    CpuUtilization = 0,
    CpuPower,
    CpuPowerLimit,
    CpuTemperature,
    CpuFrequency,
}

impl CpuTelemetryCap {
    #[inline]
    pub fn mask(self) -> u64 {
        1u64 << (self as u8)
    }
}
