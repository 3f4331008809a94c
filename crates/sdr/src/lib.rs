// Copyright 2025-2026 CEMAXECUTER LLC

//! Crossband: one device model over heterogeneous SDR front-ends.
//!
//! Drivers register a [`registry::DriverDescriptor`] and the
//! [`factory`] hands out reference-counted [`device::Device`] instances.
//! Sample I/O runs through a per-direction [`stream::Stream`] backed by a
//! lock-protected ring of fixed-size buffers shared with the native
//! driver's USB callback thread.

pub mod args;
pub mod codec;
pub mod device;
pub mod factory;
pub mod null;
pub mod registry;
pub mod ring;
pub mod session;
pub mod stream;
pub mod time;

#[cfg(feature = "hackrf")]
pub mod hackrf;

#[cfg(feature = "rtlsdr")]
pub mod rtlsdr;

#[cfg(feature = "airspy")]
pub mod airspy;

pub use args::Kwargs;
pub use device::{Device, Range, TransceiverMode};
pub use stream::Stream;

/// Stream direction. The integer values are part of the wire surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Direction {
    Tx = 0,
    Rx = 1,
}

impl Direction {
    pub fn name(self) -> &'static str {
        match self {
            Direction::Tx => "TX",
            Direction::Rx => "RX",
        }
    }
}

/// Hot-path stream result codes. Success is represented by `Ok`, so only
/// the negative codes appear here; the integer values are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Timeout = -1,
    StreamError = -2,
    Corruption = -3,
    Overflow = -4,
    NotSupported = -5,
    TimeError = -6,
    Underflow = -7,
}

/// Success code for the C-style surface.
pub const ERR_NONE: i32 = 0;

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            -1 => Some(ErrorCode::Timeout),
            -2 => Some(ErrorCode::StreamError),
            -3 => Some(ErrorCode::Corruption),
            -4 => Some(ErrorCode::Overflow),
            -5 => Some(ErrorCode::NotSupported),
            -6 => Some(ErrorCode::TimeError),
            -7 => Some(ErrorCode::Underflow),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::Timeout => "timeout",
            ErrorCode::StreamError => "stream error",
            ErrorCode::Corruption => "corruption",
            ErrorCode::Overflow => "overflow",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::TimeError => "time error",
            ErrorCode::Underflow => "underflow",
        };
        write!(f, "{}", name)
    }
}

/// Stream flags, a bitfield shared by the activate/read/write paths.
pub mod flags {
    /// The transfer ends an exact-length burst.
    pub const END_BURST: u32 = 1 << 1;
    /// `time_ns` carries a valid timestamp.
    pub const HAS_TIME: u32 = 1 << 2;
    /// The transfer ended abruptly (data was dropped).
    pub const END_ABRUPT: u32 = 1 << 3;
    /// Do not span multiple transfers in one call.
    pub const ONE_PACKET: u32 = 1 << 4;
    /// More fragments of the same packet follow.
    pub const MORE_FRAGMENTS: u32 = 1 << 5;
    /// Wait for an external trigger before streaming.
    pub const WAIT_TRIGGER: u32 = 1 << 6;
    /// Flag bits 16..20 are reserved for user layers.
    pub const USER_FLAG0: u32 = 1 << 16;
    pub const USER_FLAG1: u32 = 1 << 17;
    pub const USER_FLAG2: u32 = 1 << 18;
    pub const USER_FLAG3: u32 = 1 << 19;
    pub const USER_FLAG4: u32 = 1 << 20;
}

/// Stream format strings, the exact wire constants.
pub mod format {
    pub const CF64: &str = "CF64";
    pub const CF32: &str = "CF32";
    pub const CS32: &str = "CS32";
    pub const CU32: &str = "CU32";
    pub const CS16: &str = "CS16";
    pub const CU16: &str = "CU16";
    pub const CS12: &str = "CS12";
    pub const CU12: &str = "CU12";
    pub const CS8: &str = "CS8";
    pub const CU8: &str = "CU8";
    pub const CS4: &str = "CS4";
    pub const CU4: &str = "CU4";
    pub const F64: &str = "F64";
    pub const F32: &str = "F32";
    pub const S32: &str = "S32";
    pub const U32: &str = "U32";
    pub const S16: &str = "S16";
    pub const U16: &str = "U16";
    pub const S8: &str = "S8";
    pub const U8: &str = "U8";
}

/// The four client-side sample formats of the streaming engine, all
/// interleaved-complex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    Cs8,
    Cs16,
    Cf32,
    Cf64,
}

impl SampleFormat {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            format::CS8 => Some(SampleFormat::Cs8),
            format::CS16 => Some(SampleFormat::Cs16),
            format::CF32 => Some(SampleFormat::Cf32),
            format::CF64 => Some(SampleFormat::Cf64),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleFormat::Cs8 => format::CS8,
            SampleFormat::Cs16 => format::CS16,
            SampleFormat::Cf32 => format::CF32,
            SampleFormat::Cf64 => format::CF64,
        }
    }

    /// Bytes per interleaved complex sample (two components).
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::Cs8 => 2,
            SampleFormat::Cs16 => 4,
            SampleFormat::Cf32 => 8,
            SampleFormat::Cf64 => 16,
        }
    }
}

/// Outcome of a successful read or write call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamResult {
    /// Complex samples transferred.
    pub samples: usize,
    pub flags: u32,
    pub time_ns: i64,
}

/// Configuration and lifecycle errors. Stream hot paths use [`ErrorCode`]
/// instead.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid device arguments: {0}")]
    InvalidArgs(String),

    #[error("no device found matching \"{0}\"")]
    NoDevice(String),

    #[error("driver \"{0}\" is not registered")]
    UnknownDriver(String),

    #[error("{driver}: {op} failed (error {code})")]
    Driver {
        driver: &'static str,
        op: &'static str,
        code: i32,
    },

    #[error("{0} library is not available")]
    LibraryNotFound(&'static str),

    #[error("channel {0} out of range")]
    InvalidChannel(usize),

    #[error("stream format \"{0}\" not supported")]
    UnsupportedFormat(String),

    #[error("{} stream already open", .0.name())]
    StreamOpen(Direction),

    #[error("{} stream is not open", .0.name())]
    StreamNotOpen(Direction),

    #[error("unknown element \"{0}\"")]
    UnknownElement(String),

    #[error("unknown antenna \"{0}\"")]
    UnknownAntenna(String),

    #[error("unknown setting \"{0}\"")]
    UnknownSetting(String),

    #[error("invalid value \"{value}\" for setting \"{key}\"")]
    InvalidSetting { key: String, value: String },

    #[error("{0} not supported")]
    NotSupported(&'static str),

    #[error("module error: {0}")]
    Module(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_values() {
        assert_eq!(ERR_NONE, 0);
        assert_eq!(ErrorCode::Timeout.code(), -1);
        assert_eq!(ErrorCode::StreamError.code(), -2);
        assert_eq!(ErrorCode::Corruption.code(), -3);
        assert_eq!(ErrorCode::Overflow.code(), -4);
        assert_eq!(ErrorCode::NotSupported.code(), -5);
        assert_eq!(ErrorCode::TimeError.code(), -6);
        assert_eq!(ErrorCode::Underflow.code(), -7);
    }

    #[test]
    fn test_error_code_roundtrip() {
        for code in -7..=-1 {
            let ec = ErrorCode::from_code(code).expect("known code");
            assert_eq!(ec.code(), code);
        }
        assert_eq!(ErrorCode::from_code(0), None);
        assert_eq!(ErrorCode::from_code(-8), None);
    }

    #[test]
    fn test_flag_values() {
        assert_eq!(flags::END_BURST, 2);
        assert_eq!(flags::HAS_TIME, 4);
        assert_eq!(flags::END_ABRUPT, 8);
        assert_eq!(flags::ONE_PACKET, 16);
        assert_eq!(flags::MORE_FRAGMENTS, 32);
        assert_eq!(flags::WAIT_TRIGGER, 64);
        assert_eq!(flags::USER_FLAG0, 1 << 16);
        assert_eq!(flags::USER_FLAG4, 1 << 20);
    }

    #[test]
    fn test_direction_values() {
        assert_eq!(Direction::Tx as i32, 0);
        assert_eq!(Direction::Rx as i32, 1);
    }

    #[test]
    fn test_sample_format_sizes() {
        assert_eq!(SampleFormat::Cs8.bytes_per_sample(), 2);
        assert_eq!(SampleFormat::Cs16.bytes_per_sample(), 4);
        assert_eq!(SampleFormat::Cf32.bytes_per_sample(), 8);
        assert_eq!(SampleFormat::Cf64.bytes_per_sample(), 16);
    }

    #[test]
    fn test_sample_format_names() {
        for fmt in [
            SampleFormat::Cs8,
            SampleFormat::Cs16,
            SampleFormat::Cf32,
            SampleFormat::Cf64,
        ] {
            assert_eq!(SampleFormat::from_name(fmt.name()), Some(fmt));
        }
        assert_eq!(SampleFormat::from_name("CU8"), None);
    }
}
