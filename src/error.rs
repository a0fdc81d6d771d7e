//! Error types for option validation, startup activation, and capture-time
//! decoding.
//!
//! Two classes exist. Option and startup errors are fatal: the process
//! bootstrap reports them and exits, nothing is retried. Decode errors are
//! soft: they are logged once per capture, the affected snapshot keeps
//! whatever was populated before the bad record, and execution continues.

use thiserror::Error;

/// Rejected architecture option value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OptionError {
    #[error("unknown option --{0}")]
    Unknown(String),

    #[error("invalid value for --{name}: {value} not in {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("invalid value for --{name}: {value} is not a power of two")]
    NotPowerOfTwo { name: &'static str, value: i64 },
}

/// Failed one-time capability activation.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("mismatched vector quantities: sve {sve} vs za {za}")]
    VectorLengthConflict { sve: u16, za: u16 },

    #[error("host does not support {feature}")]
    HostUnsupported { feature: &'static str },

    #[error("unsupported {feature} vector quantity: requested {want}, host offers {got}")]
    VectorLengthRejected {
        feature: &'static str,
        want: u16,
        got: u16,
    },

    #[error("vector length selection failed: {0}")]
    Syscall(#[from] std::io::Error),

    #[error("vector configuration requires an aarch64 linux host")]
    WrongHost,
}

/// Malformed extended state in a single trap's machine context.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("missing FP/SIMD record")]
    MissingFpRecord,

    #[error("FP/SIMD record has unexpected size {0}")]
    BadFpRecordSize(u32),

    #[error("missing vector record")]
    MissingVectorRecord,

    #[error("missing tile record")]
    MissingTileRecord,

    #[error("unexpected vector length {found}, configured {expected}")]
    VectorLengthMismatch { found: u16, expected: u16 },

    #[error("record {magic:#010x} has size {size}, need {need}")]
    TruncatedRecord { magic: u32, size: u32, need: u32 },

    #[error("record at offset {offset} with size {size} overruns the context buffer")]
    RecordOverrun { offset: usize, size: u32 },

    #[error("indirection record inside an out-of-line buffer")]
    NestedIndirection,
}
