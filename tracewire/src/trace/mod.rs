//! Trace and span identity.
//!
//! Identifiers are opaque fixed-width values: a [`TraceId`] is 128 bits
//! rendered as 32 lowercase hex characters, a [`SpanId`] is 64 bits rendered
//! as 16. Ids arriving over the wire may legitimately be shorter than their
//! nominal width (peers that only propagate 64-bit trace ids, for example);
//! ingestion zero-pads them instead of rejecting them, and padding plus
//! re-rendering round-trips the id bit for bit.

use std::fmt;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

/// Describes the causal role of a span within its trace.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpanKind {
    /// The causal root of a call chain, triggered from outside the process.
    Entry,
    /// An outbound call to a dependency.
    Exit,
    /// An internal operation nested inside another span.
    Intermediate,
}

impl fmt::Display for SpanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpanKind::Entry => write!(f, "entry"),
            SpanKind::Exit => write!(f, "exit"),
            SpanKind::Intermediate => write!(f, "intermediate"),
        }
    }
}

/// A 16-byte value identifying a trace.
///
/// The id is valid if it contains at least one non-zero byte. It is
/// generated once at the first entry span of a causal chain and shared,
/// unchanged, by every descendant span.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct TraceId(u128);

impl TraceId {
    /// The invalid (all-zero) trace id.
    pub const INVALID: TraceId = TraceId(0);

    /// Create a trace id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        TraceId(u128::from_be_bytes(bytes))
    }

    /// Return the representation of this trace id as a byte array.
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    /// Converts a base-16 string to a trace id.
    ///
    /// Strings shorter than 32 characters are zero-padded on the left;
    /// longer or non-hex input is an error.
    ///
    /// ```
    /// use tracewire::trace::TraceId;
    ///
    /// assert!(TraceId::from_hex("42").is_ok());
    /// assert!(TraceId::from_hex("58406520a006649127e371903a2de979").is_ok());
    /// assert!(TraceId::from_hex("not_hex").is_err());
    /// ```
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u128::from_str_radix(hex, 16).map(TraceId)
    }
}

impl From<u128> for TraceId {
    fn from(value: u128) -> Self {
        TraceId(value)
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:032x}", self.0))
    }
}

impl fmt::LowerHex for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// An 8-byte value identifying a span.
///
/// The id is valid if it contains at least one non-zero byte.
#[derive(Clone, PartialEq, Eq, Copy, Hash)]
pub struct SpanId(u64);

impl SpanId {
    /// The invalid (all-zero) span id.
    pub const INVALID: SpanId = SpanId(0);

    /// Create a span id from its representation as a byte array.
    pub const fn from_bytes(bytes: [u8; 8]) -> Self {
        SpanId(u64::from_be_bytes(bytes))
    }

    /// Return the representation of this span id as a byte array.
    pub const fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    /// Converts a base-16 string to a span id.
    ///
    /// Strings shorter than 16 characters are zero-padded on the left;
    /// longer or non-hex input is an error.
    pub fn from_hex(hex: &str) -> Result<Self, ParseIntError> {
        u64::from_str_radix(hex, 16).map(SpanId)
    }
}

impl From<u64> for SpanId {
    fn from(value: u64) -> Self {
        SpanId(value)
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:016x}", self.0))
    }
}

impl fmt::LowerHex for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Errors returned by the tracing engine.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TraceError {
    /// Handing spans to the export channel failed.
    #[error("span export failed: {0}")]
    ExportFailed(String),

    /// Exporting did not complete within the allowed time.
    #[error("span export timed out after {0:?}")]
    ExportTimedOut(Duration),

    /// The component has already been shut down.
    #[error("already shut down")]
    AlreadyShutdown,

    /// Any other error.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// A specialized `Result` for trace operations.
pub type TraceResult<T> = Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[rustfmt::skip]
    fn trace_id_test_data() -> Vec<(TraceId, &'static str, [u8; 16])> {
        vec![
            (TraceId(0), "00000000000000000000000000000000", [0; 16]),
            (TraceId(42), "0000000000000000000000000000002a", [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 42]),
            (TraceId(126642714606581564793456114182061442190), "5f467fe7bf42676c05e20ba4a90e448e", [95, 70, 127, 231, 191, 66, 103, 108, 5, 226, 11, 164, 169, 14, 68, 142]),
        ]
    }

    #[rustfmt::skip]
    fn span_id_test_data() -> Vec<(SpanId, &'static str, [u8; 8])> {
        vec![
            (SpanId(0), "0000000000000000", [0; 8]),
            (SpanId(42), "000000000000002a", [0, 0, 0, 0, 0, 0, 0, 42]),
            (SpanId(5508496025762705295), "4c721bf33e3caf8f", [76, 114, 27, 243, 62, 60, 175, 143]),
        ]
    }

    #[test]
    fn trace_id_round_trip() {
        for (id, hex, bytes) in trace_id_test_data() {
            assert_eq!(format!("{id}"), hex);
            assert_eq!(id.to_bytes(), bytes);
            assert_eq!(id, TraceId::from_hex(hex).unwrap());
            assert_eq!(id, TraceId::from_bytes(bytes));
        }
    }

    #[test]
    fn span_id_round_trip() {
        for (id, hex, bytes) in span_id_test_data() {
            assert_eq!(format!("{id}"), hex);
            assert_eq!(id.to_bytes(), bytes);
            assert_eq!(id, SpanId::from_hex(hex).unwrap());
            assert_eq!(id, SpanId::from_bytes(bytes));
        }
    }

    #[test]
    fn short_ids_are_zero_padded() {
        // 64-bit wire ids are accepted for the 128-bit trace id
        let id = TraceId::from_hex("4c721bf33e3caf8f").unwrap();
        assert_eq!(format!("{id}"), "00000000000000004c721bf33e3caf8f");

        let id = SpanId::from_hex("2a").unwrap();
        assert_eq!(format!("{id}"), "000000000000002a");
    }

    #[test]
    fn over_width_ids_are_rejected() {
        assert!(TraceId::from_hex("f5f467fe7bf42676c05e20ba4a90e448e").is_err());
        assert!(SpanId::from_hex("f4c721bf33e3caf8f").is_err());
    }
}
