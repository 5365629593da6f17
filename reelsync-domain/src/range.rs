//! Range admission and truncation.
//!
//! A viewer's `Range` header is validated against the file length and then
//! clipped to `max_request_bytes`.  Clipping is what bounds how long one
//! client can hold the scheduler's attention: a media player that receives a
//! shorter `206` than it asked for simply issues a follow-up request for the
//! remainder.
//!
//! Only the single-range `bytes=<start>-[<end>]` form is accepted.  Suffix
//! ranges (`bytes=-N`) and multi-range sets are rejected as unsatisfiable.

use serde::Serialize;

// ---

use super::error::{ReelSyncError, Result};

// ---------------------------------------------------------------------------
// ByteRange
// ---------------------------------------------------------------------------

/// Inclusive byte span `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ByteRange {
    // ---
    pub start: u64,
    pub end: u64,
}

// ---

impl ByteRange {
    // ---
    /// Whole-file span.  `None` for an empty file.
    pub fn full(len: u64) -> Option<Self> {
        // ---
        if len == 0 {
            return None;
        }
        Some(Self {
            start: 0,
            end: len - 1,
        })
    }

    /// Number of bytes covered (never zero: `start <= end` always holds for
    /// a constructed range).
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for a `206` response.
    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Outcome of admitting one range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    // ---
    /// The span that will actually be served.
    pub range: ByteRange,

    /// The span the client asked for (end defaulted when open).
    pub requested: ByteRange,

    /// `true` when `range` is shorter than `requested`.
    pub truncated: bool,
}

// ---

/// `Content-Range` value for a `416` response.
pub fn unsatisfiable_content_range(total: u64) -> String {
    format!("bytes */{total}")
}

// ---

/// Parse a `Range` header against a file of `len` bytes.
///
/// Rejects when `start > end`, when either bound is not a non-negative
/// integer, or when `end >= len`.  An open end defaults to `len - 1`.
pub fn parse_range(header: &str, len: u64) -> Result<ByteRange> {
    // ---
    let reject = |reason: &'static str| ReelSyncError::RangeNotSatisfiable { len, reason };

    let (unit, spec) = header.trim().split_once('=').ok_or(reject("missing '='"))?;
    if !unit.trim().eq_ignore_ascii_case("bytes") {
        return Err(reject("unit is not bytes"));
    }
    if spec.contains(',') {
        return Err(reject("multiple ranges"));
    }

    let (start, end) = spec.trim().split_once('-').ok_or(reject("missing '-'"))?;
    let start = parse_bound(start).ok_or(reject("start is not a non-negative integer"))?;
    let end = match end.trim() {
        "" => len.checked_sub(1).ok_or(reject("file is empty"))?,
        raw => parse_bound(raw).ok_or(reject("end is not a non-negative integer"))?,
    };

    if start > end {
        return Err(reject("start after end"));
    }
    if end >= len {
        return Err(reject("end beyond file length"));
    }

    Ok(ByteRange { start, end })
}

// ---

/// Parse and clip a range request to `max_request_bytes`.
pub fn admit(header: &str, len: u64, max_request_bytes: u64) -> Result<Admission> {
    // ---
    let requested = parse_range(header, len)?;
    Ok(clip(requested, max_request_bytes))
}

// ---

/// Clip an already-valid span to at most `max_request_bytes` bytes.
pub fn clip(requested: ByteRange, max_request_bytes: u64) -> Admission {
    // ---
    let max = max_request_bytes.max(1);
    if requested.len() <= max {
        return Admission {
            range: requested,
            requested,
            truncated: false,
        };
    }
    Admission {
        range: ByteRange {
            start: requested.start,
            end: requested.start + max - 1,
        },
        requested,
        truncated: true,
    }
}

// ---

fn parse_bound(raw: &str) -> Option<u64> {
    // ---
    let raw = raw.trim();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const MIB: u64 = 1_048_576;

    #[test]
    fn open_range_defaults_to_last_byte() {
        // ---
        let r = parse_range("bytes=100-", 1_000).unwrap();
        assert_eq!(r, ByteRange { start: 100, end: 999 });
        assert_eq!(r.content_range(1_000), "bytes 100-999/1000");
    }

    // ---

    #[test]
    fn invalid_ranges_are_rejected() {
        // ---
        for header in [
            "bytes=5-4",
            "bytes=-500",
            "bytes=abc-10",
            "bytes=0-1000",
            "bytes=+1-10",
            "bytes=0-1,5-9",
            "items=0-10",
            "0-10",
        ] {
            let err = parse_range(header, 1_000).unwrap_err();
            assert!(
                matches!(err, ReelSyncError::RangeNotSatisfiable { len: 1_000, .. }),
                "{header} should be unsatisfiable, got {err:?}"
            );
        }
    }

    // ---

    #[test]
    fn empty_file_is_never_satisfiable() {
        assert!(parse_range("bytes=0-", 0).is_err());
        assert!(ByteRange::full(0).is_none());
    }

    // ---

    #[test]
    fn oversized_span_is_truncated_to_max_request() {
        // ---
        let a = admit("bytes=0-", 100_000_000, MIB).unwrap();
        assert!(a.truncated);
        assert_eq!(a.range, ByteRange { start: 0, end: MIB - 1 });
        assert_eq!(a.requested.end, 100_000_000 - 1);
        assert_eq!(a.range.len(), MIB);
    }

    // ---

    #[test]
    fn truncation_bound_holds_for_any_span() {
        // ---
        let len = 50 * MIB;
        for (start, max) in [(0, 1), (7, 3), (MIB, MIB), (len - 10, MIB), (123, 2 * MIB + 1)] {
            let header = format!("bytes={start}-");
            let a = admit(&header, len, max).unwrap();
            assert!(a.range.len() <= max, "span {} exceeds {max}", a.range.len());
            assert_eq!(a.range.start, start);
            assert_eq!(a.truncated, a.requested.len() > max);
        }
    }

    // ---

    #[test]
    fn span_within_limit_is_untouched() {
        // ---
        let a = admit(" Bytes = 10-19 ", 100, MIB).unwrap();
        assert!(!a.truncated);
        assert_eq!(a.range, a.requested);
        assert_eq!(a.range.len(), 10);
    }
}
