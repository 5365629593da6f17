//! Scheduling parameters and the environment resolver.
//!
//! Parameters come from `REELSYNC_*` environment variables.  A bad value
//! never aborts the process: it is rejected, the previous value is kept and a
//! [`Category::Config`] diagnostic says so.  Cross-parameter problems are
//! reported the same way and are never fatal.
//!
//! [`ConfigWatcher`] re-reads the source periodically and reports, once, the
//! first time anything differs from the startup snapshot.

use std::collections::HashMap;

use serde::Serialize;

// ---

use reelsync_domain::{Category, Diagnostic, Diagnostics, NullDiagnostics};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const ENV_FAIR_ENABLED: &str = "REELSYNC_FAIR_ENABLED";
pub const ENV_MAX_REQUEST_BYTES: &str = "REELSYNC_MAX_REQUEST_BYTES";
pub const ENV_CHUNK_BYTES: &str = "REELSYNC_CHUNK_BYTES";
pub const ENV_RATE_CAP_BPS: &str = "REELSYNC_RATE_CAP_BPS";
pub const ENV_HEAD_CACHE_BYTES: &str = "REELSYNC_HEAD_CACHE_BYTES";
pub const ENV_AHEAD_GATE_SECS: &str = "REELSYNC_AHEAD_GATE_SECS";
pub const ENV_CONTENT_BITRATE_BPS: &str = "REELSYNC_CONTENT_BITRATE_BPS";

/// Default ceiling on one admitted range.
pub const DEFAULT_MAX_REQUEST_BYTES: u64 = 4 * 1024 * 1024;

/// Default DRR quantum.
pub const DEFAULT_CHUNK_BYTES: u64 = 256 * 1024;

// ---------------------------------------------------------------------------
// ParamSource
// ---------------------------------------------------------------------------

/// Raw key/value configuration input.
pub trait ParamSource {
    fn get(&self, key: &str) -> Option<String>;
}

// ---

/// The process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSource;

impl ParamSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ParamSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

// ---------------------------------------------------------------------------
// DeliveryParams
// ---------------------------------------------------------------------------

/// Validated scheduling parameters.
///
/// Optional parameters are disabled when `None`; any value present is
/// strictly positive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryParams {
    // ---
    /// Fair scheduling on/off.  Off means ranges are served directly.
    pub enabled: bool,

    /// Longest span one range request may be answered with.
    pub max_request_bytes: u64,

    /// DRR quantum: bytes credited per visit and the largest single chunk.
    pub chunk_bytes: u64,

    /// Per-client rate cap.
    pub rate_cap_bits_per_sec: Option<u64>,

    /// Size of the in-memory copy of the file's first bytes.
    pub head_cache_bytes: Option<u64>,

    /// How far ahead of the shared playback position delivery may run.
    pub ahead_gate_secs: Option<u64>,

    /// Declared bitrate of the content; the ahead gate's time base when no
    /// rate cap is set.
    pub content_bitrate_bits_per_sec: Option<u64>,
}

// ---

impl Default for DeliveryParams {
    fn default() -> Self {
        // ---
        Self {
            enabled: true,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            rate_cap_bits_per_sec: None,
            head_cache_bytes: None,
            ahead_gate_secs: None,
            content_bitrate_bits_per_sec: None,
        }
    }
}

// ---

impl DeliveryParams {
    // ---
    /// Resolve from `source` over the built-in defaults.
    pub fn resolve(source: &dyn ParamSource, diag: &dyn Diagnostics) -> Self {
        Self::resolve_over(Self::default(), source, diag)
    }

    // ---

    /// Resolve from `source`, keeping `base` for anything missing or invalid.
    pub fn resolve_over(base: Self, source: &dyn ParamSource, diag: &dyn Diagnostics) -> Self {
        // ---
        let mut p = base;

        if let Some(raw) = source.get(ENV_FAIR_ENABLED) {
            match parse_flag(&raw) {
                Some(flag) => p.enabled = flag,
                None => reject(diag, ENV_FAIR_ENABLED, &raw, "not a boolean", p.enabled),
            }
        }

        p.max_request_bytes = positive(source, diag, ENV_MAX_REQUEST_BYTES, p.max_request_bytes);
        p.chunk_bytes = positive(source, diag, ENV_CHUNK_BYTES, p.chunk_bytes);
        p.rate_cap_bits_per_sec = optional(source, diag, ENV_RATE_CAP_BPS, p.rate_cap_bits_per_sec);
        p.head_cache_bytes = optional(source, diag, ENV_HEAD_CACHE_BYTES, p.head_cache_bytes);
        p.ahead_gate_secs = optional(source, diag, ENV_AHEAD_GATE_SECS, p.ahead_gate_secs);
        p.content_bitrate_bits_per_sec = optional(
            source,
            diag,
            ENV_CONTENT_BITRATE_BPS,
            p.content_bitrate_bits_per_sec,
        );

        p.sanity_check(diag);
        p
    }

    // ---

    /// Rate cap if set, else the declared content bitrate.
    pub fn effective_bitrate(&self) -> Option<u64> {
        self.rate_cap_bits_per_sec.or(self.content_bitrate_bits_per_sec)
    }

    /// `(window_secs, bits_per_sec)` when the ahead gate is usable.  A window
    /// without a bitrate has no time base and leaves the gate open.
    pub fn ahead_gate(&self) -> Option<(u64, u64)> {
        Some((self.ahead_gate_secs?, self.effective_bitrate()?))
    }

    // ---

    /// Cross-parameter checks.  Diagnostics only.
    pub fn sanity_check(&self, diag: &dyn Diagnostics) {
        // ---
        if self.chunk_bytes > self.max_request_bytes {
            diag.emit(
                Diagnostic::warn(Category::Config, "chunk_exceeds_max_request")
                    .field("chunk_bytes", self.chunk_bytes)
                    .field("max_request_bytes", self.max_request_bytes),
            );
        }

        if let Some(head) = self.head_cache_bytes {
            if head < self.chunk_bytes {
                diag.emit(
                    Diagnostic::warn(Category::Config, "head_cache_below_chunk")
                        .field("head_cache_bytes", head)
                        .field("chunk_bytes", self.chunk_bytes),
                );
            }
        }

        if self.ahead_gate_secs.is_some() && self.effective_bitrate().is_none() {
            diag.emit(
                Diagnostic::warn(Category::Config, "ahead_gate_without_bitrate")
                    .field("ahead_gate_secs", self.ahead_gate_secs)
                    .field("effect", "gate disabled"),
            );
        }
    }

    // ---

    /// Names of the parameters whose values differ from `other`.
    pub fn diff(&self, other: &Self) -> Vec<&'static str> {
        // ---
        let mut changed = Vec::new();
        if self.enabled != other.enabled {
            changed.push("enabled");
        }
        if self.max_request_bytes != other.max_request_bytes {
            changed.push("max_request_bytes");
        }
        if self.chunk_bytes != other.chunk_bytes {
            changed.push("chunk_bytes");
        }
        if self.rate_cap_bits_per_sec != other.rate_cap_bits_per_sec {
            changed.push("rate_cap_bits_per_sec");
        }
        if self.head_cache_bytes != other.head_cache_bytes {
            changed.push("head_cache_bytes");
        }
        if self.ahead_gate_secs != other.ahead_gate_secs {
            changed.push("ahead_gate_secs");
        }
        if self.content_bitrate_bits_per_sec != other.content_bitrate_bits_per_sec {
            changed.push("content_bitrate_bits_per_sec");
        }
        changed
    }
}

// ---------------------------------------------------------------------------
// ConfigWatcher
// ---------------------------------------------------------------------------

/// Result of one drift check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftReport {
    // ---
    /// Parameters that differ from the startup snapshot.
    pub changed: Vec<&'static str>,

    /// New head cache limit when the configured size shrank since the last
    /// check.  `Some(0)` means the cache was switched off.
    pub head_cache_shrink: Option<u64>,
}

// ---

/// Detects operator-driven drift away from the startup snapshot.
#[derive(Debug)]
pub struct ConfigWatcher {
    // ---
    startup: DeliveryParams,

    /// Head cache size currently in effect, for shrink detection.
    head_cache_in_effect: u64,

    drift_reported: bool,
}

// ---

impl ConfigWatcher {
    // ---
    pub fn new(startup: DeliveryParams) -> Self {
        // ---
        let head_cache_in_effect = startup.head_cache_bytes.unwrap_or(0);
        Self {
            startup,
            head_cache_in_effect,
            drift_reported: false,
        }
    }

    pub fn startup(&self) -> &DeliveryParams {
        &self.startup
    }

    // ---

    /// Re-read `source` and compare against the startup snapshot.
    ///
    /// Invalid values were already reported at startup, so the re-read is
    /// silent; only the first observed drift emits a diagnostic.
    pub fn check(&mut self, source: &dyn ParamSource, diag: &dyn Diagnostics) -> DriftReport {
        // ---
        let current = DeliveryParams::resolve_over(self.startup.clone(), source, &NullDiagnostics);
        let changed = current.diff(&self.startup);

        if !changed.is_empty() && !self.drift_reported {
            self.drift_reported = true;
            diag.emit(
                Diagnostic::warn(Category::Config, "drift_detected")
                    .field("changed", changed.clone())
                    .field("note", "startup values remain in effect"),
            );
        }

        let wanted = current.head_cache_bytes.unwrap_or(0);
        let head_cache_shrink = if wanted < self.head_cache_in_effect {
            self.head_cache_in_effect = wanted;
            Some(wanted)
        } else {
            None
        };

        DriftReport {
            changed,
            head_cache_shrink,
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_flag(raw: &str) -> Option<bool> {
    // ---
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ---

/// Parse a strictly positive integer, naming the reason on failure.
fn parse_positive(raw: &str) -> Result<u64, &'static str> {
    // ---
    let raw = raw.trim();
    match raw.parse::<u64>() {
        Ok(0) => Err("non-positive"),
        Ok(n) => Ok(n),
        Err(_) if raw.parse::<i64>().is_ok() => Err("non-positive"),
        Err(_) => Err("non-numeric"),
    }
}

// ---

fn positive(source: &dyn ParamSource, diag: &dyn Diagnostics, key: &'static str, current: u64) -> u64 {
    // ---
    let Some(raw) = source.get(key) else {
        return current;
    };
    match parse_positive(&raw) {
        Ok(n) => n,
        Err(reason) => {
            reject(diag, key, &raw, reason, current);
            current
        }
    }
}

// ---

fn optional(
    source: &dyn ParamSource,
    diag: &dyn Diagnostics,
    key: &'static str,
    current: Option<u64>,
) -> Option<u64> {
    // ---
    let Some(raw) = source.get(key) else {
        return current;
    };
    match parse_positive(&raw) {
        Ok(n) => Some(n),
        Err(reason) => {
            reject(diag, key, &raw, reason, current);
            current
        }
    }
}

// ---

fn reject<T: Into<serde_json::Value>>(
    diag: &dyn Diagnostics,
    key: &'static str,
    raw: &str,
    reason: &'static str,
    kept: T,
) {
    diag.emit(
        Diagnostic::warn(Category::Config, "invalid_override")
            .field("key", key)
            .field("value", raw)
            .field("reason", reason)
            .field("kept", kept),
    );
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::collections::HashMap;

    use super::*;
    use crate::RecordingDiagnostics;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ---

    #[test]
    fn empty_source_yields_defaults() {
        // ---
        let diag = RecordingDiagnostics::default();
        let p = DeliveryParams::resolve(&source(&[]), &diag);
        assert_eq!(p, DeliveryParams::default());
        assert!(diag.events().is_empty());
    }

    // ---

    #[test]
    fn valid_overrides_are_applied() {
        // ---
        let diag = RecordingDiagnostics::default();
        let p = DeliveryParams::resolve(
            &source(&[
                (ENV_FAIR_ENABLED, "off"),
                (ENV_MAX_REQUEST_BYTES, "1048576"),
                (ENV_CHUNK_BYTES, "524288"),
                (ENV_RATE_CAP_BPS, "8000000"),
                (ENV_HEAD_CACHE_BYTES, "8388608"),
                (ENV_AHEAD_GATE_SECS, "30"),
            ]),
            &diag,
        );

        assert!(!p.enabled);
        assert_eq!(p.max_request_bytes, 1_048_576);
        assert_eq!(p.chunk_bytes, 524_288);
        assert_eq!(p.rate_cap_bits_per_sec, Some(8_000_000));
        assert_eq!(p.head_cache_bytes, Some(8_388_608));
        assert_eq!(p.ahead_gate(), Some((30, 8_000_000)));
        assert!(diag.events().is_empty(), "{:?}", diag.events());
    }

    // ---

    #[test]
    fn invalid_overrides_keep_previous_value_and_report() {
        // ---
        let diag = RecordingDiagnostics::default();
        let p = DeliveryParams::resolve(
            &source(&[
                (ENV_CHUNK_BYTES, "0"),
                (ENV_MAX_REQUEST_BYTES, "-5"),
                (ENV_RATE_CAP_BPS, "fast"),
                (ENV_FAIR_ENABLED, "maybe"),
            ]),
            &diag,
        );

        assert_eq!(p, DeliveryParams::default());

        let rejected = diag.named("invalid_override");
        assert_eq!(rejected.len(), 4);
        let reason_for = |key: &str| {
            rejected
                .iter()
                .find(|d| d.get("key").and_then(|v| v.as_str()) == Some(key))
                .and_then(|d| d.get("reason").and_then(|v| v.as_str()).map(str::to_string))
        };
        assert_eq!(reason_for(ENV_CHUNK_BYTES).as_deref(), Some("non-positive"));
        assert_eq!(reason_for(ENV_MAX_REQUEST_BYTES).as_deref(), Some("non-positive"));
        assert_eq!(reason_for(ENV_RATE_CAP_BPS).as_deref(), Some("non-numeric"));
    }

    // ---

    #[test]
    fn cross_parameter_problems_are_diagnosed_not_fatal() {
        // ---
        let diag = RecordingDiagnostics::default();
        let p = DeliveryParams::resolve(
            &source(&[
                (ENV_MAX_REQUEST_BYTES, "1000"),
                (ENV_CHUNK_BYTES, "4000"),
                (ENV_HEAD_CACHE_BYTES, "2000"),
                (ENV_AHEAD_GATE_SECS, "10"),
            ]),
            &diag,
        );

        assert_eq!(p.chunk_bytes, 4_000);
        assert_eq!(p.ahead_gate(), None, "gate without a bitrate stays open");
        assert_eq!(diag.named("chunk_exceeds_max_request").len(), 1);
        assert_eq!(diag.named("head_cache_below_chunk").len(), 1);
        assert_eq!(diag.named("ahead_gate_without_bitrate").len(), 1);
    }

    // ---

    #[test]
    fn drift_is_reported_once_and_head_cache_shrink_is_surfaced() {
        // ---
        let diag = RecordingDiagnostics::default();
        let startup = DeliveryParams {
            head_cache_bytes: Some(8_000_000),
            ..DeliveryParams::default()
        };
        let mut watcher = ConfigWatcher::new(startup);

        let unchanged = watcher.check(&source(&[(ENV_HEAD_CACHE_BYTES, "8000000")]), &diag);
        assert!(unchanged.changed.is_empty());
        assert_eq!(unchanged.head_cache_shrink, None);

        let shrunk = watcher.check(
            &source(&[(ENV_HEAD_CACHE_BYTES, "4000000"), (ENV_CHUNK_BYTES, "1024")]),
            &diag,
        );
        assert_eq!(shrunk.changed, vec!["chunk_bytes", "head_cache_bytes"]);
        assert_eq!(shrunk.head_cache_shrink, Some(4_000_000));

        let again = watcher.check(&source(&[(ENV_HEAD_CACHE_BYTES, "4000000")]), &diag);
        assert_eq!(again.head_cache_shrink, None, "shrink is reported once");

        assert_eq!(diag.named("drift_detected").len(), 1);
        assert_eq!(watcher.startup().head_cache_bytes, Some(8_000_000));
    }
}
