//! [`Diagnostics`] implementations and the per-client log throttle.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ---

use parking_lot::Mutex;
use serde_json::Value;

// ---

use reelsync_domain::{Diagnostic, Diagnostics, Severity};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Minimum spacing between two throttled events of the same kind for the
/// same client.
pub const DIAGNOSTIC_THROTTLE: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// TracingDiagnostics
// ---------------------------------------------------------------------------

/// Production sink: forwards every event to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn emit(&self, d: Diagnostic) {
        // ---
        let fields = Value::Object(d.fields);
        match d.severity {
            Severity::Debug => {
                tracing::debug!(category = %d.category, event = d.event, %fields, "delivery")
            }
            Severity::Info => {
                tracing::info!(category = %d.category, event = d.event, %fields, "delivery")
            }
            Severity::Warn => {
                tracing::warn!(category = %d.category, event = d.event, %fields, "delivery")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// RecordingDiagnostics
// ---------------------------------------------------------------------------

/// Test sink: keeps every event in memory.  Cheap to clone; clones share
/// the same log.
#[derive(Debug, Default, Clone)]
pub struct RecordingDiagnostics {
    events: Arc<Mutex<Vec<Diagnostic>>>,
}

impl RecordingDiagnostics {
    // ---
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().clone()
    }

    /// Events whose name is `event`.
    pub fn named(&self, event: &str) -> Vec<Diagnostic> {
        // ---
        self.events
            .lock()
            .iter()
            .filter(|d| d.event == event)
            .cloned()
            .collect()
    }
}

impl Diagnostics for RecordingDiagnostics {
    fn emit(&self, diagnostic: Diagnostic) {
        self.events.lock().push(diagnostic);
    }
}

// ---------------------------------------------------------------------------
// LogGate
// ---------------------------------------------------------------------------

/// Wall-clock gate for one kind of event on one client record.
///
/// Logging-volume control only; correctness never depends on it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogGate {
    last: Option<Instant>,
}

impl LogGate {
    // ---
    /// `true` (and the gate is stamped) when at least
    /// [`DIAGNOSTIC_THROTTLE`] has passed since the last allowed event.
    pub fn allow(&mut self, now: Instant) -> bool {
        // ---
        match self.last {
            Some(last) if now.saturating_duration_since(last) < DIAGNOSTIC_THROTTLE => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Throttle
// ---------------------------------------------------------------------------

/// Keyed [`LogGate`]s for call sites that have no per-client record of
/// their own (the direct delivery path).
#[derive(Debug)]
pub struct Throttle<K> {
    gates: HashMap<(K, &'static str), LogGate>,
}

impl<K> Default for Throttle<K> {
    fn default() -> Self {
        Self {
            gates: HashMap::new(),
        }
    }
}

// ---

impl<K: Eq + Hash> Throttle<K> {
    // ---
    pub fn allow(&mut self, key: K, kind: &'static str, now: Instant) -> bool {
        self.gates.entry((key, kind)).or_default().allow(now)
    }

    pub fn clear(&mut self) {
        self.gates.clear();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use std::time::{Duration, Instant};

    use super::{LogGate, Throttle, DIAGNOSTIC_THROTTLE};

    #[test]
    fn gate_suppresses_within_interval() {
        // ---
        let t0 = Instant::now();
        let mut gate = LogGate::default();

        assert!(gate.allow(t0));
        assert!(!gate.allow(t0 + Duration::from_millis(100)));
        assert!(!gate.allow(t0 + DIAGNOSTIC_THROTTLE - Duration::from_millis(1)));
        assert!(gate.allow(t0 + DIAGNOSTIC_THROTTLE));
    }

    // ---

    #[test]
    fn throttle_keys_are_independent() {
        // ---
        let t0 = Instant::now();
        let mut throttle = Throttle::default();

        assert!(throttle.allow("a", "truncate", t0));
        assert!(throttle.allow("b", "truncate", t0), "other client is not throttled");
        assert!(throttle.allow("a", "enqueue", t0), "other kind is not throttled");
        assert!(!throttle.allow("a", "truncate", t0 + Duration::from_millis(10)));
    }
}
