use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// Category / Severity
// ---------------------------------------------------------------------------

/// Subsystem a diagnostic event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    // ---
    Config,
    Admission,
    Scheduler,
    Cache,
    Read,
    Reset,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Admission => "admission",
            Self::Scheduler => "scheduler",
            Self::Cache => "cache",
            Self::Read => "read",
            Self::Reset => "reset",
        };
        f.write_str(name)
    }
}

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warn,
}

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

/// One structured event emitted by the delivery core.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    // ---
    pub category: Category,
    pub event: &'static str,
    pub severity: Severity,
    pub fields: Map<String, Value>,
}

// ---

impl Diagnostic {
    // ---
    pub fn new(category: Category, event: &'static str, severity: Severity) -> Self {
        // ---
        Self {
            category,
            event,
            severity,
            fields: Map::new(),
        }
    }

    pub fn debug(category: Category, event: &'static str) -> Self {
        Self::new(category, event, Severity::Debug)
    }

    pub fn info(category: Category, event: &'static str) -> Self {
        Self::new(category, event, Severity::Info)
    }

    pub fn warn(category: Category, event: &'static str) -> Self {
        Self::new(category, event, Severity::Warn)
    }

    // ---

    /// Attach a field.  Builder style, so call sites read as one expression.
    pub fn field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Injected event sink.
///
/// Fire-and-forget: implementations must never block the caller and must
/// never panic back into the scheduler.
pub trait Diagnostics: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

// ---

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDiagnostics;

impl Diagnostics for NullDiagnostics {
    fn emit(&self, _diagnostic: Diagnostic) {}
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
