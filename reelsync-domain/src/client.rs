use std::fmt;

use serde::Serialize;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ClientKey
// ---------------------------------------------------------------------------

/// Identity of the viewer a delivery job belongs to.
///
/// The HTTP layer hands over a pre-authenticated connection id when it has
/// one.  Requests that arrive without an id get a fresh
/// [`ClientKey::Anonymous`] key so they land in a private queue of their own
/// (no fairness benefit, but nothing else breaks).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum ClientKey {
    // ---
    Named(String),
    Anonymous(Uuid),
}

// ---

impl ClientKey {
    // ---
    /// Build a key from an optional caller-supplied id.  Blank ids count as
    /// missing.
    pub fn from_id(id: Option<&str>) -> Self {
        // ---
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => Self::Named(id.to_string()),
            _ => Self::Anonymous(Uuid::new_v4()),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }
}

// ---

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(id) => f.write_str(id),
            Self::Anonymous(uuid) => write!(f, "anon-{uuid}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    // ---
    use super::ClientKey;

    #[test]
    fn named_key_keeps_trimmed_id() {
        assert_eq!(
            ClientKey::from_id(Some("  viewer-7 ")),
            ClientKey::Named("viewer-7".into())
        );
    }

    // ---

    #[test]
    fn missing_or_blank_id_gets_private_key() {
        // ---
        let a = ClientKey::from_id(None);
        let b = ClientKey::from_id(Some("   "));
        assert!(a.is_anonymous());
        assert!(b.is_anonymous());
        assert_ne!(a, b, "every anonymous request must get its own queue");
    }
}
