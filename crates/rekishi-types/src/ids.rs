//! Typed identifiers for replay sessions.
//!
//! `SessionId` wraps a UUIDv7 (time-ordered, globally unique). It displays as
//! standard UUID text for logging. The `short()` form (first 8 hex chars) is for
//! human-facing output only, never a lookup key.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A replay session identifier (UUIDv7).
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(uuid::Uuid);

impl SessionId {
    /// Create a new time-ordered ID (UUIDv7).
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7())
    }

    /// First 8 hex characters, for display only.
    pub fn short(&self) -> String {
        self.0.as_simple().to_string()[..8].to_string()
    }

    /// Full 32-character hex string (no hyphens).
    ///
    /// Used as the flow subject token, since it never contains a `.`.
    pub fn to_hex(&self) -> String {
        self.0.as_simple().to_string()
    }

    /// Parse from a hex string (32 chars, no hyphens) or standard UUID format.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        uuid::Uuid::parse_str(s).map(Self)
    }

    /// The nil ID, for sentinel values.
    pub fn nil() -> Self {
        Self(uuid::Uuid::nil())
    }

    /// Check if this is the nil ID.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<uuid::Uuid> for SessionId {
    fn from(u: uuid::Uuid) -> Self {
        Self(u)
    }
}

impl std::str::FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full UUID with hyphens for log readability
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique_and_ordered() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert_ne!(a, b);
        assert!(a < b, "UUIDv7 should be time-ordered");
    }

    #[test]
    fn test_short_and_hex() {
        let id = SessionId::new();
        assert_eq!(id.short().len(), 8);
        assert_eq!(id.to_hex().len(), 32);
        assert!(id.to_hex().starts_with(&id.short()));
        assert!(!id.to_hex().contains('.'));
    }

    #[test]
    fn test_parse_both_forms() {
        let id = SessionId::new();
        assert_eq!(SessionId::parse(&id.to_hex()).unwrap(), id);
        assert_eq!(id.to_string().parse::<SessionId>().unwrap(), id);
        assert!(SessionId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_nil() {
        assert!(SessionId::nil().is_nil());
        assert!(!SessionId::new().is_nil());
    }

    #[test]
    fn test_debug_uses_short_form() {
        let id = SessionId::new();
        assert_eq!(format!("{:?}", id), format!("SessionId({})", id.short()));
    }
}
