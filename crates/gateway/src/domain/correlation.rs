//! Correlation ID for host request/response matching.
//!
//! Ids are plain integers on the wire, monotonically increasing and never
//! reused for the lifetime of the process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation ID carried in every host-bound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    /// Create from a raw wire value
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw wire value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide id source. Starts at 1 so 0 never appears on the wire.
#[derive(Debug)]
pub struct RequestIdCounter(AtomicU64);

impl RequestIdCounter {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }

    /// Allocate the next id. Ids are unique for the process lifetime.
    pub fn next(&self) -> RequestId {
        RequestId(self.0.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let counter = RequestIdCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert_ne!(a, b);
        assert!(b.as_u64() > a.as_u64());
    }

    #[test]
    fn test_serialization_is_transparent() {
        let id = RequestId::from_raw(42);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "42");
        let parsed: RequestId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }
}
