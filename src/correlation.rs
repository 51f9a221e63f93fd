use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Correlation token used to route a reply back to the call that issued it.
///
/// The token is an opaque logical key into a client's correlation registry.
/// It travels in the broker message properties (`correlation_id`) and is
/// echoed unchanged by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    // ---

    /// Borrow the correlation id as a string slice.
    pub fn as_str(&self) -> &str {
        // ---
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Per-client source of correlation ids.
///
/// Backed by an atomically incremented 64-bit counter, so ids are unique for
/// the lifetime of the generator. Each client owns its own generator; ids
/// from different clients may coincide, which is harmless because each
/// client consumes its own reply queue.
#[derive(Debug)]
pub struct CorrelationIdGenerator {
    next: AtomicU64,
}

impl CorrelationIdGenerator {
    // ---

    /// Create a generator whose first id is `"1"`.
    pub fn new() -> Self {
        // ---
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Produce the next id.
    pub fn next_id(&self) -> CorrelationId {
        // ---
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        CorrelationId(n.to_string())
    }
}

impl Default for CorrelationIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
