//! Session construction surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 6_000;
pub const DEFAULT_MAX_PENDING_OPERATIONS: usize = 4_096;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Tunables governing one session engine.
///
/// Zero values mean "use the default", so a `SessionPolicy::default()` and a
/// zeroed deserialized policy behave identically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionPolicy {
    /// Requested session timeout; the server may negotiate it down.
    pub session_timeout_ms: u64,
    /// Bound on the outbound request queue. Submissions beyond it fail
    /// synchronously with `TooManyPendingOps`.
    pub max_pending_operations: usize,
    /// Upper bound on a single wire frame, both directions.
    pub max_frame_bytes: usize,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            max_pending_operations: DEFAULT_MAX_PENDING_OPERATIONS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl SessionPolicy {
    pub(crate) fn normalized(mut self) -> Self {
        if self.session_timeout_ms == 0 {
            self.session_timeout_ms = DEFAULT_SESSION_TIMEOUT_MS;
        }
        if self.max_pending_operations == 0 {
            self.max_pending_operations = DEFAULT_MAX_PENDING_OPERATIONS;
        }
        if self.max_frame_bytes == 0 {
            self.max_frame_bytes = DEFAULT_MAX_FRAME_BYTES;
        }
        self
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

/// Credential replayed to the server after every successful handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub scheme: String,
    pub auth: Vec<u8>,
}

impl AuthInfo {
    pub fn new(scheme: impl Into<String>, auth: impl Into<Vec<u8>>) -> Self {
        Self {
            scheme: scheme.into(),
            auth: auth.into(),
        }
    }
}
