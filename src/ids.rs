//! Hex identifier generation, microsecond timestamps, and hostname lookup.
//!
//! Identifiers are plain lowercase hex strings at fixed widths rather than a
//! newtype wrapper, matching the wire format the intake protocol expects
//! byte-for-byte (`serde_json` serializes them as-is, no further encoding
//! step). Uniqueness is probabilistic: the source does no collision
//! detection and neither do we.

use crate::error::{AgentError, Result};
use rand::RngCore;

/// Width, in hex characters, of a transaction or span identifier (64 bits).
pub const TRANSACTION_ID_LEN: usize = 16;
/// Width, in hex characters, of a trace or error identifier (128 bits).
pub const TRACE_ID_LEN: usize = 32;

/// Generate `len` lowercase hex characters from the thread-local RNG.
///
/// `len` is always even in practice (16 or 32); an odd `len` truncates the
/// final nibble rather than panicking.
pub fn generate_hex_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let bytes_needed = len.div_ceil(2);
    let mut bytes = vec![0u8; bytes_needed];
    rng.fill_bytes(&mut bytes);
    let mut hex = hex::encode(bytes);
    hex.truncate(len);
    hex
}

/// Generate a 16-hex-char transaction or span id.
pub fn transaction_id() -> String {
    generate_hex_id(TRANSACTION_ID_LEN)
}

/// Generate a 32-hex-char trace or error id.
pub fn trace_id() -> String {
    generate_hex_id(TRACE_ID_LEN)
}

/// Current wall-clock time as microseconds since the Unix epoch.
///
/// Returns 0 if the system clock is somehow before the epoch, which should
/// never happen on a real host; we prefer a sentinel to a panic here since
/// every caller is on an instrumentation hot path. The failure, if any, is
/// logged as an [`AgentError::OsReadFailed`] before falling back.
pub fn now_micros() -> u64 {
    now_micros_checked().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "{err}");
        0
    })
}

fn now_micros_checked() -> Result<u64> {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .map_err(|e| AgentError::OsReadFailed(format!("system clock before epoch: {e}")))
}

/// Best-effort hostname resolution. Returns `"unknown"` rather than
/// propagating a failure: the metadata builder treats the hostname as
/// decorative, not load-bearing. The failure, if any, is logged as an
/// [`AgentError::OsReadFailed`] before falling back.
pub fn hostname() -> String {
    hostname_checked().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "{err}");
        "unknown".to_string()
    })
}

fn hostname_checked() -> Result<String> {
    nix::unistd::gethostname()
        .map_err(|e| AgentError::OsReadFailed(format!("gethostname failed: {e}")))?
        .into_string()
        .map_err(|_| AgentError::OsReadFailed("hostname is not valid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_id_is_16_lowercase_hex() {
        let id = transaction_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn trace_id_is_32_lowercase_hex() {
        let id = trace_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn ids_are_not_trivially_repeated() {
        let a = transaction_id();
        let b = transaction_id();
        assert_ne!(a, b);
    }

    #[test]
    fn now_micros_is_plausible() {
        let t = now_micros();
        // Some time after 2020-01-01T00:00:00Z in microseconds.
        assert!(t > 1_577_836_800_000_000);
    }

    #[test]
    fn hostname_is_non_empty() {
        assert!(!hostname().is_empty());
    }
}
