//! Thin POST/GET wrapper around `reqwest::blocking` with headers, optional
//! gzip compression, and response status surfaced as a plain `u16` rather
//! than a library-specific type — the rest of the crate depends on this
//! module's `Response`, never on `reqwest` directly, so the HTTP backend
//! stays swappable.

use crate::error::{AgentError, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::time::Duration;

/// Default per-request timeout for intake POSTs. The crash path uses its
/// own out-of-process transport (see [`crate::crash`]) and does not go
/// through this module.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status == 202
    }
}

/// POST an NDJSON body to `url`, gzip-compressing it and setting the
/// headers the intake protocol requires: `Authorization: Bearer <token>`,
/// `Content-Type: application/x-ndjson`, `Content-Encoding: gzip`.
pub fn post_ndjson(url: &str, token: &str, body: &str) -> Result<Response> {
    let compressed = gzip_compress(body.as_bytes())?;

    let client = reqwest::blocking::Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        // The source disables TLS certificate verification by design; we
        // match that intentionally-insecure default rather than silently
        // hardening it, per the non-goals.
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| AgentError::TransportFailed(e.to_string()))?;

    let response = client
        .post(url)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/x-ndjson")
        .header("Content-Encoding", "gzip")
        .body(compressed)
        .send()
        .map_err(|e| AgentError::TransportFailed(e.to_string()))?;

    Ok(Response {
        status: response.status().as_u16(),
    })
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| AgentError::TransportFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| AgentError::TransportFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gzip_compress_round_trips() {
        let input = b"{\"metadata\":{}}\n{\"transaction\":{}}";
        let compressed = gzip_compress(input).unwrap();
        assert_ne!(compressed, input);

        use flate2::read::GzDecoder;
        use std::io::Read;
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, input);
    }

    #[test]
    fn response_is_success_only_on_202() {
        assert!(Response { status: 202 }.is_success());
        assert!(!Response { status: 200 }.is_success());
        assert!(!Response { status: 500 }.is_success());
    }
}
