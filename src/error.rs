//! Internal error taxonomy.
//!
//! None of these variants ever reach the host application through the public
//! `agent` API: every call site that can fail builds the matching variant,
//! logs it via `tracing`, and falls back to its documented default. The type
//! exists so internal modules can name *which* failure mode fired instead of
//! logging ad hoc string literals, and so tests can assert on it.
//!
//! The source's taxonomy also lists an `AllocationFailed` variant for the
//! crash path's memory-exhaustion case. Safe Rust has no catchable
//! allocation-failure path (the global allocator aborts the process), so
//! there is no honest call site for it here; it is dropped rather than kept
//! as a variant nothing can ever construct.

use thiserror::Error;

/// Failure modes internal to the agent. Always logged and discarded at the
/// public API boundary; never surfaced to the host service.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A `/proc` read, clock read, or hostname lookup failed. The affected
    /// field is left at its zero/default value.
    #[error("OS read failed: {0}")]
    OsReadFailed(String),

    /// A traceparent header or supplied stack-symbol line was malformed.
    /// The offending datum is discarded.
    #[error("parse failed: {0}")]
    ParseFailed(String),

    /// The intake POST failed at the network layer or returned a non-2xx
    /// status. The batch is dropped; there is no retry and no persistence.
    #[error("transport failed: {0}")]
    TransportFailed(String),

    /// A public entry point was called out of order: `begin_span` with no
    /// active transaction, `end_span` with no pending span, `end_transaction`
    /// with no active transaction.
    #[error("precondition violated: {0}")]
    PreconditionViolated(&'static str),
}

pub type Result<T> = std::result::Result<T, AgentError>;
