//! Begin/end transactions and spans, capture errors, and own the "current
//! transaction" slot plus the flush queue it hands finished transactions
//! to.
//!
//! The source documents concurrent `begin`/`end` from multiple threads as
//! undefined behavior and a programmer error. We keep the same *design*
//! assumption (one logical thread drives one trace) but back it with a
//! real `Mutex` rather than leaving it as UB: a misbehaving caller gets
//! deterministic, logged, last-caller-wins semantics instead of a data
//! race.

use crate::error::AgentError;
use crate::flush::FlushPipeline;
use crate::model::{Context, Error, Exception, Outcome, StackFrame, Transaction};
use crate::stack;
use std::sync::Mutex;

pub struct Engine {
    current: Mutex<Option<Transaction>>,
    flush: FlushPipeline,
}

impl Engine {
    pub fn new(flush: FlushPipeline) -> Self {
        Engine {
            current: Mutex::new(None),
            flush,
        }
    }

    /// Install a new transaction as current. If one is already active, it
    /// is force-ended with outcome `"failure"` and flushed before the new
    /// one replaces it — the resolution this crate picked for the source's
    /// open question ("the source silently overwrites and leaks the
    /// previous transaction"), documented in `DESIGN.md`.
    pub fn begin_transaction(
        &self,
        name: &str,
        r#type: &str,
        trace_id: Option<String>,
        parent_id: Option<String>,
    ) {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut stale) = slot.take() {
            tracing::warn!(
                transaction_id = %stale.id,
                "begin_transaction called while a transaction was already active; \
                 force-ending the previous one with outcome \"failure\""
            );
            stale.end(Outcome::Failure, None);
            self.flush.enqueue(stale);
        }
        *slot = Some(Transaction::begin(name, r#type, trace_id, parent_id));
    }

    /// Stamp duration/outcome/result, enqueue, and clear the slot.
    pub fn end_transaction(&self, outcome: Outcome, result: Option<String>) {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match slot.take() {
            Some(mut txn) => {
                txn.end(outcome, result);
                self.flush.enqueue(txn);
            }
            None => {
                let err = AgentError::PreconditionViolated(
                    "end_transaction called with no active transaction",
                );
                tracing::warn!(error = %err, "{err}");
            }
        }
    }

    /// Begin a span under the deepest pending span, or directly under the
    /// transaction if none is pending. No-op (logged) if no transaction is
    /// active.
    pub fn begin_span(&self, name: &str, r#type: &str, subtype: Option<String>) {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(txn) => {
                txn.begin_span(name, r#type, subtype);
            }
            None => {
                let err = AgentError::PreconditionViolated(
                    "begin_span called with no active transaction",
                );
                tracing::warn!(error = %err, "{err}");
            }
        }
    }

    /// End the deepest pending span. No-op (logged) if none is pending.
    pub fn end_span(&self, outcome: Outcome) {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        match slot.as_mut() {
            Some(txn) => {
                if !txn.end_span(outcome) {
                    let err =
                        AgentError::PreconditionViolated("end_span called with no pending span");
                    tracing::warn!(error = %err, "{err}");
                }
            }
            None => {
                let err =
                    AgentError::PreconditionViolated("end_span called with no active transaction");
                tracing::warn!(error = %err, "{err}");
            }
        }
    }

    /// Construct an error, resolve its stack, and attach it to the current
    /// transaction. `stack_symbols`, when given, is a set of already-symbolic
    /// `"function (file:line)"` lines (e.g. forwarded from a language
    /// runtime) parsed with [`stack::parse_backtrace_symbol`]; lines that
    /// don't parse are logged and dropped. With no supplied symbols, a fresh
    /// backtrace is captured at the call site.
    pub fn catch_error(
        &self,
        culprit: Option<String>,
        signal: &str,
        message: &str,
        stack_symbols: Option<Vec<String>>,
        handled: bool,
    ) {
        let frames = match stack_symbols {
            Some(lines) => parse_supplied_stack_symbols(&lines),
            None => stack::capture_backtrace(2),
        };
        self.build_and_attach(culprit, signal, message, frames, handled);
    }

    /// Attach an error whose stack has already been resolved to
    /// [`StackFrame`]s, used by the crash handler which resolves the
    /// faulting frame itself from the signal's machine context.
    pub(crate) fn attach_resolved_error(
        &self,
        culprit: Option<String>,
        signal: &str,
        message: &str,
        frames: Vec<StackFrame>,
        handled: bool,
    ) {
        self.build_and_attach(culprit, signal, message, frames, handled);
    }

    fn build_and_attach(
        &self,
        culprit: Option<String>,
        signal: &str,
        message: &str,
        frames: Vec<StackFrame>,
        handled: bool,
    ) {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        let Some(txn) = slot.as_mut() else {
            let err =
                AgentError::PreconditionViolated("catch_error called with no active transaction");
            tracing::warn!(error = %err, "{err}");
            return;
        };

        let culprit = culprit.or_else(|| frames.first().map(|f| f.binary.clone()));

        let error = Error {
            id: crate::ids::trace_id(),
            transaction_id: String::new(),
            trace_id: String::new(),
            parent_id: String::new(),
            culprit,
            timestamp: crate::ids::now_micros(),
            exception: Exception {
                r#type: signal.to_string(),
                message: message.to_string(),
                handled,
                stacktrace: frames,
            },
        };
        txn.catch_error(error);
    }

    /// Current active span/transaction id — used for outgoing
    /// `traceparent` headers. `None` when no transaction is active.
    pub fn active_id(&self) -> Option<String> {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_mut().map(|txn| txn.active_id())
    }

    /// Mutate the context of the currently-deepest pending span, e.g. to
    /// record `http.status_code` after an interposed HTTP call completes.
    /// No-op if no span is pending.
    pub fn set_span_context<F: FnOnce(&mut Context)>(&self, f: F) {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(txn) = slot.as_mut() {
            if let Some(span) = txn.deepest_pending_span_mut() {
                f(&mut span.context);
            }
        }
    }

    /// Current trace id, for building outgoing `traceparent` headers.
    pub fn trace_id(&self) -> Option<String> {
        let slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().map(|txn| txn.trace_id.clone())
    }

    /// Force-end the current transaction with outcome `"failure"`, used by
    /// the crash handler. Returns the ended transaction so the crash path
    /// can serialize and ship it out-of-process instead of through the
    /// normal flush queue.
    pub fn force_end_for_crash(&self) -> Option<Transaction> {
        let mut slot = self.current.lock().unwrap_or_else(|e| e.into_inner());
        slot.take().map(|mut txn| {
            txn.end(Outcome::Failure, None);
            txn
        })
    }

    pub fn shutdown(self) {
        self.flush.shutdown();
    }
}

/// Parse caller-supplied symbolic stack lines, logging and dropping any
/// line that doesn't match the expected `backtrace_symbols(3)` shape.
fn parse_supplied_stack_symbols(lines: &[String]) -> Vec<StackFrame> {
    lines
        .iter()
        .filter_map(|line| {
            stack::parse_backtrace_symbol(line).or_else(|| {
                let err = AgentError::ParseFailed(format!("unparseable stack line: {line:?}"));
                tracing::warn!(error = %err, "{err}");
                None
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::metadata::Metadata;
    use std::sync::Arc;

    fn new_engine() -> Engine {
        let config = Arc::new(Config::default());
        let metadata = Arc::new(Metadata::build(&config));
        Engine::new(FlushPipeline::start(config, metadata))
    }

    #[test]
    fn begin_then_end_transaction_clears_slot() {
        let engine = new_engine();
        engine.begin_transaction("t", "request", None, None);
        assert!(engine.active_id().is_some());
        engine.end_transaction(Outcome::Success, Some("200".into()));
        assert!(engine.active_id().is_none());
    }

    #[test]
    fn begin_transaction_while_active_force_ends_previous() {
        let engine = new_engine();
        engine.begin_transaction("first", "request", None, None);
        let first_id = engine.active_id().unwrap();
        engine.begin_transaction("second", "request", None, None);
        let second_id = engine.active_id().unwrap();
        assert_ne!(first_id, second_id);
    }

    #[test]
    fn begin_span_without_transaction_is_a_logged_no_op() {
        let engine = new_engine();
        engine.begin_span("a", "code", None);
        // No panic, no active id, nothing to assert structurally beyond
        // "it didn't crash" — the warning is verified via logs in manual
        // testing, not captured here.
        assert!(engine.active_id().is_none());
    }

    #[test]
    fn catch_error_attaches_to_current_transaction() {
        let engine = new_engine();
        engine.begin_transaction("t", "request", None, None);
        engine.catch_error(None, "E", "boom", Some(vec![]), true);
        engine.end_transaction(Outcome::Failure, None);
    }

    #[test]
    fn catch_error_culprit_defaults_to_topmost_frame_binary_not_filename() {
        let engine = new_engine();
        engine.begin_transaction("t", "request", None, None);
        let frame = StackFrame {
            function: "f".to_string(),
            filename: "src/lib.rs".to_string(),
            binary: "/usr/bin/myapp".to_string(),
        };
        engine.attach_resolved_error(None, "E", "boom", vec![frame], false);
        let txn = engine.force_end_for_crash().unwrap();
        assert_eq!(txn.errors[0].culprit.as_deref(), Some("/usr/bin/myapp"));
    }

    #[test]
    fn active_id_tracks_deepest_pending_span() {
        let engine = new_engine();
        engine.begin_transaction("t", "request", None, None);
        let txn_id = engine.active_id().unwrap();
        engine.begin_span("a", "code", None);
        let span_id = engine.active_id().unwrap();
        assert_ne!(txn_id, span_id);
        engine.end_span(Outcome::Success);
        assert_eq!(engine.active_id().unwrap(), txn_id);
        engine.end_transaction(Outcome::Success, None);
    }
}
