//! Crash-time fallback delivery path: a signal handler for `SIGSEGV` and
//! `SIGABRT` that captures the current transaction, synthesizes an error
//! from the faulting stack, and ships the resulting batch via two
//! independent external processes (`gzip`, `curl`) instead of the
//! in-process HTTP client.
//!
//! The out-of-process delivery is deliberate: at crash time the
//! in-process HTTP client's internal state may be corrupted (a connection
//! mid-flight, a buffer half-written), so the agent delegates to binaries
//! the kernel will happily exec even from a signal handler. This module is
//! the crate's one genuinely non-async-signal-safe code path — it
//! allocates (`String`, `Vec`) and calls `Command::spawn`, both forbidden
//! in the strict async-signal-safety sense. That's accepted as
//! best-effort here, matching the source; a hardened rewrite would
//! pre-allocate the payload buffer and the child argv at `init` and use
//! raw `fork`+`execve`.
//!
//! Frame #1 of the captured stack is overwritten with the faulting
//! instruction pointer pulled from the signal's machine context
//! (`ucontext_t.uc_mcontext`, the `RIP` register on x86_64), since the
//! portable `backtrace` capture taken from inside the handler sees the
//! signal trampoline at that position rather than the instruction that
//! actually raised the signal. This is only implemented for x86_64
//! Linux/glibc; other targets skip the overwrite and keep whatever
//! `capture_backtrace` found.

use crate::config::Config;
use crate::engine::Engine;
use crate::metadata::Metadata;
use crate::model::StackFrame;
use crate::serializer;
use crate::stack;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};

struct CrashContext {
    engine: Arc<Engine>,
    config: Arc<Config>,
    metadata: Arc<Metadata>,
}

static CONTEXT: OnceLock<CrashContext> = OnceLock::new();

/// Install the `SIGSEGV`/`SIGABRT` handlers. Idempotent: a second call
/// replaces the stored context but does not re-register the handlers
/// twice (the handler itself always reads through the same `OnceLock`).
///
/// # Safety
///
/// Registers a signal handler via `sigaction(2)`. The handler itself is
/// documented above as not strictly async-signal-safe; this is an
/// accepted, intentional trade-off of the crash path, not an oversight.
pub unsafe fn install(engine: Arc<Engine>, config: Arc<Config>, metadata: Arc<Metadata>) {
    let _ = CONTEXT.set(CrashContext {
        engine,
        config,
        metadata,
    });

    let action = SigAction::new(
        SigHandler::SigAction(handle_crash_signal),
        SaFlags::SA_NODEFER,
        SigSet::empty(),
    );
    // SAFETY: sigaction with a valid handler and empty mask is sound; the
    // handler only does best-effort work and never re-registers itself.
    unsafe {
        let _ = signal::sigaction(Signal::SIGSEGV, &action);
        let _ = signal::sigaction(Signal::SIGABRT, &action);
    }
}

extern "C" fn handle_crash_signal(
    signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let Some(ctx) = CONTEXT.get() else {
        return;
    };
    let signal_name = Signal::try_from(signum)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| signum.to_string());

    // Step 1-3: capture the stack, then overwrite frame #1 (the first
    // frame past this handler itself) with the faulting instruction
    // pointer read out of the signal's machine context, resolved the same
    // way any other captured frame would be. Frame #0 here is the signal
    // trampoline the `backtrace` crate sees when unwinding out of a
    // handler, not the instruction that actually faulted; the machine
    // context is the only place that address survives.
    let mut frames: Vec<StackFrame> = stack::capture_backtrace(1);
    if let Some(ip) = faulting_instruction_pointer(ucontext) {
        let frame = stack::resolve_address(ip).unwrap_or(StackFrame {
            function: format!("{ip:#x}"),
            filename: String::new(),
            binary: String::new(),
        });
        if frames.len() <= 1 {
            frames.push(frame);
        } else {
            frames[1] = frame;
        }
    }

    ctx.engine.attach_resolved_error(
        None,
        &signal_name,
        &format!("process received {signal_name}"),
        frames,
        false,
    );

    // Step 5: force-end the current transaction.
    let Some(txn) = ctx.engine.force_end_for_crash() else {
        return;
    };

    // Step 6: build the payload and hand it to the out-of-process pipeline.
    let body = serializer::serialize_transaction(&ctx.metadata, &txn);
    deliver_out_of_process(&ctx.config, &body);
}

/// Read the faulting instruction pointer out of the signal's machine
/// context. Only implemented for x86_64 Linux/glibc, where `libc` exposes
/// `ucontext_t.uc_mcontext.gregs` and `REG_RIP`; every other target gets
/// `None`, and the handler falls back to whatever `capture_backtrace`
/// already produced for frame #1.
#[cfg(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64"))]
fn faulting_instruction_pointer(ucontext: *mut libc::c_void) -> Option<u64> {
    if ucontext.is_null() {
        return None;
    }
    // SAFETY: the kernel passes a valid `ucontext_t*` as the third argument
    // to a `SA_SIGINFO` handler; we only read from it, never write.
    let ctx = unsafe { &*(ucontext as *const libc::ucontext_t) };
    let rip = ctx.uc_mcontext.gregs[libc::REG_RIP as usize];
    Some(rip as u64)
}

#[cfg(not(all(target_os = "linux", target_env = "gnu", target_arch = "x86_64")))]
fn faulting_instruction_pointer(_ucontext: *mut libc::c_void) -> Option<u64> {
    None
}

/// Spawn `gzip -c | curl -X POST ...` and write `body` to the pipeline's
/// stdin. Best-effort: every failure is swallowed, since by this point the
/// process is assumed terminal and there is nothing left to do but try.
fn deliver_out_of_process(config: &Config, body: &str) {
    if !config.is_usable() {
        return;
    }

    let url = format!("{}/intake/v2/events", config.url.trim_end_matches('/'));
    let shell_command = format!(
        "gzip -c | curl -s -X POST '{url}' \
         -H 'Authorization: Bearer {token}' \
         -H 'Content-Type: application/x-ndjson' \
         -H 'Content-Encoding: gzip' \
         --data-binary @-",
        url = url,
        token = config.token,
    );

    let child = Command::new("sh")
        .arg("-c")
        .arg(shell_command)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();

    if let Ok(mut child) = child {
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(body.as_bytes());
        }
        // Don't wait: the handler does not re-raise and assumes the
        // process is already terminal, so there is no thread left alive
        // to reap the child.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Error, Exception, Outcome, Transaction};

    #[test]
    fn deliver_out_of_process_is_a_no_op_when_unusable() {
        // A bypassed/default config has no url, so this must not attempt
        // to spawn anything; the real assertion is "doesn't panic".
        let config = Config::default();
        deliver_out_of_process(&config, "irrelevant body");
    }

    #[test]
    fn crash_serializes_a_forced_failure_outcome() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.catch_error(Error {
            id: "e".repeat(32),
            transaction_id: String::new(),
            trace_id: String::new(),
            parent_id: String::new(),
            culprit: None,
            timestamp: 0,
            exception: Exception {
                r#type: "SIGSEGV".into(),
                message: "process received SIGSEGV".into(),
                handled: false,
                stacktrace: vec![],
            },
        });
        txn.end(Outcome::Failure, None);

        let config = Config::default();
        let metadata = Metadata::build(&config);
        let body = serializer::serialize_transaction(&metadata, &txn);
        assert!(body.contains(r#""outcome":"failure""#));
        assert!(body.contains("SIGSEGV"));
    }
}
