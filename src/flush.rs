//! Background flush worker: a bounded producer/consumer FIFO decoupling
//! network latency from the application threads that end transactions.
//!
//! Shape matches the source exactly (a `Mutex`-guarded queue plus a
//! `Condvar`, not a lock-free ring buffer or bounded channel): application
//! threads only ever push and notify, never block on I/O; a single worker
//! thread blocks on the condvar, wakes, drains one transaction at a time,
//! serializes it, and POSTs it.

use crate::config::{Config, Constraints};
use crate::metadata::Metadata;
use crate::model::{Outcome, Transaction};
use crate::serializer;
use crate::transport;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

struct QueueState {
    queue: VecDeque<Transaction>,
    ready: bool,
    destroy: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// Handle to the background flush worker. Dropping it does not join the
/// thread — call [`FlushPipeline::shutdown`] explicitly for an orderly
/// drain, mirroring the source's separate `destroy_flush` entry point.
pub struct FlushPipeline {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl FlushPipeline {
    /// Start the worker thread. `metadata` is the once-built preamble
    /// reused by value across every batch; `config`'s constraints gate
    /// which dequeued transactions actually get sent.
    pub fn start(config: Arc<Config>, metadata: Arc<Metadata>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                ready: false,
                destroy: false,
            }),
            cv: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::spawn(move || worker_loop(worker_shared, config, metadata));

        FlushPipeline {
            shared,
            worker: Some(worker),
        }
    }

    /// Enqueue a finished transaction and wake the worker. O(1); never
    /// performs network I/O on the caller's thread.
    pub fn enqueue(&self, txn: Transaction) {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.push_back(txn);
        state.ready = true;
        self.shared.cv.notify_one();
    }

    /// Signal shutdown and join the worker. Transactions enqueued after
    /// this call observes `destroy` may be lost — the API is documented as
    /// not reentrant during shutdown, matching the source.
    pub fn shutdown(mut self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
            state.destroy = true;
        }
        self.shared.cv.notify_one();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    /// Current queue depth — exposed for tests and diagnostics, not part of
    /// the delivery protocol.
    pub fn queue_len(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .queue
            .len()
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.take() {
            {
                let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
                state.destroy = true;
            }
            self.shared.cv.notify_one();
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, config: Arc<Config>, metadata: Arc<Metadata>) {
    loop {
        let front = {
            let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
            while !state.ready && !state.destroy {
                state = shared.cv.wait(state).unwrap_or_else(|e| e.into_inner());
            }
            let front = state.queue.front().cloned();
            if state.queue.is_empty() {
                state.ready = false;
            }
            if front.is_none() && state.destroy {
                return;
            }
            front
        };

        let Some(txn) = front else {
            // Woken with `ready` set but nothing queued (spurious wake or a
            // producer that flipped `ready` and was immediately raced by
            // another dequeue): loop back around to re-check `destroy`.
            continue;
        };

        dispatch(&config, &metadata, &txn);

        let mut state = shared.state.lock().unwrap_or_else(|e| e.into_inner());
        state.queue.pop_front();
        if state.queue.is_empty() {
            state.ready = false;
        }
    }
}

/// `flush_if_error OR duration > flush_if_min_duration`. Transactions that
/// fail the predicate are simply dropped — they were already handed to the
/// queue exactly once and are destroyed exactly once either way, just
/// without a POST in between.
fn should_send(constraints: &Constraints, txn: &Transaction) -> bool {
    let failed = txn.outcome == Some(Outcome::Failure);
    if constraints.flush_if_error && failed {
        return true;
    }
    txn.duration.unwrap_or(0.0) > constraints.flush_if_min_duration
}

fn dispatch(config: &Config, metadata: &Metadata, txn: &Transaction) {
    if !should_send(&config.constraints, txn) {
        return;
    }
    if !config.is_usable() {
        return;
    }

    let body = serializer::serialize_transaction(metadata, txn);
    let url = format!("{}/intake/v2/events", config.url.trim_end_matches('/'));

    match transport::post_ndjson(&url, &config.token, &body) {
        Ok(response) if response.is_success() => {
            tracing::debug!(transaction_id = %txn.id, "flushed transaction");
        }
        Ok(response) => {
            tracing::warn!(transaction_id = %txn.id, status = response.status, "intake rejected batch");
        }
        Err(err) => {
            tracing::warn!(transaction_id = %txn.id, error = %err, "failed to flush transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Constraints;

    fn constraints(flush_if_error: bool, min_duration: f64) -> Constraints {
        Constraints {
            flush_if_error,
            flush_if_min_duration: min_duration,
        }
    }

    #[test]
    fn below_threshold_success_is_dropped() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.duration = Some(5.0);
        txn.outcome = Some(Outcome::Success);
        assert!(!should_send(&constraints(true, 10.0), &txn));
    }

    #[test]
    fn failure_is_always_sent_when_flush_if_error() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.duration = Some(1.0);
        txn.outcome = Some(Outcome::Failure);
        assert!(should_send(&constraints(true, 1000.0), &txn));
    }

    #[test]
    fn above_threshold_success_is_sent() {
        let mut txn = Transaction::begin("t", "request", None, None);
        txn.duration = Some(50.0);
        txn.outcome = Some(Outcome::Success);
        assert!(should_send(&constraints(true, 10.0), &txn));
    }

    #[test]
    fn enqueue_then_shutdown_drains_queue() {
        let config = Arc::new(Config::default());
        let metadata = Arc::new(Metadata::build(&config));
        let pipeline = FlushPipeline::start(config, metadata);

        let mut txn = Transaction::begin("t", "request", None, None);
        txn.end(Outcome::Success, None);
        pipeline.enqueue(txn);

        // Give the worker a moment to dequeue (bypass config means no
        // network I/O actually happens).
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(pipeline.queue_len(), 0);
        pipeline.shutdown();
    }
}
