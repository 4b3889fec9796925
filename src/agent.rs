//! The single global entry point gluing configuration, the trace engine,
//! the flush pipeline, the metrics sampler, and the crash handler together.
//! Mirrors the source's `apm_init` / `apm_begin_capture_*` /
//! `apm_end_capture_*` / `apm_catch_error` / `apm_destroy` facade as safe
//! Rust functions.
//!
//! Global mutable state — the "current transaction" slot, the flush queue,
//! the metadata cache — is encapsulated in a single [`Agent`] struct held
//! behind a process-wide [`OnceLock`], with [`init`]/[`destroy`] bounding
//! its lifetime. Every public function here looks it up once per call and
//! is a no-op when no agent has been installed, or when the installed
//! agent's config has `bypass = true` (Testable Property 1) — in bypass
//! mode [`init`] does not even construct an [`Engine`] or start the flush
//! worker, so bypass really does start zero threads, not merely route
//! around them.

use crate::config::Config;
use crate::engine::Engine;
use crate::metadata::Metadata;
#[cfg(feature = "metrics")]
use crate::metrics::MetricsSampler;
use crate::{flush::FlushPipeline, traceparent};
use std::sync::{Arc, Mutex, OnceLock};

struct Agent {
    config: Arc<Config>,
    /// `None` exactly when `config.bypass` is true — no engine, no flush
    /// worker, no metrics worker, no crash handler.
    engine: Option<Arc<Engine>>,
    #[cfg(feature = "metrics")]
    metrics: Option<MetricsSampler>,
}

static AGENT: OnceLock<Mutex<Option<Agent>>> = OnceLock::new();

fn slot() -> &'static Mutex<Option<Agent>> {
    AGENT.get_or_init(|| Mutex::new(None))
}

/// Install the agent. Calling this without a config installs
/// [`Config::default`] (`bypass = true`); every public API below then
/// degrades to a no-op and no threads are started.
pub fn init(config: Option<Config>) {
    let config = Arc::new(config.unwrap_or_default());

    let mut guard = slot().lock().unwrap_or_else(|e| e.into_inner());

    if config.bypass {
        *guard = Some(Agent {
            config,
            engine: None,
            #[cfg(feature = "metrics")]
            metrics: None,
        });
        return;
    }

    let metadata = Arc::new(Metadata::build(&config));
    let flush = FlushPipeline::start(Arc::clone(&config), Arc::clone(&metadata));
    let engine = Arc::new(Engine::new(flush));

    #[cfg(feature = "metrics")]
    let metrics = Some(MetricsSampler::start(Arc::clone(&config), Arc::clone(&metadata)));

    // SAFETY: install is only ever called once per process in practice
    // (repeated calls replace the stored context but do not double-register
    // the handler); see `crash::install`'s own doc comment.
    unsafe {
        crate::crash::install(Arc::clone(&engine), Arc::clone(&config), metadata);
    }

    *guard = Some(Agent {
        config,
        engine: Some(engine),
        #[cfg(feature = "metrics")]
        metrics,
    });
}

/// Tear down the agent: joins the flush worker (and metrics worker, if
/// running) after an orderly drain. Any transactions enqueued after
/// shutdown begins may be lost, matching the source. A no-op in bypass
/// mode, since nothing was started.
pub fn destroy() {
    let agent = slot().lock().unwrap_or_else(|e| e.into_inner()).take();
    if let Some(agent) = agent {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = agent.metrics {
            metrics.shutdown();
        }
        if let Some(engine) = agent.engine {
            if let Ok(engine) = Arc::try_unwrap(engine) {
                engine.shutdown();
            }
        }
    }
}

fn with_engine<F: FnOnce(&Engine, &Config)>(f: F) {
    let guard = slot().lock().unwrap_or_else(|e| e.into_inner());
    if let Some(agent) = guard.as_ref() {
        if let Some(engine) = agent.engine.as_ref() {
            f(engine, &agent.config);
        }
    }
}

pub fn begin_transaction(
    name: &str,
    r#type: &str,
    trace_id: Option<String>,
    parent_id: Option<String>,
) {
    with_engine(|engine, _| engine.begin_transaction(name, r#type, trace_id, parent_id));
}

pub fn end_transaction(outcome: crate::model::Outcome, result: Option<String>) {
    with_engine(|engine, _| engine.end_transaction(outcome, result));
}

pub fn begin_span(name: &str, r#type: &str, subtype: Option<String>) {
    with_engine(|engine, _| engine.begin_span(name, r#type, subtype));
}

pub fn end_span(outcome: crate::model::Outcome) {
    with_engine(|engine, _| engine.end_span(outcome));
}

/// `stack_symbols`, when given, is a set of already-symbolic
/// `"function (file:line)"` lines (e.g. forwarded from a language runtime)
/// rather than a captured backtrace; `None` captures one at the call site.
pub fn catch_error(
    culprit: Option<String>,
    signal: &str,
    message: &str,
    stack_symbols: Option<Vec<String>>,
    handled: bool,
) {
    with_engine(|engine, _| engine.catch_error(culprit, signal, message, stack_symbols, handled));
}

/// Build a `TracedHttpClient` bound to the current agent's engine, or
/// `None` when no agent is installed or the installed one is bypassed.
pub fn http_client() -> Option<crate::interposer::TracedHttpClient> {
    let guard = slot().lock().unwrap_or_else(|e| e.into_inner());
    guard
        .as_ref()
        .and_then(|agent| agent.engine.as_ref())
        .map(|engine| crate::interposer::TracedHttpClient::new(Arc::clone(engine)))
}

/// Parse an upstream `traceparent` header into `(trace_id, parent_id)`.
/// Exposed from the facade as a convenience re-export; the real logic
/// lives in [`crate::traceparent`] and needs no agent state.
pub fn parse_traceparent(value: &str) -> (Option<String>, Option<String>) {
    traceparent::parse(value)
}

/// True once [`init`] has installed a non-bypassed agent. Mostly useful
/// for tests and for callers that want to skip building request bodies
/// entirely when instrumentation is off.
pub fn is_active() -> bool {
    slot()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .is_some_and(|agent| agent.engine.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Outcome;
    use serial_test::serial;

    #[test]
    #[serial]
    fn bypass_mode_is_idempotent_and_side_effect_free() {
        init(None); // default config is bypass=true
        assert!(!is_active());
        begin_transaction("GET /x", "request", None, None);
        begin_span("db.query", "db", Some("postgresql".into()));
        end_span(Outcome::Success);
        catch_error(None, "E", "boom", Some(vec![]), true);
        end_transaction(Outcome::Success, Some("200".into()));
        destroy();
    }

    #[test]
    #[serial]
    fn init_without_config_degrades_to_default_bypass() {
        init(None);
        assert!(!is_active());
        destroy();
    }

    #[test]
    #[serial]
    fn explicit_non_bypassed_config_activates_the_engine() {
        let config = Config {
            bypass: false,
            url: "https://intake.invalid".into(),
            ..Config::default()
        };
        init(Some(config));
        assert!(is_active());
        destroy();
        assert!(!is_active());
    }
}
