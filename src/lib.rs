//! `terra-apm-agent` — an in-process Application Performance Monitoring
//! agent.
//!
//! Embed this crate in a long-running service to capture distributed
//! traces (transactions containing nested spans), handled and fatal
//! errors with stack traces, and periodic process/system resource
//! metrics, then ship all of it as NDJSON batches to an intake endpoint
//! compatible with the Elastic APM v2 intake schema.
//!
//! The public surface is the [`agent`] facade: call [`agent::init`] once
//! at process startup, drive traces with [`agent::begin_transaction`] /
//! [`agent::begin_span`] / [`agent::end_span`] / [`agent::end_transaction`]
//! / [`agent::catch_error`], and call [`agent::destroy`] once at shutdown
//! for an orderly drain of in-flight transactions.
//!
//! ```no_run
//! use terra_apm_agent::{agent, config::Config, model::Outcome};
//!
//! agent::init(Some(Config {
//!     bypass: false,
//!     url: "https://my-apm-server.example.com".to_string(),
//!     token: "secret".to_string(),
//!     name: "checkout-service".to_string(),
//!     ..Config::default()
//! }));
//!
//! agent::begin_transaction("GET /checkout", "request", None, None);
//! agent::begin_span("db.query", "db", Some("postgresql".to_string()));
//! agent::end_span(Outcome::Success);
//! agent::end_transaction(Outcome::Success, Some("200".to_string()));
//!
//! agent::destroy();
//! ```
//!
//! Every public entry point swallows and logs its own failures: an
//! instrumentation bug must never become a host application bug. With
//! `bypass = true` (the default when [`agent::init`] is called with
//! `None`), every call above is a pure no-op — no threads, no allocation
//! beyond argument passing, no network traffic.

pub mod agent;
pub mod config;
pub mod crash;
pub mod engine;
pub mod error;
pub mod flush;
pub mod ids;
pub mod interposer;
pub mod metadata;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod model;
pub mod serializer;
pub mod stack;
pub mod traceparent;
pub mod transport;
