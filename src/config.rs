//! Process-wide agent configuration with an `init -> run -> destroy`
//! lifecycle. Constructed once in [`crate::agent::init`] and shared as
//! `Arc<Config>` by every worker thread the agent starts.

/// Flush-time constraints evaluated against a finished transaction.
#[derive(Debug, Clone, Copy)]
pub struct Constraints {
    /// If set, a transaction whose outcome is `"failure"` is always sent,
    /// regardless of duration.
    pub flush_if_error: bool,
    /// Transactions shorter than this (in milliseconds) and not failing are
    /// dropped at flush time. Dropped transactions still consumed memory
    /// until `end_transaction` — the threshold is not applied at record
    /// time.
    pub flush_if_min_duration: f64,
}

impl Default for Constraints {
    fn default() -> Self {
        Constraints {
            flush_if_error: true,
            flush_if_min_duration: 0.0,
        }
    }
}

/// Process-wide configuration value.
#[derive(Debug, Clone)]
pub struct Config {
    /// When true, every public entry point is a no-op and no threads are
    /// started. [`Config::default`] sets this to `true` so that calling
    /// [`crate::agent::init`] with no config degrades safely.
    pub bypass: bool,
    pub url: String,
    pub token: String,
    pub name: String,
    pub environment: String,
    pub version: String,
    pub constraints: Constraints,
}

impl Config {
    /// Environment variable read for [`Config::from_env`], typed default
    /// documented alongside its constant rather than left as a magic number
    /// scattered through the worker loops.
    pub const ENV_URL: &'static str = "ELASTIC_APM_SERVER_URL";
    pub const ENV_TOKEN: &'static str = "ELASTIC_APM_SECRET_TOKEN";
    pub const ENV_SERVICE_NAME: &'static str = "ELASTIC_APM_SERVICE_NAME";
    pub const ENV_ENVIRONMENT: &'static str = "ELASTIC_APM_ENVIRONMENT";
    pub const ENV_SERVICE_VERSION: &'static str = "ELASTIC_APM_SERVICE_VERSION";
    pub const ENV_FLUSH_MIN_DURATION_MS: &'static str = "ELASTIC_APM_FLUSH_MIN_DURATION_MS";

    pub const DEFAULT_FLUSH_MIN_DURATION_MS: f64 = 0.0;

    /// Build a non-bypassed config from environment variables, falling back
    /// to documented defaults for anything unset. Does not itself flip
    /// `bypass` to `false` when `url` is empty — callers that want strict
    /// "bypass unless fully configured" behavior should check
    /// [`Config::is_usable`].
    pub fn from_env() -> Self {
        let flush_if_min_duration = std::env::var(Self::ENV_FLUSH_MIN_DURATION_MS)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(Self::DEFAULT_FLUSH_MIN_DURATION_MS);

        Config {
            bypass: false,
            url: std::env::var(Self::ENV_URL).unwrap_or_default(),
            token: std::env::var(Self::ENV_TOKEN).unwrap_or_default(),
            name: std::env::var(Self::ENV_SERVICE_NAME).unwrap_or_default(),
            environment: std::env::var(Self::ENV_ENVIRONMENT).unwrap_or_default(),
            version: std::env::var(Self::ENV_SERVICE_VERSION).unwrap_or_default(),
            constraints: Constraints {
                flush_if_error: true,
                flush_if_min_duration,
            },
        }
    }

    /// A config is only usable for real delivery when it isn't bypassed and
    /// carries a non-empty intake URL.
    pub fn is_usable(&self) -> bool {
        !self.bypass && !self.url.is_empty()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bypass: true,
            url: String::new(),
            token: String::new(),
            name: String::new(),
            environment: String::new(),
            version: String::new(),
            constraints: Constraints::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_bypassed() {
        let cfg = Config::default();
        assert!(cfg.bypass);
        assert!(!cfg.is_usable());
    }

    #[test]
    fn explicit_config_with_url_is_usable() {
        let cfg = Config {
            bypass: false,
            url: "https://intake.example.com".into(),
            ..Config::default()
        };
        assert!(cfg.is_usable());
    }

    #[test]
    fn bypassed_config_with_url_is_still_not_usable() {
        let cfg = Config {
            bypass: true,
            url: "https://intake.example.com".into(),
            ..Config::default()
        };
        assert!(!cfg.is_usable());
    }
}
