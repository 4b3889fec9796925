//! One-shot snapshot of service, process, host, and cloud-provider
//! attributes, built once at [`crate::agent::init`] and emitted as the
//! first NDJSON line of every batch (the `metadata` envelope).

use crate::config::Config;
use crate::ids;
use serde::Serialize;
use std::time::Duration;

const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
const CRATE_VERSION: &str = env!("CARGO_PKG_VERSION");

const AZURE_IMDS_URL: &str =
    "http://169.254.169.254/metadata/instance/compute?api-version=2019-08-15";
const AZURE_IMDS_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Serialize)]
pub struct AgentInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ContainerInfo {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemInfo {
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerInfo>,
}

/// Cloud-provider attributes. Left entirely `None` when no provider's probe
/// succeeds — this departs from the source, which defaulted to
/// `provider="azure"` with empty fields on any Azure IMDS failure even when
/// running on AWS/GCP/bare metal. See `DESIGN.md` for the rationale.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CloudInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub service: ServiceInfo,
    pub process: ProcessInfo,
    pub system: SystemInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud: Option<CloudInfo>,
}

impl Metadata {
    /// Build a one-shot snapshot from `config`, probing for cloud metadata.
    /// Called exactly once, at init; the result is cached and cloned by
    /// value into every subsequent batch (cheap: a handful of small
    /// strings).
    pub fn build(config: &Config) -> Self {
        Metadata {
            service: ServiceInfo {
                name: non_empty_or(&config.name, CRATE_NAME),
                environment: non_empty(&config.environment),
                version: non_empty(&config.version),
                agent: AgentInfo {
                    name: CRATE_NAME.to_string(),
                    version: CRATE_VERSION.to_string(),
                },
            },
            process: ProcessInfo {
                pid: std::process::id(),
            },
            system: SystemInfo {
                hostname: ids::hostname(),
                container: container_id().map(|id| ContainerInfo { id }),
            },
            cloud: probe_cloud(),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

fn non_empty_or(s: &str, default: &str) -> String {
    if s.is_empty() {
        default.to_string()
    } else {
        s.to_string()
    }
}

/// Container id, read from the cgroup path the way most container-aware
/// agents do it: the last path segment of `/proc/self/cgroup`'s longest
/// entry. Returns `None` outside a container or on any read failure.
fn container_id() -> Option<String> {
    container_id_from_path("/proc/self/cgroup")
}

fn container_id_from_path(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .lines()
        .filter_map(|line| line.rsplit('/').next())
        .find(|segment| segment.len() >= 64 && segment.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|s| s.to_string())
}

/// Probe the Azure IMDS endpoint with a short timeout. Any failure (timeout,
/// connection refused, non-200 status) leaves cloud metadata entirely
/// unset rather than guessing a provider.
fn probe_cloud() -> Option<CloudInfo> {
    let client = reqwest::blocking::Client::builder()
        .timeout(AZURE_IMDS_TIMEOUT)
        .build()
        .ok()?;

    let response = client
        .get(AZURE_IMDS_URL)
        .header("Metadata", "true")
        .send()
        .ok()?;

    if !response.status().is_success() {
        return None;
    }

    #[derive(serde::Deserialize)]
    struct AzureCompute {
        location: Option<String>,
    }

    let body: AzureCompute = response.json().ok()?;
    Some(CloudInfo {
        provider: Some("azure".to_string()),
        region: body.location,
    })
}
