//! Periodic process/system resource sampling, feature-gated behind
//! `metrics` (mirroring the source's compile-time `APM_SPAWN_METRICS`
//! switch). A second background worker wakes roughly every ten seconds,
//! reads `/proc/stat` and `/proc/self/stat`, and POSTs a single
//! `metricset` NDJSON line alongside the cached metadata preamble.

use crate::config::Config;
use crate::metadata::Metadata;
use crate::transport;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Page size used to convert `/proc/self/stat`'s RSS (in pages) to bytes.
/// Read once via `sysconf(_SC_PAGESIZE)`; falls back to 4096 (the
/// overwhelmingly common value on x86_64/aarch64 Linux) if the syscall
/// fails.
fn page_size() -> u64 {
    // SAFETY: sysconf with a valid name argument never causes UB; a
    // negative return means "unsupported", handled below.
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as u64
    } else {
        4096
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct CpuSample {
    system_total: u64,
    system_idle: u64,
    process_total: u64,
}

fn read_system_cpu() -> Option<(u64, u64)> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse::<u64>().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3];
    let total: u64 = fields.iter().sum();
    Some((total, idle))
}

fn read_process_stat() -> Option<(u64, u64, u64)> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_process_stat(&stat)
}

/// Parse `/proc/self/stat`'s (process_total_ticks, vsize, rss_pages) out of
/// its raw contents. Fields after the `(comm)` parenthesized group are
/// whitespace separated and position-stable; utime is field 14, stime field
/// 15, vsize field 23, rss field 24 (1-indexed per proc(5)). `fields[0]`
/// here is state (field 3 overall), so field N overall lands at index
/// N-3: utime is index 11, stime index 12, vsize index 20, rss index 21.
fn parse_process_stat(contents: &str) -> Option<(u64, u64, u64)> {
    let after_comm = contents.rsplit_once(") ")?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let vsize: u64 = fields.get(20)?.parse().ok()?;
    let rss: u64 = fields.get(21)?.parse().ok()?;
    Some((utime + stime, vsize, rss))
}

fn sample_cpu() -> CpuSample {
    let (system_total, system_idle) = read_system_cpu().unwrap_or((0, 0));
    let (process_total, _, _) = read_process_stat().unwrap_or((0, 0, 0));
    CpuSample {
        system_total,
        system_idle,
        process_total,
    }
}

#[derive(Serialize)]
struct SystemCpu {
    #[serde(rename = "total.norm.pct")]
    total_norm_pct: f64,
}

#[derive(Serialize)]
struct ProcessCpu {
    #[serde(rename = "total.norm.pct")]
    total_norm_pct: f64,
}

#[derive(Serialize)]
struct ProcessMemory {
    size: u64,
    #[serde(rename = "rss.bytes")]
    rss_bytes: u64,
}

#[derive(Serialize)]
struct SystemSection {
    cpu: SystemCpu,
    process: ProcessSection,
}

#[derive(Serialize)]
struct ProcessSection {
    cpu: ProcessCpu,
    memory: ProcessMemory,
}

#[derive(Serialize)]
struct Metricset {
    system: SystemSection,
}

/// Compute the normalized CPU deltas and current memory footprint between
/// two consecutive samples. Both CPU ratios are reported as 0 when the
/// system's total delta is zero (first sample, or a `/proc/stat` read
/// failure on both sides).
fn build_metricset(previous: CpuSample, current: CpuSample, vsize: u64, rss_pages: u64) -> Metricset {
    let system_total_delta = current.system_total.saturating_sub(previous.system_total);
    let system_busy_delta = system_total_delta.saturating_sub(
        current
            .system_idle
            .saturating_sub(previous.system_idle),
    );
    let process_total_delta = current.process_total.saturating_sub(previous.process_total);

    let (system_pct, process_pct) = if system_total_delta == 0 {
        (0.0, 0.0)
    } else {
        (
            system_busy_delta as f64 / system_total_delta as f64,
            process_total_delta as f64 / system_total_delta as f64,
        )
    };

    Metricset {
        system: SystemSection {
            cpu: SystemCpu {
                total_norm_pct: system_pct,
            },
            process: ProcessSection {
                cpu: ProcessCpu {
                    total_norm_pct: process_pct,
                },
                memory: ProcessMemory {
                    size: vsize,
                    rss_bytes: rss_pages * page_size(),
                },
            },
        },
    }
}

fn serialize_metricset(metadata: &Metadata, metricset: &Metricset) -> String {
    let mut out = String::new();
    out.push_str(&serde_json::json!({ "metadata": metadata }).to_string());
    out.push('\n');
    out.push_str(&serde_json::json!({ "metricset": metricset }).to_string());
    out
}

pub struct MetricsSampler {
    shutdown: Arc<(Mutex<bool>, Condvar)>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    pub fn start(config: Arc<Config>, metadata: Arc<Metadata>) -> Self {
        let shutdown = Arc::new((Mutex::new(false), Condvar::new()));
        let running = Arc::new(AtomicBool::new(true));

        let worker_shutdown = Arc::clone(&shutdown);
        let worker_running = Arc::clone(&running);
        let worker = thread::spawn(move || {
            let mut previous = sample_cpu();
            let (lock, cv) = &*worker_shutdown;
            loop {
                let mut done = lock.lock().unwrap_or_else(|e| e.into_inner());
                let (result, _) = cv
                    .wait_timeout(done, SAMPLE_INTERVAL)
                    .unwrap_or_else(|e| e.into_inner());
                done = result;
                if *done {
                    break;
                }
                drop(done);

                let current = sample_cpu();
                let (_, vsize, rss) = read_process_stat().unwrap_or((0, 0, 0));
                let metricset = build_metricset(previous, current, vsize, rss);
                previous = current;

                if config.is_usable() {
                    let body = serialize_metricset(&metadata, &metricset);
                    let url = format!(
                        "{}/intake/v2/metrics",
                        config.url.trim_end_matches('/')
                    );
                    if let Err(err) = transport::post_ndjson(&url, &config.token, &body) {
                        tracing::warn!(error = %err, "failed to post metrics");
                    }
                }
            }
            worker_running.store(false, Ordering::SeqCst);
        });

        MetricsSampler {
            shutdown,
            running,
            worker: Some(worker),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn shutdown(mut self) {
        {
            let (lock, cv) = &*self.shutdown;
            let mut done = lock.lock().unwrap_or_else(|e| e.into_inner());
            *done = true;
            cv.notify_one();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}
