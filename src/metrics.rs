//! Host metrics sampling and the periodic pump into the hub

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use logtide_hub::Hub;
use logtide_types::{CpuInfo, Envelope, MemoryInfo, MetricsSnapshot, RuntimeInfo, UptimeInfo};

/// Something that can take a health sample of the host
pub trait MetricsProvider: Send + Sync {
    fn sample_now(&self) -> Result<MetricsSnapshot>;
}

/// Linux `/proc` reader
#[derive(Debug, Clone)]
pub struct ProcMetrics {
    root: PathBuf,
}

impl ProcMetrics {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from a different procfs mount
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, name: &str) -> Result<String> {
        let path = self.root.join(name);
        std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))
    }
}

impl Default for ProcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsProvider for ProcMetrics {
    fn sample_now(&self) -> Result<MetricsSnapshot> {
        let now = Utc::now();
        let load_average = parse_loadavg(&self.read("loadavg")?)?;
        let memory = parse_meminfo(&self.read("meminfo")?)?;
        let uptime = parse_uptime(&self.read("uptime")?, now)?;
        let cores = std::thread::available_parallelism().map_or(1, |n| n.get());

        Ok(MetricsSnapshot {
            timestamp: now,
            cpu: CpuInfo { cores, load_average },
            memory,
            uptime,
            runtime: RuntimeInfo::current(),
        })
    }
}

fn parse_loadavg(raw: &str) -> Result<[f64; 3]> {
    let mut fields = raw.split_whitespace().map(str::parse::<f64>);
    let mut load = [0.0; 3];
    for slot in &mut load {
        *slot = fields
            .next()
            .ok_or_else(|| anyhow!("loadavg: too few fields"))?
            .context("loadavg: bad number")?;
    }
    Ok(load)
}

fn parse_meminfo(raw: &str) -> Result<MemoryInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        // Values are in kB
        let Ok(kib) = value.parse::<u64>() else { continue };
        match key {
            "MemTotal:" => total = Some(kib * 1024),
            "MemAvailable:" => available = Some(kib * 1024),
            "MemFree:" => free = Some(kib * 1024),
            _ => {}
        }
    }

    let total = total.ok_or_else(|| anyhow!("meminfo: MemTotal missing"))?;
    // Kernels before 3.14 have no MemAvailable
    let available = available.or(free).unwrap_or(0);
    Ok(MemoryInfo::new(total, available))
}

fn parse_uptime(raw: &str, now: DateTime<Utc>) -> Result<UptimeInfo> {
    let seconds: f64 = raw
        .split_whitespace()
        .next()
        .ok_or_else(|| anyhow!("uptime: empty"))?
        .parse()
        .context("uptime: bad number")?;
    let uptime_seconds = seconds as u64;
    let boot_time = now - TimeDelta::seconds(uptime_seconds as i64);
    Ok(UptimeInfo {
        uptime_seconds,
        boot_time,
    })
}

/// Publish a sample every `interval` until cancelled
///
/// A failed sample is logged and skipped; the pump keeps running.
pub async fn run_metrics_pump<P: MetricsProvider + ?Sized>(
    provider: &P,
    hub: Hub<Envelope>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match provider.sample_now() {
            Ok(snapshot) => {
                let accepted = hub.publish(Envelope::Metrics(snapshot));
                debug!(accepted, subscribers = hub.subscriber_count(), "metrics published");
            }
            Err(e) => warn!("metrics sample failed: {e:#}"),
        }
    }
}
