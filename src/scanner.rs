use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::net::lookup_host;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::detect::detect_service;
use crate::ports::COMMON_PORTS;
use crate::probe::probe;
use crate::types::{PortStatus, ProbeResult, ScanMetrics, Technique};

/// Hard ceiling on simultaneous in-flight probes, matching what one process
/// can sensibly hold in its socket table.
const MAX_CONCURRENCY: usize = 5_000;

/// Live counters shared with callers that want progress while a scan runs
/// (the HTTP status endpoint reads these).
#[derive(Clone, Debug, Default)]
pub struct SharedProgress {
    pub scanned_done: Arc<AtomicU64>,
    pub open_count: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
    pub peak_in_flight: Arc<AtomicU64>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::Relaxed);
    }

    fn exit(&self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Outcome of scanning one host in a multi-target batch.
#[derive(Serialize, Debug, Clone)]
pub struct HostScanOutcome {
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub ports: Vec<ProbeResult>,
    pub metrics: Option<ScanMetrics>,
}

#[derive(Serialize, Debug, Clone)]
pub struct MultiScanSummary {
    pub total_targets_scanned: usize,
    pub successful_scans: usize,
    pub total_open_ports: usize,
    pub average_scan_time: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct MultiScanReport {
    pub results: BTreeMap<String, HostScanOutcome>,
    pub summary: MultiScanSummary,
}

/// Concurrent port scanner with a bounded probe pool.
///
/// Each `scan_*` call is independent; the scanner holds no state across
/// scans and may be used concurrently for different hosts.
#[derive(Clone, Debug)]
pub struct PortScanner {
    timeout: Duration,
    concurrency: usize,
    deadline: Option<Duration>,
    detect_services: bool,
}

impl Default for PortScanner {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), 100)
    }
}

impl PortScanner {
    pub fn new(timeout: Duration, concurrency: usize) -> Self {
        Self {
            timeout,
            concurrency: concurrency.clamp(1, MAX_CONCURRENCY),
            deadline: None,
            detect_services: true,
        }
    }

    /// Bound the whole scan: when the deadline passes, pending and in-flight
    /// probes are aborted and metrics cover whatever completed.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Skip service detection on open ports; used for the single-technique
    /// side of hybrid-vs-single comparisons.
    pub fn without_detection(mut self) -> Self {
        self.detect_services = false;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Scan `start..=end` on `host`, optionally probing well-known ports
    /// first. Returns every per-port result plus the aggregate metrics.
    pub async fn scan_port_range(
        &self,
        host: &str,
        start: u16,
        end: u16,
        use_common_ports: bool,
        technique: Technique,
    ) -> Result<(Vec<ProbeResult>, ScanMetrics)> {
        let ports = crate::ports::build_worklist(start, end, use_common_ports);
        self.scan_ports(host, &ports, technique, CancellationToken::new(), SharedProgress::new())
            .await
    }

    /// Quick scan of the fixed well-known port set, TCP connect only.
    pub async fn scan_common_ports(&self, host: &str) -> Result<(Vec<ProbeResult>, ScanMetrics)> {
        self.scan_ports(
            host,
            COMMON_PORTS,
            Technique::TcpConnect,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await
    }

    /// Scan an explicit port list with external cancellation and live
    /// progress counters. This is the full-control entry point the HTTP
    /// layer and the tests drive.
    pub async fn scan_ports(
        &self,
        host: &str,
        ports: &[u16],
        technique: Technique,
        cancel: CancellationToken,
        shared: SharedProgress,
    ) -> Result<(Vec<ProbeResult>, ScanMetrics)> {
        let ip = resolve_host(host).await?;
        info!(host, ip = %ip, ports = ports.len(), technique = %technique, "scan started");
        let scan_start = Instant::now();

        if let Some(deadline) = self.deadline {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(deadline) => {
                        warn!(?deadline, "scan deadline reached, cancelling remaining probes");
                        cancel.cancel();
                    }
                    _ = cancel.cancelled() => {}
                }
            });
        }

        let sem = Arc::new(Semaphore::new(self.concurrency));
        let mut set: JoinSet<Option<(ProbeResult, Technique, Duration)>> = JoinSet::new();
        let host_label: Arc<str> = Arc::from(host);
        let timeout = self.timeout;
        let detect = self.detect_services;

        for &port in ports {
            if cancel.is_cancelled() {
                break;
            }
            let permit = sem
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore in scope");
            let cancel = cancel.clone();
            let shared = shared.clone();
            let host = host_label.clone();

            set.spawn(async move {
                let _permit = permit; // held until the probe finishes

                if cancel.is_cancelled() {
                    return None;
                }
                shared.enter();
                let addr = SocketAddr::new(ip, port);
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = probe_and_detect(&host, addr, technique, timeout, detect) => Some(result),
                };
                shared.exit();

                let (result, probe_elapsed) = outcome?;
                shared.scanned_done.fetch_add(1, Ordering::Relaxed);
                if result.status == PortStatus::Open {
                    shared.open_count.fetch_add(1, Ordering::Relaxed);
                }
                Some((result, technique, probe_elapsed))
            });
        }

        // Collect in completion order; aggregation is commutative so the
        // order cannot change the metrics.
        let mut results = Vec::with_capacity(ports.len());
        let mut timings = Vec::with_capacity(ports.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some((result, technique, elapsed))) => {
                    results.push(result);
                    timings.push((technique, elapsed));
                }
                Ok(None) => {} // cancelled before completion
                Err(e) => debug!(error = %e, "probe task aborted"),
            }
        }

        let metrics = ScanMetrics::compute(
            host,
            &results,
            &timings,
            scan_start.elapsed(),
            self.concurrency,
        );
        info!(
            host,
            scanned = metrics.ports_scanned,
            open = metrics.open_count,
            elapsed = ?metrics.total_duration,
            "scan finished"
        );
        Ok((results, metrics))
    }

    /// Scan several hosts in sequence. A host that fails to resolve gets an
    /// error entry and the batch keeps going.
    pub async fn scan_many(
        &self,
        hosts: &[String],
        ports: Option<&[u16]>,
        technique: Technique,
    ) -> MultiScanReport {
        let ports = ports.unwrap_or(COMMON_PORTS);
        let mut results = BTreeMap::new();
        let mut scan_times = Vec::new();
        let mut total_open = 0;

        for host in hosts {
            let ip = match resolve_host(host).await {
                Ok(ip) => ip,
                Err(e) => {
                    warn!(host, error = %e, "target skipped: resolution failed");
                    results.insert(
                        host.clone(),
                        HostScanOutcome {
                            ip: None,
                            error: Some(format!("could not resolve host: {e}")),
                            ports: Vec::new(),
                            metrics: None,
                        },
                    );
                    continue;
                }
            };

            match self
                .scan_ports(host, ports, technique, CancellationToken::new(), SharedProgress::new())
                .await
            {
                Ok((port_results, metrics)) => {
                    total_open += metrics.open_count;
                    scan_times.push(metrics.total_duration.as_secs_f64());
                    results.insert(
                        host.clone(),
                        HostScanOutcome {
                            ip: Some(ip.to_string()),
                            error: None,
                            ports: port_results,
                            metrics: Some(metrics),
                        },
                    );
                }
                Err(e) => {
                    results.insert(
                        host.clone(),
                        HostScanOutcome {
                            ip: Some(ip.to_string()),
                            error: Some(e.to_string()),
                            ports: Vec::new(),
                            metrics: None,
                        },
                    );
                }
            }
        }

        let successful = results.values().filter(|o| o.error.is_none()).count();
        let average_scan_time = if scan_times.is_empty() {
            0.0
        } else {
            scan_times.iter().sum::<f64>() / scan_times.len() as f64
        };
        MultiScanReport {
            summary: MultiScanSummary {
                total_targets_scanned: hosts.len(),
                successful_scans: successful,
                total_open_ports: total_open,
                average_scan_time,
            },
            results,
        }
    }
}

/// Probe one port and, when it comes back open, run service detection before
/// the result is finalized. Detection cannot fail the probe: it either
/// enriches the result or leaves it untouched. The returned duration covers
/// the probe only, so technique timing stats are not inflated by detection.
async fn probe_and_detect(
    host: &str,
    addr: SocketAddr,
    technique: Technique,
    timeout: Duration,
    detect: bool,
) -> (ProbeResult, Duration) {
    let start = Instant::now();
    let result = probe(host, addr, technique, timeout).await;
    let probe_elapsed = start.elapsed();
    let result = if detect && result.status == PortStatus::Open {
        detect_service(result, timeout).await
    } else {
        result
    };
    (result, probe_elapsed)
}

/// Resolve a hostname or IP literal to the address the probes will target.
/// Failure here aborts only this target.
pub async fn resolve_host(host: &str) -> Result<IpAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ip);
    }
    let mut addrs = lookup_host((host, 0u16))
        .await
        .with_context(|| format!("could not resolve host: {host}"))?;
    addrs
        .next()
        .map(|a| a.ip())
        .with_context(|| format!("no addresses for host: {host}"))
}
