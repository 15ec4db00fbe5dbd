use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::metrics::now_rfc3339;
use crate::ports::COMMON_PORTS;
use crate::scanner::{PortScanner, SharedProgress};
use crate::types::{
    ComparisonRecord, DetectionCounts, PortStatus, ProbeResult, ResourceUsage, Technique,
    ToolTiming,
};

const SUBPROCESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Ranked comparison across every tool that produced a benchmark entry.
#[derive(Serialize, Debug, Clone, Default)]
pub struct ComparisonReport {
    pub speed_ranking: Vec<SpeedEntry>,
    pub accuracy_ranking: Vec<AccuracyEntry>,
    pub efficiency_ranking: Vec<EfficiencyEntry>,
    pub overall_winner: String,
    pub recommendations: Vec<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SpeedEntry {
    pub tool: String,
    pub ports_per_second: f64,
    pub total_time: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct AccuracyEntry {
    pub tool: String,
    pub accuracy_score: f64,
    pub open_ports: usize,
    pub confidence: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct EfficiencyEntry {
    pub tool: String,
    pub efficiency_score: f64,
    pub accuracy: f64,
    pub time: f64,
}

#[derive(Serialize, Debug, Clone)]
pub struct BenchmarkReport {
    pub target: String,
    pub results: BTreeMap<String, ComparisonRecord>,
    pub comparison_report: ComparisonReport,
    pub timestamp: String,
}

/// Summary of one pass in the hybrid-vs-single comparison.
#[derive(Serialize, Debug, Clone)]
pub struct MethodSummary {
    pub technique: String,
    pub time: f64,
    pub ports_scanned: usize,
    pub open_ports: usize,
    pub closed_ports: usize,
    pub filtered_ports: usize,
    pub services_identified: usize,
    pub versions_detected: usize,
}

#[derive(Serialize, Debug, Clone)]
pub struct HybridDelta {
    pub extra_time_for_hybrid: f64,
    pub time_increase_percent: f64,
    pub services_gained: usize,
    pub versions_gained: usize,
}

#[derive(Serialize, Debug, Clone)]
pub struct HybridComparison {
    pub target: String,
    pub single_method: MethodSummary,
    pub hybrid_method: MethodSummary,
    pub comparison: HybridDelta,
    pub finding: String,
}

/// Benchmarks the custom scanner against whatever external tools are present
/// on the host. A missing tool skips its entry; the report is produced from
/// the tools that did run.
pub struct BenchmarkSuite {
    target: String,
    scanner: PortScanner,
}

impl BenchmarkSuite {
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            scanner: PortScanner::new(Duration::from_secs(3), 50),
        }
    }

    pub fn with_scanner(mut self, scanner: PortScanner) -> Self {
        self.scanner = scanner;
        self
    }

    /// Run every available tool over the well-known port set and rank them.
    pub async fn run_comprehensive_benchmark(&self) -> Result<BenchmarkReport> {
        info!(target = %self.target, "benchmark suite started");
        let mut results = BTreeMap::new();

        match self.benchmark_custom_scanner(Technique::TcpConnect).await {
            Ok(record) => {
                results.insert(record.tool_name.clone(), record);
            }
            Err(e) => warn!(error = %e, "custom scanner benchmark failed"),
        }

        if let Some(record) = self.benchmark_nmap().await {
            results.insert(record.tool_name.clone(), record);
        }
        if let Some(record) = self.benchmark_masscan().await {
            results.insert(record.tool_name.clone(), record);
        }

        let comparison_report = comparison_report(&results);
        Ok(BenchmarkReport {
            target: self.target.clone(),
            results,
            comparison_report,
            timestamp: now_rfc3339(),
        })
    }

    /// Benchmark this crate's scanner over the well-known port set.
    pub async fn benchmark_custom_scanner(&self, technique: Technique) -> Result<ComparisonRecord> {
        let memory_before = resident_memory_mb();
        let start = Instant::now();
        let (results, metrics) = self
            .scanner
            .scan_ports(
                &self.target,
                COMMON_PORTS,
                technique,
                CancellationToken::new(),
                SharedProgress::new(),
            )
            .await?;
        let elapsed = start.elapsed();
        let memory_after = resident_memory_mb();

        let counts = detection_counts(&results);
        Ok(ComparisonRecord {
            tool_name: "Custom Scanner".to_string(),
            host: self.target.clone(),
            technique: technique.as_str().to_string(),
            timing: ToolTiming {
                total_time: elapsed,
                ports_per_second: metrics.ports_per_second,
            },
            detection_counts: counts,
            // TCP connect verifies the full handshake; classification is
            // reliable but not raw-socket ground truth.
            accuracy_score: 95.0,
            resource_usage: ResourceUsage {
                memory_used_mb: (memory_after - memory_before).max(0.0),
                ports_scanned: metrics.ports_scanned,
            },
            confidence: if counts.open > 0 { 98.0 } else { 90.0 },
        })
    }

    /// Benchmark nmap over the same port set, if installed.
    pub async fn benchmark_nmap(&self) -> Option<ComparisonRecord> {
        if !tool_available("nmap").await {
            warn!("nmap not installed, omitting its benchmark entry");
            return None;
        }
        let ports = ports_csv(COMMON_PORTS);
        let start = Instant::now();
        let output = run_tool(
            Command::new("nmap")
                .arg("-T3")
                .arg("-p")
                .arg(&ports)
                .arg(&self.target)
                .arg("-oX")
                .arg("-"),
        )
        .await?;
        let elapsed = start.elapsed();

        let open = output.matches("state=\"open\"").count();
        let closed = output.matches("state=\"closed\"").count();
        let filtered = output.matches("state=\"filtered\"").count();
        let total = open + closed + filtered;

        Some(ComparisonRecord {
            tool_name: "Nmap".to_string(),
            host: self.target.clone(),
            technique: "tcp_connect".to_string(),
            timing: ToolTiming {
                total_time: elapsed,
                ports_per_second: rate(total, elapsed),
            },
            detection_counts: DetectionCounts {
                open,
                closed,
                filtered,
            },
            accuracy_score: 98.0,
            resource_usage: ResourceUsage {
                memory_used_mb: 0.0, // external process, not sampled
                ports_scanned: total,
            },
            confidence: 99.0,
        })
    }

    /// Benchmark masscan over the same port set, if installed. Masscan only
    /// reports open ports, so closed/filtered stay zero.
    pub async fn benchmark_masscan(&self) -> Option<ComparisonRecord> {
        if !tool_available("masscan").await {
            warn!("masscan not installed, omitting its benchmark entry");
            return None;
        }
        let ports = ports_csv(COMMON_PORTS);
        let start = Instant::now();
        let output = run_tool(
            Command::new("masscan")
                .arg(&self.target)
                .arg("-p")
                .arg(&ports)
                .arg("--rate")
                .arg("10000"),
        )
        .await?;
        let elapsed = start.elapsed();

        let open = output.matches("open").count();
        Some(ComparisonRecord {
            tool_name: "Masscan".to_string(),
            host: self.target.clone(),
            technique: "syn".to_string(),
            timing: ToolTiming {
                total_time: elapsed,
                ports_per_second: rate(COMMON_PORTS.len(), elapsed),
            },
            detection_counts: DetectionCounts {
                open,
                closed: 0,
                filtered: 0,
            },
            accuracy_score: 85.0,
            resource_usage: ResourceUsage {
                memory_used_mb: 0.0,
                ports_scanned: COMMON_PORTS.len(),
            },
            confidence: 80.0,
        })
    }
}

/// Rank benchmark entries by speed, accuracy and efficiency
/// (accuracy / elapsed time); the top efficiency entry is the overall
/// winner. Works for any number of entries, including a single tool.
pub fn comparison_report(entries: &BTreeMap<String, ComparisonRecord>) -> ComparisonReport {
    if entries.is_empty() {
        return ComparisonReport::default();
    }

    let mut speed: Vec<SpeedEntry> = entries
        .values()
        .map(|r| SpeedEntry {
            tool: r.tool_name.clone(),
            ports_per_second: r.timing.ports_per_second,
            total_time: r.timing.total_time.as_secs_f64(),
        })
        .collect();
    speed.sort_by(|a, b| b.ports_per_second.total_cmp(&a.ports_per_second));

    let mut accuracy: Vec<AccuracyEntry> = entries
        .values()
        .map(|r| AccuracyEntry {
            tool: r.tool_name.clone(),
            accuracy_score: r.accuracy_score,
            open_ports: r.detection_counts.open,
            confidence: r.confidence,
        })
        .collect();
    accuracy.sort_by(|a, b| b.accuracy_score.total_cmp(&a.accuracy_score));

    let mut efficiency: Vec<EfficiencyEntry> = entries
        .values()
        .map(|r| {
            let time = r.timing.total_time.as_secs_f64();
            EfficiencyEntry {
                tool: r.tool_name.clone(),
                efficiency_score: if time > 0.0 { r.accuracy_score / time } else { 0.0 },
                accuracy: r.accuracy_score,
                time,
            }
        })
        .collect();
    efficiency.sort_by(|a, b| b.efficiency_score.total_cmp(&a.efficiency_score));

    let overall_winner = efficiency
        .first()
        .map(|e| e.tool.clone())
        .unwrap_or_default();

    ComparisonReport {
        speed_ranking: speed,
        accuracy_ranking: accuracy,
        efficiency_ranking: efficiency,
        overall_winner,
        recommendations: recommendations(),
    }
}

/// Static hybrid-recon guidance; not derived from the measured data.
fn recommendations() -> Vec<String> {
    [
        "For initial discovery: Masscan (fastest sweep, open ports only)",
        "For verification: Custom Scanner (full TCP connect, reliable state classification)",
        "For comprehensive analysis: Nmap (most thorough, industry standard)",
        "Hybrid flow: Masscan for discovery, Custom Scanner for verification, Nmap for deep analysis",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Run a connect-only pass and a connect-plus-service-detection pass over the
/// same well-known port set and report what the extra detection step buys.
pub async fn compare_hybrid_vs_single(target: &str) -> Result<HybridComparison> {
    let single_scanner = PortScanner::new(Duration::from_secs(3), 50).without_detection();
    let hybrid_scanner = PortScanner::new(Duration::from_secs(3), 50);

    info!(target, "hybrid vs single comparison: connect-only pass");
    let start = Instant::now();
    let (single_results, _) = single_scanner
        .scan_ports(
            target,
            COMMON_PORTS,
            Technique::TcpConnect,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await?;
    let single_time = start.elapsed();

    info!(target, "hybrid vs single comparison: connect + detection pass");
    let start = Instant::now();
    let (hybrid_results, _) = hybrid_scanner
        .scan_ports(
            target,
            COMMON_PORTS,
            Technique::Hybrid,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await?;
    let hybrid_time = start.elapsed();

    let single = summarize_method("TCP Connect", &single_results, single_time);
    let hybrid = summarize_method(
        "TCP Connect + Service Detection + Banner Grabbing",
        &hybrid_results,
        hybrid_time,
    );

    let extra_time = hybrid_time.as_secs_f64() - single_time.as_secs_f64();
    let time_increase_percent = if single_time.as_secs_f64() > 0.0 {
        extra_time / single_time.as_secs_f64() * 100.0
    } else {
        0.0
    };
    let services_gained = hybrid
        .services_identified
        .saturating_sub(single.services_identified);
    let versions_gained = hybrid
        .versions_detected
        .saturating_sub(single.versions_detected);

    let insight_per_open_port = if hybrid.open_ports > 0 {
        hybrid.services_identified as f64 / hybrid.open_ports as f64 * 100.0
    } else {
        0.0
    };
    let finding = format!(
        "Single method classified {} open ports; the hybrid pass identified {} services \
         and {} version strings on the same port set, costing {:.2}s extra ({:.1}% more time). \
         Information gain per open port: {:.1}%.",
        single.open_ports,
        hybrid.services_identified,
        hybrid.versions_detected,
        extra_time.max(0.0),
        time_increase_percent.max(0.0),
        insight_per_open_port,
    );

    Ok(HybridComparison {
        target: target.to_string(),
        single_method: single,
        hybrid_method: hybrid,
        comparison: HybridDelta {
            extra_time_for_hybrid: extra_time,
            time_increase_percent,
            services_gained,
            versions_gained,
        },
        finding,
    })
}

fn summarize_method(technique: &str, results: &[ProbeResult], elapsed: Duration) -> MethodSummary {
    let counts = detection_counts(results);
    MethodSummary {
        technique: technique.to_string(),
        time: elapsed.as_secs_f64(),
        ports_scanned: results.len(),
        open_ports: counts.open,
        closed_ports: counts.closed,
        filtered_ports: counts.filtered,
        services_identified: results
            .iter()
            .filter(|r| r.status == PortStatus::Open && r.service.is_some())
            .count(),
        versions_detected: results
            .iter()
            .filter(|r| r.status == PortStatus::Open && r.version.is_some())
            .count(),
    }
}

fn detection_counts(results: &[ProbeResult]) -> DetectionCounts {
    let mut counts = DetectionCounts::default();
    for r in results {
        match r.status {
            PortStatus::Open => counts.open += 1,
            PortStatus::Closed => counts.closed += 1,
            PortStatus::Filtered | PortStatus::OpenOrFiltered => counts.filtered += 1,
        }
    }
    counts
}

/// True when `name --version` runs at all.
async fn tool_available(name: &str) -> bool {
    Command::new(name)
        .arg("--version")
        .output()
        .await
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Run an external tool, bounded by the subprocess timeout. Any failure is
/// logged and turns into `None` so the report degrades instead of erroring.
async fn run_tool(cmd: &mut Command) -> Option<String> {
    match tokio::time::timeout(SUBPROCESS_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => Some(String::from_utf8_lossy(&output.stdout).into_owned()),
        Ok(Err(e)) => {
            warn!(error = %e, "external tool failed to run");
            None
        }
        Err(_) => {
            warn!("external tool timed out");
            None
        }
    }
}

/// Ports per second; 0 when nothing elapsed.
fn rate(ports: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        ports as f64 / secs
    } else {
        0.0
    }
}

fn ports_csv(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Resident set size of this process in MB; 0 where /proc is unavailable.
fn resident_memory_mb() -> f64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(rest) = line.strip_prefix("VmRSS:") {
                    if let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<f64>().ok()) {
                        return kb / 1024.0;
                    }
                }
            }
        }
    }
    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tool: &str, pps: f64, total_secs: f64, accuracy: f64, open: usize) -> ComparisonRecord {
        ComparisonRecord {
            tool_name: tool.to_string(),
            host: "127.0.0.1".to_string(),
            technique: "tcp_connect".to_string(),
            timing: ToolTiming {
                total_time: Duration::from_secs_f64(total_secs),
                ports_per_second: pps,
            },
            detection_counts: DetectionCounts {
                open,
                closed: 0,
                filtered: 0,
            },
            accuracy_score: accuracy,
            resource_usage: ResourceUsage {
                memory_used_mb: 1.0,
                ports_scanned: 18,
            },
            confidence: 90.0,
        }
    }

    #[test]
    fn rankings_sort_descending_and_pick_winner() {
        let mut entries = BTreeMap::new();
        entries.insert("Fast".to_string(), record("Fast", 500.0, 2.0, 85.0, 3));
        entries.insert("Slow".to_string(), record("Slow", 50.0, 10.0, 98.0, 4));

        let report = comparison_report(&entries);
        assert_eq!(report.speed_ranking[0].tool, "Fast");
        assert_eq!(report.accuracy_ranking[0].tool, "Slow");
        // Efficiency: Fast 85/2 = 42.5 beats Slow 98/10 = 9.8.
        assert_eq!(report.overall_winner, "Fast");
        assert!(!report.recommendations.is_empty());
    }

    #[test]
    fn singleton_entry_still_produces_a_winner() {
        let mut entries = BTreeMap::new();
        entries.insert("Only".to_string(), record("Only", 100.0, 1.0, 95.0, 2));
        let report = comparison_report(&entries);
        assert_eq!(report.speed_ranking.len(), 1);
        assert_eq!(report.overall_winner, "Only");
    }

    #[test]
    fn empty_entries_yield_empty_report() {
        let report = comparison_report(&BTreeMap::new());
        assert!(report.speed_ranking.is_empty());
        assert_eq!(report.overall_winner, "");
    }

    #[test]
    fn rate_is_ports_over_elapsed_and_zero_on_zero_time() {
        assert_eq!(rate(18, Duration::from_secs(2)), 9.0);
        assert_eq!(rate(18, Duration::ZERO), 0.0);
        assert_eq!(rate(0, Duration::from_secs(1)), 0.0);
    }

    #[test]
    fn zero_time_entry_gets_zero_efficiency() {
        let mut entries = BTreeMap::new();
        entries.insert("Instant".to_string(), record("Instant", 0.0, 0.0, 95.0, 0));
        let report = comparison_report(&entries);
        assert_eq!(report.efficiency_ranking[0].efficiency_score, 0.0);
    }
}
