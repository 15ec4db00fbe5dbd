use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Classification of a single probed port.
///
/// Every probe outcome — including timeouts and network errors — maps to one
/// of these variants; probes never surface errors to the caller.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
    /// UDP's no-response case: the port may be open or silently filtered.
    /// The ambiguity is inherent to the protocol and is preserved as-is.
    OpenOrFiltered,
}

/// Scanning technique. A closed enum so technique dispatch is exhaustive.
#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
    clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Technique {
    TcpConnect,
    /// Connect-based check run on a blocking worker thread. A true half-open
    /// SYN scan needs raw sockets; this variant does not claim those semantics.
    Syn,
    Udp,
    /// Connect probe plus service detection on open ports.
    Hybrid,
}

impl Technique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Technique::TcpConnect => "tcp_connect",
            Technique::Syn => "syn",
            Technique::Udp => "udp",
            Technique::Hybrid => "hybrid",
        }
    }
}

impl std::fmt::Display for Technique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe attempt against host:port. Immutable once produced.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub host: String,
    pub port: u16,
    pub status: PortStatus,
    pub service: Option<String>,
    pub version: Option<String>,
    /// Captured banner text, truncated to 200 characters.
    pub banner: Option<String>,
    #[serde(with = "duration_secs")]
    pub response_time: Duration,
}

impl ProbeResult {
    pub fn new(host: impl Into<String>, port: u16, status: PortStatus, elapsed: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            status,
            service: None,
            version: None,
            banner: None,
            response_time: elapsed,
        }
    }
}

/// Per-technique timing breakdown inside one scan.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TechniqueStats {
    pub count: u64,
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
    #[serde(with = "duration_secs")]
    pub avg_time: Duration,
}

/// Aggregate metrics for one orchestrated scan. Computed once, never mutated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScanMetrics {
    pub ports_scanned: usize,
    pub open_count: usize,
    pub closed_count: usize,
    pub filtered_count: usize,
    #[serde(with = "duration_secs")]
    pub total_duration: Duration,
    pub ports_per_second: f64,
    #[serde(with = "duration_secs")]
    pub average_response_time: Duration,
    pub technique_breakdown: BTreeMap<Technique, TechniqueStats>,
    pub concurrency_level: usize,
    pub host: String,
}

impl ScanMetrics {
    /// Fold probe results and per-technique timings into scan metrics.
    ///
    /// Pure and commutative over `results`/`timings` ordering, so concurrent
    /// completion order cannot change the outcome.
    pub fn compute(
        host: &str,
        results: &[ProbeResult],
        timings: &[(Technique, Duration)],
        total_duration: Duration,
        concurrency_level: usize,
    ) -> Self {
        let mut open_count = 0;
        let mut closed_count = 0;
        let mut filtered_count = 0;
        for r in results {
            match r.status {
                PortStatus::Open => open_count += 1,
                PortStatus::Closed => closed_count += 1,
                PortStatus::Filtered | PortStatus::OpenOrFiltered => filtered_count += 1,
            }
        }

        let ports_scanned = results.len();
        let total_secs = total_duration.as_secs_f64();
        let ports_per_second = if total_secs > 0.0 {
            ports_scanned as f64 / total_secs
        } else {
            0.0
        };
        let average_response_time = if ports_scanned > 0 {
            results.iter().map(|r| r.response_time).sum::<Duration>() / ports_scanned as u32
        } else {
            Duration::ZERO
        };

        let mut technique_breakdown: BTreeMap<Technique, TechniqueStats> = BTreeMap::new();
        for &(technique, elapsed) in timings {
            let stats = technique_breakdown.entry(technique).or_default();
            stats.count += 1;
            stats.total_time += elapsed;
        }
        for stats in technique_breakdown.values_mut() {
            if stats.count > 0 {
                stats.avg_time = stats.total_time / stats.count as u32;
            }
        }

        Self {
            ports_scanned,
            open_count,
            closed_count,
            filtered_count,
            total_duration,
            ports_per_second,
            average_response_time,
            technique_breakdown,
            concurrency_level,
            host: host.to_string(),
        }
    }
}

/// Confusion-matrix counts from comparing scan findings against ground truth.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionCounts {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl ConfusionCounts {
    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r > 0.0 {
            2.0 * p * r / (p + r)
        } else {
            0.0
        }
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.true_positive
            + self.false_positive
            + self.true_negative
            + self.false_negative;
        ratio(self.true_positive + self.true_negative, total)
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Timing figures for one benchmarked tool run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ToolTiming {
    #[serde(with = "duration_secs")]
    pub total_time: Duration,
    pub ports_per_second: f64,
}

/// Open/closed/filtered counts a tool reported.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionCounts {
    pub open: usize,
    pub closed: usize,
    pub filtered: usize,
}

/// Resources a tool run consumed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResourceUsage {
    pub memory_used_mb: f64,
    pub ports_scanned: usize,
}

/// One external-tool (or custom-scanner) benchmark run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ComparisonRecord {
    pub tool_name: String,
    pub host: String,
    pub technique: String,
    pub timing: ToolTiming,
    pub detection_counts: DetectionCounts,
    /// 0-100 accuracy estimate for the tool's classification quality.
    pub accuracy_score: f64,
    pub resource_usage: ResourceUsage,
    /// 0-100 confidence in the reported results.
    pub confidence: f64,
}

/// Serialize `Duration` as fractional seconds so the JSON boundary matches
/// what dashboard consumers already expect.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be non-negative"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: PortStatus, ms: u64) -> ProbeResult {
        ProbeResult::new("127.0.0.1", 80, status, Duration::from_millis(ms))
    }

    #[test]
    fn metrics_counts_partition_ports_scanned() {
        let results = vec![
            result(PortStatus::Open, 10),
            result(PortStatus::Closed, 5),
            result(PortStatus::Filtered, 100),
            result(PortStatus::OpenOrFiltered, 100),
        ];
        let m = ScanMetrics::compute("127.0.0.1", &results, &[], Duration::from_secs(1), 50);
        assert_eq!(m.ports_scanned, 4);
        assert_eq!(
            m.ports_scanned,
            m.open_count + m.closed_count + m.filtered_count
        );
        assert_eq!(m.open_count, 1);
        assert_eq!(m.closed_count, 1);
        assert_eq!(m.filtered_count, 2);
    }

    #[test]
    fn metrics_zero_duration_has_zero_rate() {
        let results = vec![result(PortStatus::Open, 1)];
        let m = ScanMetrics::compute("h", &results, &[], Duration::ZERO, 1);
        assert_eq!(m.ports_per_second, 0.0);
    }

    #[test]
    fn technique_breakdown_averages() {
        let timings = vec![
            (Technique::TcpConnect, Duration::from_millis(100)),
            (Technique::TcpConnect, Duration::from_millis(300)),
        ];
        let m = ScanMetrics::compute("h", &[], &timings, Duration::from_secs(1), 1);
        let stats = &m.technique_breakdown[&Technique::TcpConnect];
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_time, Duration::from_millis(400));
        assert_eq!(stats.avg_time, Duration::from_millis(200));
    }

    #[test]
    fn confusion_rates_never_divide_by_zero() {
        let empty = ConfusionCounts::default();
        assert_eq!(empty.precision(), 0.0);
        assert_eq!(empty.recall(), 0.0);
        assert_eq!(empty.f1(), 0.0);
        assert_eq!(empty.accuracy(), 0.0);
    }

    #[test]
    fn status_and_technique_wire_names() {
        assert_eq!(
            serde_json::to_string(&PortStatus::OpenOrFiltered).unwrap(),
            "\"open_or_filtered\""
        );
        assert_eq!(
            serde_json::to_string(&Technique::TcpConnect).unwrap(),
            "\"tcp_connect\""
        );
    }

    #[test]
    fn probe_result_serializes_seconds() {
        let r = result(PortStatus::Open, 1500);
        let v: serde_json::Value = serde_json::to_value(&r).unwrap();
        assert_eq!(v["response_time"].as_f64().unwrap(), 1.5);
        assert_eq!(v["status"], "open");
    }
}
