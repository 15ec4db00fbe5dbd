use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde::Serialize;
use ::time::{format_description::well_known, OffsetDateTime};

use crate::types::{duration_secs, ConfusionCounts};

/// One recorded target scan inside a collector.
#[derive(Serialize, Debug, Clone)]
pub struct ScanRecord {
    pub target: String,
    pub open_ports: Vec<u16>,
    pub closed_ports: Vec<u16>,
    pub filtered_ports: Vec<u16>,
    pub services: Vec<String>,
    pub timestamp: String,
}

/// Confusion counts plus the derived rates, ready for reporting.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct AccuracyReport {
    pub counts: ConfusionCounts,
    pub precision: f64,
    pub recall: f64,
    pub f1_score: f64,
    pub accuracy: f64,
}

/// Cross-scan roll-up for one tool/technique pairing.
#[derive(Serialize, Debug, Clone)]
pub struct CollectorSummary {
    pub tool_name: String,
    pub technique: String,
    pub targets_scanned: usize,
    pub total_services_discovered: usize,
    pub average_services_per_target: f64,
    #[serde(with = "duration_secs")]
    pub total_scan_time: Duration,
    #[serde(with = "duration_secs")]
    pub average_scan_time_per_target: Duration,
    pub ports_scanned_per_second: f64,
    pub service_diversity: f64,
    pub peak_memory_mb: f64,
    pub average_memory_mb: f64,
    pub scan_date: String,
}

/// Accumulates one record per completed target scan and derives accuracy and
/// diversity statistics across them.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    tool_name: String,
    technique: String,
    records: Vec<ScanRecord>,
    scan_times: Vec<Duration>,
    services_found: Vec<String>,
    memory_usage_mb: Vec<f64>,
}

impl MetricsCollector {
    pub fn new(tool_name: impl Into<String>, technique: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            technique: technique.into(),
            records: Vec::new(),
            scan_times: Vec::new(),
            services_found: Vec::new(),
            memory_usage_mb: Vec::new(),
        }
    }

    pub fn records(&self) -> &[ScanRecord] {
        &self.records
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_scan(
        &mut self,
        target: impl Into<String>,
        open_ports: Vec<u16>,
        closed_ports: Vec<u16>,
        filtered_ports: Vec<u16>,
        services: Vec<String>,
        scan_time: Duration,
        memory_used_mb: f64,
    ) {
        self.services_found.extend(services.iter().cloned());
        self.records.push(ScanRecord {
            target: target.into(),
            open_ports,
            closed_ports,
            filtered_ports,
            services,
            timestamp: now_rfc3339(),
        });
        self.scan_times.push(scan_time);
        self.memory_usage_mb.push(memory_used_mb);
    }

    /// Score recorded scans against ground truth: per target, the found and
    /// expected open-port sets are intersected for TP/FP/FN, and each closed
    /// port counts as a true negative. Rates are 0 whenever their
    /// denominator is 0.
    pub fn precision_recall(&self, ground_truth: &HashMap<String, Vec<u16>>) -> AccuracyReport {
        let mut counts = ConfusionCounts::default();

        for record in &self.records {
            let found: HashSet<u16> = record.open_ports.iter().copied().collect();
            let expected: HashSet<u16> = ground_truth
                .get(&record.target)
                .map(|ports| ports.iter().copied().collect())
                .unwrap_or_default();

            counts.true_positive += found.intersection(&expected).count();
            counts.false_positive += found.difference(&expected).count();
            counts.false_negative += expected.difference(&found).count();
            counts.true_negative += record.closed_ports.len();
        }

        AccuracyReport {
            counts,
            precision: counts.precision(),
            recall: counts.recall(),
            f1_score: counts.f1(),
            accuracy: counts.accuracy(),
        }
    }

    /// Shannon entropy (base 2) over the distribution of discovered service
    /// names. Higher means a more diverse service mix.
    pub fn service_diversity(&self) -> f64 {
        self.diversity_with(|p| -(p * p.log2()))
    }

    /// The historical diversity formula, `-Σ p·√p`. Not standard entropy;
    /// kept so results stay comparable with earlier data sets.
    pub fn legacy_service_diversity(&self) -> f64 {
        self.diversity_with(|p| -(p * p.sqrt()))
    }

    fn diversity_with(&self, term: impl Fn(f64) -> f64) -> f64 {
        if self.services_found.is_empty() {
            return 0.0;
        }
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for service in &self.services_found {
            *counts.entry(service.as_str()).or_default() += 1;
        }
        let total = self.services_found.len() as f64;
        counts
            .values()
            .map(|&count| term(count as f64 / total))
            .sum()
    }

    /// Roll up everything recorded so far.
    pub fn summary(&self) -> CollectorSummary {
        let targets = self.records.len();
        let unique_services: HashSet<&str> =
            self.services_found.iter().map(String::as_str).collect();
        let total_scan_time: Duration = self.scan_times.iter().sum();
        let average_scan_time = if targets > 0 {
            total_scan_time / targets as u32
        } else {
            Duration::ZERO
        };
        let total_ports: usize = self
            .records
            .iter()
            .map(|r| r.open_ports.len() + r.closed_ports.len() + r.filtered_ports.len())
            .sum();
        let total_secs = total_scan_time.as_secs_f64();
        let ports_per_second = if total_secs > 0.0 {
            total_ports as f64 / total_secs
        } else {
            0.0
        };
        let peak_memory = self.memory_usage_mb.iter().copied().fold(0.0, f64::max);
        let average_memory = if self.memory_usage_mb.is_empty() {
            0.0
        } else {
            self.memory_usage_mb.iter().sum::<f64>() / self.memory_usage_mb.len() as f64
        };

        CollectorSummary {
            tool_name: self.tool_name.clone(),
            technique: self.technique.clone(),
            targets_scanned: targets,
            total_services_discovered: unique_services.len(),
            average_services_per_target: if targets > 0 {
                unique_services.len() as f64 / targets as f64
            } else {
                0.0
            },
            total_scan_time,
            average_scan_time_per_target: average_scan_time,
            ports_scanned_per_second: ports_per_second,
            service_diversity: self.service_diversity(),
            peak_memory_mb: peak_memory,
            average_memory_mb: average_memory,
            scan_date: now_rfc3339(),
        }
    }
}

/// RFC3339 UTC timestamp for record and report metadata.
pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
