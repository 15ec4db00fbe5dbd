use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tokio_util::sync::CancellationToken;

use recon_scan_rs::benchmark::{compare_hybrid_vs_single, BenchmarkSuite};
use recon_scan_rs::scanner::{PortScanner, SharedProgress};
use recon_scan_rs::server;
use recon_scan_rs::types::{ProbeResult, ScanMetrics, Technique};

/// recon-scan-rs — async hybrid port scanner with service detection, scan
/// metrics and cross-tool benchmarking.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "recon-scan-rs",
    version,
    about = "Async hybrid port scanner with service detection, scan metrics and cross-tool benchmarking.",
    long_about = None
)]
struct Cli {
    /// Target host (IP or hostname).
    #[arg(default_value = "127.0.0.1")]
    host: String,

    /// First port of the scan range.
    #[arg(long, default_value_t = 1)]
    start_port: u16,

    /// Last port of the scan range (inclusive).
    #[arg(long, default_value_t = 1024)]
    end_port: u16,

    /// Scan only the fixed well-known port set.
    #[arg(long, default_value_t = false)]
    common_ports: bool,

    /// Scan an explicit port list instead of a range, e.g. "22,80,8000-8010".
    #[arg(long, conflicts_with_all = ["start_port", "end_port", "common_ports"])]
    ports: Option<String>,

    /// Do not probe well-known ports first within the range.
    #[arg(long, default_value_t = false)]
    no_prioritize: bool,

    /// Scanning technique.
    #[arg(long, value_enum, default_value_t = Technique::TcpConnect)]
    technique: Technique,

    /// Max concurrent in-flight probes.
    #[arg(long, default_value_t = 100)]
    concurrency: usize,

    /// Per-probe timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = 3_000)]
    timeout_ms: u64,

    /// Abort the whole scan after this many milliseconds, keeping partial results.
    #[arg(long = "deadline-ms")]
    deadline_ms: Option<u64>,

    /// Write results as pretty JSON to this path.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Benchmark the scanner against nmap/masscan (when installed) instead of scanning.
    #[arg(long, default_value_t = false)]
    benchmark: bool,

    /// Compare a connect-only pass against connect + service detection instead of scanning.
    #[arg(long, default_value_t = false)]
    compare: bool,

    /// Start the HTTP scan API instead of scanning.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Bind address for --serve.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if cli.serve {
        return server::spawn_server(&cli.bind).await;
    }

    if cli.benchmark {
        let report = BenchmarkSuite::new(&cli.host)
            .run_comprehensive_benchmark()
            .await?;
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if cli.compare {
        let finding = compare_hybrid_vs_single(&cli.host).await?;
        println!("{}", serde_json::to_string_pretty(&finding)?);
        return Ok(());
    }

    let mut scanner = PortScanner::new(Duration::from_millis(cli.timeout_ms), cli.concurrency);
    if let Some(deadline_ms) = cli.deadline_ms {
        scanner = scanner.with_deadline(Duration::from_millis(deadline_ms));
    }

    let (results, metrics) = if let Some(spec) = cli.ports.as_deref() {
        let ports = recon_scan_rs::ports::parse_port_spec(spec)?;
        scanner
            .scan_ports(
                &cli.host,
                &ports,
                cli.technique,
                CancellationToken::new(),
                SharedProgress::new(),
            )
            .await?
    } else if cli.common_ports {
        scanner.scan_common_ports(&cli.host).await?
    } else {
        scanner
            .scan_port_range(
                &cli.host,
                cli.start_port,
                cli.end_port,
                !cli.no_prioritize,
                cli.technique,
            )
            .await?
    };

    print_results_table(&results, &metrics);

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &results, &metrics)?;
        println!("Wrote JSON results to {}", path.display());
    }

    Ok(())
}

fn print_results_table(results: &[ProbeResult], metrics: &ScanMetrics) {
    println!(
        "\nScanned {} ports on {} in {:.2}s ({:.1} ports/sec)",
        metrics.ports_scanned,
        metrics.host,
        metrics.total_duration.as_secs_f64(),
        metrics.ports_per_second
    );
    println!(
        "open: {}  closed: {}  filtered: {}",
        metrics.open_count, metrics.closed_count, metrics.filtered_count
    );

    let mut open: Vec<&ProbeResult> = results
        .iter()
        .filter(|r| r.status == recon_scan_rs::types::PortStatus::Open)
        .collect();
    open.sort_by_key(|r| r.port);
    if open.is_empty() {
        return;
    }

    println!("\n{:>5}  {:<12} {:<30} {}", "port", "service", "version", "banner");
    println!("{:-<5}  {:-<12} {:-<30} {:-<20}", "", "", "", "");
    for r in open {
        let banner: String = r.banner.as_deref().unwrap_or("").chars().take(60).collect();
        println!(
            "{:>5}  {:<12} {:<30} {}",
            r.port,
            r.service.as_deref().unwrap_or("-"),
            r.version.as_deref().unwrap_or("-"),
            banner.replace('\n', "\\n").replace('\r', "\\r")
        );
    }
}

fn write_results_json(
    path: &std::path::Path,
    results: &[ProbeResult],
    metrics: &ScanMetrics,
) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(
        file,
        &serde_json::json!({ "results": results, "metrics": metrics }),
    )?;
    Ok(())
}
