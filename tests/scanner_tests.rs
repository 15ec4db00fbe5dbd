use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use recon_scan_rs::probe::{probe, udp_probe};
use recon_scan_rs::scanner::{PortScanner, SharedProgress};
use recon_scan_rs::types::{PortStatus, ProbeResult, ScanMetrics, Technique};

/// Loopback listener that greets every connection with an SSH-style banner.
async fn spawn_banner_listener() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = stream.write_all(b"SSH-2.0-TestServer\r\n").await;
                tokio::time::sleep(Duration::from_millis(100)).await;
            });
        }
    });
    addr
}

#[tokio::test]
async fn open_and_closed_ports_are_classified() {
    let addr = spawn_banner_listener().await;
    // A freshly bound-then-dropped port is closed on loopback.
    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };

    let scanner = PortScanner::new(Duration::from_secs(2), 16);
    let ports = [addr.port(), closed_port];
    let (results, metrics) = scanner
        .scan_ports(
            "127.0.0.1",
            &ports,
            Technique::TcpConnect,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 2);
    let open = results.iter().find(|r| r.port == addr.port()).unwrap();
    assert_eq!(open.status, PortStatus::Open);
    assert!(open.banner.as_deref().unwrap_or("").contains("SSH-2.0-TestServer"));
    assert_eq!(open.version.as_deref(), Some("SSH-2.0-TestServer"));

    let closed = results.iter().find(|r| r.port == closed_port).unwrap();
    assert_eq!(closed.status, PortStatus::Closed);

    assert_eq!(metrics.ports_scanned, 2);
    assert_eq!(
        metrics.ports_scanned,
        metrics.open_count + metrics.closed_count + metrics.filtered_count
    );
    assert!(results.iter().all(|r| r.response_time >= Duration::ZERO));
}

#[tokio::test]
async fn syn_fallback_classifies_like_connect() {
    let addr = spawn_banner_listener().await;
    let scanner = PortScanner::new(Duration::from_secs(2), 4);
    let (results, _) = scanner
        .scan_ports(
            "127.0.0.1",
            &[addr.port()],
            Technique::Syn,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await
        .unwrap();
    assert_eq!(results[0].status, PortStatus::Open);
}

#[tokio::test]
async fn concurrency_cap_is_enforced() {
    // 200 closed loopback ports; probes resolve quickly but still enter and
    // leave the in-flight window.
    let ports: Vec<u16> = (41000..41200).collect();
    let shared = SharedProgress::new();
    let scanner = PortScanner::new(Duration::from_secs(1), 8);

    let (results, metrics) = scanner
        .scan_ports(
            "127.0.0.1",
            &ports,
            Technique::TcpConnect,
            CancellationToken::new(),
            shared.clone(),
        )
        .await
        .unwrap();

    assert_eq!(results.len(), 200);
    assert_eq!(metrics.concurrency_level, 8);
    let peak = shared.peak_in_flight.load(Ordering::Relaxed);
    assert!(peak >= 1, "at least one probe must have been in flight");
    assert!(peak <= 8, "peak in-flight probes {peak} exceeded the cap of 8");
}

#[tokio::test]
async fn cancelled_scan_returns_partial_results_with_valid_metrics() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let scanner = PortScanner::new(Duration::from_secs(1), 8);
    let (results, metrics) = scanner
        .scan_ports(
            "127.0.0.1",
            &[41500, 41501, 41502],
            Technique::TcpConnect,
            cancel,
            SharedProgress::new(),
        )
        .await
        .unwrap();

    assert!(results.is_empty());
    assert_eq!(metrics.ports_scanned, 0);
    assert_eq!(metrics.ports_per_second, 0.0);
    assert_eq!(
        metrics.ports_scanned,
        metrics.open_count + metrics.closed_count + metrics.filtered_count
    );
}

#[tokio::test]
async fn deadline_aborts_in_flight_probes_but_keeps_completed_results() {
    // One UDP echo responder (answers instantly) and two bound-but-mute
    // sockets (no reply, no ICMP, so their probes sit out the full 5s
    // per-probe timeout unless the deadline cuts them off).
    let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_port = responder.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((_, peer)) = responder.recv_from(&mut buf).await else {
                break;
            };
            let _ = responder.send_to(b"pong", peer).await;
        }
    });
    let mute_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mute_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let ports = [
        echo_port,
        mute_a.local_addr().unwrap().port(),
        mute_b.local_addr().unwrap().port(),
    ];

    let scanner = PortScanner::new(Duration::from_secs(5), 4)
        .with_deadline(Duration::from_millis(800));
    let started = std::time::Instant::now();
    let (results, metrics) = scanner
        .scan_ports(
            "127.0.0.1",
            &ports,
            Technique::Udp,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await
        .unwrap();

    // The echo probe finished before the deadline; the mute ones were
    // aborted mid-flight rather than waiting out their timeout.
    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(!results.is_empty(), "fast probe must have completed");
    assert!(results.len() < ports.len(), "deadline must have cut probes off");
    assert!(results.iter().any(|r| r.port == echo_port && r.status == PortStatus::Open));
    assert_eq!(metrics.ports_scanned, results.len());
    assert_eq!(
        metrics.ports_scanned,
        metrics.open_count + metrics.closed_count + metrics.filtered_count
    );
}

#[tokio::test]
async fn technique_timing_covers_probe_not_detection() {
    // Listener that greets instantly, then holds the connection open without
    // answering the detection probe: the probe is fast, detection sits out
    // its full response window. The per-technique stats must reflect only
    // the probe.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let _ = stream.write_all(b"SSH-2.0-SlowServer\r\n").await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            });
        }
    });

    let scanner = PortScanner::new(Duration::from_secs(3), 4);
    let (results, metrics) = scanner
        .scan_ports(
            "127.0.0.1",
            &[addr.port()],
            Technique::TcpConnect,
            CancellationToken::new(),
            SharedProgress::new(),
        )
        .await
        .unwrap();

    assert_eq!(results[0].status, PortStatus::Open);
    let stats = &metrics.technique_breakdown[&Technique::TcpConnect];
    assert_eq!(stats.count, 1);
    assert!(
        stats.total_time < Duration::from_millis(800),
        "technique time {:?} includes detection",
        stats.total_time
    );
    // The scan as a whole did pay for detection.
    assert!(metrics.total_duration > stats.total_time);
}

#[tokio::test]
async fn aggregation_is_order_independent() {
    let mut results: Vec<ProbeResult> = vec![
        ProbeResult::new("h", 80, PortStatus::Open, Duration::from_millis(10)),
        ProbeResult::new("h", 443, PortStatus::Closed, Duration::from_millis(20)),
        ProbeResult::new("h", 22, PortStatus::Filtered, Duration::from_millis(30)),
        ProbeResult::new("h", 53, PortStatus::OpenOrFiltered, Duration::from_millis(40)),
    ];
    let mut timings = vec![
        (Technique::TcpConnect, Duration::from_millis(10)),
        (Technique::TcpConnect, Duration::from_millis(20)),
        (Technique::Udp, Duration::from_millis(30)),
        (Technique::Udp, Duration::from_millis(40)),
    ];

    let baseline = ScanMetrics::compute("h", &results, &timings, Duration::from_secs(1), 50);

    let mut rng = rand::thread_rng();
    for _ in 0..20 {
        results.shuffle(&mut rng);
        timings.shuffle(&mut rng);
        let shuffled = ScanMetrics::compute("h", &results, &timings, Duration::from_secs(1), 50);
        assert_eq!(shuffled, baseline);
    }
}

#[tokio::test]
async fn udp_probe_sees_reply_as_open_and_silence_as_ambiguous() {
    // Echo responder: replies to every datagram.
    let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = responder.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((_, peer)) = responder.recv_from(&mut buf).await else {
                break;
            };
            let _ = responder.send_to(b"pong", peer).await;
        }
    });

    let result = udp_probe("127.0.0.1", echo_addr, Duration::from_secs(2)).await;
    assert_eq!(result.status, PortStatus::Open);

    // Bound but mute socket: no ICMP unreachable, no reply — ambiguous.
    let mute = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mute_addr = mute.local_addr().unwrap();
    let result = udp_probe("127.0.0.1", mute_addr, Duration::from_millis(300)).await;
    assert_eq!(result.status, PortStatus::OpenOrFiltered);
}

#[tokio::test]
async fn probe_technique_dispatch_is_total() {
    // Closed loopback port: every technique must classify without erroring.
    let closed_port = {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        l.local_addr().unwrap().port()
    };
    let addr: SocketAddr = format!("127.0.0.1:{closed_port}").parse().unwrap();

    for technique in [
        Technique::TcpConnect,
        Technique::Syn,
        Technique::Udp,
        Technique::Hybrid,
    ] {
        let result = probe("127.0.0.1", addr, technique, Duration::from_millis(500)).await;
        assert!(matches!(
            result.status,
            PortStatus::Open
                | PortStatus::Closed
                | PortStatus::Filtered
                | PortStatus::OpenOrFiltered
        ));
    }
}

#[tokio::test]
async fn scan_many_survives_resolution_failure() {
    let addr = spawn_banner_listener().await;
    let scanner = PortScanner::new(Duration::from_secs(1), 8);
    let hosts = vec![
        "127.0.0.1".to_string(),
        "definitely-not-a-real-host.invalid".to_string(),
    ];
    let report = scanner
        .scan_many(&hosts, Some(&[addr.port()]), Technique::TcpConnect)
        .await;

    assert_eq!(report.summary.total_targets_scanned, 2);
    assert_eq!(report.summary.successful_scans, 1);
    assert!(report.summary.total_open_ports >= 1);

    let failed = &report.results["definitely-not-a-real-host.invalid"];
    assert!(failed.error.is_some());
    assert!(failed.metrics.is_none());

    let ok = &report.results["127.0.0.1"];
    assert!(ok.error.is_none());
    assert_eq!(ok.ports.len(), 1);
}
