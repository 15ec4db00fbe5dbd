use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{self, Instant};
use tracing::debug;

use crate::ports::service_name;
use crate::types::{PortStatus, ProbeResult, Technique};

/// Probe one port with the requested technique.
///
/// Total by construction: every timeout and network error folds into a
/// `PortStatus`, and wall-clock `response_time` is recorded on every path.
/// `host` labels the result (the caller resolved it to `addr` already).
pub async fn probe(host: &str, addr: SocketAddr, technique: Technique, timeout: Duration) -> ProbeResult {
    match technique {
        // Hybrid is a connect probe; the orchestrator layers detection on top.
        Technique::TcpConnect | Technique::Hybrid => tcp_connect_probe(host, addr, timeout).await,
        Technique::Syn => syn_fallback_probe(host, addr, timeout).await,
        Technique::Udp => udp_probe(host, addr, timeout).await,
    }
}

/// Full-handshake TCP probe. Open ports get a short passive banner read.
pub async fn tcp_connect_probe(host: &str, addr: SocketAddr, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    match time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(mut stream)) => {
            let elapsed = start.elapsed();
            let banner = read_banner(&mut stream).await;
            let mut result = ProbeResult::new(host, addr.port(), PortStatus::Open, elapsed);
            result.service = service_name(addr.port()).map(str::to_string);
            result.banner = banner;
            result
        }
        Ok(Err(e)) => {
            let status = classify_connect_error(&e);
            debug!(port = addr.port(), error = %e, "tcp connect failed");
            ProbeResult::new(host, addr.port(), status, start.elapsed())
        }
        Err(_) => ProbeResult::new(host, addr.port(), PortStatus::Filtered, start.elapsed()),
    }
}

/// UDP probe: empty datagram, then wait for any reply.
///
/// A reply means open; silence is `OpenOrFiltered` — UDP cannot distinguish
/// an open-but-quiet service from a dropping firewall. An ICMP
/// port-unreachable surfaces as `ConnectionRefused` on the recv and means
/// closed.
pub async fn udp_probe(host: &str, addr: SocketAddr, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let port = addr.port();

    let bind_addr: SocketAddr = if addr.is_ipv4() {
        "0.0.0.0:0".parse().expect("literal addr")
    } else {
        "[::]:0".parse().expect("literal addr")
    };
    let socket = match UdpSocket::bind(bind_addr).await {
        Ok(s) => s,
        Err(e) => {
            debug!(port, error = %e, "udp bind failed");
            return ProbeResult::new(host, port, PortStatus::Filtered, start.elapsed());
        }
    };
    // Connect so ICMP port-unreachable comes back as ConnectionRefused.
    if let Err(e) = socket.connect(addr).await {
        debug!(port, error = %e, "udp connect failed");
        return ProbeResult::new(host, port, PortStatus::Filtered, start.elapsed());
    }
    if let Err(e) = socket.send(&[]).await {
        debug!(port, error = %e, "udp send failed");
        let status = if e.kind() == io::ErrorKind::ConnectionRefused {
            PortStatus::Closed
        } else {
            PortStatus::Filtered
        };
        return ProbeResult::new(host, port, status, start.elapsed());
    }

    let mut buf = [0u8; 1024];
    match time::timeout(timeout, socket.recv(&mut buf)).await {
        Ok(Ok(_)) => {
            let mut result = ProbeResult::new(host, port, PortStatus::Open, start.elapsed());
            result.service = service_name(port).map(str::to_string);
            result
        }
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            ProbeResult::new(host, port, PortStatus::Closed, start.elapsed())
        }
        Ok(Err(_)) => ProbeResult::new(host, port, PortStatus::Filtered, start.elapsed()),
        Err(_) => ProbeResult::new(host, port, PortStatus::OpenOrFiltered, start.elapsed()),
    }
}

/// "SYN-style" probe: a connect-based check run on the blocking thread pool.
///
/// This is not a half-open scan — that would need raw sockets and elevated
/// privileges. The blocking `connect_timeout` keeps socket-table pressure
/// off the async scheduler; if the worker cannot run at all, the probe falls
/// back to the plain async TCP connect path.
pub async fn syn_fallback_probe(host: &str, addr: SocketAddr, timeout: Duration) -> ProbeResult {
    let start = Instant::now();
    let join = tokio::task::spawn_blocking(move || {
        std::net::TcpStream::connect_timeout(&addr, timeout).map(drop)
    })
    .await;

    match join {
        Ok(Ok(())) => {
            let mut result = ProbeResult::new(host, addr.port(), PortStatus::Open, start.elapsed());
            result.service = service_name(addr.port()).map(str::to_string);
            result
        }
        Ok(Err(e)) => {
            let status = classify_connect_error(&e);
            ProbeResult::new(host, addr.port(), status, start.elapsed())
        }
        Err(e) => {
            debug!(port = addr.port(), error = %e, "blocking probe task failed, falling back");
            tcp_connect_probe(host, addr, timeout).await
        }
    }
}

fn classify_connect_error(e: &io::Error) -> PortStatus {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => PortStatus::Closed,
        io::ErrorKind::TimedOut => PortStatus::Filtered,
        _ => PortStatus::Filtered,
    }
}

/// Passive post-connect banner grab: up to 256 bytes within 200ms, with a
/// best-effort zero-length write first. Failures are ignored.
async fn read_banner(stream: &mut TcpStream) -> Option<String> {
    let _ = stream.write_all(&[]).await;
    let mut buf = vec![0u8; 256];
    match time::timeout(Duration::from_millis(200), stream.read(&mut buf)).await {
        Ok(Ok(n)) if n > 0 => {
            buf.truncate(n);
            let s = String::from_utf8_lossy(&buf).trim().to_string();
            if s.is_empty() {
                None
            } else {
                Some(truncate_chars(&s, 200))
            }
        }
        _ => None,
    }
}

/// Truncate on a character boundary so lossy UTF-8 banners stay valid.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_errors_map_to_closed_or_filtered() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert_eq!(classify_connect_error(&refused), PortStatus::Closed);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        assert_eq!(classify_connect_error(&timed_out), PortStatus::Filtered);

        let other = io::Error::new(io::ErrorKind::AddrNotAvailable, "unreachable");
        assert_eq!(classify_connect_error(&other), PortStatus::Filtered);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let s = "αβγδε";
        assert_eq!(truncate_chars(s, 3), "αβγ");
        assert_eq!(truncate_chars("ab", 200), "ab");
    }
}
