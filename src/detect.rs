use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::debug;

use crate::probe::truncate_chars;
use crate::types::{PortStatus, ProbeResult};

const BANNER_WAIT: Duration = Duration::from_millis(800);
const RESPONSE_WAIT: Duration = Duration::from_millis(1200);
const BANNER_MAX_CHARS: usize = 200;

/// Identify the service behind an open port by banner grabbing and
/// protocol-specific probing.
///
/// No-op unless the result is `Open`. Detection failures of any kind return
/// the input untouched — an open classification is never downgraded.
pub async fn detect_service(result: ProbeResult, timeout: Duration) -> ProbeResult {
    if result.status != PortStatus::Open {
        return result;
    }
    let probe_timeout = timeout.min(Duration::from_secs(5)).max(Duration::from_secs(1));

    match grab_banner(&result.host, result.port, probe_timeout).await {
        Some(banner) if !banner.is_empty() => {
            let banner = truncate_chars(banner.trim(), BANNER_MAX_CHARS);
            let version = extract_version(&banner);
            let mut updated = result;
            updated.version = Some(version);
            updated.banner = Some(banner);
            updated
        }
        _ => result,
    }
}

/// Open a fresh connection (TLS-wrapped for HTTPS ports) and converse with
/// the service. Returns whatever banner bytes were collected, or `None` if
/// the connection could not be established.
async fn grab_banner(host: &str, port: u16, probe_timeout: Duration) -> Option<String> {
    let stream = match time::timeout(probe_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(host, port, error = %e, "detection connect failed");
            return None;
        }
        Err(_) => return None,
    };

    if is_tls_port(port) {
        let connector = native_tls::TlsConnector::builder()
            // Scan targets present arbitrary certificates and hostnames.
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .ok()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let mut tls = match time::timeout(probe_timeout, connector.connect(host, stream)).await {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                debug!(host, port, error = %e, "tls handshake failed");
                return None;
            }
            Err(_) => return None,
        };
        Some(converse(&mut tls, host, port).await)
    } else {
        let mut plain = stream;
        Some(converse(&mut plain, host, port).await)
    }
}

/// Listen briefly for an unsolicited banner, send the port-specific probe,
/// then wait for the response. Works over plain TCP or TLS.
async fn converse<S>(stream: &mut S, host: &str, port: u16) -> String
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut banner = String::new();
    let mut buf = vec![0u8; 2048];

    // SSH, FTP and SMTP servers usually speak first.
    if let Ok(Ok(n)) = time::timeout(BANNER_WAIT, stream.read(&mut buf)).await {
        if n > 0 {
            banner.push_str(&String::from_utf8_lossy(&buf[..n]));
        }
    }

    let request = probe_payload(host, port);
    if stream.write_all(&request).await.is_ok() {
        let _ = time::timeout(BANNER_WAIT, stream.flush()).await;
        let mut buf = vec![0u8; 4096];
        if let Ok(Ok(n)) = time::timeout(RESPONSE_WAIT, stream.read(&mut buf)).await {
            if n > 0 {
                banner.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        }
    }

    banner
}

fn is_tls_port(port: u16) -> bool {
    matches!(port, 443 | 8443)
}

/// Protocol probe that elicits a response from the common service families.
/// Unknown ports get a bare CRLF, which is enough to wake most line-oriented
/// protocols.
fn probe_payload(host: &str, port: u16) -> Vec<u8> {
    match port {
        80 | 443 | 8000 | 8008 | 8080 | 8443 => {
            format!("HEAD / HTTP/1.0\r\nHost: {host}\r\n\r\n").into_bytes()
        }
        25 | 587 | 2525 => b"EHLO example.com\r\n".to_vec(),
        21 => b"FEAT\r\n".to_vec(),
        110 => b"NOOP\r\n".to_vec(),
        143 => b"A1 CAPABILITY\r\n".to_vec(),
        6379 => b"PING\r\n".to_vec(),
        _ => b"\r\n".to_vec(),
    }
}

/// Pull a version string out of a banner with a small marker rule table:
/// recognized protocols take text up to the first line terminator, anything
/// else keeps its first 50 characters.
fn extract_version(banner: &str) -> String {
    if banner.is_empty() {
        return String::new();
    }
    if banner.contains("SSH") || banner.contains("FTP") {
        return banner.split('\r').next().unwrap_or(banner).to_string();
    }
    if banner.contains("HTTP") {
        return banner
            .split('\n')
            .next()
            .unwrap_or(banner)
            .trim_end_matches('\r')
            .to_string();
    }
    truncate_chars(banner, 50)
}
