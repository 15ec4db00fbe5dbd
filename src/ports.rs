use anyhow::{bail, Context, Result};

/// Well-known ports probed first when prioritization is enabled, and the
/// full set used by the quick common-ports scan.
pub const COMMON_PORTS: &[u16] = &[
    21,    // FTP
    22,    // SSH
    23,    // Telnet
    25,    // SMTP
    53,    // DNS
    80,    // HTTP
    110,   // POP3
    143,   // IMAP
    443,   // HTTPS
    445,   // SMB
    3306,  // MySQL
    3389,  // RDP
    5432,  // PostgreSQL
    5900,  // VNC
    8080,  // HTTP-Alt
    8443,  // HTTPS-Alt
    27017, // MongoDB
    6379,  // Redis
];

/// Best-effort service name for a well-known port.
pub fn service_name(port: u16) -> Option<&'static str> {
    let name = match port {
        21 => "FTP",
        22 => "SSH",
        23 => "Telnet",
        25 => "SMTP",
        53 => "DNS",
        80 => "HTTP",
        110 => "POP3",
        143 => "IMAP",
        443 => "HTTPS",
        445 => "SMB",
        465 => "SMTPS",
        587 => "SMTP",
        993 => "IMAPS",
        995 => "POP3S",
        1433 => "MSSQL",
        3306 => "MySQL",
        3389 => "RDP",
        5432 => "PostgreSQL",
        5900 => "VNC",
        8080 => "HTTP-Alt",
        8443 => "HTTPS-Alt",
        9200 => "Elasticsearch",
        27017 => "MongoDB",
        6379 => "Redis",
        _ => return None,
    };
    Some(name)
}

/// Build the port worklist for a range scan.
///
/// With prioritization, well-known ports inside the range come first and the
/// remainder follows in ascending order. Ordering only affects how early
/// interesting ports are reached, never which ports are scanned.
pub fn build_worklist(start: u16, end: u16, prioritize_common: bool) -> Vec<u16> {
    if start > end {
        return Vec::new();
    }
    let range = start..=end;
    if !prioritize_common {
        return range.collect();
    }
    let common: Vec<u16> = COMMON_PORTS
        .iter()
        .copied()
        .filter(|p| (start..=end).contains(p))
        .collect();
    let mut out = common.clone();
    out.extend(range.filter(|p| !common.contains(p)));
    out
}

/// Parse a CLI port spec into a deduplicated list.
///
/// Supported forms, comma-separated: single port `80`, inclusive range
/// `8000-8010`. Whitespace around items is ignored.
pub fn parse_port_spec(spec: &str) -> Result<Vec<u16>> {
    let mut out: Vec<u16> = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for item in spec.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if let Some((a, b)) = item.split_once('-') {
            let start = parse_port_str(a.trim())
                .with_context(|| format!("invalid start in range: {a}"))?;
            let end = parse_port_str(b.trim())
                .with_context(|| format!("invalid end in range: {b}"))?;
            if start > end {
                bail!("invalid range {start}-{end} (start > end)");
            }
            for p in start..=end {
                if seen.insert(p) {
                    out.push(p);
                }
            }
            continue;
        }
        let p = parse_port_str(item).with_context(|| format!("invalid port value: {item}"))?;
        if seen.insert(p) {
            out.push(p);
        }
    }

    if out.is_empty() {
        bail!("port spec is empty");
    }
    Ok(out)
}

fn parse_port_str(s: &str) -> Result<u16> {
    let val: u32 = s.parse::<u32>().map_err(|e| anyhow::anyhow!(e))?;
    if val == 0 || val > 65535 {
        bail!("port out of range: {val}");
    }
    Ok(val as u16)
}
