//! Guest address discovery over the virtual tap subnet.
//!
//! Guests acquire an address on the host's tap interface /24 but never
//! report it back, so the bridge finds them the blunt way: identify the tap
//! interface's IPv4 address, then probe every other address on the subnet
//! for an open SSH port. The scan is bounded twice — per-attempt (~150 ms
//! TCP connect timeout, 32 probes in flight) and overall (~3 s budget);
//! probes still outstanding at the deadline are dropped, not awaited.

use std::net::Ipv4Addr;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info};

/// Port probed on candidate guest addresses.
pub const SSH_PORT: u16 = 22;

const SCAN_CONCURRENCY: usize = 32;
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(150);
const SCAN_BUDGET: Duration = Duration::from_secs(3);

/// Parameters for one subnet scan. The defaults match production; tests
/// point the scan at loopback with a shorter budget.
#[derive(Debug, Clone)]
pub struct ScanParams {
    /// The host's own address on the subnet; its octet is excluded from the
    /// candidate list.
    pub host_addr: Ipv4Addr,
    pub port: u16,
    pub attempt_timeout: Duration,
    pub budget: Duration,
    pub concurrency: usize,
}

impl ScanParams {
    pub fn for_host(host_addr: Ipv4Addr) -> Self {
        Self {
            host_addr,
            port: SSH_PORT,
            attempt_timeout: ATTEMPT_TIMEOUT,
            budget: SCAN_BUDGET,
            concurrency: SCAN_CONCURRENCY,
        }
    }
}

/// Find the guest's address: locate the tap interface, then scan its /24.
/// `None` when there is no tap interface or nothing answered in budget.
pub async fn discover_guest_address(tap_prefix: &str) -> Option<Ipv4Addr> {
    let host_addr = host_tap_ipv4(tap_prefix).await?;
    debug!(%host_addr, "scanning tap subnet for a guest SSH endpoint");
    scan_subnet(&ScanParams::for_host(host_addr)).await
}

/// Probe all 253 other addresses on the host's /24 for an accepting TCP
/// port. First hit wins.
pub async fn scan_subnet(params: &ScanParams) -> Option<Ipv4Addr> {
    let [a, b, c, host_octet] = params.host_addr.octets();
    let port = params.port;
    let attempt_timeout = params.attempt_timeout;

    let candidates = (1..=254u8)
        .filter(move |octet| *octet != host_octet)
        .map(move |octet| Ipv4Addr::new(a, b, c, octet));

    let mut probes = stream::iter(candidates)
        .map(move |addr| probe(addr, port, attempt_timeout))
        .buffer_unordered(params.concurrency);

    let scan = async {
        while let Some(hit) = probes.next().await {
            if hit.is_some() {
                return hit;
            }
        }
        None
    };

    match tokio::time::timeout(params.budget, scan).await {
        Ok(found) => found,
        Err(_) => {
            debug!(budget_ms = params.budget.as_millis() as u64, "scan budget exhausted");
            None
        }
    }
}

async fn probe(addr: Ipv4Addr, port: u16, attempt_timeout: Duration) -> Option<Ipv4Addr> {
    match tokio::time::timeout(attempt_timeout, TcpStream::connect((addr, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            info!(%addr, port, "guest endpoint accepted connection");
            Some(addr)
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tap interface lookup
// ---------------------------------------------------------------------------

/// IPv4 address of the first interface whose name starts with `prefix`.
async fn host_tap_ipv4(prefix: &str) -> Option<Ipv4Addr> {
    let output = Command::new("ip")
        .args(["-o", "-4", "addr", "show"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        debug!("`ip addr show` failed");
        return None;
    }
    parse_tap_ipv4(&String::from_utf8_lossy(&output.stdout), prefix)
}

/// Parse `ip -o -4 addr show` output. One line per address:
///
/// ```text
/// 4: vmtap0    inet 192.168.100.1/24 brd 192.168.100.255 scope global vmtap0
/// ```
pub fn parse_tap_ipv4(output: &str, prefix: &str) -> Option<Ipv4Addr> {
    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let Some(_index) = fields.next() else {
            continue;
        };
        let Some(ifname) = fields.next() else {
            continue;
        };
        if !ifname.starts_with(prefix) {
            continue;
        }
        let rest: Vec<&str> = fields.collect();
        let Some(addr) = rest
            .iter()
            .position(|f| *f == "inet")
            .and_then(|i| rest.get(i + 1))
        else {
            continue;
        };
        let Some(addr) = addr.split('/').next() else {
            continue;
        };
        if let Ok(parsed) = addr.parse() {
            return Some(parsed);
        }
    }
    None
}
