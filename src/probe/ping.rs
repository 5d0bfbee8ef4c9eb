//! ICMP echo transport with native sockets and a `ping` command fallback.
//!
//! Native probes use blocking sockets in spawn_blocking for sub-millisecond
//! timing precision.

use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::process::Command;

use super::{Probe, ProbeError};

/// ICMP capability state
#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    /// Native ICMP sockets are available
    Native,
    /// Only command fallback is available
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static ECHO_SEQUENCE: AtomicU16 = AtomicU16::new(0);

/// Identifier/sequence pair so concurrent echoes to the same host can be told apart.
fn next_echo_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = ECHO_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    // RAW needs CAP_NET_RAW or root
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (RAW socket, privileged)");
        return IcmpCapability::Native;
    }

    // DGRAM works unprivileged on macOS, and on Linux within ping_group_range
    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("Ping probe: using native ICMP (DGRAM socket, unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("Ping probe: native ICMP unavailable, using command fallback");
    IcmpCapability::CommandOnly
}

/// Default transport: ICMP echo request/reply.
#[derive(Debug, Default, Clone)]
pub struct IcmpProbe;

impl IcmpProbe {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Probe for IcmpProbe {
    async fn send(&self, address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
        let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);

        if capability == IcmpCapability::CommandOnly {
            return run_ping_command(address, timeout).await;
        }

        let ip = resolve_address(address).await?;
        let result = tokio::task::spawn_blocking(move || run_blocking_ping(ip, timeout))
            .await
            .map_err(|e| ProbeError::Transport(format!("spawn_blocking failed: {}", e)))?;

        match result {
            Err(NativeError::PermissionDenied(detail)) => {
                tracing::warn!(
                    "Native ping to {} was refused, falling back to command: {}",
                    address,
                    detail
                );
                run_ping_command(address, timeout).await
            }
            Err(NativeError::Probe(e)) => Err(e),
            Ok(latency) => Ok(latency),
        }
    }
}

/// Native errors, split so permission problems can trigger the fallback.
enum NativeError {
    PermissionDenied(String),
    Probe(ProbeError),
}

impl From<ProbeError> for NativeError {
    fn from(e: ProbeError) -> Self {
        NativeError::Probe(e)
    }
}

fn classify_io(context: &str, e: io::Error, timeout: Duration) -> NativeError {
    match e.kind() {
        io::ErrorKind::PermissionDenied => NativeError::PermissionDenied(format!("{}: {}", context, e)),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => NativeError::Probe(ProbeError::Timeout(timeout)),
        _ if e.to_string().to_lowercase().contains("unreachable") => {
            NativeError::Probe(ProbeError::Unreachable(e.to_string()))
        }
        _ => NativeError::Probe(ProbeError::Transport(format!("{}: {}", context, e))),
    }
}

async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Resolution(format!("{}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Resolution(format!("no addresses found for {}", address)))
}

fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, NativeError> {
    let (domain, protocol) = match ip {
        IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
        IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
    };

    // Try RAW first (privileged), then DGRAM (unprivileged). Linux rewrites
    // the echo identifier on DGRAM sockets, so only RAW replies can be
    // matched on it.
    let (socket, match_id) = match Socket::new(domain, Type::RAW, Some(protocol)) {
        Ok(socket) => (socket, true),
        Err(_) => Socket::new(domain, Type::DGRAM, Some(protocol))
            .map(|socket| (socket, false))
            .map_err(|e| classify_io("failed to create ICMP socket", e, timeout))?,
    };

    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| classify_io("failed to set timeout", e, timeout))?;

    let dest = SocketAddr::new(ip, 0);
    socket
        .connect(&dest.into())
        .map_err(|e| classify_io("failed to connect", e, timeout))?;

    let (identifier, sequence) = next_echo_id();
    let packet = match ip {
        IpAddr::V4(_) => build_icmp_echo_request(identifier, sequence),
        IpAddr::V6(_) => build_icmpv6_echo_request(identifier, sequence),
    };

    let start = Instant::now();
    socket
        .send(&packet)
        .map_err(|e| classify_io("failed to send", e, timeout))?;

    // Loop until we see our own reply or run out of time.
    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket
            .recv(&mut buf)
            .map_err(|e| classify_io("failed to receive", e, timeout))?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout).into());
        }

        match parse_reply(ip, buf, match_id.then_some(identifier), sequence) {
            Reply::Echo => return Ok(elapsed),
            Reply::Unreachable => {
                return Err(ProbeError::Unreachable(format!("destination unreachable from {}", ip)).into())
            }
            Reply::Other => {}
        }
    }
}

#[derive(Debug, PartialEq)]
enum Reply {
    Echo,
    Unreachable,
    Other,
}

/// Classify a received datagram against the echo we sent.
///
/// DGRAM sockets deliver just the ICMP message; RAW IPv4 sockets prefix it
/// with the IP header. `identifier` is `None` when it cannot be trusted.
fn parse_reply(ip: IpAddr, buf: &[u8], identifier: Option<u16>, sequence: u16) -> Reply {
    let (offset, echo_reply, unreachable) = match ip {
        IpAddr::V4(_) => {
            let offset = if buf.first().is_some_and(|b| b >> 4 == 4) {
                usize::from(buf[0] & 0x0F) * 4
            } else {
                0
            };
            (offset, 0u8, 3u8)
        }
        IpAddr::V6(_) => (0, 129u8, 1u8),
    };

    if buf.len() < offset + 8 {
        return Reply::Other;
    }

    let icmp = &buf[offset..];
    let is_ours = |echo: &[u8]| {
        let id = u16::from_be_bytes([echo[4], echo[5]]);
        let seq = u16::from_be_bytes([echo[6], echo[7]]);
        identifier.map_or(true, |expected| expected == id) && seq == sequence
    };

    if icmp[0] == echo_reply && is_ours(icmp) {
        return Reply::Echo;
    }

    if icmp[0] == unreachable {
        // The error quotes the offending packet: its IP header, then our echo header.
        let inner_offset = match ip {
            IpAddr::V4(_) => icmp.get(8).map(|b| 8 + usize::from(b & 0x0F) * 4),
            IpAddr::V6(_) => Some(8 + 40),
        };
        if let Some(echo) = inner_offset.and_then(|o| icmp.get(o..o + 8)) {
            if is_ours(echo) {
                return Reply::Unreachable;
            }
        }
    }

    Reply::Other
}

fn echo_payload_timestamp() -> [u8; 8] {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    nanos.to_be_bytes()
}

/// Build an ICMP Echo Request packet (type 8, code 0).
fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64]; // 8 byte header + 56 byte payload

    packet[0] = 8;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&echo_payload_timestamp());

    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());

    packet
}

/// Build an ICMPv6 Echo Request packet (type 128, code 0).
///
/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];

    packet[0] = 128;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    packet[8..16].copy_from_slice(&echo_payload_timestamp());

    packet
}

/// Compute ICMP checksum (RFC 1071).
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u32::from(u16::from_be_bytes([*hi, *lo])),
            [hi] => u32::from(*hi) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

fn ping_command_args(address: &str, timeout: Duration) -> Vec<String> {
    let timeout_secs = timeout.as_secs().max(1).to_string();

    if cfg!(target_os = "windows") {
        vec!["-n".into(), "1".into(), "-w".into(), timeout.as_millis().to_string(), address.into()]
    } else if cfg!(target_os = "macos") {
        vec!["-c".into(), "1".into(), "-t".into(), timeout_secs, address.into()]
    } else {
        vec!["-c".into(), "1".into(), "-W".into(), timeout_secs, address.into()]
    }
}

/// Run ping via the OS command (fallback).
async fn run_ping_command(address: &str, timeout: Duration) -> Result<Duration, ProbeError> {
    let output = Command::new("ping")
        .args(ping_command_args(address, timeout))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ProbeError::Transport(format!("failed to execute ping: {}", e)))?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !output.status.success() {
        return Err(classify_command_failure(&stdout, &stderr, timeout));
    }

    parse_ping_output(&stdout)
}

fn classify_command_failure(stdout: &str, stderr: &str, timeout: Duration) -> ProbeError {
    let combined = format!("{}\n{}", stdout, stderr);
    let lower = combined.to_lowercase();

    if lower.contains("unknown host")
        || lower.contains("cannot resolve")
        || lower.contains("name or service not known")
        || lower.contains("could not find host")
        || lower.contains("temporary failure in name resolution")
    {
        ProbeError::Resolution(stderr.trim().to_string())
    } else if lower.contains("unreachable") {
        ProbeError::Unreachable(combined.trim().to_string())
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("100% packet loss")
        || lower.contains("100.0% packet loss")
    {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Transport(format!("ping failed: {}", combined.trim()))
    }
}

fn ms_to_duration(ms: &str) -> Option<Duration> {
    ms.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(|v| Duration::from_secs_f64(v / 1000.0))
}

/// Parse ping command output for latency.
fn parse_ping_output(output: &str) -> Result<Duration, ProbeError> {
    // Per-packet "time=12.3 ms" / "time<1ms" (Linux, macOS, Windows)
    static PER_PACKET: OnceLock<Option<Regex>> = OnceLock::new();
    // Summary "rtt min/avg/max/mdev = ..." (Linux) or "round-trip min/avg/max/stddev = ..." (macOS)
    static SUMMARY: OnceLock<Option<Regex>> = OnceLock::new();

    let per_packet = PER_PACKET.get_or_init(|| Regex::new(r"time[=<]\s*(?P<val>[0-9.]+)\s*ms").ok());
    if let Some(caps) = per_packet.as_ref().and_then(|re| re.captures(output)) {
        if let Some(latency) = caps.name("val").and_then(|m| ms_to_duration(m.as_str())) {
            return Ok(latency);
        }
    }

    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"(?:rtt|round-trip)\s+min/avg/max/(?:mdev|stddev)\s*=\s*([0-9.]+)/([0-9.]+)/([0-9.]+)").ok()
    });
    if let Some(caps) = summary.as_ref().and_then(|re| re.captures(output)) {
        if let Some(latency) = caps.get(2).and_then(|m| ms_to_duration(m.as_str())) {
            return Ok(latency);
        }
    }

    Err(ProbeError::Transport(format!("failed to parse ping output: {}", output.trim())))
}
