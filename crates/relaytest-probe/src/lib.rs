//! Reachability probes through the core's local inbound.
//!
//! A probe drives one canonical HTTP request through the proxy endpoint
//! and classifies the outcome. It never errors out of the task: every
//! failure mode maps to an outcome class the tester records directly.
//!
//! Response time is wall-clock from probe start to the first response
//! byte, and is only reported on success.

pub mod http_connect;
pub mod socks5;

pub use http_connect::HttpConnectProbe;
pub use socks5::Socks5Probe;

use async_trait::async_trait;
use http::Uri;
use relaytest_common::{Protocol, Result, TesterError};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Outcome classes a probe can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeClass {
    /// Response arrived with a 2xx/3xx status.
    Success,
    /// Deadline expired before the first response byte.
    Timeout,
    /// Negotiation or transfer failed.
    ProbeFailed,
    /// The batch was cancelled mid-probe.
    Cancelled,
}

/// Classified probe result.
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub class: ProbeClass,
    /// Probe start to first response byte. `None` unless `Success`.
    pub response_time: Option<Duration>,
    pub detail: String,
}

impl ProbeOutcome {
    fn success(elapsed: Duration, status: u16) -> Self {
        Self {
            class: ProbeClass::Success,
            response_time: Some(elapsed),
            detail: format!("HTTP {}", status),
        }
    }

    fn failed(detail: impl Into<String>) -> Self {
        Self {
            class: ProbeClass::ProbeFailed,
            response_time: None,
            detail: detail.into(),
        }
    }

    fn timeout(deadline: Duration) -> Self {
        Self {
            class: ProbeClass::Timeout,
            response_time: None,
            detail: format!("no response within {:?}", deadline),
        }
    }

    fn cancelled() -> Self {
        Self {
            class: ProbeClass::Cancelled,
            response_time: None,
            detail: "batch cancelled".to_string(),
        }
    }
}

/// The reachability URL a probe requests through the proxy.
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProbeTarget {
    /// Parse an `http://` URL. TLS targets are rejected up front; the
    /// canonical generate_204 endpoints are plain HTTP.
    pub fn from_url(url: &str) -> Result<Self> {
        let uri: Uri = url
            .parse()
            .map_err(|e| TesterError::config(format!("invalid probe URL {:?}: {}", url, e)))?;

        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => {
                return Err(TesterError::config(format!(
                    "probe URL scheme {:?} not supported, use http",
                    other
                )))
            }
            None => return Err(TesterError::config("probe URL must be absolute")),
        }

        let host = uri
            .host()
            .ok_or_else(|| TesterError::config("probe URL has no host"))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|pq| pq.to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self { host, port, path })
    }

    /// `host:port` form used in CONNECT requests.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Protocol-specific probe behavior.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Drive one request through `proxy` toward `target` and classify.
    async fn probe(
        &self,
        token: &CancellationToken,
        proxy: SocketAddr,
        target: &ProbeTarget,
        deadline: Duration,
    ) -> ProbeOutcome;

    fn name(&self) -> &'static str;
}

static SOCKS5_PROBE: Socks5Probe = Socks5Probe;
static HTTP_CONNECT_PROBE: HttpConnectProbe = HttpConnectProbe;

/// Probe selection by candidate protocol: HTTP candidates get an HTTP
/// inbound, everything else is tested through a SOCKS5 inbound.
pub fn probe_for(protocol: Protocol) -> &'static dyn Probe {
    match protocol {
        Protocol::Http => &HTTP_CONNECT_PROBE,
        _ => &SOCKS5_PROBE,
    }
}

/// Run `attempt` under the deadline with cancellation, mapping its error
/// and timeout cases onto outcome classes.
async fn classify<F>(token: &CancellationToken, deadline: Duration, attempt: F) -> ProbeOutcome
where
    F: std::future::Future<Output = std::io::Result<(u16, Duration)>>,
{
    tokio::select! {
        _ = token.cancelled() => ProbeOutcome::cancelled(),
        res = tokio::time::timeout(deadline, attempt) => match res {
            Err(_) => ProbeOutcome::timeout(deadline),
            Ok(Err(e)) => ProbeOutcome::failed(e.to_string()),
            Ok(Ok((status, first_byte))) => {
                if (200..400).contains(&status) {
                    ProbeOutcome::success(first_byte, status)
                } else {
                    ProbeOutcome::failed(format!("unexpected status {}", status))
                }
            }
        }
    }
}

/// Send the canonical GET and read the status line through an already
/// negotiated tunnel. Returns the status code and the elapsed time from
/// `started` to the first response byte.
async fn http_exchange(
    stream: &mut TcpStream,
    target: &ProbeTarget,
    started: Instant,
) -> std::io::Result<(u16, Duration)> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: relaytest/0.3\r\nConnection: close\r\n\r\n",
        target.path, target.host
    );
    stream.write_all(request.as_bytes()).await?;

    let mut buf = [0u8; 1024];
    let mut collected: Vec<u8> = Vec::new();
    let mut first_byte: Option<Duration> = None;

    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before status line",
            ));
        }
        if first_byte.is_none() {
            first_byte = Some(started.elapsed());
        }
        collected.extend_from_slice(&buf[..n]);

        if let Some(status) = parse_status_line(&collected) {
            // first_byte is set on the branch above before we ever get here
            return Ok((status, first_byte.unwrap_or_default()));
        }
        if collected.len() > 8 * 1024 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "no HTTP status line in response",
            ));
        }
    }
}

/// Extract the status code once a full status line is buffered.
fn parse_status_line(data: &[u8]) -> Option<u16> {
    let line_end = data.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&data[..line_end]).ok()?;
    if !line.starts_with("HTTP/") {
        return None;
    }
    line.split_whitespace().nth(1)?.parse().ok()
}
