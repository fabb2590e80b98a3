//! HTTP CONNECT probe for candidates tested through an HTTP inbound.

use crate::{classify, http_exchange, parse_status_line, Probe, ProbeOutcome, ProbeTarget};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Probes through a local HTTP proxy inbound using CONNECT.
pub struct HttpConnectProbe;

#[async_trait]
impl Probe for HttpConnectProbe {
    async fn probe(
        &self,
        token: &CancellationToken,
        proxy: SocketAddr,
        target: &ProbeTarget,
        deadline: Duration,
    ) -> ProbeOutcome {
        let started = Instant::now();
        classify(token, deadline, async {
            let mut stream = TcpStream::connect(proxy).await?;
            open_tunnel(&mut stream, target).await?;
            http_exchange(&mut stream, target, started).await
        })
        .await
    }

    fn name(&self) -> &'static str {
        "http-connect"
    }
}

/// Issue CONNECT and consume the proxy's response head.
async fn open_tunnel(stream: &mut TcpStream, target: &ProbeTarget) -> io::Result<()> {
    let request = format!(
        "CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n",
        target.authority()
    );
    stream.write_all(request.as_bytes()).await?;

    let mut collected: Vec<u8> = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "proxy closed during CONNECT",
            ));
        }
        collected.extend_from_slice(&buf[..n]);

        if let Some(head_end) = collected.windows(4).position(|w| w == b"\r\n\r\n") {
            let status = parse_status_line(&collected[..head_end + 2]).ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "malformed CONNECT response")
            })?;
            if status != 200 {
                return Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("CONNECT rejected with status {}", status),
                ));
            }
            return Ok(());
        }
        if collected.len() > 8 * 1024 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized CONNECT response head",
            ));
        }
    }
}
