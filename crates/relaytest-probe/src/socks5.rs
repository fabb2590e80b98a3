//! SOCKS5 probe (RFC 1928, no-auth).

use crate::{classify, http_exchange, Probe, ProbeOutcome, ProbeTarget};
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_METHOD_NONE: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV4: u8 = 0x01;
const ATYP_IPV6: u8 = 0x04;
const REPLY_SUCCEEDED: u8 = 0x00;

/// Probes through a local SOCKS5 inbound.
pub struct Socks5Probe;

#[async_trait]
impl Probe for Socks5Probe {
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
            handshake(&mut stream).await?;
            connect_through(&mut stream, target).await?;
            http_exchange(&mut stream, target, started).await
        })
        .await
    }

    fn name(&self) -> &'static str {
        "socks5"
    }
}

/// Version/method negotiation, offering no-auth only.
async fn handshake(stream: &mut TcpStream) -> io::Result<()> {
    stream
        .write_all(&[SOCKS5_VERSION, 1, AUTH_METHOD_NONE])
        .await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;

    if reply[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "bad SOCKS version in method reply: {:#04x}",
            reply[0]
        )));
    }
    if reply[1] != AUTH_METHOD_NONE {
        return Err(protocol_error(format!(
            "proxy requires auth method {:#04x}",
            reply[1]
        )));
    }
    Ok(())
}

/// CONNECT to the target by domain name and consume the bound address.
async fn connect_through(stream: &mut TcpStream, target: &ProbeTarget) -> io::Result<()> {
    let host = target.host.as_bytes();
    if host.len() > 255 {
        return Err(protocol_error("target host name too long"));
    }

    let mut request = Vec::with_capacity(7 + host.len());
    request.extend_from_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00, ATYP_DOMAIN]);
    request.push(host.len() as u8);
    request.extend_from_slice(host);
    request.extend_from_slice(&target.port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;

    if head[0] != SOCKS5_VERSION {
        return Err(protocol_error(format!(
            "bad SOCKS version in reply: {:#04x}",
            head[0]
        )));
    }
    if head[1] != REPLY_SUCCEEDED {
        return Err(protocol_error(format!(
            "connect rejected: {}",
            reply_message(head[1])
        )));
    }

    // Remaining reply: bound address, length depends on ATYP.
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize
        }
        other => {
            return Err(protocol_error(format!(
                "bad address type in reply: {:#04x}",
                other
            )))
        }
    };
    let mut rest = vec![0u8; addr_len + 2];
    stream.read_exact(&mut rest).await?;

    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}

fn protocol_error(message: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.into())
}
