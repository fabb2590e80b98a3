//! Stand-in proxy core for end-to-end tests.
//!
//! Accepts the same invocation as the real core (`stub-core run -c
//! <config.json>`), binds the inbound declared in the config, and speaks
//! just enough SOCKS5 / HTTP proxy protocol to satisfy the probe: every
//! tunneled request is answered with a canned `204 No Content` instead
//! of contacting the upstream.
//!
//! Fault injection via environment variables:
//! - `STUB_STARTUP_DELAY_MS`  sleep before binding the inbound
//! - `STUB_RESPONSE_DELAY_MS` sleep before answering the tunneled request
//! - `STUB_EXIT_EARLY=1`      exit with status 3 before binding

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn env_ms(key: &str) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::ZERO)
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config_path = match args.as_slice() {
        [_, run, flag, path] if run == "run" && flag == "-c" => path.clone(),
        _ => {
            eprintln!("usage: stub-core run -c <config.json>");
            std::process::exit(2);
        }
    };

    let raw = match std::fs::read_to_string(&config_path) {
        Ok(raw) => raw,
        Err(e) => {
            eprintln!("stub-core: cannot read {}: {}", config_path, e);
            std::process::exit(2);
        }
    };
    let config: serde_json::Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(e) => {
            eprintln!("stub-core: bad config: {}", e);
            std::process::exit(2);
        }
    };

    let inbound = &config["inbounds"][0];
    let port = inbound["port"].as_u64().unwrap_or(0) as u16;
    let http_mode = inbound["protocol"].as_str() == Some("http");
    if port == 0 {
        eprintln!("stub-core: config has no inbound port");
        std::process::exit(2);
    }

    if std::env::var("STUB_EXIT_EARLY").as_deref() == Ok("1") {
        eprintln!("stub-core: exiting early as requested");
        std::process::exit(3);
    }

    let startup_delay = env_ms("STUB_STARTUP_DELAY_MS");
    if !startup_delay.is_zero() {
        tokio::time::sleep(startup_delay).await;
    }

    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("stub-core: cannot bind 127.0.0.1:{}: {}", port, e);
            std::process::exit(2);
        }
    };
    eprintln!("stub-core: listening on 127.0.0.1:{}", port);

    let response_delay = env_ms("STUB_RESPONSE_DELAY_MS");
    let accept_loop = async {
        loop {
            if let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _ = handle_connection(stream, http_mode, response_delay).await;
                });
            }
        }
    };

    tokio::select! {
        _ = accept_loop => {}
        _ = wait_for_shutdown() => {
            eprintln!("stub-core: shutting down");
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    http_mode: bool,
    response_delay: Duration,
) -> std::io::Result<()> {
    if http_mode {
        // CONNECT <authority> HTTP/1.1 ... then the tunneled request.
        read_request_head(&mut stream).await?;
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .await?;
    } else {
        // SOCKS5: greeting, no-auth reply, CONNECT, success reply.
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await?;
        let mut methods = vec![0u8; greeting[1] as usize];
        stream.read_exact(&mut methods).await?;
        stream.write_all(&[0x05, 0x00]).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        let addr_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            _ => 0,
        };
        let mut rest = vec![0u8; addr_len + 2];
        stream.read_exact(&mut rest).await?;
        stream
            .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await?;
    }

    // The probe's GET for the reachability URL.
    read_request_head(&mut stream).await?;

    if !response_delay.is_zero() {
        tokio::time::sleep(response_delay).await;
    }
    stream.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await?;
    Ok(())
}

async fn read_request_head(stream: &mut TcpStream) -> std::io::Result<()> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "peer closed mid-request",
            ));
        }
        collected.extend_from_slice(&buf[..n]);
        if collected.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(());
        }
        if collected.len() > 16 * 1024 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "oversized request head",
            ));
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
