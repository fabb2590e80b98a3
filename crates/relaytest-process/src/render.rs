//! Rendering of the per-test core configuration.
//!
//! The core is handed a JSON file with a single loopback inbound on the
//! leased port and a single outbound built from the candidate record.
//! Candidates missing the fields their protocol requires are rejected
//! here, before a process is ever spawned.

use relaytest_common::{Protocol, ProxyConfig, Result, TesterError};
use serde_json::{json, Value};

/// Build the full core config for one candidate on one leased port.
pub fn render_core_config(config: &ProxyConfig, port: u16) -> Result<Value> {
    let inbound_protocol = match config.protocol {
        Protocol::Http => "http",
        _ => "socks",
    };

    let mut inbound = json!({
        "tag": "relaytest-in",
        "listen": "127.0.0.1",
        "port": port,
        "protocol": inbound_protocol,
    });
    if inbound_protocol == "socks" {
        inbound["settings"] = json!({ "udp": false });
    }

    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [inbound],
        "outbounds": [outbound_for(config)?],
    }))
}

fn outbound_for(config: &ProxyConfig) -> Result<Value> {
    let mut outbound = match config.protocol {
        Protocol::Vmess => {
            let uuid = require(config, &config.uuid, "uuid")?;
            json!({
                "protocol": "vmess",
                "settings": {
                    "vnext": [{
                        "address": config.server,
                        "port": config.port,
                        "users": [{
                            "id": uuid,
                            "alterId": config.alter_id.unwrap_or(0),
                            "security": config.cipher.as_deref().unwrap_or("auto"),
                        }],
                    }],
                },
            })
        }
        Protocol::Vless => {
            let uuid = require(config, &config.uuid, "uuid")?;
            let mut user = json!({ "id": uuid, "encryption": "none" });
            if let Some(flow) = &config.flow {
                user["flow"] = json!(flow);
            }
            json!({
                "protocol": "vless",
                "settings": {
                    "vnext": [{
                        "address": config.server,
                        "port": config.port,
                        "users": [user],
                    }],
                },
            })
        }
        Protocol::Trojan => {
            let password = require(config, &config.password, "password")?;
            json!({
                "protocol": "trojan",
                "settings": {
                    "servers": [{
                        "address": config.server,
                        "port": config.port,
                        "password": password,
                    }],
                },
            })
        }
        Protocol::Shadowsocks => {
            let password = require(config, &config.password, "password")?;
            let method = config
                .method
                .as_deref()
                .or(config.cipher.as_deref())
                .ok_or_else(|| {
                    TesterError::invalid_candidate(&config.tag, "missing method")
                })?;
            json!({
                "protocol": "shadowsocks",
                "settings": {
                    "servers": [{
                        "address": config.server,
                        "port": config.port,
                        "method": method,
                        "password": password,
                    }],
                },
            })
        }
        Protocol::Socks | Protocol::Http => {
            let mut server = json!({
                "address": config.server,
                "port": config.port,
            });
            if let (Some(user), Some(pass)) = (&config.username, &config.password) {
                server["users"] = json!([{ "user": user, "pass": pass }]);
            }
            json!({
                "protocol": config.protocol.to_string(),
                "settings": { "servers": [server] },
            })
        }
    };

    if let Some(stream) = stream_settings(config) {
        outbound["streamSettings"] = stream;
    }

    Ok(outbound)
}

fn stream_settings(config: &ProxyConfig) -> Option<Value> {
    let network = config.network.as_deref().unwrap_or("tcp");
    let mut stream = json!({ "network": network });

    match network {
        "ws" => {
            let mut ws = json!({ "path": config.path.as_deref().unwrap_or("/") });
            if let Some(host) = &config.host {
                ws["headers"] = json!({ "Host": host });
            }
            stream["wsSettings"] = ws;
        }
        "grpc" => {
            stream["grpcSettings"] = json!({
                "serviceName": config.path.as_deref().unwrap_or(""),
            });
        }
        _ => {}
    }

    if config.tls {
        stream["security"] = json!("tls");
        let server_name = config.sni.as_deref().or(config.host.as_deref());
        if let Some(name) = server_name {
            stream["tlsSettings"] = json!({ "serverName": name });
        }
    }

    if network == "tcp" && !config.tls {
        // Plain TCP needs no stream block at all.
        return None;
    }

    Some(stream)
}

fn require<'a>(config: &ProxyConfig, field: &'a Option<String>, name: &str) -> Result<&'a str> {
    field
        .as_deref()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TesterError::invalid_candidate(&config.tag, format!("missing {}", name)))
}
