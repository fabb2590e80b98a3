//! Core data model: candidate records, outcomes, and per-test results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Proxy protocol of a candidate, as emitted by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vmess,
    Shadowsocks,
    Trojan,
    Vless,
    Socks,
    Http,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Vmess => write!(f, "vmess"),
            Protocol::Shadowsocks => write!(f, "shadowsocks"),
            Protocol::Trojan => write!(f, "trojan"),
            Protocol::Vless => write!(f, "vless"),
            Protocol::Socks => write!(f, "socks"),
            Protocol::Http => write!(f, "http"),
        }
    }
}

/// Classified outcome of one test task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Success,
    Failure,
    Timeout,
    PortConflict,
    ResourceExhausted,
    LaunchFailed,
    ProbeFailed,
    Cancelled,
}

impl TestResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TestResult::Success)
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestResult::Success => "success",
            TestResult::Failure => "failure",
            TestResult::Timeout => "timeout",
            TestResult::PortConflict => "port_conflict",
            TestResult::ResourceExhausted => "resource_exhausted",
            TestResult::LaunchFailed => "launch_failed",
            TestResult::ProbeFailed => "probe_failed",
            TestResult::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Normalized description of one proxy candidate.
///
/// Produced by the collector as JSON; immutable once enqueued except for
/// `local_port`, which the tester fills with the leased inbound port just
/// before launching the core. Unknown input fields are ignored so both
/// collector record variants deserialize into this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Display name of the candidate.
    pub tag: String,

    /// Proxy protocol.
    #[serde(rename = "type")]
    pub protocol: Protocol,

    /// Remote server host.
    pub server: String,

    /// Remote server port.
    pub port: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(rename = "alterId", default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,

    /// Transport network: tcp (default), ws, or grpc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    #[serde(default)]
    pub tls: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,

    /// Local inbound port leased for the test run. Filled by the tester.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
}

impl ProxyConfig {
    /// Minimal record with only the mandatory fields set.
    pub fn new(tag: impl Into<String>, protocol: Protocol, server: impl Into<String>, port: u16) -> Self {
        Self {
            tag: tag.into(),
            protocol,
            server: server.into(),
            port,
            uuid: None,
            alter_id: None,
            cipher: None,
            network: None,
            tls: false,
            sni: None,
            host: None,
            path: None,
            password: None,
            flow: None,
            username: None,
            method: None,
            local_port: None,
        }
    }
}

/// One test outcome, owned by the batch result slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultData {
    pub config: ProxyConfig,
    pub result: TestResult,
    pub message: String,
    /// Wall-clock from probe start to first response byte, in milliseconds.
    /// Zero on every non-success outcome.
    pub response_time_ms: u64,
    pub batch_id: u64,
    pub started_at: DateTime<Utc>,
}

impl TestResultData {
    /// Record a non-success outcome. Response time is zero by contract.
    pub fn outcome(
        config: ProxyConfig,
        batch_id: u64,
        result: TestResult,
        message: impl Into<String>,
    ) -> Self {
        Self {
            config,
            result,
            message: message.into(),
            response_time_ms: 0,
            batch_id,
            started_at: Utc::now(),
        }
    }

    /// Record a successful probe with its measured response time.
    pub fn success(config: ProxyConfig, batch_id: u64, response_time: Duration) -> Self {
        Self {
            config,
            result: TestResult::Success,
            message: String::new(),
            response_time_ms: response_time.as_millis() as u64,
            batch_id,
            started_at: Utc::now(),
        }
    }
}

/// One call to the tester: the batch's inputs, outputs and timing.
#[derive(Debug, Clone, Serialize)]
pub struct BatchRun {
    pub batch_id: u64,
    pub configs: usize,
    pub results: Vec<TestResultData>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_serializes_snake_case() {
        let json = serde_json::to_string(&TestResult::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
        let json = serde_json::to_string(&TestResult::PortConflict).unwrap();
        assert_eq!(json, "\"port_conflict\"");
    }

    #[test]
    fn proxy_config_parses_collector_record() {
        let raw = r#"{
            "tag": "jp-01",
            "type": "vmess",
            "server": "example.com",
            "port": 443,
            "uuid": "a2c9e5b4-5f7e-4a9e-9d7c-000000000001",
            "alterId": 0,
            "network": "ws",
            "tls": true,
            "sni": "example.com",
            "path": "/ws",
            "someUnknownField": 42
        }"#;

        let cfg: ProxyConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.tag, "jp-01");
        assert_eq!(cfg.protocol, Protocol::Vmess);
        assert_eq!(cfg.alter_id, Some(0));
        assert!(cfg.tls);
        assert_eq!(cfg.network.as_deref(), Some("ws"));
        assert_eq!(cfg.local_port, None);
    }

    #[test]
    fn result_data_field_names_are_stable() {
        let cfg = ProxyConfig::new("a", Protocol::Socks, "1.2.3.4", 1080);
        let data = TestResultData::success(cfg, 3, Duration::from_millis(120));
        let value = serde_json::to_value(&data).unwrap();

        assert_eq!(value["result"], "success");
        assert_eq!(value["response_time_ms"], 120);
        assert_eq!(value["batch_id"], 3);
        assert_eq!(value["config"]["type"], "socks");
        assert!(value.get("started_at").is_some());
    }

    #[test]
    fn non_success_outcome_has_zero_response_time() {
        let cfg = ProxyConfig::new("b", Protocol::Trojan, "1.2.3.4", 443);
        let data = TestResultData::outcome(cfg, 1, TestResult::Timeout, "deadline expired");
        assert_eq!(data.response_time_ms, 0);
        assert!(!data.result.is_success());
    }
}
