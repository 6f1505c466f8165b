use anyhow::{Context, Result};
use h2sec_traits::{HeaderField, Target, MAX_WINDOW_INCREMENT};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Used when neither the server nor the configuration bounds concurrency.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 100;

const MAX_HEADER_LEN_LIMIT: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub host: String,
    /// Falls back to 80, or 443 with TLS.
    pub port: Option<u16>,
    pub path: String,
    pub tls: bool,
    pub insecure: bool,
    pub timeout_ms: u64,
    /// Total number of requests a scenario may issue.
    pub requests: usize,
    /// Desired number of concurrent streams; 0 leaves it to the server.
    pub concurrency: usize,
    /// Encoded header block length the HPACK bomb grows to.
    pub max_header_len: usize,
    /// Flow-control window, and replenishment increment, for slow-read.
    pub slow_read_step: u32,
    pub slow_read_interval_ms: u64,
    pub default_max_concurrent_streams: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: None,
            path: "/".to_string(),
            tls: false,
            insecure: false,
            timeout_ms: 2000,
            requests: 1000,
            concurrency: 100,
            max_header_len: 4000,
            slow_read_step: 1,
            slow_read_interval_ms: 100,
            default_max_concurrent_streams: DEFAULT_MAX_CONCURRENT_STREAMS,
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid config in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            anyhow::bail!("host must not be empty");
        }
        if !self.path.starts_with('/') {
            anyhow::bail!("path must start with '/': {:?}", self.path);
        }
        if self.requests == 0 {
            anyhow::bail!("requests must be at least 1");
        }
        if self.slow_read_step == 0 || self.slow_read_step > MAX_WINDOW_INCREMENT {
            anyhow::bail!(
                "slow_read_step must be within 1..={}, got {}",
                MAX_WINDOW_INCREMENT,
                self.slow_read_step
            );
        }
        if self.slow_read_interval() >= self.timeout() {
            anyhow::bail!(
                "slow_read_interval_ms ({}) must be below timeout_ms ({})",
                self.slow_read_interval_ms,
                self.timeout_ms
            );
        }
        if self.max_header_len > MAX_HEADER_LEN_LIMIT {
            anyhow::bail!("max_header_len must not exceed {}", MAX_HEADER_LEN_LIMIT);
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 443 } else { 80 })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn slow_read_interval(&self) -> Duration {
        Duration::from_millis(self.slow_read_interval_ms)
    }

    pub fn target(&self) -> Target {
        Target {
            host: self.host.clone(),
            port: self.port(),
            tls: self.tls,
            insecure: self.insecure,
            read_timeout: self.timeout(),
        }
    }

    /// Request pseudo-headers every scenario starts from.
    pub fn common_headers(&self) -> Vec<HeaderField> {
        let scheme = if self.tls { "https" } else { "http" };
        vec![
            HeaderField::new(":method", "GET"),
            HeaderField::new(":scheme", scheme),
            HeaderField::new(":path", self.path.clone()),
            HeaderField::new(":authority", self.target().authority()),
        ]
    }

    /// Number of streams to keep open at once: the smallest of the server's
    /// limit, the configured concurrency and the fallback default, with zero
    /// or absent values ignored.
    pub fn stream_budget(&self, negotiated: Option<u32>) -> usize {
        [
            negotiated.map(|n| n as usize).unwrap_or(0),
            self.concurrency,
            self.default_max_concurrent_streams,
        ]
        .into_iter()
        .filter(|&n| n > 0)
        .min()
        .unwrap_or(DEFAULT_MAX_CONCURRENT_STREAMS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn port_follows_tls() {
        let mut config = Config::default();
        assert_eq!(config.port(), 80);
        config.tls = true;
        assert_eq!(config.port(), 443);
        config.port = Some(8443);
        assert_eq!(config.port(), 8443);
    }

    #[test]
    fn stream_budget_takes_smallest_nonzero_source() {
        let config = Config::default();
        assert_eq!(config.stream_budget(Some(5)), 5);
        assert_eq!(config.stream_budget(None), 100);
        assert_eq!(config.stream_budget(Some(0)), 100);

        let config = Config {
            concurrency: 8,
            ..Config::default()
        };
        assert_eq!(config.stream_budget(Some(250)), 8);
    }

    #[test]
    fn stream_budget_falls_back_when_every_source_is_zero() {
        let config = Config {
            concurrency: 0,
            default_max_concurrent_streams: 0,
            ..Config::default()
        };
        assert_eq!(config.stream_budget(None), DEFAULT_MAX_CONCURRENT_STREAMS);
    }

    #[test]
    fn rejects_interval_not_below_timeout() {
        let config = Config {
            timeout_ms: 100,
            slow_read_interval_ms: 100,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config = serde_json::from_str(r#"{"host": "example.com", "tls": true}"#).unwrap();
        assert_eq!(config.host, "example.com");
        assert_eq!(config.port(), 443);
        assert_eq!(config.requests, 1000);
        assert_eq!(
            config.common_headers()[3],
            HeaderField::new(":authority", "example.com:443")
        );
    }
}
