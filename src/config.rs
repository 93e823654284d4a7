use anyhow::{anyhow, bail, Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone)]
pub struct Config {
    pub gateway_id: String,

    pub buffer_max_size: usize,
    pub batch_threshold: usize,
    pub offline_queue_max_batches: usize,

    pub upstream_url: Option<Url>,
    pub upload_timeout: Duration,
    pub simulated_upload_delay: Duration,

    pub auto_batch: bool,
    pub batch_poll_interval: Duration,
    pub batch_interval: Duration,
    pub retry_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let gateway_id = env_string(
            "NANOCLAW_GATEWAY_ID",
            Some("nanoclaw_gateway_001".to_string()),
        )?;
        if gateway_id.is_empty() {
            bail!("NANOCLAW_GATEWAY_ID must not be empty");
        }

        let buffer_max_size = env_u64("NANOCLAW_BUFFER_MAX_SIZE", Some(1000))? as usize;
        let batch_threshold = env_u64("NANOCLAW_BATCH_THRESHOLD", Some(100))? as usize;
        // 0 disables the cap.
        let offline_queue_max_batches =
            env_u64("NANOCLAW_OFFLINE_QUEUE_MAX_BATCHES", Some(1000))? as usize;

        let upstream_url = match env_optional("NANOCLAW_UPSTREAM_URL") {
            Some(raw) => {
                let url = Url::parse(&raw).context("invalid NANOCLAW_UPSTREAM_URL")?;
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("NANOCLAW_UPSTREAM_URL must be http or https");
                }
                Some(url)
            }
            None => None,
        };

        let upload_timeout =
            Duration::from_millis(env_u64("NANOCLAW_UPLOAD_TIMEOUT_MS", Some(10_000))?);
        let simulated_upload_delay =
            Duration::from_millis(env_u64("NANOCLAW_SIMULATED_UPLOAD_DELAY_MS", Some(100))?);

        let auto_batch = env_bool("NANOCLAW_AUTO_BATCH", true)?;
        let batch_poll_interval =
            Duration::from_millis(env_u64("NANOCLAW_BATCH_POLL_INTERVAL_MS", Some(1000))?);
        let batch_interval =
            Duration::from_secs(env_u64("NANOCLAW_BATCH_INTERVAL_SECONDS", Some(60))?);
        let retry_interval =
            Duration::from_secs(env_u64("NANOCLAW_RETRY_INTERVAL_SECONDS", Some(300))?);

        let config = Self {
            gateway_id,
            buffer_max_size,
            batch_threshold,
            offline_queue_max_batches,
            upstream_url,
            upload_timeout,
            simulated_upload_delay,
            auto_batch,
            batch_poll_interval,
            batch_interval,
            retry_interval,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_max_size == 0 {
            bail!("NANOCLAW_BUFFER_MAX_SIZE must be at least 1");
        }
        if self.batch_threshold == 0 || self.batch_threshold > self.buffer_max_size {
            bail!(
                "NANOCLAW_BATCH_THRESHOLD must be between 1 and the buffer size ({})",
                self.buffer_max_size
            );
        }
        if self.upload_timeout.is_zero() {
            bail!("NANOCLAW_UPLOAD_TIMEOUT_MS must be positive");
        }
        for (key, interval) in [
            ("NANOCLAW_BATCH_POLL_INTERVAL_MS", self.batch_poll_interval),
            ("NANOCLAW_BATCH_INTERVAL_SECONDS", self.batch_interval),
            ("NANOCLAW_RETRY_INTERVAL_SECONDS", self.retry_interval),
        ] {
            if interval.is_zero() {
                bail!("{key} must be positive");
            }
        }
        Ok(())
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env_optional(key) {
        Some(raw) => parse_bool(&raw).ok_or_else(|| anyhow!("invalid {key}: expected true/false")),
        None => Ok(default),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        gateway_id: "gw-test".to_string(),
        buffer_max_size: 3,
        batch_threshold: 2,
        offline_queue_max_batches: 0,
        upstream_url: None,
        upload_timeout: Duration::from_secs(5),
        simulated_upload_delay: Duration::from_millis(1),
        auto_batch: false,
        batch_poll_interval: Duration::from_millis(10),
        batch_interval: Duration::from_secs(60),
        retry_interval: Duration::from_secs(300),
    }
}
