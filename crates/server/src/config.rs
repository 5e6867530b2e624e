// crates/server/src/config.rs
//! Runtime configuration from command-line flags and environment variables.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use iavatar_observability::{LogConfig, LogFormat};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

/// Extra time a synchronous request waits beyond the inference timeout, to
/// cover queueing behind the admission gate and staging I/O.
pub const SYNC_WAIT_GRACE: Duration = Duration::from_secs(30);

/// Room for multipart framing and text fields on top of the two files.
const MULTIPART_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Parser)]
#[command(name = "iavatar", version, about = "Talking-head video generation service")]
pub struct Config {
    /// Address to bind.
    #[arg(long, env = "IAVATAR_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    pub host: IpAddr,

    /// Port to bind. Falls back to `PORT`, then 8000.
    #[arg(long, env = "IAVATAR_PORT")]
    pub port: Option<u16>,

    /// Inference executions allowed to run at once.
    #[arg(long, env = "IAVATAR_MAX_CONCURRENT_INFERENCE", default_value_t = 1)]
    pub max_concurrent_inference: usize,

    #[arg(long, env = "IAVATAR_INFERENCE_TIMEOUT_SECONDS", default_value_t = 120)]
    pub inference_timeout_seconds: u64,

    /// How long finished async jobs stay pollable.
    #[arg(long, env = "IAVATAR_JOB_TTL_SECONDS", default_value_t = 3600)]
    pub job_ttl_seconds: u64,

    #[arg(long, env = "IAVATAR_SWEEP_INTERVAL_SECONDS", default_value_t = 60)]
    pub sweep_interval_seconds: u64,

    /// Per-file upload ceiling in bytes.
    #[arg(long, env = "IAVATAR_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Directory for staged uploads and results. Falls back to `TEMP_DIR`,
    /// then `<system tmp>/iavatar`.
    #[arg(long, env = "IAVATAR_STAGING_DIR")]
    pub staging_dir: Option<PathBuf>,

    /// Checkout of the synthesis pipeline (contains `inference.py`).
    #[arg(long, env = "SADTALKER_PATH", default_value = "/workspace/SadTalker")]
    pub pipeline_root: PathBuf,

    /// Interpreter used to run the pipeline script.
    #[arg(long, env = "IAVATAR_PYTHON", default_value = "python")]
    pub python: String,

    /// `compact` or `json`.
    #[arg(long, env = "IAVATAR_LOG_FORMAT", default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    /// Also write daily rolling log files here.
    #[arg(long, env = "IAVATAR_LOG_DIR")]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: None,
            max_concurrent_inference: 1,
            inference_timeout_seconds: 120,
            job_ttl_seconds: 3600,
            sweep_interval_seconds: 60,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            staging_dir: None,
            pipeline_root: PathBuf::from("/workspace/SadTalker"),
            python: "python".into(),
            log_format: LogFormat::Compact,
            log_dir: None,
        }
    }
}

impl Config {
    /// Parse flags and environment, then apply the legacy variable fallbacks.
    pub fn load() -> Self {
        let mut config = Self::parse();
        config.apply_fallbacks(|key| std::env::var(key).ok());
        config
    }

    /// Fill unset options from `PORT` and `TEMP_DIR`.
    pub fn apply_fallbacks(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if self.port.is_none() {
            self.port = lookup("PORT").and_then(|p| p.parse().ok());
        }
        if self.staging_dir.is_none() {
            self.staging_dir = lookup("TEMP_DIR").map(PathBuf::from);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_inference == 0 {
            return Err(ConfigError::Zero("max_concurrent_inference"));
        }
        if self.inference_timeout_seconds == 0 {
            return Err(ConfigError::Zero("inference_timeout_seconds"));
        }
        if self.max_upload_bytes == 0 {
            return Err(ConfigError::Zero("max_upload_bytes"));
        }
        if self.sweep_interval_seconds == 0 {
            return Err(ConfigError::Zero("sweep_interval_seconds"));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("iavatar"))
    }

    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_seconds)
    }

    /// Upper bound on how long `/generate-avatar` blocks.
    pub fn sync_wait(&self) -> Duration {
        self.inference_timeout() + SYNC_WAIT_GRACE
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    /// Whole-request body limit. Larger than two files so the per-file check
    /// can report which upload was too big.
    pub fn body_limit(&self) -> usize {
        self.max_upload_bytes
            .saturating_mul(2)
            .saturating_add(MULTIPART_OVERHEAD_BYTES)
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            format: self.log_format,
            dir: self.log_dir.clone(),
            ..LogConfig::default()
        }
    }
}
