use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use ipnet::IpNet;

use crate::decision_log::{Backpressure, LoggerConfig};
use crate::mitigation::{IndicatorType, MitigationConfig};
use crate::policy::RetryPolicy;

/// Command line entry point.
#[derive(Debug, Parser)]
#[command(name = "edgeguard")]
#[command(about = "Edge traffic-policy evaluation engine", version)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "RUST_LOG")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value = "false", env = "EDGEGUARD_LOG_JSON")]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the evaluation server
    Serve(Config),

    /// Push an emergency block rule to a running server
    PushBlock(PushBlockArgs),

    /// Aggregate KPIs from a decision log file
    Kpi(KpiArgs),
}

/// Server configuration.
#[derive(Debug, Clone, Args)]
pub struct Config {
    /// HTTP server listen address
    #[arg(long, default_value = "0.0.0.0:8080", env = "EDGEGUARD_LISTEN_ADDR")]
    pub listen_addr: String,

    /// Proxies whose X-Forwarded-For header is honoured (comma-separated CIDRs)
    #[arg(long, value_delimiter = ',', env = "EDGEGUARD_TRUSTED_PROXIES")]
    pub trusted_proxies: Vec<IpNet>,

    /// Path to policy YAML file
    #[arg(long, default_value = "policy.yaml", env = "EDGEGUARD_POLICY_PATH")]
    pub policy_path: PathBuf,

    /// Path to the gzip decision log
    #[arg(
        long,
        default_value = "decisions.log.gz",
        env = "EDGEGUARD_DECISION_LOG_PATH"
    )]
    pub decision_log_path: PathBuf,

    /// Policy reload check interval in seconds
    #[arg(long, default_value = "30", env = "EDGEGUARD_POLICY_RELOAD_SECS")]
    pub policy_reload_secs: u64,

    /// Decision log buffer capacity (records)
    #[arg(long, default_value = "10000", env = "EDGEGUARD_LOG_BUFFER")]
    pub log_buffer: usize,

    /// Records per delivered batch
    #[arg(long, default_value = "500", env = "EDGEGUARD_LOG_BATCH")]
    pub log_batch: usize,

    /// Flush interval for partial batches in milliseconds
    #[arg(long, default_value = "1000", env = "EDGEGUARD_LOG_FLUSH_MS")]
    pub log_flush_ms: u64,

    /// What to do when the log buffer is full
    #[arg(
        long,
        value_enum,
        default_value = "drop-oldest",
        env = "EDGEGUARD_LOG_BACKPRESSURE"
    )]
    pub log_backpressure: BackpressureMode,

    /// Longest wait for buffer space in block mode, milliseconds
    #[arg(long, default_value = "50", env = "EDGEGUARD_LOG_BLOCK_TIMEOUT_MS")]
    pub log_block_timeout_ms: u64,

    /// Deadline for a mitigation push in seconds
    #[arg(long, default_value = "60", env = "EDGEGUARD_MITIGATION_SLA_SECS")]
    pub mitigation_sla_secs: u64,

    /// Lowest priority of the mitigation band
    #[arg(long, default_value = "1000", env = "EDGEGUARD_MITIGATION_BAND_MIN")]
    pub mitigation_band_min: u32,

    /// Highest priority of the mitigation band
    #[arg(long, default_value = "1999", env = "EDGEGUARD_MITIGATION_BAND_MAX")]
    pub mitigation_band_max: u32,

    /// Publish attempts before a conflict is surfaced
    #[arg(long, default_value = "5", env = "EDGEGUARD_PUBLISH_ATTEMPTS")]
    pub publish_attempts: u32,

    /// Backoff after the first publish conflict in milliseconds
    #[arg(long, default_value = "50", env = "EDGEGUARD_PUBLISH_BACKOFF_MS")]
    pub publish_backoff_ms: u64,

    /// Expired mitigation sweep interval in seconds
    #[arg(long, default_value = "10", env = "EDGEGUARD_SWEEP_SECS")]
    pub sweep_secs: u64,

    /// Token required to promote staged policies (promotion disabled if unset)
    #[arg(long, env = "EDGEGUARD_APPROVAL_TOKEN", hide_env_values = true)]
    pub approval_token: Option<String>,

    /// Policy versions retained for rollback
    #[arg(long, default_value = "32", env = "EDGEGUARD_HISTORY_LIMIT")]
    pub history_limit: usize,

    /// Enable graceful shutdown
    #[arg(long, default_value = "true", env = "EDGEGUARD_GRACEFUL_SHUTDOWN")]
    pub graceful_shutdown: bool,

    /// Graceful shutdown timeout in seconds
    #[arg(long, default_value = "30", env = "EDGEGUARD_SHUTDOWN_TIMEOUT_SECS")]
    pub shutdown_timeout_secs: u64,
}

/// Log buffer overflow policy as given on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackpressureMode {
    DropOldest,
    Block,
}

#[derive(Debug, Clone, Args)]
pub struct PushBlockArgs {
    /// Base URL of the running server
    #[arg(long, default_value = "http://127.0.0.1:8080", env = "EDGEGUARD_SERVER")]
    pub server: String,

    /// Indicator kind
    #[arg(long = "type", value_enum, default_value = "ip-cidr")]
    pub indicator_type: IndicatorKind,

    /// CIDR or URI regex to block
    pub indicator: String,

    /// Expire the rule after this many seconds
    #[arg(long)]
    pub ttl: Option<u64>,

    /// Client-side request timeout in seconds
    #[arg(long, default_value = "65")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum IndicatorKind {
    IpCidr,
    UriPattern,
}

impl From<IndicatorKind> for IndicatorType {
    fn from(kind: IndicatorKind) -> Self {
        match kind {
            IndicatorKind::IpCidr => IndicatorType::IpCidr,
            IndicatorKind::UriPattern => IndicatorType::UriPattern,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct KpiArgs {
    /// Decision log file to read
    #[arg(
        long,
        default_value = "decisions.log.gz",
        env = "EDGEGUARD_DECISION_LOG_PATH"
    )]
    pub log_path: PathBuf,

    /// Window start, epoch milliseconds (default: seven days before end)
    #[arg(long)]
    pub start: Option<i64>,

    /// Window end, epoch milliseconds (default: now)
    #[arg(long)]
    pub end: Option<i64>,
}

impl Config {
    /// Get policy reload interval as Duration.
    pub fn policy_reload_interval(&self) -> Duration {
        Duration::from_secs(self.policy_reload_secs.max(1))
    }

    /// Get shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Get sweep interval as Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_secs.max(1))
    }

    /// Retry policy shared by publishers.
    pub fn publish_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.publish_attempts,
            Duration::from_millis(self.publish_backoff_ms),
            Duration::from_secs(2),
        )
    }

    pub fn logger_config(&self) -> LoggerConfig {
        let backpressure = match self.log_backpressure {
            BackpressureMode::DropOldest => Backpressure::DropOldest,
            BackpressureMode::Block => Backpressure::Block {
                timeout: Duration::from_millis(self.log_block_timeout_ms),
            },
        };

        LoggerConfig {
            capacity: self.log_buffer.max(1),
            batch_size: self.log_batch.clamp(1, self.log_buffer.max(1)),
            flush_interval: Duration::from_millis(self.log_flush_ms.max(1)),
            backpressure,
            ..LoggerConfig::default()
        }
    }

    pub fn mitigation_config(&self) -> MitigationConfig {
        MitigationConfig {
            sla: Duration::from_secs(self.mitigation_sla_secs),
            band_min: self.mitigation_band_min,
            band_max: self.mitigation_band_max,
            retry: self.publish_retry(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_addr: "0.0.0.0:8080".to_string(),
            trusted_proxies: Vec::new(),
            policy_path: PathBuf::from("policy.yaml"),
            decision_log_path: PathBuf::from("decisions.log.gz"),
            policy_reload_secs: 30,
            log_buffer: 10_000,
            log_batch: 500,
            log_flush_ms: 1000,
            log_backpressure: BackpressureMode::DropOldest,
            log_block_timeout_ms: 50,
            mitigation_sla_secs: 60,
            mitigation_band_min: 1000,
            mitigation_band_max: 1999,
            publish_attempts: 5,
            publish_backoff_ms: 50,
            sweep_secs: 10,
            approval_token: None,
            history_limit: 32,
            graceful_shutdown: true,
            shutdown_timeout_secs: 30,
        }
    }
}
