use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use tracing::info;

use crate::client::parse_trusted_proxies;
use crate::limits::AdmissionConfig;
use crate::upload::DEFAULT_MAX_UPLOAD_BYTES;

const DEFAULT_PORT: u16 = 3001;
const DEFAULT_UPLOAD_DIR: &str = "uploads";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: usize,
    pub admission: AdmissionConfig,
    /// Run a background ledger sweep in addition to lazy pruning.
    pub sweep: bool,
    pub trusted_proxies: Vec<IpNet>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AdmissionConfig::default();

        let admission = AdmissionConfig {
            concurrency_ceiling: parse_or(
                &lookup,
                "UPLOAD_CONCURRENCY",
                defaults.concurrency_ceiling,
            )?,
            hourly_ceiling: parse_or(&lookup, "UPLOAD_HOURLY_LIMIT", defaults.hourly_ceiling)?,
            minute_ceiling: parse_or(&lookup, "UPLOAD_MINUTE_LIMIT", defaults.minute_ceiling)?,
            five_minute_ceiling: parse_or(
                &lookup,
                "UPLOAD_BURST_LIMIT",
                defaults.five_minute_ceiling,
            )?,
            min_spacing: Duration::from_millis(parse_or(
                &lookup,
                "UPLOAD_MIN_SPACING_MS",
                millis(defaults.min_spacing),
            )?),
            cleanup_interval: Duration::from_millis(parse_or(
                &lookup,
                "UPLOAD_CLEANUP_INTERVAL_MS",
                millis(defaults.cleanup_interval),
            )?),
        };

        let max_upload_mb: usize = parse_or(
            &lookup,
            "MAX_UPLOAD_MB",
            DEFAULT_MAX_UPLOAD_BYTES / (1024 * 1024),
        )?;

        let sweep = parse_flag(&lookup, "UPLOAD_SWEEP")?;

        let trusted_proxies = lookup("TRUSTED_PROXIES")
            .map(|v| parse_trusted_proxies(&v))
            .unwrap_or_default();

        let config = Self {
            port: parse_port(&lookup)?,
            upload_dir: lookup("UPLOAD_DIR")
                .filter(|v| !v.trim().is_empty())
                .map_or_else(|| PathBuf::from(DEFAULT_UPLOAD_DIR), PathBuf::from),
            max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
            admission,
            sweep,
            trusted_proxies,
        };

        info!(
            "Upload limits: {} concurrent, {}/hour, {}/minute, {}/5 minutes, {:?} spacing",
            config.admission.concurrency_ceiling,
            config.admission.hourly_ceiling,
            config.admission.minute_ceiling,
            config.admission.five_minute_ceiling,
            config.admission.min_spacing
        );

        Ok(config)
    }
}

/// Parses the port number from environment variables.
/// Checks PORT first, then FEEDBACK_UPLOADS_PORT, defaulting to 3001.
/// Returns an error if the port value is invalid.
pub fn parse_port<F>(lookup: &F) -> anyhow::Result<u16>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(port_str) = lookup("PORT").or_else(|| lookup("FEEDBACK_UPLOADS_PORT")) else {
        return Ok(DEFAULT_PORT);
    };
    port_str.trim().parse::<u16>().map_err(|e| {
        anyhow::anyhow!(
            "Invalid port value '{}': {}. Port must be a number between 1 and 65535",
            port_str,
            e
        )
    })
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid {} value '{}': {}", key, raw, e)),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> anyhow::Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(false);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        _ => Err(anyhow::anyhow!(
            "Invalid {} value '{}': expected 1/true/yes or 0/false/no",
            key,
            raw
        )),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
