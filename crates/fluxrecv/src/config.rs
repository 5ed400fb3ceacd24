use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use fluxrecv_flux::{DEFAULT_API_BASE, DEFAULT_SYNC_TIMEOUT};
use fluxrecv_pubsub::subscription::DEFAULT_MAX_OUTSTANDING_MESSAGES;
use fluxrecv_relay::DEFAULT_HANDOFF_CAPACITY;

use crate::cli::Cli;

pub const FLUX_TOKEN_ENV: &str = "FLUX_TOKEN";

/// Keys accepted in the TOML config file. Durations are strings in the
/// same format as the command line.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(alias = "projectId")]
    pub project_id: Option<String>,
    #[serde(alias = "subId")]
    pub sub_id: Option<String>,
    #[serde(alias = "topicId")]
    pub topic_id: Option<String>,
    #[serde(alias = "syncTimeout")]
    pub sync_timeout: Option<String>,
    pub flux_url: Option<String>,
    pub flux_token: Option<String>,
    pub max_outstanding: Option<usize>,
    pub synchronous: Option<bool>,
    pub handoff_capacity: Option<usize>,
    pub pubsub_endpoint: Option<String>,
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub project_id: Option<String>,
    pub sub_id: String,
    pub topic_id: Option<String>,
    pub sync_timeout: Duration,
    pub flux_url: String,
    pub flux_token: Option<String>,
    pub max_outstanding: usize,
    pub synchronous: bool,
    pub handoff_capacity: usize,
    pub pubsub_endpoint: Option<String>,
}

/// `~/.config/fluxrecv/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("fluxrecv").join("config.toml"))
}

pub fn load_file(path: &Path) -> anyhow::Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config = toml::from_str(&content)
        .with_context(|| format!("invalid config file {}", path.display()))?;
    Ok(config)
}

/// An explicit `--config` must exist; the default location is optional.
pub fn load(cli: &Cli) -> anyhow::Result<FileConfig> {
    if let Some(path) = &cli.config {
        return load_file(path);
    }
    match default_config_path() {
        Some(path) if path.is_file() => load_file(&path),
        _ => Ok(FileConfig::default()),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl Settings {
    /// Command line first, then the config file, then the environment for
    /// the Flux token, then built-in defaults.
    pub fn resolve(cli: Cli, file: FileConfig, env_token: Option<String>) -> anyhow::Result<Self> {
        let sub_id = non_empty(cli.sub_id.or(file.sub_id))
            .context("a subscription id is required (--sub-id)")?;

        let sync_timeout = match (cli.sync_timeout, file.sync_timeout) {
            (Some(d), _) => d,
            (None, Some(s)) => parse_duration(&s)
                .map_err(|e| anyhow::anyhow!("invalid sync-timeout in config file: {e}"))?,
            (None, None) => DEFAULT_SYNC_TIMEOUT,
        };
        if sync_timeout.is_zero() {
            anyhow::bail!("sync-timeout must be greater than zero");
        }

        let max_outstanding = cli
            .max_outstanding
            .or(file.max_outstanding)
            .unwrap_or(DEFAULT_MAX_OUTSTANDING_MESSAGES);
        if max_outstanding == 0 {
            anyhow::bail!("max-outstanding must be at least 1");
        }

        Ok(Self {
            project_id: non_empty(cli.project_id.or(file.project_id)),
            sub_id,
            topic_id: non_empty(cli.topic_id.or(file.topic_id)),
            sync_timeout,
            flux_url: non_empty(cli.flux_url.or(file.flux_url))
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            flux_token: non_empty(cli.flux_token.or(file.flux_token).or(env_token)),
            max_outstanding,
            synchronous: cli.synchronous.or(file.synchronous).unwrap_or(true),
            handoff_capacity: cli
                .handoff_capacity
                .or(file.handoff_capacity)
                .unwrap_or(DEFAULT_HANDOFF_CAPACITY),
            pubsub_endpoint: non_empty(cli.pubsub_endpoint.or(file.pubsub_endpoint)),
        })
    }
}

/// Parse `500ms`, `30s`, `2m`, `1h` or bare seconds.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let parse = |n: &str| {
        n.trim()
            .parse::<u64>()
            .map_err(|_| format!("invalid duration '{s}'"))
    };
    let scaled = |n: &str, unit: u64| {
        parse(n)?
            .checked_mul(unit)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is out of range"))
    };
    if let Some(ms) = s.strip_suffix("ms") {
        parse(ms).map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        parse(secs).map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        parse(s).map(Duration::from_secs)
    }
}
