use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Values taken from the command line. They override the environment and the
/// configuration file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub base_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub log_file: Option<PathBuf>,
    pub blocks_enable: Option<bool>,
    pub heads_enable: Option<bool>,
    pub attestations_enable: Option<bool>,
}

/// Top-level configuration.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Minimum level of messages to log. Default: "info".
    #[serde(default = "default_log_level", rename = "log-level")]
    pub log_level: String,

    /// Redirect log output to a file.
    #[serde(default, rename = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Upstream consensus node configuration.
    #[serde(default, rename = "consensusclient")]
    pub consensus_client: ConsensusClientConfig,

    /// Downstream collector configuration.
    #[serde(default)]
    pub submitter: SubmitterConfig,

    /// Metrics presentation configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Block delay reporting.
    #[serde(default)]
    pub blocks: FeatureConfig,

    /// Head delay reporting.
    #[serde(default)]
    pub heads: FeatureConfig,

    /// Attestation reporting and aggregation.
    #[serde(default)]
    pub attestations: FeatureConfig,
}

#[derive(Debug, Deserialize)]
pub struct ConsensusClientConfig {
    /// Addresses of the consensus nodes to watch. Required.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Request timeout. Default: 2m.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub struct SubmitterConfig {
    /// Submission style. Default: immediate.
    #[serde(default)]
    pub style: SubmitterStyle,

    /// Collector base URLs.
    #[serde(default, rename = "base-urls")]
    pub base_urls: Vec<String>,

    /// Single collector base URL; ignored when base-urls is set.
    #[serde(default, rename = "base-url")]
    pub base_url: Option<String>,
}

impl SubmitterConfig {
    /// The effective collector list.
    pub fn base_urls(&self) -> Vec<String> {
        if !self.base_urls.is_empty() {
            return self.base_urls.clone();
        }

        self.base_url.iter().cloned().collect()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmitterStyle {
    #[default]
    Immediate,
    Console,
}

impl FromStr for SubmitterStyle {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "immediate" => Ok(Self::Immediate),
            "console" => Ok(Self::Console),
            other => bail!("unknown submitter style {other:?}"),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub prometheus: PrometheusConfig,
}

#[derive(Debug, Default, Deserialize)]
pub struct PrometheusConfig {
    /// Address to serve /metrics on; metrics are disabled when unset.
    #[serde(default, rename = "listen-address")]
    pub listen_address: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FeatureConfig {
    /// Default: true.
    #[serde(default = "default_true")]
    pub enable: bool,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: None,
            consensus_client: ConsensusClientConfig::default(),
            submitter: SubmitterConfig::default(),
            metrics: MetricsConfig::default(),
            blocks: FeatureConfig::default(),
            heads: FeatureConfig::default(),
            attestations: FeatureConfig::default(),
        }
    }
}

impl Default for ConsensusClientConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            timeout: default_timeout(),
        }
    }
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

// --- Loading, layering and validation ---

impl Config {
    /// Loads configuration in precedence order: command-line overrides, then
    /// `PROBEC_*` environment variables, then the configuration file, then
    /// built-in defaults. A missing file is fine; an unreadable one is not.
    pub fn load(overrides: &Overrides) -> Result<Self> {
        let mut cfg = match find_config_file(overrides.base_dir.as_deref()) {
            Some(path) => {
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_yaml::from_str(&data)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Config::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.apply_overrides(overrides);
        cfg.validate()?;

        Ok(cfg)
    }

    /// Applies `PROBEC_*` environment variables; `-` and `.` in key names
    /// both map to `_`.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = var("PROBEC_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Some(v) = var("PROBEC_LOG_FILE") {
            self.log_file = Some(PathBuf::from(v));
        }
        if let Some(v) = var("PROBEC_CONSENSUSCLIENT_ADDRESSES") {
            self.consensus_client.addresses = split_list(&v);
        }
        if let Some(v) = var("PROBEC_CONSENSUSCLIENT_TIMEOUT") {
            self.consensus_client.timeout = humantime::parse_duration(&v)
                .with_context(|| format!("parsing consensusclient.timeout {v:?}"))?;
        }
        if let Some(v) = var("PROBEC_SUBMITTER_STYLE") {
            self.submitter.style = v.parse()?;
        }
        if let Some(v) = var("PROBEC_SUBMITTER_BASE_URLS") {
            self.submitter.base_urls = split_list(&v);
        }
        if let Some(v) = var("PROBEC_SUBMITTER_BASE_URL") {
            self.submitter.base_url = Some(v);
        }
        if let Some(v) = var("PROBEC_METRICS_PROMETHEUS_LISTEN_ADDRESS") {
            self.metrics.prometheus.listen_address = Some(v);
        }
        if let Some(v) = var("PROBEC_BLOCKS_ENABLE") {
            self.blocks.enable = parse_bool("blocks.enable", &v)?;
        }
        if let Some(v) = var("PROBEC_HEADS_ENABLE") {
            self.heads.enable = parse_bool("heads.enable", &v)?;
        }
        if let Some(v) = var("PROBEC_ATTESTATIONS_ENABLE") {
            self.attestations.enable = parse_bool("attestations.enable", &v)?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(level) = &overrides.log_level {
            self.log_level = level.clone();
        }
        if let Some(file) = &overrides.log_file {
            self.log_file = Some(file.clone());
        }
        if let Some(enable) = overrides.blocks_enable {
            self.blocks.enable = enable;
        }
        if let Some(enable) = overrides.heads_enable {
            self.heads.enable = enable;
        }
        if let Some(enable) = overrides.attestations_enable {
            self.attestations.enable = enable;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.consensus_client.addresses.is_empty() {
            bail!("no consensus client addresses provided");
        }

        if self.submitter.style == SubmitterStyle::Immediate
            && self.submitter.base_urls().is_empty()
        {
            bail!("submitter base URL not supplied");
        }

        Ok(())
    }
}

/// Looks for `<base-dir>/execd.*` when a base directory is given, otherwise
/// `$HOME/.probec.*`.
fn find_config_file(base_dir: Option<&Path>) -> Option<PathBuf> {
    let (dir, stem) = match base_dir {
        Some(dir) => (dir.to_path_buf(), "execd"),
        None => (PathBuf::from(std::env::var_os("HOME")?), ".probec"),
    };

    ["yaml", "yml", "json"]
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|path| path.is_file())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => bail!("invalid boolean for {key}: {other:?}"),
    }
}
