//! Configuration file management for marcus.
//!
//! Provides a TOML-based config file at `~/.config/marcus/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default (§6.5).

use std::path::PathBuf;

use anyhow::{Context, Result};
use marcus_core::coordinator::CoordinatorConfig;
use marcus_core::infer::{InferConfig, InferPreset};
use marcus_core::lease::LeaseConfig;
use serde::{Deserialize, Serialize};

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub core: CoreSection,
    #[serde(default)]
    pub lease: LeaseSection,
    #[serde(default)]
    pub inference: InferenceSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CoreSection {
    pub data_dir: Option<String>,
    pub check_interval_seconds: Option<u64>,
    pub assignment_capacity_per_agent: Option<u32>,
    pub event_queue_max: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LeaseSection {
    pub default_minutes: Option<i64>,
    pub max_minutes: Option<i64>,
    pub max_renewals: Option<u32>,
    pub heartbeat_timeout_minutes: Option<i64>,
    pub auto_renew_threshold_minutes: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct InferenceSection {
    pub preset: Option<String>,
    pub pattern_confidence_threshold: Option<f64>,
    pub ai_confidence_threshold: Option<f64>,
    pub combined_confidence_boost: Option<f64>,
    pub max_ai_pairs_per_batch: Option<usize>,
    pub cache_ttl_hours: Option<i64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TimeoutsSection {
    pub board_timeout_seconds: Option<u64>,
    pub oracle_timeout_seconds: Option<u64>,
    pub ledger_timeout_seconds: Option<u64>,
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &["core", "lease", "inference", "timeouts"];

/// Parse `contents` as a [`ConfigFile`], logging a warning for any
/// unrecognized top-level key rather than rejecting it (§9: "unknown keys
/// ignored with a warning").
fn parse_config(contents: &str) -> Result<ConfigFile> {
    let raw: toml::Value = toml::from_str(contents).context("failed to parse config file")?;
    if let toml::Value::Table(table) = &raw {
        for key in table.keys() {
            if !KNOWN_TOP_LEVEL_KEYS.contains(&key.as_str()) {
                tracing::warn!(key = %key, "ignoring unrecognized config key");
            }
        }
    }
    let config: ConfigFile = toml::from_str(contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the marcus config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/marcus` or `~/.config/marcus`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("marcus");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("marcus")
}

/// Return the path to the marcus config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default data directory (§6.4 persisted state layout) when neither a
/// CLI flag nor a config entry names one.
pub fn default_data_dir() -> PathBuf {
    config_dir().join("data")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    load_config_from(&config_path())
}

/// Load and parse the config file at an explicit path (`--config` override).
pub fn load_config_from(path: &std::path::Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    parse_config(&contents)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    save_config_to(&config_path(), config)
}

/// Same as [`save_config`], writing to an explicit path (`--config` override).
pub fn save_config_to(path: &std::path::Path, config: &ConfigFile) -> Result<()> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_i64(name: &str) -> Option<i64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_f64(name: &str) -> Option<f64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn parse_preset(s: &str) -> InferPreset {
    match s {
        "conservative" => InferPreset::Conservative,
        "balanced" => InferPreset::Balanced,
        "aggressive" => InferPreset::Aggressive,
        "cost_optimized" => InferPreset::CostOptimized,
        "pattern_only" => InferPreset::PatternOnly,
        other => {
            tracing::warn!(preset = %other, "unrecognized inference_preset, falling back to balanced");
            InferPreset::Balanced
        }
    }
}

/// Fully resolved configuration, ready for use (§6.5).
#[derive(Debug)]
pub struct MarcusConfig {
    pub data_dir: PathBuf,
    pub check_interval_seconds: u64,
    pub lease_config: LeaseConfig,
    pub infer_config: InferConfig,
    pub coordinator_config: CoordinatorConfig,
    pub ledger_timeout_seconds: u64,
    pub event_queue_max: usize,
}

impl MarcusConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, for every key named in §6.5.
    pub fn resolve(cli_data_dir: Option<&str>) -> Result<Self> {
        Self::resolve_with_config_path(cli_data_dir, None)
    }

    /// Same as [`resolve`](Self::resolve), with an explicit config file
    /// path (`--config`) taking priority over the XDG default.
    pub fn resolve_with_config_path(cli_data_dir: Option<&str>, cli_config_path: Option<&str>) -> Result<Self> {
        let file = match cli_config_path {
            Some(path) => load_config_from(std::path::Path::new(path)).ok(),
            None => load_config().ok(),
        };

        let data_dir = cli_data_dir
            .map(PathBuf::from)
            .or_else(|| std::env::var("MARCUS_DATA_DIR").ok().map(PathBuf::from))
            .or_else(|| file.as_ref().and_then(|f| f.core.data_dir.clone()).map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let check_interval_seconds = env_u64("MARCUS_CHECK_INTERVAL_SECONDS")
            .or_else(|| file.as_ref().and_then(|f| f.core.check_interval_seconds))
            .unwrap_or(30);

        let assignment_capacity_per_agent = env_u32("MARCUS_ASSIGNMENT_CAPACITY_PER_AGENT")
            .or_else(|| file.as_ref().and_then(|f| f.core.assignment_capacity_per_agent))
            .unwrap_or(1);

        let event_queue_max = env_usize("MARCUS_EVENT_QUEUE_MAX")
            .or_else(|| file.as_ref().and_then(|f| f.core.event_queue_max))
            .unwrap_or(1000);

        let lease_config = LeaseConfig {
            default_minutes: env_i64("MARCUS_LEASE_DEFAULT_MINUTES")
                .or_else(|| file.as_ref().and_then(|f| f.lease.default_minutes))
                .unwrap_or(30),
            max_minutes: env_i64("MARCUS_LEASE_MAX_MINUTES")
                .or_else(|| file.as_ref().and_then(|f| f.lease.max_minutes))
                .unwrap_or(240),
            max_renewals: env_u32("MARCUS_MAX_RENEWALS")
                .or_else(|| file.as_ref().and_then(|f| f.lease.max_renewals))
                .unwrap_or(5),
            heartbeat_timeout_minutes: env_i64("MARCUS_HEARTBEAT_TIMEOUT_MINUTES")
                .or_else(|| file.as_ref().and_then(|f| f.lease.heartbeat_timeout_minutes))
                .unwrap_or(10),
            auto_renew_threshold_minutes: env_i64("MARCUS_AUTO_RENEW_THRESHOLD_MINUTES")
                .or_else(|| file.as_ref().and_then(|f| f.lease.auto_renew_threshold_minutes))
                .unwrap_or(10),
        };

        let preset = std::env::var("MARCUS_INFERENCE_PRESET")
            .ok()
            .or_else(|| file.as_ref().and_then(|f| f.inference.preset.clone()))
            .map(|s| parse_preset(&s))
            .unwrap_or_default();
        let mut infer_config = InferConfig::from_preset(preset);
        if let Some(v) = env_f64("MARCUS_PATTERN_CONFIDENCE_THRESHOLD")
            .or_else(|| file.as_ref().and_then(|f| f.inference.pattern_confidence_threshold))
        {
            infer_config.pattern_confidence_threshold = v;
        }
        if let Some(v) = env_f64("MARCUS_AI_CONFIDENCE_THRESHOLD")
            .or_else(|| file.as_ref().and_then(|f| f.inference.ai_confidence_threshold))
        {
            infer_config.ai_confidence_threshold = v;
        }
        if let Some(v) = env_f64("MARCUS_COMBINED_CONFIDENCE_BOOST")
            .or_else(|| file.as_ref().and_then(|f| f.inference.combined_confidence_boost))
        {
            infer_config.combined_confidence_boost = v;
        }
        if let Some(v) = env_usize("MARCUS_MAX_AI_PAIRS_PER_BATCH")
            .or_else(|| file.as_ref().and_then(|f| f.inference.max_ai_pairs_per_batch))
        {
            infer_config.max_ai_pairs_per_batch = v;
        }
        if let Some(v) = env_i64("MARCUS_CACHE_TTL_HOURS").or_else(|| file.as_ref().and_then(|f| f.inference.cache_ttl_hours)) {
            infer_config.cache_ttl_hours = v;
        }

        let board_timeout_seconds = env_u64("MARCUS_BOARD_TIMEOUT_SECONDS")
            .or_else(|| file.as_ref().and_then(|f| f.timeouts.board_timeout_seconds))
            .unwrap_or(10);
        let oracle_timeout_seconds = env_u64("MARCUS_ORACLE_TIMEOUT_SECONDS")
            .or_else(|| file.as_ref().and_then(|f| f.timeouts.oracle_timeout_seconds))
            .unwrap_or(30);
        let ledger_timeout_seconds = env_u64("MARCUS_LEDGER_TIMEOUT_SECONDS")
            .or_else(|| file.as_ref().and_then(|f| f.timeouts.ledger_timeout_seconds))
            .unwrap_or(2);

        let coordinator_config = CoordinatorConfig {
            assignment_capacity_per_agent,
            board_timeout: std::time::Duration::from_secs(board_timeout_seconds),
            oracle_timeout: std::time::Duration::from_secs(oracle_timeout_seconds),
        };

        Ok(Self {
            data_dir,
            check_interval_seconds,
            lease_config,
            infer_config,
            coordinator_config,
            ledger_timeout_seconds,
            event_queue_max,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
