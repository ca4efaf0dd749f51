//! Configuration loading and management.
//!
//! Loads gate configuration from `./straylight.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file values;
//! file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::gate::policy::PolicyConfig;

// ── Top-level config ────────────────────────────────────────────

/// Top-level gate configuration loaded from TOML.
///
/// Path: `./straylight.toml` or `$STRAYLIGHT_CONFIG_PATH`.
/// Env vars override file values; file values override defaults.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct GateConfig {
    /// Runtime settings (`[runtime]`).
    pub runtime: RuntimeConfig,
    /// Filesystem paths for persistent state (`[paths]`).
    pub paths: PathsConfig,
    /// Token issuer key set (`[token]`).
    pub token: TokenConfig,
    /// Initial admission policy (`[policy]`), used until the first
    /// committed operator update. A policy file on disk takes precedence.
    pub policy: PolicyConfig,
}

impl GateConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./straylight.toml`.
    /// If the file does not exist, returns defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing config file cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from the TOML file only, no env overrides.
    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: GateConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(GateConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve the config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        if let Some(p) = env("STRAYLIGHT_CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("straylight.toml")
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability.
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Runtime.
        if let Some(v) = env("STRAYLIGHT_BIND_ADDR") {
            self.runtime.bind_addr = v;
        }
        if let Some(v) = env("STRAYLIGHT_LOG_LEVEL") {
            self.runtime.log_level = v;
        }
        if let Some(v) = env("STRAYLIGHT_SWEEP_INTERVAL_SECS") {
            match v.parse() {
                Ok(n) => self.runtime.sweep_interval_secs = n,
                Err(_) => tracing::warn!(
                    var = "STRAYLIGHT_SWEEP_INTERVAL_SECS",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Paths.
        if let Some(v) = env("STRAYLIGHT_POLICY_FILE") {
            self.paths.policy_file = v;
        }
        if let Some(v) = env("STRAYLIGHT_AUDIT_DB") {
            self.paths.audit_db = v;
        }
        if let Some(v) = env("STRAYLIGHT_TRIP_FILE") {
            self.paths.trip_file = v;
        }
        if let Some(v) = env("STRAYLIGHT_LOGS_DIR") {
            self.paths.logs_dir = v;
        }

        // Token — "issuer:hexkey" adds or replaces one issuer entry.
        if let Some(v) = env("STRAYLIGHT_ISSUER_KEY") {
            match v.split_once(':') {
                Some((issuer, key)) if !issuer.is_empty() && !key.is_empty() => {
                    self.token
                        .issuers
                        .insert(issuer.to_owned(), key.to_owned());
                }
                _ => tracing::warn!(
                    var = "STRAYLIGHT_ISSUER_KEY",
                    "ignoring override; expected 'issuer:hexkey'"
                ),
            }
        }
    }
}

// ── Runtime ─────────────────────────────────────────────────────

/// Runtime settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// HTTP listen address.
    pub bind_addr: String,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Cadence of the timeout/expiry sweeper.
    pub sweep_interval_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8437".to_owned(),
            log_level: "info".to_owned(),
            sweep_interval_secs: 30,
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Committed policy file (durable across restarts).
    pub policy_file: String,
    /// Append-only audit event database.
    pub audit_db: String,
    /// Emergency trip file the watchdog watches.
    pub trip_file: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = default_data_dir();
        Self {
            policy_file: base.join("policy.toml").to_string_lossy().into_owned(),
            audit_db: base.join("audit.db").to_string_lossy().into_owned(),
            trip_file: base.join("emergency.trip").to_string_lossy().into_owned(),
            logs_dir: base.join("logs").to_string_lossy().into_owned(),
        }
    }
}

/// Platform data directory for gate state, with a local fallback.
fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "straylight")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./straylight-data"))
}

// ── Token ───────────────────────────────────────────────────────

/// Token issuer key set.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Issuer name → hex-encoded HMAC key.
    pub issuers: HashMap<String, String>,
}

impl TokenConfig {
    /// Decode the configured issuer keys.
    ///
    /// # Errors
    ///
    /// Returns an error naming the issuer whose key is not valid hex.
    pub fn issuer_keys(&self) -> Result<HashMap<String, Vec<u8>>> {
        let mut keys = HashMap::new();
        for (issuer, hex_key) in &self.issuers {
            let key = hex::decode(hex_key)
                .with_context(|| format!("issuer '{issuer}' key is not valid hex"))?;
            keys.insert(issuer.clone(), key);
        }
        Ok(keys)
    }
}
