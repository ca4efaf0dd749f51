//! Policy configuration and the operator-controlled policy store.
//!
//! The committed [`PolicyConfig`] is held behind an atomically swapped
//! snapshot: request handling reads a fresh `Arc` clone and never observes a
//! partially applied update. Updates are validated before commit — a broken
//! candidate is rejected and the previous config keeps serving (fail-closed).

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{GateMode, TrustLevel};

/// Per-session quota limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionLimits {
    /// Work units one session may be granted in total.
    pub max_work_units_per_session: u64,
    /// Admissible requests one session may make in total.
    pub max_requests_per_session: u64,
    /// Idle time after which a session is expired.
    pub session_ttl_secs: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_work_units_per_session: 100,
            max_requests_per_session: 500,
            session_ttl_secs: 1800,
        }
    }
}

/// In-flight concurrency ceilings — hard limits no mode bypasses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyLimits {
    /// Gate-wide ceiling on in-flight work items.
    pub max_in_flight: u64,
    /// Per-agent ceiling on in-flight work items.
    pub max_in_flight_per_agent: u64,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            max_in_flight_per_agent: 32,
        }
    }
}

/// Thresholds for the security sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityLimits {
    /// Admission attempts one session may make within a rolling minute
    /// before it is quarantined.
    pub max_requests_per_minute: u32,
}

impl Default for SecurityLimits {
    fn default() -> Self {
        Self {
            max_requests_per_minute: 120,
        }
    }
}

/// Operator-controlled gate policy. Versioned; swapped atomically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Global kill switch. `false` denies everything regardless of any
    /// other field or credential.
    pub reflection_enabled: bool,
    /// Operating mode.
    pub mode: GateMode,
    /// Agents admissible at all. An empty whitelist denies every agent.
    pub agent_whitelist: BTreeSet<String>,
    /// Per-agent blessing requirement, overriding the mode default.
    pub per_agent_blessing: BTreeMap<String, bool>,
    /// Optional per-agent work-unit caps, enforced independently of the
    /// session-wide cap.
    pub per_agent_work_unit_cap: BTreeMap<String, u64>,
    /// Session quota limits.
    pub session_limits: SessionLimits,
    /// In-flight concurrency ceilings.
    pub concurrency: ConcurrencyLimits,
    /// Security sentinel thresholds.
    pub security: SecurityLimits,
    /// Factor applied to numeric session limits in `Development` mode.
    pub development_limit_multiplier: u64,
    /// Age after which an in-flight work item is reclaimed by the sweeper.
    pub work_max_age_secs: u64,
    /// Monotonic config version, bumped on every committed update.
    pub version: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            reflection_enabled: true,
            mode: GateMode::BlessingRequired,
            agent_whitelist: BTreeSet::new(),
            per_agent_blessing: BTreeMap::new(),
            per_agent_work_unit_cap: BTreeMap::new(),
            session_limits: SessionLimits::default(),
            concurrency: ConcurrencyLimits::default(),
            security: SecurityLimits::default(),
            development_limit_multiplier: 10,
            work_max_age_secs: 900,
            version: 0,
        }
    }
}

impl PolicyConfig {
    /// Whether the global kill switch is engaged.
    pub fn kill_switch_engaged(&self) -> bool {
        !self.reflection_enabled || self.mode == GateMode::EmergencySafe
    }

    /// Quota limits in force for one agent under this config.
    ///
    /// `Development` mode raises the numeric limits by the configured
    /// multiplier; every other mode applies them as written.
    pub fn quota_for(&self, agent_id: &str) -> crate::gate::ledger::QuotaLimits {
        let multiplier = if self.mode == GateMode::Development {
            self.development_limit_multiplier
        } else {
            1
        };
        crate::gate::ledger::QuotaLimits {
            max_work_units: self
                .session_limits
                .max_work_units_per_session
                .saturating_mul(multiplier),
            max_requests: self
                .session_limits
                .max_requests_per_session
                .saturating_mul(multiplier),
            per_agent_cap: self
                .per_agent_work_unit_cap
                .get(agent_id)
                .map(|cap| cap.saturating_mul(multiplier)),
        }
    }

    /// Session TTL as a chrono duration.
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.session_limits.session_ttl_secs).unwrap_or(i64::MAX))
    }

    /// Reject internally inconsistent configs before they are committed.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidConfig`] naming the first broken field.
    pub fn validate(&self) -> Result<(), PolicyError> {
        fn broken(reason: &str) -> Result<(), PolicyError> {
            Err(PolicyError::InvalidConfig {
                reason: reason.to_owned(),
            })
        }

        if self.session_limits.max_work_units_per_session == 0 {
            return broken("session_limits.max_work_units_per_session must be at least 1");
        }
        if self.session_limits.max_requests_per_session == 0 {
            return broken("session_limits.max_requests_per_session must be at least 1");
        }
        if self.session_limits.session_ttl_secs == 0 {
            return broken("session_limits.session_ttl_secs must be at least 1");
        }
        if self.concurrency.max_in_flight == 0 {
            return broken("concurrency.max_in_flight must be at least 1");
        }
        if self.concurrency.max_in_flight_per_agent == 0 {
            return broken("concurrency.max_in_flight_per_agent must be at least 1");
        }
        if self.concurrency.max_in_flight_per_agent > self.concurrency.max_in_flight {
            return broken("concurrency.max_in_flight_per_agent exceeds max_in_flight");
        }
        if self.security.max_requests_per_minute == 0 {
            return broken("security.max_requests_per_minute must be at least 1");
        }
        if self.development_limit_multiplier == 0 {
            return broken("development_limit_multiplier must be at least 1");
        }
        if self.work_max_age_secs == 0 {
            return broken("work_max_age_secs must be at least 1");
        }
        if let Some((agent, _)) = self.per_agent_work_unit_cap.iter().find(|(_, cap)| **cap == 0)
        {
            return Err(PolicyError::InvalidConfig {
                reason: format!("per_agent_work_unit_cap for '{agent}' must be at least 1"),
            });
        }
        Ok(())
    }
}

/// Errors from policy loading and updates.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Updater credential is below `SystemBlessed`.
    #[error("policy update requires a system-blessed credential, got {presented:?}")]
    Unauthorized {
        /// Level the updater presented.
        presented: TrustLevel,
    },

    /// Candidate config failed validation; the prior config stays active.
    #[error("invalid policy config: {reason}")]
    InvalidConfig {
        /// First broken field.
        reason: String,
    },

    /// The committed config could not be read or written.
    #[error("policy persistence failed: {0}")]
    Io(#[from] std::io::Error),

    /// The policy file is not valid TOML.
    #[error("policy file is not valid TOML: {0}")]
    Decode(#[from] toml::de::Error),

    /// The config could not be encoded for persistence.
    #[error("policy encoding failed: {0}")]
    Encode(#[from] toml::ser::Error),
}

/// Holds the committed policy and serializes updates.
///
/// Readers take an `Arc` snapshot; the write path swaps the whole `Arc`, so
/// a reader either sees the old config or the new one, never a mix.
pub struct PolicyStore {
    current: RwLock<Arc<PolicyConfig>>,
    /// Where committed configs are persisted. `None` keeps the store
    /// memory-only (tests).
    path: Option<PathBuf>,
}

impl PolicyStore {
    /// Create a store from an already validated config.
    pub fn new(config: PolicyConfig, path: Option<PathBuf>) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            path,
        }
    }

    /// Load the committed policy from disk, falling back to `initial` when
    /// no policy file exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read, parsed, or
    /// fails validation — a broken policy file is never served.
    pub fn open(path: &Path, initial: PolicyConfig) -> Result<Self, PolicyError> {
        initial.validate()?;
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                let loaded: PolicyConfig = toml::from_str(&contents)?;
                loaded.validate()?;
                info!(path = %path.display(), version = loaded.version, "loaded committed policy");
                loaded
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no committed policy on disk, using initial config");
                initial
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self::new(config, Some(path.to_path_buf())))
    }

    /// Latest committed config, as an atomic snapshot.
    pub fn current(&self) -> Arc<PolicyConfig> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            // A poisoned lock means a writer panicked mid-swap; the stored
            // Arc is still a complete config, so serve it.
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Validate and commit an operator-submitted config.
    ///
    /// Returns the committed version. The candidate's `version` field is
    /// overwritten with `current + 1`; callers cannot rewind history.
    ///
    /// # Errors
    ///
    /// `Unauthorized` unless `updater` is `SystemBlessed`; `InvalidConfig`
    /// for an inconsistent candidate; persistence errors leave the prior
    /// config active.
    pub fn apply_update(
        &self,
        mut candidate: PolicyConfig,
        updater: TrustLevel,
    ) -> Result<u64, PolicyError> {
        if updater != TrustLevel::SystemBlessed {
            return Err(PolicyError::Unauthorized { presented: updater });
        }
        candidate.validate()?;
        candidate.version = self.current().version.saturating_add(1);
        let version = candidate.version;

        // Persist before swapping so a crash cannot leave disk behind the
        // served config.
        self.persist(&candidate)?;
        self.swap(candidate);
        info!(version, "policy update committed");
        Ok(version)
    }

    /// Engage the emergency mode without an operator credential.
    ///
    /// This is the watchdog path: the whole point of the emergency switch
    /// is to work when normal authorization is unavailable or compromised.
    /// Persistence failures are logged, not propagated — the in-memory flip
    /// must always land.
    pub fn engage_emergency(&self, reason: &str) -> u64 {
        let mut tripped = (*self.current()).clone();
        tripped.mode = GateMode::EmergencySafe;
        tripped.version = tripped.version.saturating_add(1);
        let version = tripped.version;
        if let Err(e) = self.persist(&tripped) {
            warn!(error = %e, "failed to persist emergency policy flip");
        }
        self.swap(tripped);
        warn!(reason, version, "emergency shutdown engaged");
        version
    }

    fn swap(&self, config: PolicyConfig) {
        let next = Arc::new(config);
        match self.current.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    fn persist(&self, config: &PolicyConfig) -> Result<(), PolicyError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let encoded = toml::to_string_pretty(config)?;
        // Write-then-rename so a crash mid-write cannot corrupt the
        // committed policy file.
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, encoded)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
