//! Emergency watchdog — flips the gate into `EmergencySafe` without going
//! through operator authorization.
//!
//! The whole point of the emergency switch is to work when normal
//! authorization is unavailable or compromised, so this path never asks
//! for a credential. Two triggers:
//!
//! - a trip file appearing (or changing) on disk, watched with [`notify`] —
//!   an on-call human with shell access can `touch` it with no token;
//! - the in-process [`Watchdog::trip`] call, for embedding supervisors.
//!
//! In-flight work is allowed to finish; the next `admit` call observes the
//! flipped mode because the pipeline reads policy fresh on every call.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::gate::audit::AuditReporter;
use crate::gate::policy::PolicyStore;
use crate::types::{AuditEvent, AuditKind, GateMode};

/// Watches for emergency trips and engages the kill switch.
pub struct Watchdog {
    policy: Arc<PolicyStore>,
    audit: AuditReporter,
    trip_file: PathBuf,
}

/// Keeps the filesystem watcher and its task alive.
///
/// Dropping the guard stops the watcher; keep it for the life of the
/// process.
pub struct WatchdogGuard {
    _watcher: notify::RecommendedWatcher,
    /// The event-draining task.
    pub task: JoinHandle<()>,
}

impl Watchdog {
    /// Create a watchdog tripping on the given file.
    pub fn new(policy: Arc<PolicyStore>, audit: AuditReporter, trip_file: PathBuf) -> Self {
        Self {
            policy,
            audit,
            trip_file,
        }
    }

    /// Engage the emergency mode directly, bypassing all authorization.
    pub fn trip(&self, reason: &str) {
        engage(&self.policy, &self.audit, reason);
    }

    /// Start watching the trip file.
    ///
    /// If the file already exists at startup the trip fires immediately —
    /// a gate restarted during an incident must come up closed.
    ///
    /// # Errors
    ///
    /// Returns an error if the filesystem watcher cannot be installed.
    pub fn spawn(self) -> anyhow::Result<WatchdogGuard> {
        if self.trip_file.exists() {
            let reason = read_trip_reason(&self.trip_file);
            warn!(path = %self.trip_file.display(), "trip file present at startup");
            engage(&self.policy, &self.audit, &reason);
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(evt) = event {
                if matches!(
                    evt.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                ) {
                    for path in evt.paths {
                        // UnboundedSender::send is sync-safe from the
                        // watcher's own thread.
                        let _ = tx.send(path);
                    }
                }
            }
        })?;

        // Watch the parent directory: the trip file usually does not exist
        // yet, and that is the healthy state.
        let watch_dir = self
            .trip_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        std::fs::create_dir_all(&watch_dir)?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;
        info!(
            trip_file = %self.trip_file.display(),
            "emergency watchdog armed"
        );

        let Self {
            policy,
            audit,
            trip_file,
        } = self;
        let task = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if path.file_name() != trip_file.file_name() {
                    continue;
                }
                if policy.current().mode == GateMode::EmergencySafe {
                    // Already tripped; nothing to do.
                    continue;
                }
                let reason = read_trip_reason(&trip_file);
                engage(&policy, &audit, &reason);
            }
        });

        Ok(WatchdogGuard {
            _watcher: watcher,
            task,
        })
    }
}

/// Flip the policy and put the trip on the audit stream.
fn engage(policy: &Arc<PolicyStore>, audit: &AuditReporter, reason: &str) {
    let version = policy.engage_emergency(reason);
    audit.record(AuditEvent::now(
        "",
        "",
        AuditKind::EmergencyTripped,
        Some(reason.to_owned()),
        0,
        GateMode::EmergencySafe,
    ));
    warn!(version, reason, "watchdog engaged emergency shutdown");
}

/// First line of the trip file, or a fixed fallback.
fn read_trip_reason(path: &Path) -> String {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|contents| contents.lines().next().map(str::to_owned))
        .filter(|line| !line.is_empty())
        .unwrap_or_else(|| "trip file touched".to_owned())
}
