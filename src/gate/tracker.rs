//! Work tracker — admitted work items from admission to terminal status.
//!
//! The tracker owns every in-flight [`WorkItem`]. Ceiling checks and
//! registration are one atomic step under the tracker lock; the global
//! in-flight count is mirrored into an atomic counter for lock-free reads.
//! Terminal items are retained until the next sweep so a duplicate
//! completion report resolves to [`CompletionOutcome::AlreadyTerminal`]
//! instead of double-crediting the ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::gate::audit::AuditReporter;
use crate::gate::ledger::{CommitOutcome, SessionLedger};
use crate::gate::policy::PolicyStore;
use crate::types::{AuditEvent, AuditKind, DenyReason, WorkItem, WorkStatus};

/// Outcome of a completion or failure report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The item reached its terminal status and the ledger reconciled.
    Reconciled {
        /// Units charged to the session after reconciliation.
        charged: u64,
    },
    /// The actual cost exceeded what could be reserved; charged stays at
    /// the reservation and the overrun was audited as a policy violation.
    Overrun {
        /// Units that could not be reserved.
        unreserved: u64,
    },
    /// The item was already terminal; nothing changed.
    AlreadyTerminal,
}

/// Errors from completion reports.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// No work item with this ID exists (never admitted, or already
    /// purged by the sweeper).
    #[error("unknown work item {work_id}")]
    UnknownWork {
        /// The ID the caller reported against.
        work_id: Uuid,
    },
}

struct TrackerState {
    items: HashMap<Uuid, WorkItem>,
    /// In-flight count per agent; entries removed at zero.
    per_agent: HashMap<String, u64>,
}

/// Tracks admitted work until completion, failure, or timeout.
pub struct WorkTracker {
    state: Mutex<TrackerState>,
    in_flight: AtomicU64,
    ledger: Arc<SessionLedger>,
    policy: Arc<PolicyStore>,
    audit: AuditReporter,
}

impl WorkTracker {
    /// Create a tracker wired to the ledger, policy store, and audit
    /// reporter.
    pub fn new(
        ledger: Arc<SessionLedger>,
        policy: Arc<PolicyStore>,
        audit: AuditReporter,
    ) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                items: HashMap::new(),
                per_agent: HashMap::new(),
            }),
            in_flight: AtomicU64::new(0),
            ledger,
            policy,
            audit,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Atomically check the concurrency ceilings and register a new
    /// in-flight item.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` when either ceiling is reached; nothing
    /// is registered in that case.
    pub fn try_register(
        &self,
        session_id: &str,
        agent_id: &str,
        estimated_cost: u64,
        reserved_cost: u64,
        now: DateTime<Utc>,
        max_in_flight: u64,
        max_per_agent: u64,
    ) -> Result<Uuid, DenyReason> {
        let mut state = self.lock();

        if self.in_flight.load(Ordering::Relaxed) >= max_in_flight {
            return Err(DenyReason::ResourceExhausted);
        }
        let agent_count = state.per_agent.get(agent_id).copied().unwrap_or(0);
        if agent_count >= max_per_agent {
            return Err(DenyReason::ResourceExhausted);
        }

        let work_id = Uuid::new_v4();
        state.items.insert(
            work_id,
            WorkItem {
                work_id,
                session_id: session_id.to_owned(),
                agent_id: agent_id.to_owned(),
                estimated_cost,
                reserved_cost,
                admitted_at: now,
                status: WorkStatus::InFlight,
            },
        );
        state
            .per_agent
            .insert(agent_id.to_owned(), agent_count.saturating_add(1));
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        Ok(work_id)
    }

    /// Transition an item out of `InFlight` under the tracker lock.
    ///
    /// Returns a snapshot of the item as it was admitted, or `None` when
    /// it was already terminal.
    fn to_terminal(&self, work_id: Uuid, status: WorkStatus) -> Result<Option<WorkItem>, TrackerError> {
        let mut state = self.lock();
        let Some(item) = state.items.get_mut(&work_id) else {
            return Err(TrackerError::UnknownWork { work_id });
        };
        if item.status != WorkStatus::InFlight {
            return Ok(None);
        }
        item.status = status;
        let snapshot = item.clone();

        let remaining = state
            .per_agent
            .get(&snapshot.agent_id)
            .copied()
            .unwrap_or(0)
            .saturating_sub(1);
        if remaining == 0 {
            state.per_agent.remove(&snapshot.agent_id);
        } else {
            state.per_agent.insert(snapshot.agent_id.clone(), remaining);
        }
        drop(state);

        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        Ok(Some(snapshot))
    }

    /// Record a successful completion and reconcile its actual cost.
    ///
    /// Idempotent: a second terminal report for the same `work_id` returns
    /// [`CompletionOutcome::AlreadyTerminal`] without touching the ledger.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownWork`] when the ID was never admitted or has
    /// been purged.
    pub fn complete(
        &self,
        work_id: Uuid,
        actual_cost: u64,
        summary: Option<&str>,
    ) -> Result<CompletionOutcome, TrackerError> {
        let Some(item) = self.to_terminal(work_id, WorkStatus::Completed)? else {
            return Ok(CompletionOutcome::AlreadyTerminal);
        };

        let policy = self.policy.current();
        let outcome = if item.reserved_cost > 0 {
            let limits = policy.quota_for(&item.agent_id);
            match self.ledger.commit(
                &item.session_id,
                &item.agent_id,
                item.reserved_cost,
                actual_cost,
                &limits,
            ) {
                CommitOutcome::Reconciled { charged } => CompletionOutcome::Reconciled { charged },
                CommitOutcome::Overrun { unreserved } => {
                    warn!(
                        %work_id,
                        session_id = %item.session_id,
                        agent_id = %item.agent_id,
                        unreserved,
                        "completion overran its reservation"
                    );
                    self.audit.record(AuditEvent::now(
                        item.session_id.clone(),
                        item.agent_id.clone(),
                        AuditKind::QuotaOverrun,
                        Some(format!(
                            "completion reported {actual_cost} units but only {} were reserved",
                            item.reserved_cost
                        )),
                        unreserved,
                        policy.mode,
                    ));
                    CompletionOutcome::Overrun { unreserved }
                }
            }
        } else {
            // Unmetered (operator-override) admission: nothing reserved,
            // nothing charged — the audit record still carries the units.
            CompletionOutcome::Reconciled { charged: 0 }
        };

        let charged = match outcome {
            CompletionOutcome::Reconciled { charged } => charged,
            CompletionOutcome::Overrun { .. } => item.reserved_cost,
            CompletionOutcome::AlreadyTerminal => 0,
        };
        self.audit.record(AuditEvent::now(
            item.session_id,
            item.agent_id,
            AuditKind::Completed,
            summary.map(str::to_owned),
            charged,
            policy.mode,
        ));
        Ok(outcome)
    }

    /// Record an external work failure and refund its reservation.
    ///
    /// Idempotent like [`complete`](Self::complete).
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownWork`] when the ID was never admitted or has
    /// been purged.
    pub fn fail(&self, work_id: Uuid, reason: &str) -> Result<CompletionOutcome, TrackerError> {
        let Some(item) = self.to_terminal(work_id, WorkStatus::Failed)? else {
            return Ok(CompletionOutcome::AlreadyTerminal);
        };

        self.ledger
            .release(&item.session_id, &item.agent_id, item.reserved_cost);
        self.audit.record(AuditEvent::now(
            item.session_id,
            item.agent_id,
            AuditKind::Failed,
            Some(reason.to_owned()),
            item.reserved_cost,
            self.policy.current().mode,
        ));
        Ok(CompletionOutcome::Reconciled { charged: 0 })
    }

    /// Reclaim in-flight items older than `max_age` and purge terminal
    /// items past the same horizon.
    ///
    /// This is what prevents a crashed caller from permanently holding
    /// session quota. Returns the number of items forced to `TimedOut`.
    pub fn sweep_timeouts(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let stale: Vec<Uuid> = {
            let state = self.lock();
            state
                .items
                .values()
                .filter(|item| {
                    item.status == WorkStatus::InFlight && now - item.admitted_at > max_age
                })
                .map(|item| item.work_id)
                .collect()
        };

        let mut reclaimed = 0_usize;
        for work_id in stale {
            match self.to_terminal(work_id, WorkStatus::TimedOut) {
                Ok(Some(item)) => {
                    reclaimed = reclaimed.saturating_add(1);
                    self.ledger
                        .release(&item.session_id, &item.agent_id, item.reserved_cost);
                    info!(%work_id, session_id = %item.session_id, "work item timed out, reservation refunded");
                    self.audit.record(AuditEvent::now(
                        item.session_id,
                        item.agent_id,
                        AuditKind::TimedOut,
                        Some(format!(
                            "no completion report within {}s",
                            max_age.num_seconds()
                        )),
                        item.reserved_cost,
                        self.policy.current().mode,
                    ));
                }
                // Raced with a caller's report; the report won.
                Ok(None) | Err(_) => {}
            }
        }

        // Terminal items past the horizon have served their idempotence
        // window; drop them.
        let mut state = self.lock();
        state.items.retain(|_, item| {
            item.status == WorkStatus::InFlight || now - item.admitted_at <= max_age
        });
        reclaimed
    }

    /// Gate-wide in-flight count.
    pub fn in_flight_total(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// In-flight count for one agent.
    pub fn in_flight_for(&self, agent_id: &str) -> u64 {
        self.lock().per_agent.get(agent_id).copied().unwrap_or(0)
    }

    /// Snapshot of one work item, if the tracker still holds it.
    pub fn get(&self, work_id: Uuid) -> Option<WorkItem> {
        self.lock().items.get(&work_id).cloned()
    }
}
