//! Session ledger — per-session quota accounting.
//!
//! Sessions live in a registry keyed by session ID. The registry lock is
//! held only for lookup/insert; all counter mutation happens under the
//! per-session mutex, so two requests on the same session serialize their
//! quota reservation while different sessions never contend.
//!
//! Ledger state is in-memory only and rebuilt empty on restart: sessions
//! simply re-authenticate and re-accumulate. The durable record of what
//! happened is the audit store, not the ledger.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use crate::types::{DenyReason, SessionSummary};

/// How many expired sessions are retained (as multiples of the TTL) so a
/// stale session ID keeps denying `SessionExpired` instead of being
/// silently recreated as a fresh session.
const EXPIRED_RETENTION_TTLS: i32 = 2;

/// Length of the request-rate window the security sentinel inspects.
pub const RATE_WINDOW_SECS: i64 = 60;

/// Mutable per-session state. Guarded by the per-session mutex.
#[derive(Debug)]
pub struct SessionState {
    /// Session identifier.
    pub session_id: String,
    /// First time this session was seen.
    pub created_at: DateTime<Utc>,
    /// Last admissible request.
    pub last_seen_at: DateTime<Utc>,
    /// Work units granted and not refunded.
    pub granted_work_units: u64,
    /// Requests counted against `max_requests_per_session`.
    pub request_count: u64,
    /// Denials recorded on this session.
    pub denied_count: u64,
    /// Work units granted per agent.
    pub per_agent_granted: BTreeMap<String, u64>,
    /// Denial histogram; invariant: values sum to `denied_count`.
    pub denial_reasons: BTreeMap<DenyReason, u64>,
    /// Request instants within the sentinel rate window.
    pub recent_requests: VecDeque<DateTime<Utc>>,
    /// Denied until an operator lifts the quarantine.
    pub quarantined: bool,
}

impl SessionState {
    fn new(session_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: session_id.to_owned(),
            created_at: now,
            last_seen_at: now,
            granted_work_units: 0,
            request_count: 0,
            denied_count: 0,
            per_agent_granted: BTreeMap::new(),
            denial_reasons: BTreeMap::new(),
            recent_requests: VecDeque::new(),
            quarantined: false,
        }
    }

    /// Requests seen within the rolling rate window ending at `now`.
    pub fn requests_in_window(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        self.recent_requests.iter().filter(|t| **t > cutoff).count()
    }

    fn note_request(&mut self, now: DateTime<Utc>) {
        self.last_seen_at = now;
        self.request_count = self.request_count.saturating_add(1);
        self.recent_requests.push_back(now);
        let cutoff = now - Duration::seconds(RATE_WINDOW_SECS);
        while self
            .recent_requests
            .front()
            .is_some_and(|t| *t <= cutoff)
        {
            self.recent_requests.pop_front();
        }
    }

    fn record_denial(&mut self, reason: DenyReason) {
        self.denied_count = self.denied_count.saturating_add(1);
        let slot = self.denial_reasons.entry(reason).or_insert(0);
        *slot = slot.saturating_add(1);
    }

    fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            created_at: self.created_at,
            last_seen_at: self.last_seen_at,
            granted_work_units: self.granted_work_units,
            request_count: self.request_count,
            denied_count: self.denied_count,
            per_agent_granted: self.per_agent_granted.clone(),
            denial_reasons: self
                .denial_reasons
                .iter()
                .map(|(reason, count)| (reason.as_str().to_owned(), *count))
                .collect(),
            quarantined: self.quarantined,
        }
    }
}

/// Quota limits the ledger enforces on one reservation.
#[derive(Debug, Clone, Copy)]
pub struct QuotaLimits {
    /// Session-wide work-unit cap.
    pub max_work_units: u64,
    /// Session-wide request cap.
    pub max_requests: u64,
    /// Optional per-agent work-unit cap.
    pub per_agent_cap: Option<u64>,
}

/// Outcome of reconciling an actual cost against its reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Actual cost fit within limits (extra units reserved, or surplus
    /// refunded).
    Reconciled {
        /// Units charged to the session after reconciliation.
        charged: u64,
    },
    /// Actual exceeded the reservation and the extra units did not fit;
    /// the charge stays at the reserved amount and the overrun is a policy
    /// violation for the audit trail.
    Overrun {
        /// Units that could not be reserved.
        unreserved: u64,
    },
}

/// Lock a session entry, recovering from a poisoned lock.
///
/// Counter state stays coherent across poisoning: every mutation is a
/// complete single-field update.
pub(crate) fn lock_session(
    entry: &Arc<Mutex<SessionState>>,
) -> std::sync::MutexGuard<'_, SessionState> {
    match entry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// The session registry.
pub struct SessionLedger {
    sessions: RwLock<HashMap<String, Arc<Mutex<SessionState>>>>,
}

impl Default for SessionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<Mutex<SessionState>>> {
        let map = match self.sessions.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        map.get(session_id).map(Arc::clone)
    }

    /// Touch a session for a new request: create it on first sight, refuse
    /// it once expired.
    ///
    /// Expired sessions are *not* recreated; the caller must start a fresh
    /// session ID. The request is stamped into the rate window and request
    /// counter.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired` when the TTL has elapsed.
    pub fn begin_request(
        &self,
        session_id: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Arc<Mutex<SessionState>>, DenyReason> {
        if let Some(entry) = self.lookup(session_id) {
            let mut state = lock_session(&entry);
            if now - state.last_seen_at > ttl {
                // Record the denial on the expired session itself so the
                // operator summary explains what happened to it.
                state.record_denial(DenyReason::SessionExpired);
                return Err(DenyReason::SessionExpired);
            }
            state.note_request(now);
            drop(state);
            return Ok(entry);
        }

        let mut map = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = map
            .entry(session_id.to_owned())
            .or_insert_with(|| {
                debug!(session_id, "session created");
                Arc::new(Mutex::new(SessionState::new(session_id, now)))
            })
            .clone();
        drop(map);

        let mut state = lock_session(&entry);
        // Another request may have created the entry first; the TTL cannot
        // have elapsed between those two instants, so just stamp ours.
        state.note_request(now);
        drop(state);
        Ok(entry)
    }

    /// Atomically reserve `cost` units for `agent_id`, enforcing the
    /// session cap, the request cap, and the optional per-agent cap.
    ///
    /// # Errors
    ///
    /// Returns `LimitsExceeded` when any cap would be breached; the session
    /// is left unchanged.
    pub fn reserve(
        &self,
        entry: &Arc<Mutex<SessionState>>,
        agent_id: &str,
        cost: u64,
        limits: &QuotaLimits,
    ) -> Result<(), DenyReason> {
        let mut state = lock_session(entry);

        if state.request_count > limits.max_requests {
            return Err(DenyReason::LimitsExceeded);
        }

        let new_total = state.granted_work_units.saturating_add(cost);
        if new_total > limits.max_work_units {
            return Err(DenyReason::LimitsExceeded);
        }

        let agent_granted = state
            .per_agent_granted
            .get(agent_id)
            .copied()
            .unwrap_or(0);
        if let Some(cap) = limits.per_agent_cap {
            if agent_granted.saturating_add(cost) > cap {
                return Err(DenyReason::LimitsExceeded);
            }
        }

        state.granted_work_units = new_total;
        state
            .per_agent_granted
            .insert(agent_id.to_owned(), agent_granted.saturating_add(cost));
        Ok(())
    }

    /// Reconcile a completion's actual cost against its reservation.
    ///
    /// A surplus (`actual < reserved`) is refunded. A shortfall attempts
    /// the extra reservation; when that would break a cap, the charge stays
    /// at the reserved amount and the overrun is reported for auditing —
    /// never silently truncated.
    pub fn commit(
        &self,
        session_id: &str,
        agent_id: &str,
        reserved: u64,
        actual: u64,
        limits: &QuotaLimits,
    ) -> CommitOutcome {
        let Some(entry) = self.lookup(session_id) else {
            // Session already swept; the audit trail still gets the
            // completion, there is just no quota left to reconcile.
            warn!(session_id, "commit for a session no longer in the ledger");
            return CommitOutcome::Reconciled { charged: reserved };
        };
        let mut state = lock_session(&entry);

        if actual >= reserved {
            let extra = actual.saturating_sub(reserved);
            if extra == 0 {
                return CommitOutcome::Reconciled { charged: actual };
            }
            let new_total = state.granted_work_units.saturating_add(extra);
            let agent_granted = state.per_agent_granted.get(agent_id).copied().unwrap_or(0);
            let agent_fits = limits
                .per_agent_cap
                .map_or(true, |cap| agent_granted.saturating_add(extra) <= cap);
            if new_total > limits.max_work_units || !agent_fits {
                return CommitOutcome::Overrun { unreserved: extra };
            }
            state.granted_work_units = new_total;
            state
                .per_agent_granted
                .insert(agent_id.to_owned(), agent_granted.saturating_add(extra));
            CommitOutcome::Reconciled { charged: actual }
        } else {
            let surplus = reserved.saturating_sub(actual);
            state.granted_work_units = state.granted_work_units.saturating_sub(surplus);
            if let Some(granted) = state.per_agent_granted.get_mut(agent_id) {
                *granted = granted.saturating_sub(surplus);
            }
            CommitOutcome::Reconciled { charged: actual }
        }
    }

    /// Refund a reservation after external work failure or timeout.
    pub fn release(&self, session_id: &str, agent_id: &str, reserved: u64) {
        let Some(entry) = self.lookup(session_id) else {
            return;
        };
        let mut state = lock_session(&entry);
        state.granted_work_units = state.granted_work_units.saturating_sub(reserved);
        if let Some(granted) = state.per_agent_granted.get_mut(agent_id) {
            *granted = granted.saturating_sub(reserved);
        }
    }

    /// Record a denial against a session, if the ledger knows it.
    ///
    /// Denials that never reach a known session (malformed IDs, kill
    /// switch) are visible in the audit stream only.
    pub fn record_denial(&self, session_id: &str, reason: DenyReason) {
        if let Some(entry) = self.lookup(session_id) {
            lock_session(&entry).record_denial(reason);
        }
    }

    /// Mark or clear a session quarantine.
    pub fn set_quarantined(&self, session_id: &str, quarantined: bool) {
        if let Some(entry) = self.lookup(session_id) {
            lock_session(&entry).quarantined = quarantined;
        }
    }

    /// Operator-facing aggregate for one session.
    pub fn summary(&self, session_id: &str) -> Option<SessionSummary> {
        self.lookup(session_id)
            .map(|entry| lock_session(&entry).summary())
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        match self.sessions.read() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Whether the ledger tracks no sessions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop sessions idle for longer than the retention horizon.
    ///
    /// Retention is a small multiple of the TTL: between TTL and the
    /// horizon a stale ID still denies `SessionExpired`; past the horizon
    /// the ID behaves as brand new. Returns the number of sessions removed.
    pub fn sweep_expired(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let horizon = ttl * EXPIRED_RETENTION_TTLS;
        let mut map = match self.sessions.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = map.len();
        map.retain(|_, entry| {
            let state = lock_session(entry);
            now - state.last_seen_at <= horizon
        });
        let removed = before.saturating_sub(map.len());
        if removed > 0 {
            debug!(removed, "swept expired sessions");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_units: u64) -> QuotaLimits {
        QuotaLimits {
            max_work_units: max_units,
            max_requests: 100,
            per_agent_cap: None,
        }
    }

    fn begin(ledger: &SessionLedger, id: &str) -> Arc<Mutex<SessionState>> {
        ledger
            .begin_request(id, Utc::now(), Duration::seconds(60))
            .expect("session should be admissible")
    }

    #[test]
    fn reserve_enforces_session_cap() {
        let ledger = SessionLedger::new();
        let entry = begin(&ledger, "s1");
        let l = limits(3);

        assert!(ledger.reserve(&entry, "cal", 2, &l).is_ok());
        assert!(ledger.reserve(&entry, "cal", 1, &l).is_ok());
        assert_eq!(
            ledger.reserve(&entry, "cal", 1, &l),
            Err(DenyReason::LimitsExceeded)
        );
        // The failed reservation changed nothing.
        let summary = ledger.summary("s1").expect("summary");
        assert_eq!(summary.granted_work_units, 3);
    }

    #[test]
    fn per_agent_cap_is_independent() {
        let ledger = SessionLedger::new();
        let entry = begin(&ledger, "s1");
        let l = QuotaLimits {
            max_work_units: 10,
            max_requests: 100,
            per_agent_cap: Some(2),
        };

        assert!(ledger.reserve(&entry, "cal", 2, &l).is_ok());
        assert_eq!(
            ledger.reserve(&entry, "cal", 1, &l),
            Err(DenyReason::LimitsExceeded)
        );
        // A different agent still fits under the session cap.
        assert!(ledger.reserve(&entry, "domingo", 2, &l).is_ok());
    }

    #[test]
    fn expired_session_denies_and_is_not_recreated() {
        let ledger = SessionLedger::new();
        let start = Utc::now();
        ledger
            .begin_request("s1", start, Duration::seconds(10))
            .expect("fresh session");

        let later = start + Duration::seconds(11);
        let err = ledger
            .begin_request("s1", later, Duration::seconds(10))
            .expect_err("expired");
        assert_eq!(err, DenyReason::SessionExpired);

        // Still the same (expired) session, not a silently recreated one.
        let summary = ledger.summary("s1").expect("summary");
        assert_eq!(summary.denied_count, 1);
        assert_eq!(summary.denial_reasons.get("SessionExpired"), Some(&1));
    }

    #[test]
    fn sweep_removes_sessions_past_retention() {
        let ledger = SessionLedger::new();
        let start = Utc::now();
        ledger
            .begin_request("s1", start, Duration::seconds(10))
            .expect("fresh session");

        // Past TTL but within retention: still present, still denying.
        assert_eq!(ledger.sweep_expired(start + Duration::seconds(15), Duration::seconds(10)), 0);
        assert_eq!(ledger.len(), 1);

        // Past the retention horizon: gone.
        assert_eq!(ledger.sweep_expired(start + Duration::seconds(25), Duration::seconds(10)), 1);
        assert!(ledger.is_empty());
    }

    #[test]
    fn commit_refunds_surplus() {
        let ledger = SessionLedger::new();
        let entry = begin(&ledger, "s1");
        let l = limits(10);
        ledger.reserve(&entry, "cal", 5, &l).expect("reserve");

        let outcome = ledger.commit("s1", "cal", 5, 2, &l);
        assert_eq!(outcome, CommitOutcome::Reconciled { charged: 2 });
        let summary = ledger.summary("s1").expect("summary");
        assert_eq!(summary.granted_work_units, 2);
        assert_eq!(summary.per_agent_granted.get("cal"), Some(&2));
    }

    #[test]
    fn commit_reserves_extra_when_it_fits() {
        let ledger = SessionLedger::new();
        let entry = begin(&ledger, "s1");
        let l = limits(10);
        ledger.reserve(&entry, "cal", 3, &l).expect("reserve");

        let outcome = ledger.commit("s1", "cal", 3, 7, &l);
        assert_eq!(outcome, CommitOutcome::Reconciled { charged: 7 });
        assert_eq!(
            ledger.summary("s1").expect("summary").granted_work_units,
            7
        );
    }

    #[test]
    fn commit_overrun_keeps_reserved_charge() {
        let ledger = SessionLedger::new();
        let entry = begin(&ledger, "s1");
        let l = limits(5);
        ledger.reserve(&entry, "cal", 4, &l).expect("reserve");

        let outcome = ledger.commit("s1", "cal", 4, 9, &l);
        assert_eq!(outcome, CommitOutcome::Overrun { unreserved: 5 });
        // The invariant holds: the charge never exceeded the cap.
        assert_eq!(
            ledger.summary("s1").expect("summary").granted_work_units,
            4
        );
    }

    #[test]
    fn release_refunds_reservation() {
        let ledger = SessionLedger::new();
        let entry = begin(&ledger, "s1");
        let l = limits(5);
        ledger.reserve(&entry, "cal", 4, &l).expect("reserve");
        ledger.release("s1", "cal", 4);

        let summary = ledger.summary("s1").expect("summary");
        assert_eq!(summary.granted_work_units, 0);
        assert_eq!(summary.per_agent_granted.get("cal"), Some(&0));
        // Quota is usable again.
        assert!(ledger.reserve(&entry, "cal", 5, &l).is_ok());
    }

    #[test]
    fn denial_histogram_sums_to_denied_count() {
        let ledger = SessionLedger::new();
        begin(&ledger, "s1");
        ledger.record_denial("s1", DenyReason::LimitsExceeded);
        ledger.record_denial("s1", DenyReason::LimitsExceeded);
        ledger.record_denial("s1", DenyReason::AgentNotWhitelisted);

        let summary = ledger.summary("s1").expect("summary");
        let histogram_total: u64 = summary.denial_reasons.values().sum();
        assert_eq!(histogram_total, summary.denied_count);
        assert_eq!(summary.denied_count, 3);
    }

    #[test]
    fn request_window_trims_old_entries() {
        let ledger = SessionLedger::new();
        let start = Utc::now();
        let ttl = Duration::seconds(3600);
        let entry = ledger.begin_request("s1", start, ttl).expect("begin");
        for i in 1..=5 {
            ledger
                .begin_request("s1", start + Duration::seconds(i), ttl)
                .expect("begin");
        }

        let state = lock_session(&entry);
        assert_eq!(state.requests_in_window(start + Duration::seconds(5)), 6);
        // Two minutes later the window is empty.
        assert_eq!(
            state.requests_in_window(start + Duration::seconds(125)),
            0
        );
    }

    #[test]
    fn concurrent_reservation_never_overspends() {
        let ledger = Arc::new(SessionLedger::new());
        let entry = begin(&ledger, "s1");
        let l = limits(50);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = Arc::clone(&ledger);
            let entry = Arc::clone(&entry);
            handles.push(std::thread::spawn(move || {
                let mut won = 0_u64;
                for _ in 0..20 {
                    if ledger.reserve(&entry, "cal", 1, &l).is_ok() {
                        won = won.saturating_add(1);
                    }
                }
                won
            }));
        }
        let total: u64 = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .sum();

        // 160 attempts raced for 50 units; exactly 50 may win.
        assert_eq!(total, 50);
        assert_eq!(
            ledger.summary("s1").expect("summary").granted_work_units,
            50
        );
    }
}
