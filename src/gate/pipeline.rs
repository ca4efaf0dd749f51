//! Admission pipeline — the ordered chain of checks behind every decision.
//!
//! Seven hard gates, first failure wins and is recorded verbatim:
//!
//! 1. global kill switch
//! 2. session validity (format, TTL)
//! 3. agent whitelist
//! 4. blessing requirement (capability token)
//! 5. session quota reservation
//! 6. security checks
//! 7. in-flight resource ceilings
//!
//! `OperatorOverride` with a `SystemBlessed` token short-circuits 3–6 only:
//! even operators cannot exceed hard resource ceilings or resurrect a
//! global shutdown without an explicit policy update. The policy snapshot
//! is read fresh on every call — an emergency flip is honored by the very
//! next admission, never served from a per-session cache.

use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::gate::audit::AuditReporter;
use crate::gate::ledger::{lock_session, SessionLedger};
use crate::gate::policy::{PolicyConfig, PolicyError, PolicyStore};
use crate::gate::sentinel::{default_checks, SecurityCheck, SentinelVerdict};
use crate::gate::tracker::{CompletionOutcome, TrackerError, WorkTracker};
use crate::token::{TokenError, TokenValidator};
use crate::types::{
    AdmissionRequest, AuditEvent, AuditKind, Decision, DenyReason, GateMode, SessionSummary,
    TrustLevel,
};

/// Accepted session ID shape: 1–128 characters of `[A-Za-z0-9._-]`.
fn session_id_format() -> &'static Regex {
    static FORMAT: OnceLock<Regex> = OnceLock::new();
    FORMAT.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]{1,128}$").expect("literal pattern compiles")
    })
}

/// The admission gate.
///
/// One `Gate` serves every caller; it is `Send + Sync` and designed to sit
/// behind an `Arc`.
pub struct Gate {
    policy: Arc<PolicyStore>,
    validator: Arc<TokenValidator>,
    ledger: Arc<SessionLedger>,
    tracker: Arc<WorkTracker>,
    audit: AuditReporter,
    checks: Vec<Box<dyn SecurityCheck>>,
}

impl Gate {
    /// Assemble the pipeline with the default security check set.
    pub fn new(
        policy: Arc<PolicyStore>,
        validator: Arc<TokenValidator>,
        ledger: Arc<SessionLedger>,
        tracker: Arc<WorkTracker>,
        audit: AuditReporter,
    ) -> Self {
        Self::with_checks(policy, validator, ledger, tracker, audit, default_checks())
    }

    /// Assemble the pipeline with an explicit security check set.
    pub fn with_checks(
        policy: Arc<PolicyStore>,
        validator: Arc<TokenValidator>,
        ledger: Arc<SessionLedger>,
        tracker: Arc<WorkTracker>,
        audit: AuditReporter,
        checks: Vec<Box<dyn SecurityCheck>>,
    ) -> Self {
        Self {
            policy,
            validator,
            ledger,
            tracker,
            audit,
            checks,
        }
    }

    /// Decide an admission request at the current time.
    pub fn admit(&self, request: &AdmissionRequest) -> Decision {
        self.admit_at(request, Utc::now())
    }

    /// Decide an admission request at an explicit instant.
    ///
    /// `admit` is the production entry point; the explicit instant exists
    /// so TTL and expiry behavior is testable without wall-clock sleeps.
    pub fn admit_at(&self, request: &AdmissionRequest, now: DateTime<Utc>) -> Decision {
        // Check 1 — global kill switch, read fresh every call.
        let policy = self.policy.current();
        if policy.kill_switch_engaged() {
            return self.deny(request, DenyReason::EmergencyShutdown, &policy);
        }

        // Check 2 — session validity.
        if !session_id_format().is_match(&request.session_id) {
            return self.deny(request, DenyReason::InvalidSession, &policy);
        }
        let entry = match self
            .ledger
            .begin_request(&request.session_id, now, policy.session_ttl())
        {
            Ok(entry) => entry,
            Err(reason) => {
                // The ledger recorded the denial on the expired session.
                return self.audit_deny(request, reason, &policy);
            }
        };

        // OperatorOverride with a SystemBlessed token short-circuits
        // checks 3–6. Checks 1, 2, and 7 still apply.
        let token = request.token.as_deref().unwrap_or("");
        let overridden = policy.mode == GateMode::OperatorOverride
            && self
                .validator
                .validate(token, &request.agent_id, TrustLevel::SystemBlessed, now)
                .is_ok();

        let reserved = if overridden {
            debug!(session_id = %request.session_id, "operator override admission");
            0
        } else {
            // Check 3 — agent whitelist.
            if !policy.agent_whitelist.contains(&request.agent_id) {
                return self.deny(request, DenyReason::AgentNotWhitelisted, &policy);
            }

            // Check 4 — blessing requirement. Development mode waives it;
            // the per-agent flag otherwise overrides the mode default.
            let blessing_required = if policy.mode == GateMode::Development {
                false
            } else {
                policy
                    .per_agent_blessing
                    .get(&request.agent_id)
                    .copied()
                    .unwrap_or(policy.mode == GateMode::BlessingRequired)
            };
            if blessing_required {
                if let Err(e) = self.validator.validate(
                    token,
                    &request.agent_id,
                    policy.mode.required_level(),
                    now,
                ) {
                    return self.deny(request, e.deny_reason(), &policy);
                }
            }

            // Check 5 — session quota reservation (atomic per session).
            let limits = policy.quota_for(&request.agent_id);
            if let Err(reason) = self.ledger.reserve(
                &entry,
                &request.agent_id,
                request.requested_work_units,
                &limits,
            ) {
                return self.deny(request, reason, &policy);
            }

            // Check 6 — security checks. The reservation from check 5 is
            // rolled back on a violation so denied requests hold no quota.
            let quarantined = lock_session(&entry).quarantined;
            if quarantined {
                self.ledger.release(
                    &request.session_id,
                    &request.agent_id,
                    request.requested_work_units,
                );
                return self.deny(request, DenyReason::SecurityPolicyViolation, &policy);
            }
            for check in &self.checks {
                let verdict = {
                    let state = lock_session(&entry);
                    check.inspect(&state, &policy, now)
                };
                if let SentinelVerdict::Violation { detail } = verdict {
                    warn!(
                        check = check.name(),
                        session_id = %request.session_id,
                        detail,
                        "security check tripped; session quarantined"
                    );
                    lock_session(&entry).quarantined = true;
                    self.ledger.release(
                        &request.session_id,
                        &request.agent_id,
                        request.requested_work_units,
                    );
                    return self.deny(
                        request,
                        DenyReason::SecurityPolicyViolation,
                        &policy,
                    );
                }
            }

            request.requested_work_units
        };

        // Check 7 — hard resource ceilings. Applies to overrides too.
        match self.tracker.try_register(
            &request.session_id,
            &request.agent_id,
            request.requested_work_units,
            reserved,
            now,
            policy.concurrency.max_in_flight,
            policy.concurrency.max_in_flight_per_agent,
        ) {
            Ok(work_id) => {
                info!(
                    session_id = %request.session_id,
                    agent_id = %request.agent_id,
                    %work_id,
                    units = reserved,
                    "admission granted"
                );
                self.audit.record(AuditEvent::now(
                    request.session_id.clone(),
                    request.agent_id.clone(),
                    AuditKind::Admitted,
                    None,
                    reserved,
                    policy.mode,
                ));
                Decision::Allow { work_id }
            }
            Err(reason) => {
                self.ledger
                    .release(&request.session_id, &request.agent_id, reserved);
                self.deny(request, reason, &policy)
            }
        }
    }

    /// Record a denial on the session (a no-op for sessions the ledger
    /// does not know) and audit it.
    fn deny(
        &self,
        request: &AdmissionRequest,
        reason: DenyReason,
        policy: &PolicyConfig,
    ) -> Decision {
        self.ledger.record_denial(&request.session_id, reason);
        self.audit_deny(request, reason, policy)
    }

    /// Audit a denial and build the decision. Does not touch the ledger.
    fn audit_deny(
        &self,
        request: &AdmissionRequest,
        reason: DenyReason,
        policy: &PolicyConfig,
    ) -> Decision {
        info!(
            session_id = %request.session_id,
            agent_id = %request.agent_id,
            reason = %reason,
            "admission denied"
        );
        self.audit.record(AuditEvent::now(
            request.session_id.clone(),
            request.agent_id.clone(),
            AuditKind::Denied,
            Some(reason.as_str().to_owned()),
            0,
            policy.mode,
        ));
        Decision::Deny { reason }
    }

    /// Report successful completion of admitted work.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownWork`] for an ID that was never admitted or
    /// has been purged.
    pub fn complete(
        &self,
        work_id: Uuid,
        actual_cost: u64,
        summary: Option<&str>,
    ) -> Result<CompletionOutcome, TrackerError> {
        self.tracker.complete(work_id, actual_cost, summary)
    }

    /// Report external failure of admitted work; the reservation is
    /// refunded.
    ///
    /// # Errors
    ///
    /// [`TrackerError::UnknownWork`] for an ID that was never admitted or
    /// has been purged.
    pub fn fail(&self, work_id: Uuid, reason: &str) -> Result<CompletionOutcome, TrackerError> {
        self.tracker.fail(work_id, reason)
    }

    /// Validate the updater credential and commit a policy update.
    ///
    /// # Errors
    ///
    /// [`PolicyError::Unauthorized`] unless the token carries
    /// `SystemBlessed`; validation and persistence errors pass through.
    pub fn update_policy(
        &self,
        candidate: PolicyConfig,
        updater_token: &str,
    ) -> Result<u64, PolicyError> {
        // Any validation failure downgrades to Guest: the store only
        // accepts SystemBlessed, so the update is refused either way.
        let level = self
            .validator
            .validate(updater_token, "", TrustLevel::Guest, Utc::now())
            .map(|claims| claims.level)
            .unwrap_or(TrustLevel::Guest);
        let version = self.policy.apply_update(candidate, level)?;
        let policy = self.policy.current();
        self.audit.record(AuditEvent::now(
            "",
            "",
            AuditKind::PolicyUpdated,
            Some(format!("version {version}")),
            0,
            policy.mode,
        ));
        Ok(version)
    }

    /// Lift a session quarantine after operator review.
    ///
    /// # Errors
    ///
    /// Returns the token validation failure when the credential is below
    /// `Operator`.
    pub fn lift_quarantine(&self, session_id: &str, token: &str) -> Result<(), TokenError> {
        self.validator
            .validate(token, "", TrustLevel::Operator, Utc::now())?;
        self.ledger.set_quarantined(session_id, false);
        info!(session_id, "quarantine lifted by operator");
        self.audit.record(AuditEvent::now(
            session_id,
            "",
            AuditKind::QuarantineLifted,
            None,
            0,
            self.policy.current().mode,
        ));
        Ok(())
    }

    /// Operator-facing aggregate for one session.
    pub fn summarize(&self, session_id: &str) -> Option<SessionSummary> {
        self.ledger.summary(session_id)
    }

    /// The audit reporter handle (for streaming and health probes).
    pub fn audit(&self) -> &AuditReporter {
        &self.audit
    }

    /// The policy store (for the watchdog and operator tooling).
    pub fn policy(&self) -> &Arc<PolicyStore> {
        &self.policy
    }

    /// Background maintenance loop: reclaims timed-out work items and
    /// drops sessions past their retention horizon.
    pub fn spawn_sweeper(gate: Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let policy = gate.policy.current();
                let now = Utc::now();
                let max_age = chrono::Duration::seconds(
                    i64::try_from(policy.work_max_age_secs).unwrap_or(i64::MAX),
                );
                gate.tracker.sweep_timeouts(max_age, now);
                gate.ledger.sweep_expired(now, policy.session_ttl());
            }
        })
    }
}
