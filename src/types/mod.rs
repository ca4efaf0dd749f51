// Core types shared across the gate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trust levels carried by capability tokens, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    /// Unauthenticated or anonymous caller.
    Guest,
    /// Authenticated caller in good standing.
    Trusted,
    /// Human operator.
    Operator,
    /// Operator credential authorized to change policy itself.
    SystemBlessed,
}

impl TrustLevel {
    /// Human-readable label for display and audit records.
    pub fn label(self) -> &'static str {
        match self {
            Self::Guest => "guest",
            Self::Trusted => "trusted",
            Self::Operator => "operator",
            Self::SystemBlessed => "system_blessed",
        }
    }
}

/// Operating mode of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Normal operation — agent work requires a blessing token.
    BlessingRequired,
    /// Reduced friction for development: blessing waived, limits raised.
    /// Every decision is still audited.
    Development,
    /// Global shutdown — every admission is denied.
    EmergencySafe,
    /// Operators with a `SystemBlessed` token bypass routine checks.
    /// Hard resource ceilings and the kill switch still apply.
    OperatorOverride,
}

impl GateMode {
    /// Minimum token trust level a blessing must carry in this mode.
    pub fn required_level(self) -> TrustLevel {
        match self {
            Self::BlessingRequired | Self::OperatorOverride => TrustLevel::Trusted,
            Self::Development => TrustLevel::Guest,
            // Nothing is admitted in this mode; the level never matters.
            Self::EmergencySafe => TrustLevel::SystemBlessed,
        }
    }

    /// Stable string form used in audit records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BlessingRequired => "blessing_required",
            Self::Development => "development",
            Self::EmergencySafe => "emergency_safe",
            Self::OperatorOverride => "operator_override",
        }
    }
}

/// Reasons an admission request can be denied.
///
/// Serialized variant names are the wire contract: callers match on them to
/// decide between retry (quota, expiry) and give-up (shutdown, whitelist).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DenyReason {
    /// Global kill switch engaged — not retryable until an operator acts.
    EmergencyShutdown,
    /// Session identifier is malformed.
    InvalidSession,
    /// Session TTL elapsed; a new session ID is required.
    SessionExpired,
    /// Agent is not on the policy whitelist.
    AgentNotWhitelisted,
    /// Token could not be decoded.
    Malformed,
    /// Token signature did not verify against the issuer key set.
    BadSignature,
    /// Token expiry is in the past.
    Expired,
    /// Token trust level is below what the current mode requires.
    InsufficientLevel,
    /// Token is scoped to other agents.
    AgentNotInScope,
    /// Session or per-agent work-unit quota would be exceeded.
    LimitsExceeded,
    /// A security check tripped; the session may be quarantined.
    SecurityPolicyViolation,
    /// In-flight concurrency ceiling reached — retry is pointless until
    /// running work drains.
    ResourceExhausted,
}

impl DenyReason {
    /// Stable string form — matches the serialized variant name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EmergencyShutdown => "EmergencyShutdown",
            Self::InvalidSession => "InvalidSession",
            Self::SessionExpired => "SessionExpired",
            Self::AgentNotWhitelisted => "AgentNotWhitelisted",
            Self::Malformed => "Malformed",
            Self::BadSignature => "BadSignature",
            Self::Expired => "Expired",
            Self::InsufficientLevel => "InsufficientLevel",
            Self::AgentNotInScope => "AgentNotInScope",
            Self::LimitsExceeded => "LimitsExceeded",
            Self::SecurityPolicyViolation => "SecurityPolicyViolation",
            Self::ResourceExhausted => "ResourceExhausted",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One admission request from a caller or agent orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionRequest {
    /// Continuous caller context this request belongs to.
    pub session_id: String,
    /// Agent the caller wants to run.
    pub agent_id: String,
    /// Opaque blessing token, if the caller has one.
    pub token: Option<String>,
    /// Work units the caller estimates this piece of work will cost.
    pub requested_work_units: u64,
}

/// Outcome of the admission pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Work may proceed; report completion against `work_id`.
    Allow {
        /// Handle for the admitted work item.
        work_id: Uuid,
    },
    /// Work may not proceed.
    Deny {
        /// First failed check, verbatim.
        reason: DenyReason,
    },
}

/// Lifecycle status of an admitted work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Admitted, no completion report yet.
    InFlight,
    /// Caller reported success.
    Completed,
    /// Caller reported failure; the reservation was refunded.
    Failed,
    /// No report arrived within the max in-flight age; reclaimed by the
    /// sweeper and refunded.
    TimedOut,
}

/// One admitted unit of agent work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique work handle returned to the caller.
    pub work_id: Uuid,
    /// Session the work was admitted under.
    pub session_id: String,
    /// Agent performing the work.
    pub agent_id: String,
    /// Cost estimate presented at admission time.
    pub estimated_cost: u64,
    /// Units actually reserved against the session quota. Zero for
    /// operator-override admissions, which are unmetered.
    pub reserved_cost: u64,
    /// When the pipeline admitted the work.
    pub admitted_at: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: WorkStatus,
}

/// Audit event type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// The pipeline admitted a work request.
    Admitted,
    /// The pipeline denied a work request.
    Denied,
    /// An admitted work item completed and was reconciled.
    Completed,
    /// An admitted work item failed; its reservation was refunded.
    Failed,
    /// The sweeper reclaimed a work item that never reported back.
    TimedOut,
    /// An operator committed a new policy config.
    PolicyUpdated,
    /// The watchdog or an operator engaged the emergency mode.
    EmergencyTripped,
    /// A completion reported more units than could be reserved.
    QuotaOverrun,
    /// An operator lifted a session quarantine.
    QuarantineLifted,
}

impl AuditKind {
    /// Stable string form used as the store discriminator column.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Denied => "denied",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::PolicyUpdated => "policy_updated",
            Self::EmergencyTripped => "emergency_tripped",
            Self::QuotaOverrun => "quota_overrun",
            Self::QuarantineLifted => "quarantine_lifted",
        }
    }
}

/// A single immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the decision or outcome was recorded.
    pub timestamp: DateTime<Utc>,
    /// Session the event belongs to. Empty for gate-wide events such as
    /// policy updates.
    pub session_id: String,
    /// Agent involved, if any.
    pub agent_id: String,
    /// Event discriminator.
    pub kind: AuditKind,
    /// Deny reason or failure detail, when applicable.
    pub reason: Option<String>,
    /// Work units charged or refunded by this event.
    pub work_units: u64,
    /// Policy mode in force when the event was recorded.
    pub policy_mode: GateMode,
}

impl AuditEvent {
    /// Build an event stamped with the current time.
    pub fn now(
        session_id: impl Into<String>,
        agent_id: impl Into<String>,
        kind: AuditKind,
        reason: Option<String>,
        work_units: u64,
        policy_mode: GateMode,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            session_id: session_id.into(),
            agent_id: agent_id.into(),
            kind,
            reason,
            work_units,
            policy_mode,
        }
    }
}

/// Operator-facing aggregate for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session identifier.
    pub session_id: String,
    /// When the session was first seen.
    pub created_at: DateTime<Utc>,
    /// Last admissible request on the session.
    pub last_seen_at: DateTime<Utc>,
    /// Total work units granted (post-reconciliation).
    pub granted_work_units: u64,
    /// Requests counted against the per-session request limit.
    pub request_count: u64,
    /// Total denials on this session.
    pub denied_count: u64,
    /// Work units granted per agent.
    pub per_agent_granted: BTreeMap<String, u64>,
    /// Denial histogram — sums to `denied_count`.
    pub denial_reasons: BTreeMap<String, u64>,
    /// Whether the session is quarantined pending operator review.
    pub quarantined: bool,
}
