//! Security sentinel — pluggable anomaly checks behind pipeline check 6.
//!
//! Checks inspect the session's recent behavior and return a verdict; a
//! violation quarantines the session until an operator lifts it. The gate
//! runs every configured check and stops at the first violation.

use chrono::{DateTime, Utc};

use crate::gate::ledger::SessionState;
use crate::gate::policy::PolicyConfig;

/// Verdict from one security check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentinelVerdict {
    /// Nothing anomalous.
    Clear,
    /// The check tripped; the session is quarantined and the request
    /// denied as a security policy violation.
    Violation {
        /// Operator-facing description of what tripped.
        detail: String,
    },
}

/// One pluggable anomaly check.
pub trait SecurityCheck: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Inspect the session at the moment of admission.
    fn inspect(
        &self,
        session: &SessionState,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> SentinelVerdict;
}

/// Flags sessions issuing admission requests faster than the configured
/// per-minute ceiling.
pub struct RateSentinel;

impl SecurityCheck for RateSentinel {
    fn name(&self) -> &'static str {
        "request_rate"
    }

    fn inspect(
        &self,
        session: &SessionState,
        policy: &PolicyConfig,
        now: DateTime<Utc>,
    ) -> SentinelVerdict {
        let seen = session.requests_in_window(now);
        let ceiling = usize::try_from(policy.security.max_requests_per_minute).unwrap_or(usize::MAX);
        if seen > ceiling {
            return SentinelVerdict::Violation {
                detail: format!("{seen} requests in the last minute exceeds {ceiling}"),
            };
        }
        SentinelVerdict::Clear
    }
}

/// The default check set.
pub fn default_checks() -> Vec<Box<dyn SecurityCheck>> {
    vec![Box::new(RateSentinel)]
}
