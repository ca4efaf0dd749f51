//! Concurrency properties: the session quota invariant under racing
//! admissions, independence of sessions, and racing completion reports.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};

use straylight::gate::audit::AuditReporter;
use straylight::gate::ledger::SessionLedger;
use straylight::gate::pipeline::Gate;
use straylight::gate::policy::{PolicyConfig, PolicyStore};
use straylight::gate::tracker::{CompletionOutcome, WorkTracker};
use straylight::token::{mint, random_nonce, TokenClaims, TokenValidator};
use straylight::types::{AdmissionRequest, Decision, TrustLevel};

const KEY: &[u8] = b"concurrency-test-key";

fn gate_with(policy: PolicyConfig) -> Arc<Gate> {
    let policy = Arc::new(PolicyStore::new(policy, None));
    let mut keys = HashMap::new();
    keys.insert("core".to_owned(), KEY.to_vec());
    let validator = Arc::new(TokenValidator::new(keys));
    let ledger = Arc::new(SessionLedger::new());
    let audit = AuditReporter::discard();
    let tracker = Arc::new(WorkTracker::new(
        Arc::clone(&ledger),
        Arc::clone(&policy),
        audit.clone(),
    ));
    Arc::new(Gate::new(policy, validator, ledger, tracker, audit))
}

fn open_policy(max_units: u64) -> PolicyConfig {
    let mut policy = PolicyConfig::default();
    policy.agent_whitelist.insert("cal".to_owned());
    policy.mode = straylight::types::GateMode::Development;
    policy.development_limit_multiplier = 1;
    policy.session_limits.max_work_units_per_session = max_units;
    policy.session_limits.max_requests_per_session = 10_000;
    policy.security.max_requests_per_minute = 100_000;
    policy.concurrency.max_in_flight = 10_000;
    policy.concurrency.max_in_flight_per_agent = 10_000;
    policy
}

fn token_for(agents: &[&str]) -> String {
    mint(
        KEY,
        &TokenClaims {
            level: TrustLevel::Trusted,
            expires_at: Utc::now() + Duration::seconds(600),
            issuer: "core".to_owned(),
            scoped_agents: agents.iter().map(|a| (*a).to_owned()).collect(),
            nonce: random_nonce(),
        },
    )
}

fn request(session: &str, units: u64) -> AdmissionRequest {
    AdmissionRequest {
        session_id: session.to_owned(),
        agent_id: "cal".to_owned(),
        token: None,
        requested_work_units: units,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_admissions_never_overspend_a_session() {
    let gate = gate_with(open_policy(10));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            let mut allowed = 0_u64;
            for _ in 0..5 {
                if matches!(gate.admit(&request("s1", 1)), Decision::Allow { .. }) {
                    allowed = allowed.saturating_add(1);
                }
            }
            allowed
        }));
    }

    let mut total = 0_u64;
    for handle in handles {
        total = total.saturating_add(handle.await.expect("task"));
    }

    // 40 attempts raced for 10 units; exactly 10 may win.
    assert_eq!(total, 10);
    let summary = gate.summarize("s1").expect("summary");
    assert_eq!(summary.granted_work_units, 10);
    assert!(summary.granted_work_units <= 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_spend_independently() {
    let gate = gate_with(open_policy(3));

    let mut handles = Vec::new();
    for session in ["a", "b", "c", "d"] {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            let mut allowed = 0_u64;
            for _ in 0..6 {
                if matches!(gate.admit(&request(session, 1)), Decision::Allow { .. }) {
                    allowed = allowed.saturating_add(1);
                }
            }
            allowed
        }));
    }

    for handle in handles {
        // Every session gets its own full budget, no cross-talk.
        assert_eq!(handle.await.expect("task"), 3);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_completion_reports_settle_once() {
    let gate = gate_with(open_policy(10));
    let work_id = match gate.admit(&request("s1", 5)) {
        Decision::Allow { work_id } => work_id,
        Decision::Deny { reason } => panic!("unexpected deny: {reason}"),
    };

    let mut handles = Vec::new();
    for _ in 0..4 {
        let gate = Arc::clone(&gate);
        handles.push(tokio::spawn(async move {
            gate.complete(work_id, 5, None).expect("report")
        }));
    }

    let mut reconciled = 0_u32;
    let mut already_terminal = 0_u32;
    for handle in handles {
        match handle.await.expect("task") {
            CompletionOutcome::Reconciled { .. } => reconciled = reconciled.saturating_add(1),
            CompletionOutcome::AlreadyTerminal => {
                already_terminal = already_terminal.saturating_add(1);
            }
            CompletionOutcome::Overrun { .. } => panic!("no overrun expected"),
        }
    }

    // Exactly one report wins; the rest observe the terminal state.
    assert_eq!(reconciled, 1);
    assert_eq!(already_terminal, 3);
    assert_eq!(gate.summarize("s1").expect("summary").granted_work_units, 5);
}

#[tokio::test]
async fn blessing_tokens_scope_to_agents_under_load() {
    let mut policy = open_policy(100);
    policy.mode = straylight::types::GateMode::BlessingRequired;
    policy.agent_whitelist.insert("domingo".to_owned());
    policy
        .per_agent_blessing
        .insert("cal".to_owned(), true);
    policy.per_agent_blessing.insert("domingo".to_owned(), true);
    let gate = gate_with(policy);

    let cal_only = token_for(&["cal"]);
    let ok = AdmissionRequest {
        session_id: "s1".to_owned(),
        agent_id: "cal".to_owned(),
        token: Some(cal_only.clone()),
        requested_work_units: 1,
    };
    let out_of_scope = AdmissionRequest {
        session_id: "s1".to_owned(),
        agent_id: "domingo".to_owned(),
        token: Some(cal_only),
        requested_work_units: 1,
    };

    assert!(matches!(gate.admit(&ok), Decision::Allow { .. }));
    assert!(matches!(
        gate.admit(&out_of_scope),
        Decision::Deny {
            reason: straylight::types::DenyReason::AgentNotInScope
        }
    ));
}
