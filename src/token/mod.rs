//! Capability token validation.
//!
//! A blessing token is `base64url(claims JSON) "." hex(HMAC-SHA256)` where
//! the MAC is keyed by the issuer's shared secret and covers the raw claims
//! bytes. The gate only verifies tokens; issuing is an external authority's
//! job ([`mint`] exists for the operator CLI and tests).
//!
//! Validation is a pure function of (token, now, issuer keys, minimum
//! level); it has no side effects and never panics on hostile input.

use std::collections::HashMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::types::{DenyReason, TrustLevel};

type HmacSha256 = Hmac<Sha256>;

/// Claims carried inside a blessing token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Trust level granted to the bearer.
    pub level: TrustLevel,
    /// Hard expiry; the token is invalid at and after this instant.
    pub expires_at: DateTime<Utc>,
    /// Issuing authority — selects the verification key.
    pub issuer: String,
    /// Agents the bearer may request. Empty means all agents.
    #[serde(default)]
    pub scoped_agents: Vec<String>,
    /// Random value so identical claims produce distinct tokens.
    #[serde(default)]
    pub nonce: String,
}

/// Why a token failed validation.
///
/// The variants are deliberately distinct so the audit trail can tell an
/// attack attempt (bad signature) from routine expiry.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    /// The token could not be decoded into claims.
    #[error("token is not decodable")]
    Malformed,

    /// The signature did not verify against the issuer key set.
    #[error("token signature verification failed")]
    BadSignature,

    /// The token expiry is in the past.
    #[error("token expired at {expired_at}")]
    Expired {
        /// The expiry instant carried by the token.
        expired_at: DateTime<Utc>,
    },

    /// The token level is below the mode's minimum.
    #[error("token level {presented:?} below required {required:?}")]
    InsufficientLevel {
        /// Minimum level the current mode demands.
        required: TrustLevel,
        /// Level the token carries.
        presented: TrustLevel,
    },

    /// The requested agent is outside the token's scope.
    #[error("agent '{agent}' not in token scope")]
    AgentNotInScope {
        /// The agent that was requested.
        agent: String,
    },
}

impl TokenError {
    /// Map the validation failure onto the admission deny reason.
    pub fn deny_reason(&self) -> DenyReason {
        match self {
            Self::Malformed => DenyReason::Malformed,
            Self::BadSignature => DenyReason::BadSignature,
            Self::Expired { .. } => DenyReason::Expired,
            Self::InsufficientLevel { .. } => DenyReason::InsufficientLevel,
            Self::AgentNotInScope { .. } => DenyReason::AgentNotInScope,
        }
    }
}

/// Verifies blessing tokens against a configured issuer key set.
pub struct TokenValidator {
    /// Issuer name → shared MAC key.
    keys: HashMap<String, Vec<u8>>,
}

impl TokenValidator {
    /// Create a validator trusting the given issuer keys.
    pub fn new(keys: HashMap<String, Vec<u8>>) -> Self {
        Self { keys }
    }

    /// Validate a token for a requested agent at a minimum trust level.
    ///
    /// Checks run in order and short-circuit on the first failure:
    /// decodability, signature, expiry, level, agent scope.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a [`TokenError`].
    pub fn validate(
        &self,
        token: &str,
        requested_agent: &str,
        min_level: TrustLevel,
        now: DateTime<Utc>,
    ) -> Result<TokenClaims, TokenError> {
        // 1. Decodability.
        let (claims_part, sig_part) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let claims_bytes = URL_SAFE_NO_PAD
            .decode(claims_part)
            .map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&claims_bytes).map_err(|_| TokenError::Malformed)?;

        // 2. Signature integrity against the issuer key set.
        let key = self
            .keys
            .get(&claims.issuer)
            .ok_or(TokenError::BadSignature)?;
        let sig = hex::decode(sig_part).map_err(|_| TokenError::BadSignature)?;
        let mut mac = HmacSha256::new_from_slice(key).map_err(|_| TokenError::BadSignature)?;
        mac.update(&claims_bytes);
        mac.verify_slice(&sig).map_err(|_| TokenError::BadSignature)?;

        // 3. Expiry.
        if now >= claims.expires_at {
            return Err(TokenError::Expired {
                expired_at: claims.expires_at,
            });
        }

        // 4. Level against the mode's minimum.
        if claims.level < min_level {
            return Err(TokenError::InsufficientLevel {
                required: min_level,
                presented: claims.level,
            });
        }

        // 5. Agent scope. Empty scope means all agents.
        if !claims.scoped_agents.is_empty()
            && !claims.scoped_agents.iter().any(|a| a == requested_agent)
        {
            return Err(TokenError::AgentNotInScope {
                agent: requested_agent.to_owned(),
            });
        }

        Ok(claims)
    }
}

/// Sign claims with an issuer key, producing the wire-form token.
///
/// Issuing proper is out of the gate's scope; this helper backs the
/// `mint-token` CLI subcommand and the test suite.
pub fn mint(key: &[u8], claims: &TokenClaims) -> String {
    // Serializing a plain struct cannot fail; fall back to an empty claims
    // object rather than panicking in a helper reachable from the CLI.
    let claims_bytes = serde_json::to_vec(claims).unwrap_or_default();
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; this arm is unreachable.
        Err(_) => return String::new(),
    };
    mac.update(&claims_bytes);
    let sig = mac.finalize().into_bytes();
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&claims_bytes),
        hex::encode(sig)
    )
}

/// Fill a random nonce for freshly minted claims.
pub fn random_nonce() -> String {
    use rand::Rng;
    let bytes: Vec<u8> = (0..12).map(|_| rand::thread_rng().gen::<u8>()).collect();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const KEY: &[u8] = b"straylight-test-key";

    fn validator() -> TokenValidator {
        let mut keys = HashMap::new();
        keys.insert("core".to_owned(), KEY.to_vec());
        TokenValidator::new(keys)
    }

    fn claims(level: TrustLevel, ttl_secs: i64, agents: &[&str]) -> TokenClaims {
        TokenClaims {
            level,
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            issuer: "core".to_owned(),
            scoped_agents: agents.iter().map(|a| (*a).to_owned()).collect(),
            nonce: random_nonce(),
        }
    }

    #[test]
    fn valid_token_passes() {
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::Trusted, 60, &["cal"]));
        let out = v
            .validate(&token, "cal", TrustLevel::Trusted, Utc::now())
            .expect("should validate");
        assert_eq!(out.level, TrustLevel::Trusted);
    }

    #[test]
    fn empty_scope_matches_any_agent() {
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::Trusted, 60, &[]));
        assert!(v
            .validate(&token, "anything", TrustLevel::Trusted, Utc::now())
            .is_ok());
    }

    #[test]
    fn garbage_is_malformed() {
        let v = validator();
        for junk in ["", "not-a-token", "a.b.c.d", "!!!.00"] {
            assert_eq!(
                v.validate(junk, "cal", TrustLevel::Guest, Utc::now()),
                Err(TokenError::Malformed),
                "input {junk:?}"
            );
        }
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::Guest, 60, &[]));
        // Re-encode elevated claims but keep the original signature.
        let sig = token.split_once('.').expect("two parts").1;
        let forged_claims = serde_json::to_vec(&claims(TrustLevel::SystemBlessed, 60, &[]))
            .expect("serialize");
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&forged_claims), sig);
        assert_eq!(
            v.validate(&forged, "cal", TrustLevel::Guest, Utc::now()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn unknown_issuer_fails_signature() {
        let v = validator();
        let mut c = claims(TrustLevel::Trusted, 60, &[]);
        c.issuer = "nobody".to_owned();
        let token = mint(KEY, &c);
        assert_eq!(
            v.validate(&token, "cal", TrustLevel::Guest, Utc::now()),
            Err(TokenError::BadSignature)
        );
    }

    #[test]
    fn expired_token_fails_even_with_valid_signature() {
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::SystemBlessed, -1, &[]));
        assert!(matches!(
            v.validate(&token, "cal", TrustLevel::Guest, Utc::now()),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn expiry_checked_before_level() {
        // An expired token must report Expired, not InsufficientLevel.
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::Guest, -1, &[]));
        assert!(matches!(
            v.validate(&token, "cal", TrustLevel::SystemBlessed, Utc::now()),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn level_below_minimum_is_rejected() {
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::Guest, 60, &[]));
        assert_eq!(
            v.validate(&token, "cal", TrustLevel::Trusted, Utc::now()),
            Err(TokenError::InsufficientLevel {
                required: TrustLevel::Trusted,
                presented: TrustLevel::Guest,
            })
        );
    }

    #[test]
    fn agent_outside_scope_is_rejected() {
        let v = validator();
        let token = mint(KEY, &claims(TrustLevel::Trusted, 60, &["cal"]));
        assert_eq!(
            v.validate(&token, "domingo", TrustLevel::Trusted, Utc::now()),
            Err(TokenError::AgentNotInScope {
                agent: "domingo".to_owned(),
            })
        );
    }

    #[test]
    fn deny_reason_mapping() {
        assert_eq!(TokenError::Malformed.deny_reason(), DenyReason::Malformed);
        assert_eq!(
            TokenError::BadSignature.deny_reason(),
            DenyReason::BadSignature
        );
    }
}
