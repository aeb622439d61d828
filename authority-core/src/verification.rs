//! Authority Verification Protocol (§4.7, component I).
//!
//! Offline-verifiable, self-contained token: an identity plus a chain of
//! assertions terminating at a trust anchor. Grounded on the same
//! `CryptoGateway` boundary as `identity.rs`'s `verify_signature`, extended
//! to walk a chain instead of a single signature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoGateway, KeyMaterial, Signature};
use crate::identity::{AgentId, SignedAgentIdentity};
use crate::serialize::stable_bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionType {
    RoleAssignment,
    Delegation,
    OwnershipGrant,
}

/// The signed-over portion of one assertion (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionPayload {
    pub issuer_id: AgentId,
    pub subject_id: AgentId,
    pub assertion_type: AssertionType,
    pub claim: serde_json::Value,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub nonce: String,
}

/// `{payload{issuerId, subjectId, type, claim, issuedAt, expiresAt, nonce},
/// signature, issuerPublicKey}` from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assertion {
    pub payload: AssertionPayload,
    pub signature: Signature,
    pub issuer_public_key: KeyMaterial,
}

/// Signs `payload` with the issuer's private key and bundles the issuer's
/// public key alongside it (§4.7 "Assertion issuance").
pub fn issue_assertion(
    gateway: &dyn CryptoGateway,
    payload: AssertionPayload,
    issuer_private_key: &KeyMaterial,
    issuer_public_key: KeyMaterial,
) -> Assertion {
    let bytes = stable_bytes(&payload);
    let signature = gateway.sign(&bytes, issuer_private_key);
    Assertion {
        payload,
        signature,
        issuer_public_key,
    }
}

/// `{assertions[], targetSubjectId, requiredScope?}` from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityProof {
    pub assertions: Vec<Assertion>,
    pub target_subject_id: AgentId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<crate::identity::ScopeSpec>,
}

/// `{identityPayload, identitySignature, authorityProof, version}` from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableAuthorityToken {
    pub identity: SignedAgentIdentity,
    pub authority_proof: AuthorityProof,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustChainStatus {
    Verified,
    Broken,
    Unverified,
}

/// §4.7's verification result. `verified_claims` holds each assertion's
/// `claim` value, in chain order, only on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub is_valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub trust_chain_status: TrustChainStatus,
    pub verified_claims: Vec<serde_json::Value>,
}

impl VerificationResult {
    fn failure(reason: impl Into<String>, status: TrustChainStatus) -> Self {
        Self {
            is_valid: false,
            reason: Some(reason.into()),
            trust_chain_status: status,
            verified_claims: Vec::new(),
        }
    }

    fn success(verified_claims: Vec<serde_json::Value>) -> Self {
        Self {
            is_valid: true,
            reason: None,
            trust_chain_status: TrustChainStatus::Verified,
            verified_claims,
        }
    }
}

/// Verifies a portable token against `trusted_roots` as of `now` (§4.7):
/// identity signature, per-assertion signature and expiry, chain
/// continuity from a trusted root, and termination at the identity's own
/// `agentId`.
pub fn verify_portable_token(
    gateway: &dyn CryptoGateway,
    token: &PortableAuthorityToken,
    trusted_roots: &[KeyMaterial],
    now: DateTime<Utc>,
) -> VerificationResult {
    if !token.identity.verify_signature(gateway) {
        return VerificationResult::failure("identity signature invalid", TrustChainStatus::Unverified);
    }

    let assertions = &token.authority_proof.assertions;
    if assertions.is_empty() {
        return VerificationResult::failure(
            "authority proof carries no assertions",
            TrustChainStatus::Unverified,
        );
    }

    for assertion in assertions {
        let bytes = stable_bytes(&assertion.payload);
        if !gateway.verify(&bytes, &assertion.signature, &assertion.issuer_public_key) {
            return VerificationResult::failure(
                format!("assertion signature invalid for issuer {}", assertion.payload.issuer_id),
                TrustChainStatus::Unverified,
            );
        }
        if now > assertion.payload.expires_at {
            return VerificationResult::failure(
                format!("assertion from {} has expired", assertion.payload.issuer_id),
                TrustChainStatus::Unverified,
            );
        }
    }

    let first = &assertions[0];
    if !trusted_roots.contains(&first.issuer_public_key) {
        return VerificationResult::failure(
            "Broken authority chain: issuer not a trusted root",
            TrustChainStatus::Broken,
        );
    }

    for i in 1..assertions.len() {
        if assertions[i].payload.issuer_id != assertions[i - 1].payload.subject_id {
            return VerificationResult::failure(
                "Broken authority chain: issuer mismatch",
                TrustChainStatus::Broken,
            );
        }
    }

    let last = assertions.last().unwrap();
    if last.payload.subject_id != token.identity.payload.agent_id {
        return VerificationResult::failure(
            "Broken authority chain: unterminated target",
            TrustChainStatus::Broken,
        );
    }

    let verified_claims = assertions.iter().map(|a| a.payload.claim.clone()).collect();
    VerificationResult::success(verified_claims)
}
