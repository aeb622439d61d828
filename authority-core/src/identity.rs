//! Agent Identity (§3) and the Identity Claim Provider boundary (§6).
//!
//! `AgentIdentityPayload` is the immutable, signed tuple from §3. Revocation
//! is tracked out-of-band by `AgentIdentityRegistry`, keyed by `agentId`,
//! following `ccos::agents::identity::AgentRegistry`'s `RwLock<HashMap<..>>`
//! shape (§5: "Organizational Graph... multi-reader/single-writer"; the
//! identity registry follows the same discipline even though §3 doesn't
//! name it explicitly, because every consumer needs a revocation check).

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{CryptoGateway, KeyMaterial, Signature};
use crate::error::{AuthorityError, AuthorityResult};
use crate::serialize::stable_bytes;

pub type AgentId = String;
pub type OwnerId = String;
pub type OrgId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Production,
    Staging,
    Development,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Production => "production",
            Environment::Staging => "staging",
            Environment::Development => "development",
        }
    }
}

/// `{resources[], actions[], constraints?}` from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpec {
    pub resources: Vec<String>,
    pub actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<HashMap<String, serde_json::Value>>,
}

impl ScopeSpec {
    pub fn new(resources: Vec<String>, actions: Vec<String>) -> Self {
        Self {
            resources,
            actions,
            constraints: None,
        }
    }

    pub fn covers(&self, resource: &str, action: &str) -> bool {
        self.resources
            .iter()
            .any(|r| crate::pattern::glob_matches(r, resource))
            && self.actions.iter().any(|a| crate::pattern::glob_matches(a, action))
    }
}

/// `{environment, region?, labels?}` from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityContext {
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// The immutable, signed Agent Identity payload (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentIdentityPayload {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    pub org_id: OrgId,
    pub declared_scope: ScopeSpec,
    pub context: IdentityContext,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub version: u32,
    pub public_key: KeyMaterial,
}

/// The payload plus its detached signature — what is actually issued to an
/// agent and what the verification protocol (§4.7) checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedAgentIdentity {
    pub payload: AgentIdentityPayload,
    pub signature: Signature,
}

impl SignedAgentIdentity {
    /// Verify the detached signature over the stable serialization of the
    /// payload, using the payload's own declared public key. Expiry is
    /// checked separately by callers against a supplied `as_of` (§5: "Time
    /// is an input, not ambient state").
    pub fn verify_signature(&self, gateway: &dyn CryptoGateway) -> bool {
        let bytes = stable_bytes(&self.payload);
        gateway.verify(&bytes, &self.signature, &self.payload.public_key)
    }

    pub fn is_expired(&self, as_of: DateTime<Utc>) -> bool {
        as_of > self.payload.expires_at
    }
}

/// Roles resolved for an identity by the external claim provider (§6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleClaims {
    pub assigned: Vec<String>,
    pub resolved: Vec<String>,
}

/// Department membership resolved for an identity (§6).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DepartmentClaims {
    pub active_department_id: Option<String>,
    pub lineage: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimSource {
    pub synchronized_at: DateTime<Utc>,
}

/// `{subject, roles{assigned,resolved}, departments{...}, permissionScopes[],
/// source{synchronizedAt}}` from §6. Consumed as a read-only claim provider;
/// `resolved` roles and `lineage` are treated as authoritative by the graph
/// builder (§4.2).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityClaims {
    pub subject: AgentId,
    pub roles: RoleClaims,
    pub departments: DepartmentClaims,
    pub permission_scopes: Vec<ScopeSpec>,
    pub source: ClaimSource,
}

/// External, read-only identity/SSO/RBAC/directory connector (§6). The core
/// never calls this trait itself — integration adapters are expected to
/// resolve claims asynchronously and hand the core a materialized
/// `IdentityClaims` before any authority build (§5).
pub trait IdentityClaimProvider: Send + Sync {
    fn claims_for(&self, agent_id: &AgentId) -> Option<IdentityClaims>;
}

/// A static, in-memory claim provider useful for tests and for small
/// deployments that mirror directory state into the process.
#[derive(Debug, Default)]
pub struct StaticClaimProvider {
    claims: HashMap<AgentId, IdentityClaims>,
}

impl StaticClaimProvider {
    pub fn new() -> Self {
        Self {
            claims: HashMap::new(),
        }
    }

    pub fn insert(&mut self, claims: IdentityClaims) {
        self.claims.insert(claims.subject.clone(), claims);
    }
}

impl IdentityClaimProvider for StaticClaimProvider {
    fn claims_for(&self, agent_id: &AgentId) -> Option<IdentityClaims> {
        self.claims.get(agent_id).cloned()
    }
}

/// Registry of issued identities with revocation tracking, grounded on
/// `ccos::agents::identity::AgentRegistry`'s `RwLock<HashMap<..>>` shape.
/// Revocable by `agentId` (§3).
#[derive(Debug, Default)]
pub struct AgentIdentityRegistry {
    identities: RwLock<HashMap<AgentId, SignedAgentIdentity>>,
    revoked: RwLock<HashMap<AgentId, DateTime<Utc>>>,
}

impl AgentIdentityRegistry {
    pub fn new() -> Self {
        Self {
            identities: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashMap::new()),
        }
    }

    pub fn register(&self, identity: SignedAgentIdentity) -> AuthorityResult<()> {
        let mut identities = self
            .identities
            .write()
            .map_err(|_| AuthorityError::precondition_failed("identity registry lock poisoned"))?;
        identities.insert(identity.payload.agent_id.clone(), identity);
        Ok(())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<SignedAgentIdentity> {
        self.identities.read().ok()?.get(agent_id).cloned()
    }

    pub fn revoke(&self, agent_id: &AgentId, at: DateTime<Utc>) -> AuthorityResult<()> {
        let mut revoked = self
            .revoked
            .write()
            .map_err(|_| AuthorityError::precondition_failed("identity registry lock poisoned"))?;
        revoked.insert(agent_id.clone(), at);
        Ok(())
    }

    pub fn is_revoked(&self, agent_id: &AgentId) -> bool {
        self.revoked
            .read()
            .map(|r| r.contains_key(agent_id))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<SignedAgentIdentity> {
        self.identities
            .read()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }
}
