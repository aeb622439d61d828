//! Context Adaptation (§4.4, component F).
//!
//! Layers time-bounded policy overlays on top of a base Authority Graph,
//! producing a reversible "adaptation session". Expiry sweeps run at the
//! start of every public call (§5), mirroring the same discipline
//! `DelegationControl` applies to its records.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::authority_graph::{build, AuthorityGraph, AuthorityGraphBuildInput};
use crate::error::{AuthorityError, AuthorityResult};
use crate::policy::{AuthorityPolicy, Decision, GovernanceLimits};

pub type AdaptationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Expired,
    Reverted,
}

#[derive(Debug, Clone)]
pub struct ProjectAssignment {
    pub project_id: String,
    pub policy: AuthorityPolicy,
}

#[derive(Debug, Clone)]
pub struct EmergencyOverride {
    pub policy: AuthorityPolicy,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct ComplianceFlag {
    pub flag: String,
    pub policy: AuthorityPolicy,
}

#[derive(Debug, Clone)]
pub struct JurisdictionOverlay {
    pub code: String,
    pub policy: AuthorityPolicy,
}

/// Up to four triggers contributing overlays in a single `adapt` call
/// (§4.4 table).
#[derive(Debug, Clone, Default)]
pub struct ContextSignal {
    pub project_assignment: Option<ProjectAssignment>,
    pub emergency_override: Option<EmergencyOverride>,
    pub compliance_flag: Option<ComplianceFlag>,
    pub jurisdiction: Option<JurisdictionOverlay>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionDeltaEntry {
    pub resource: String,
    pub action: String,
    pub base_decision: Decision,
    pub adapted_decision: Decision,
}

/// `{adaptationId, createdAt, expiresAt, status, baseGraph, adaptedGraph,
/// appliedPolicies[], decisionDelta[]}` from §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptationSession {
    pub adaptation_id: AdaptationId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub base_graph: AuthorityGraph,
    pub adapted_graph: AuthorityGraph,
    pub applied_policies: Vec<(String, AuthorityPolicy)>,
    pub decision_delta: Vec<DecisionDeltaEntry>,
    pub reverted_at: Option<DateTime<Utc>>,
}

/// Owns adaptation sessions, indexed by id (§4.4, §5).
pub struct ContextAdaptation {
    sessions: RwLock<HashMap<AdaptationId, AdaptationSession>>,
    limits: GovernanceLimits,
}

impl ContextAdaptation {
    pub fn new(limits: GovernanceLimits) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            limits,
        }
    }

    /// §4.4: collects overlays from the four triggers present in
    /// `context_signal`, builds an adapted graph from
    /// `base_input.org_policies ++ overlays`, and records the session. If no
    /// trigger is present the adapted graph equals the base graph bit-for-bit
    /// (§8 invariant) and the session's `expiresAt` falls back to
    /// `asOf + defaultOverlayTtl`.
    pub fn adapt(&self, base_input: AuthorityGraphBuildInput<'_>, context_signal: &ContextSignal, as_of: DateTime<Utc>) -> AuthorityResult<AdaptationSession> {
        self.sweep(as_of)?;

        let base_graph = build(AuthorityGraphBuildInput {
            extra_policies: base_input.extra_policies,
            ..clone_input(&base_input)
        });

        let mut overlays: Vec<(String, AuthorityPolicy)> = Vec::new();
        let mut expiries: Vec<DateTime<Utc>> = Vec::new();
        let default_expiry = as_of + self.limits.default_overlay_ttl;

        if let Some(project) = &context_signal.project_assignment {
            overlays.push((format!("context:project:{}", project.project_id), project.policy.clone()));
            expiries.push(default_expiry);
        }
        if let Some(emergency) = &context_signal.emergency_override {
            overlays.push(("context:emergency_override".to_string(), emergency.policy.clone()));
            expiries.push(emergency.expires_at.unwrap_or(default_expiry));
        }
        if let Some(compliance) = &context_signal.compliance_flag {
            overlays.push((format!("context:compliance:{}", compliance.flag), compliance.policy.clone()));
            expiries.push(default_expiry);
        }
        if let Some(jurisdiction) = &context_signal.jurisdiction {
            overlays.push((format!("context:jurisdiction:{}", jurisdiction.code), jurisdiction.policy.clone()));
            expiries.push(default_expiry);
        }

        let session_expiry = expiries.into_iter().min().unwrap_or(default_expiry);

        let mut combined_extra: Vec<(String, AuthorityPolicy)> = base_input.extra_policies.to_vec();
        combined_extra.extend(overlays.iter().cloned());

        let adapted_graph = build(AuthorityGraphBuildInput {
            extra_policies: &combined_extra,
            ..clone_input(&base_input)
        });

        let decision_delta = compute_delta(&base_graph, &adapted_graph);

        let adaptation_id = uuid::Uuid::new_v4().to_string();
        let session = AdaptationSession {
            adaptation_id: adaptation_id.clone(),
            created_at: as_of,
            expires_at: session_expiry,
            status: SessionStatus::Active,
            base_graph,
            adapted_graph,
            applied_policies: overlays,
            decision_delta,
            reverted_at: None,
        };

        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AuthorityError::precondition_failed("adaptation session registry lock poisoned"))?;
        sessions.insert(adaptation_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, adaptation_id: &str, as_of: DateTime<Utc>) -> AuthorityResult<Option<AdaptationSession>> {
        self.sweep(as_of)?;
        let sessions = self
            .sessions
            .read()
            .map_err(|_| AuthorityError::precondition_failed("adaptation session registry lock poisoned"))?;
        Ok(sessions.get(adaptation_id).cloned())
    }

    /// §4.4: fails with `PreconditionFailed` if the session is not `Active`.
    pub fn revert(&self, adaptation_id: &str, as_of: DateTime<Utc>) -> AuthorityResult<AdaptationSession> {
        self.sweep(as_of)?;
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AuthorityError::precondition_failed("adaptation session registry lock poisoned"))?;
        let session = sessions
            .get_mut(adaptation_id)
            .ok_or_else(|| AuthorityError::not_found(format!("adaptation session {} not found", adaptation_id)))?;

        if session.status != SessionStatus::Active {
            return Err(AuthorityError::precondition_failed(format!(
                "adaptation session {} is not active",
                adaptation_id
            )));
        }

        session.status = SessionStatus::Reverted;
        session.reverted_at = Some(as_of);
        Ok(session.clone())
    }

    /// §5: "expiry sweeps run at the start of every public call"; transitions
    /// any `Active` session whose `expiresAt <= as_of` to `Expired` exactly
    /// once.
    fn sweep(&self, as_of: DateTime<Utc>) -> AuthorityResult<()> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| AuthorityError::precondition_failed("adaptation session registry lock poisoned"))?;
        for session in sessions.values_mut() {
            if session.status == SessionStatus::Active && as_of >= session.expires_at {
                session.status = SessionStatus::Expired;
            }
        }
        Ok(())
    }
}

fn clone_input<'a>(input: &AuthorityGraphBuildInput<'a>) -> AuthorityGraphBuildInput<'a> {
    AuthorityGraphBuildInput {
        identity: input.identity,
        claims: input.claims,
        role_scopes: input.role_scopes,
        org_policies: input.org_policies,
        active_delegations: input.active_delegations,
        org_graph: input.org_graph,
        as_of: input.as_of,
        extra_policies: input.extra_policies,
    }
}

/// The set of `(resource, action)` keys whose decision differs between
/// `base` and `adapted`, sorted (§4.4).
fn compute_delta(base: &AuthorityGraph, adapted: &AuthorityGraph) -> Vec<DecisionDeltaEntry> {
    let mut keys: std::collections::BTreeSet<(String, String)> = std::collections::BTreeSet::new();
    for rule in base_rules(base) {
        keys.insert((rule.resource.clone(), rule.action.clone()));
    }
    for rule in base_rules(adapted) {
        keys.insert((rule.resource.clone(), rule.action.clone()));
    }

    let mut delta = Vec::new();
    for (resource, action) in keys {
        let (base_decision, _) = base.decide(&resource, &action);
        let (adapted_decision, _) = adapted.decide(&resource, &action);
        if base_decision != adapted_decision {
            delta.push(DecisionDeltaEntry {
                resource,
                action,
                base_decision,
                adapted_decision,
            });
        }
    }
    delta
}

fn base_rules(graph: &AuthorityGraph) -> impl Iterator<Item = &crate::authority_graph::AuthorityRule> {
    graph
        .can_execute
        .iter()
        .chain(graph.requires_approval.iter())
        .chain(graph.prohibited.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoGateway, KeyMaterial, Sha256Gateway};
    use crate::identity::{
        AgentIdentityPayload, ClaimSource, DepartmentClaims, Environment, IdentityClaims, IdentityContext,
        RoleClaims, ScopeSpec, SignedAgentIdentity,
    };
    use crate::org_graph::OrgGraph;
    use crate::policy::Effect;
    use crate::serialize::stable_bytes;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    fn identity(now: DateTime<Utc>) -> SignedAgentIdentity {
        let gateway = Sha256Gateway;
        let payload = AgentIdentityPayload {
            agent_id: "agent-1".to_string(),
            owner_id: "owner-1".to_string(),
            org_id: "org-1".to_string(),
            declared_scope: ScopeSpec::new(vec!["service:*".to_string()], vec!["deploy".to_string()]),
            context: IdentityContext {
                environment: Environment::Production,
                region: None,
                labels: None,
            },
            issued_at: now,
            expires_at: now + chrono::Duration::days(30),
            version: 1,
            public_key: KeyMaterial::from_str("k1"),
        };
        let bytes = stable_bytes(&payload);
        let signature = gateway.sign(&bytes, &KeyMaterial::from_str("k1"));
        SignedAgentIdentity { payload, signature }
    }

    fn claims() -> IdentityClaims {
        IdentityClaims {
            subject: "agent-1".to_string(),
            roles: RoleClaims {
                assigned: vec![],
                resolved: vec![],
            },
            departments: DepartmentClaims {
                active_department_id: None,
                lineage: vec![],
            },
            permission_scopes: vec![],
            source: ClaimSource {
                synchronized_at: Utc::now(),
            },
        }
    }

    #[test]
    fn no_overlays_leaves_adapted_graph_identical_to_base() {
        let now = Utc::now();
        let id = identity(now);
        let c = claims();
        let role_scopes = BTreeMap::new();
        let org_graph = OrgGraph::new();
        let adaptation = ContextAdaptation::new(GovernanceLimits::default());

        let session = adaptation
            .adapt(
                AuthorityGraphBuildInput {
                    identity: &id,
                    claims: &c,
                    role_scopes: &role_scopes,
                    org_policies: &[],
                    active_delegations: &[],
                    org_graph: &org_graph,
                    as_of: now,
                    extra_policies: &[],
                },
                &ContextSignal::default(),
                now,
            )
            .unwrap();

        assert_eq!(session.base_graph, session.adapted_graph);
        assert!(session.decision_delta.is_empty());
    }

    #[test]
    fn emergency_override_scenario() {
        let now = Utc::now();
        let id = identity(now);
        let c = claims();
        let role_scopes = BTreeMap::new();
        let org_graph = OrgGraph::new();
        let adaptation = ContextAdaptation::new(GovernanceLimits::default());

        let signal = ContextSignal {
            emergency_override: Some(EmergencyOverride {
                policy: AuthorityPolicy {
                    resource: "*".to_string(),
                    actions: vec!["*".to_string()],
                    effect: Effect::RequireApproval,
                    reason: Some("emergency override in effect".to_string()),
                    constraints: None,
                    condition: None,
                },
                expires_at: Some(now + chrono::Duration::seconds(3600)),
            }),
            ..ContextSignal::default()
        };

        let session = adaptation
            .adapt(
                AuthorityGraphBuildInput {
                    identity: &id,
                    claims: &c,
                    role_scopes: &role_scopes,
                    org_policies: &[],
                    active_delegations: &[],
                    org_graph: &org_graph,
                    as_of: now,
                    extra_policies: &[],
                },
                &signal,
                now,
            )
            .unwrap();

        assert_eq!(session.expires_at, now + chrono::Duration::seconds(3600));
        assert!(session
            .decision_delta
            .iter()
            .any(|d| d.resource == "*" && d.action == "*" && d.base_decision == Decision::Prohibited && d.adapted_decision == Decision::RequiresApproval));

        let after_expiry = adaptation.get(&session.adaptation_id, now + chrono::Duration::seconds(3601)).unwrap().unwrap();
        assert_eq!(after_expiry.status, SessionStatus::Expired);

        let err = adaptation
            .revert(&session.adaptation_id, now + chrono::Duration::seconds(3601))
            .unwrap_err();
        assert!(matches!(err, AuthorityError::PreconditionFailed(_)));
    }

    #[test]
    fn revert_restores_active_session_to_reverted() {
        let now = Utc::now();
        let id = identity(now);
        let c = claims();
        let role_scopes = BTreeMap::new();
        let org_graph = OrgGraph::new();
        let adaptation = ContextAdaptation::new(GovernanceLimits::default());

        let signal = ContextSignal {
            compliance_flag: Some(ComplianceFlag {
                flag: "gdpr".to_string(),
                policy: AuthorityPolicy::deny("service:eu-*", vec!["export".to_string()], "gdpr restriction"),
            }),
            ..ContextSignal::default()
        };

        let session = adaptation
            .adapt(
                AuthorityGraphBuildInput {
                    identity: &id,
                    claims: &c,
                    role_scopes: &role_scopes,
                    org_policies: &[],
                    active_delegations: &[],
                    org_graph: &org_graph,
                    as_of: now,
                    extra_policies: &[],
                },
                &signal,
                now,
            )
            .unwrap();

        let reverted = adaptation.revert(&session.adaptation_id, now).unwrap();
        assert_eq!(reverted.status, SessionStatus::Reverted);
        assert!(reverted.reverted_at.is_some());
    }
}
