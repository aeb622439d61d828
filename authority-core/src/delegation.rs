//! Delegation Control (§4.3, component E).
//!
//! Owns delegation records exclusively (§5). Grounded on
//! `ccos::agents::identity::AgentRegistry`'s `RwLock<HashMap<..>>` registry
//! shape, with creation/revocation paths emitting audit events the way the
//! teacher's approval storage (`InMemoryApprovalStorage`) records state
//! transitions rather than silently mutating.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditDomain, AuditEventInput, AuditTrace, EventDecision};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::{AgentId, Environment, ScopeSpec};
use crate::pattern::pattern_covers;
use crate::policy::{Effect, GovernanceLimits};

pub type DelegationId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelegationStatus {
    Scheduled,
    Active,
    Expired,
    Revoked,
}

/// Context restriction carried by a delegation (§4.3): all-of semantics
/// across every present dimension, missing dimension unrestricted — the
/// same shape as `PolicyCondition` (§3), specialised with labels instead of
/// departments/roles because delegations restrict by declared context, not
/// by claim-resolved membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextRestriction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<Vec<Environment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_labels: Option<HashMap<String, String>>,
}

impl ContextRestriction {
    pub fn is_satisfied(&self, environment: Environment, region: Option<&str>, labels: &HashMap<String, String>) -> bool {
        if let Some(envs) = &self.environments {
            if !envs.iter().any(|e| e.as_str() == environment.as_str()) {
                return false;
            }
        }
        if let Some(required_region) = &self.region {
            if region != Some(required_region.as_str()) {
                return false;
            }
        }
        if let Some(required_labels) = &self.required_labels {
            for (k, v) in required_labels {
                if labels.get(k) != Some(v) {
                    return false;
                }
            }
        }
        true
    }
}

/// `{delegationId, grantorAgentId, granteeAgentId, effect, scope, reason?,
/// startsAt, expiresAt?, contextRestriction?, parentDelegationId?, chain[],
/// status, createdAt, revokedAt?}` from §4.3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationRecord {
    pub delegation_id: DelegationId,
    pub grantor_agent_id: AgentId,
    pub grantee_agent_id: AgentId,
    pub effect: Effect,
    pub scope: ScopeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub starts_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_restriction: Option<ContextRestriction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_delegation_id: Option<DelegationId>,
    pub chain: Vec<DelegationId>,
    pub status: DelegationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
}

impl DelegationRecord {
    /// §4.3: scheduled/active/expired/revoked is always a pure function of
    /// `asOf` against the stored timestamps — status is never mutated by the
    /// passage of time, only recomputed on read (except `Revoked`, which is
    /// sticky).
    pub fn status_at(&self, as_of: DateTime<Utc>) -> DelegationStatus {
        if self.status == DelegationStatus::Revoked {
            return DelegationStatus::Revoked;
        }
        if as_of < self.starts_at {
            return DelegationStatus::Scheduled;
        }
        if let Some(expires_at) = self.expires_at {
            if as_of >= expires_at {
                return DelegationStatus::Expired;
            }
        }
        DelegationStatus::Active
    }

    pub fn is_active_at(&self, as_of: DateTime<Utc>) -> bool {
        self.status_at(as_of) == DelegationStatus::Active
    }
}

/// A request to create a delegation; `delegation_id`/`chain`/`status`/
/// `created_at` are computed by `DelegationControl::create`.
#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub grantor_agent_id: AgentId,
    pub grantee_agent_id: AgentId,
    pub effect: Effect,
    pub scope: ScopeSpec,
    pub reason: Option<String>,
    pub starts_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub context_restriction: Option<ContextRestriction>,
    pub parent_delegation_id: Option<DelegationId>,
}

/// Owns delegation records (§5: "Delegation Control owns delegation
/// records exclusively"). Validates coverage, TTL, and chain depth on
/// create (§4.3 invariants); revoke is idempotent on terminal states.
pub struct DelegationControl<'a> {
    records: RwLock<HashMap<DelegationId, DelegationRecord>>,
    limits: GovernanceLimits,
    audit: Option<&'a AuditTrace>,
}

impl<'a> DelegationControl<'a> {
    pub fn new(limits: GovernanceLimits) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            limits,
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: &'a AuditTrace) -> Self {
        self.audit = Some(audit);
        self
    }

    /// §3 invariants, checked in order:
    /// - `scope.resources`/`scope.actions` non-empty (`InvalidArgument`);
    /// - if `expiresAt` present, `expiresAt > startsAt` (`InvalidArgument`);
    /// - `expiresAt - createdAt <= maxTtl` (`LimitExceeded`);
    /// - with a parent: `grantor == parent.grantee` (`PreconditionFailed`),
    ///   parent not terminal (`PreconditionFailed`), child scope
    ///   pattern-covered by parent scope (`InvalidArgument`, matching the
    ///   literal scenario in §8.2), `child.expiresAt <= parent.expiresAt`
    ///   (`LimitExceeded`), `parent.chain.len() + 1 <= maxChainDepth`
    ///   (`LimitExceeded`);
    /// - without a parent: grantor's own effective authority (supplied by
    ///   the caller as `grantor_scope`, since only the caller holds the org
    ///   graph) must cover every `(resource, action)` pair in `scope`
    ///   (`LimitExceeded`, per §7 "scope not covered by... grantor
    ///   capabilities").
    ///
    /// Open Question (§9) resolved: a `scheduled` parent is not terminal, so
    /// creating a child beneath a not-yet-active parent remains allowed, as
    /// the spec's current behavior documents. See `DESIGN.md`.
    pub fn create(
        &self,
        request: DelegationRequest,
        grantor_scope: &[ScopeSpec],
        now: DateTime<Utc>,
    ) -> AuthorityResult<DelegationRecord> {
        if request.scope.resources.is_empty() || request.scope.actions.is_empty() {
            return Err(AuthorityError::invalid_argument(
                "delegation scope must name at least one resource and one action",
            ));
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at <= request.starts_at {
                return Err(AuthorityError::invalid_argument(
                    "delegation expiresAt must be after startsAt",
                ));
            }
        }
        if let Some(expires_at) = request.expires_at {
            if expires_at - now > self.limits.max_delegation_ttl {
                return Err(AuthorityError::limit_exceeded("delegation TTL exceeds maxTtl"));
            }
        }

        let mut chain = Vec::new();
        if let Some(parent_id) = &request.parent_delegation_id {
            let records = self
                .records
                .read()
                .map_err(|_| AuthorityError::precondition_failed("delegation registry lock poisoned"))?;
            let parent = records
                .get(parent_id)
                .ok_or_else(|| AuthorityError::not_found(format!("delegation {} not found", parent_id)))?
                .clone();
            drop(records);

            if request.grantor_agent_id != parent.grantee_agent_id {
                return Err(AuthorityError::precondition_failed(
                    "grantor is not parent delegation's grantee",
                ));
            }
            if parent.status_at(now) == DelegationStatus::Expired
                || parent.status_at(now) == DelegationStatus::Revoked
            {
                return Err(AuthorityError::precondition_failed("parent delegation is terminal"));
            }

            for action in &request.scope.actions {
                let covered = request.scope.resources.iter().all(|resource| {
                    parent
                        .scope
                        .resources
                        .iter()
                        .any(|parent_resource| pattern_covers(parent_resource, resource))
                }) && parent.scope.actions.iter().any(|parent_action| pattern_covers(parent_action, action));
                if !covered {
                    let reason = format!("Child delegation action exceeds parent scope: {}", action);
                    self.emit(
                        AuditDomain::DelegationEvent,
                        "delegation_denied",
                        None,
                        Some(request.grantor_agent_id.clone()),
                        json!({"reason": reason}),
                        now,
                    );
                    return Err(AuthorityError::invalid_argument(reason));
                }
            }

            if let (Some(child_expiry), Some(parent_expiry)) = (request.expires_at, parent.expires_at) {
                if child_expiry > parent_expiry {
                    return Err(AuthorityError::limit_exceeded(
                        "child delegation expiresAt exceeds parent delegation expiresAt",
                    ));
                }
            } else if request.expires_at.is_none() && parent.expires_at.is_some() {
                return Err(AuthorityError::limit_exceeded(
                    "child delegation must not outlive a bounded parent delegation",
                ));
            }

            if parent.chain.len() + 1 > self.limits.max_chain_depth {
                return Err(AuthorityError::limit_exceeded(
                    "delegation chain exceeds maxChainDepth",
                ));
            }
            chain.extend(parent.chain.iter().cloned());
            chain.push(parent_id.clone());
        } else {
            for resource in &request.scope.resources {
                for action in &request.scope.actions {
                    if !grantor_scope.iter().any(|s| s.covers(resource, action)) {
                        let reason = format!(
                            "grantor does not hold authority over ({}, {})",
                            resource, action
                        );
                        self.emit(
                            AuditDomain::DelegationEvent,
                            "delegation_denied",
                            None,
                            Some(request.grantor_agent_id.clone()),
                            json!({"resource": resource, "action": action}),
                            now,
                        );
                        return Err(AuthorityError::limit_exceeded(reason));
                    }
                }
            }
        }

        let delegation_id = uuid::Uuid::new_v4().to_string();
        let record = DelegationRecord {
            delegation_id: delegation_id.clone(),
            grantor_agent_id: request.grantor_agent_id,
            grantee_agent_id: request.grantee_agent_id,
            effect: request.effect,
            scope: request.scope,
            reason: request.reason,
            starts_at: request.starts_at,
            expires_at: request.expires_at,
            context_restriction: request.context_restriction,
            parent_delegation_id: request.parent_delegation_id,
            chain,
            status: DelegationStatus::Active,
            created_at: now,
            revoked_at: None,
        };

        {
            let mut records = self
                .records
                .write()
                .map_err(|_| AuthorityError::precondition_failed("delegation registry lock poisoned"))?;
            records.insert(delegation_id.clone(), record.clone());
        }

        self.emit(
            AuditDomain::DelegationEvent,
            "delegation_created",
            Some(delegation_id),
            Some(record.grantor_agent_id.clone()),
            json!({"grantee": record.grantee_agent_id, "effect": record.effect}),
            now,
        );

        Ok(record)
    }

    /// Idempotent: revoking an already-revoked or already-expired
    /// delegation is a no-op that returns the current record (§4.3).
    pub fn revoke(&self, delegation_id: &str, now: DateTime<Utc>) -> AuthorityResult<DelegationRecord> {
        let mut records = self
            .records
            .write()
            .map_err(|_| AuthorityError::precondition_failed("delegation registry lock poisoned"))?;
        let record = records
            .get_mut(delegation_id)
            .ok_or_else(|| AuthorityError::not_found(format!("delegation {} not found", delegation_id)))?;

        if record.status == DelegationStatus::Revoked {
            return Ok(record.clone());
        }
        if record.status_at(now) == DelegationStatus::Expired {
            return Ok(record.clone());
        }

        record.status = DelegationStatus::Revoked;
        record.revoked_at = Some(now);
        let result = record.clone();
        drop(records);

        self.emit(
            AuditDomain::DelegationEvent,
            "delegation_revoked",
            Some(delegation_id.to_string()),
            Some(result.grantor_agent_id.clone()),
            json!({"grantee": result.grantee_agent_id}),
            now,
        );

        Ok(result)
    }

    pub fn get(&self, delegation_id: &str) -> Option<DelegationRecord> {
        self.records.read().ok()?.get(delegation_id).cloned()
    }

    /// Delegations currently active for `grantee_agent_id` as of `as_of`
    /// (§4.3, used by the Authority Graph Builder).
    pub fn active_for_grantee(&self, grantee_agent_id: &str, as_of: DateTime<Utc>) -> Vec<DelegationRecord> {
        self.records
            .read()
            .map(|records| {
                records
                    .values()
                    .filter(|r| r.grantee_agent_id == grantee_agent_id)
                    .filter(|r| r.is_active_at(as_of))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Expiration sweep: a pure read-only function of `as_of` (§4.3) —
    /// returns the delegations that are expired but not yet marked
    /// `Revoked`, without mutating stored status.
    pub fn expired_as_of(&self, as_of: DateTime<Utc>) -> Vec<DelegationRecord> {
        self.records
            .read()
            .map(|records| {
                records
                    .values()
                    .filter(|r| r.status_at(as_of) == DelegationStatus::Expired)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<DelegationRecord> {
        self.records.read().map(|r| r.values().cloned().collect()).unwrap_or_default()
    }

    /// Walks `parent_delegation_id` back to the root, returning the full
    /// chain from root to `delegation_id` inclusive (§4.3).
    pub fn chain_trace(&self, delegation_id: &str) -> Vec<DelegationRecord> {
        let Some(record) = self.get(delegation_id) else {
            return Vec::new();
        };
        let mut trace: Vec<DelegationRecord> = record
            .chain
            .iter()
            .filter_map(|id| self.get(id))
            .collect();
        trace.push(record);
        trace
    }

    fn emit(
        &self,
        domain: AuditDomain,
        event_type: &str,
        entity_id: Option<String>,
        actor_id: Option<String>,
        details: serde_json::Value,
        now: DateTime<Utc>,
    ) {
        let Some(audit) = self.audit else { return };
        let trace_id = entity_id.clone().unwrap_or_else(|| "delegation".to_string());
        let mut input = AuditEventInput::new(trace_id, domain, event_type).with_details(details);
        if let Some(actor) = actor_id {
            input = input.with_actor(actor);
        }
        if let Some(entity) = entity_id {
            input = input.with_entity(entity);
        }
        if event_type == "delegation_denied" {
            input = input.with_decision(EventDecision::Deny);
        }
        let _ = audit.record(input, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope(resource: &str, action: &str) -> ScopeSpec {
        ScopeSpec::new(vec![resource.to_string()], vec![action.to_string()])
    }

    fn base_request(now: DateTime<Utc>) -> DelegationRequest {
        DelegationRequest {
            grantor_agent_id: "grantor".to_string(),
            grantee_agent_id: "grantee".to_string(),
            effect: Effect::Allow,
            scope: scope("service:prod-api", "deploy"),
            reason: Some("coverage during on-call".to_string()),
            starts_at: now,
            expires_at: Some(now + chrono::Duration::days(1)),
            context_restriction: None,
            parent_delegation_id: None,
        }
    }

    #[test]
    fn create_rejects_scope_grantor_does_not_hold() {
        let control = DelegationControl::new(GovernanceLimits::default());
        let now = Utc::now();
        let grantor_scope = vec![scope("service:staging-*", "deploy")];
        let err = control.create(base_request(now), &grantor_scope, now).unwrap_err();
        assert!(matches!(err, AuthorityError::LimitExceeded(_)));
    }

    #[test]
    fn create_rejects_ttl_beyond_limit() {
        let control = DelegationControl::new(GovernanceLimits::default());
        let now = Utc::now();
        let mut request = base_request(now);
        request.expires_at = Some(now + chrono::Duration::days(365));
        let grantor_scope = vec![scope("service:*", "deploy")];
        let err = control.create(request, &grantor_scope, now).unwrap_err();
        assert!(matches!(err, AuthorityError::LimitExceeded(_)));
    }

    #[test]
    fn create_succeeds_and_is_active() {
        let control = DelegationControl::new(GovernanceLimits::default());
        let now = Utc::now();
        let grantor_scope = vec![scope("service:*", "deploy")];
        let record = control.create(base_request(now), &grantor_scope, now).unwrap();
        assert_eq!(record.status_at(now), DelegationStatus::Active);
        assert_eq!(control.active_for_grantee("grantee", now).len(), 1);
    }

    #[test]
    fn chain_depth_enforced_across_parent() {
        let limits = GovernanceLimits {
            max_chain_depth: 0,
            ..GovernanceLimits::default()
        };
        let control = DelegationControl::new(limits);
        let now = Utc::now();
        let grantor_scope = vec![scope("service:*", "deploy")];
        let parent = control.create(base_request(now), &grantor_scope, now).unwrap();

        let mut child = base_request(now);
        child.grantor_agent_id = parent.grantee_agent_id.clone();
        child.parent_delegation_id = Some(parent.delegation_id.clone());
        let err = control.create(child, &grantor_scope, now).unwrap_err();
        assert!(matches!(err, AuthorityError::LimitExceeded(_)));
    }

    #[test]
    fn revoke_is_idempotent() {
        let control = DelegationControl::new(GovernanceLimits::default());
        let now = Utc::now();
        let grantor_scope = vec![scope("service:*", "deploy")];
        let record = control.create(base_request(now), &grantor_scope, now).unwrap();
        let revoked_once = control.revoke(&record.delegation_id, now).unwrap();
        let revoked_twice = control.revoke(&record.delegation_id, now + chrono::Duration::hours(1)).unwrap();
        assert_eq!(revoked_once.status, DelegationStatus::Revoked);
        assert_eq!(revoked_twice.revoked_at, revoked_once.revoked_at);
    }

    #[test]
    fn expiration_is_a_pure_function_of_as_of() {
        let control = DelegationControl::new(GovernanceLimits::default());
        let now = Utc::now();
        let grantor_scope = vec![scope("service:*", "deploy")];
        let record = control.create(base_request(now), &grantor_scope, now).unwrap();
        assert!(control.expired_as_of(now).is_empty());
        let later = now + chrono::Duration::days(2);
        let expired = control.expired_as_of(later);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].delegation_id, record.delegation_id);
    }

    /// §8 scenario 2: child requests an action the parent never granted.
    #[test]
    fn child_exceeding_parent_scope_is_invalid_argument() {
        let control = DelegationControl::new(GovernanceLimits::default());
        let now = Utc::now();
        let grantor_scope = vec![scope("repo:team-a/*", "read")];

        let parent_request = DelegationRequest {
            grantor_agent_id: "owner".to_string(),
            grantee_agent_id: "grantor".to_string(),
            effect: Effect::Allow,
            scope: ScopeSpec::new(vec!["repo:team-a/*".to_string()], vec!["read".to_string()]),
            reason: None,
            starts_at: now,
            expires_at: Some(now + chrono::Duration::days(7)),
            context_restriction: None,
            parent_delegation_id: None,
        };
        let parent = control.create(parent_request, &grantor_scope, now).unwrap();

        let child_request = DelegationRequest {
            grantor_agent_id: "grantor".to_string(),
            grantee_agent_id: "grantee".to_string(),
            effect: Effect::Allow,
            scope: ScopeSpec::new(vec!["repo:team-a/secret".to_string()], vec!["write".to_string()]),
            reason: None,
            starts_at: now,
            expires_at: Some(now + chrono::Duration::days(1)),
            context_restriction: None,
            parent_delegation_id: Some(parent.delegation_id.clone()),
        };
        let err = control.create(child_request, &[], now).unwrap_err();
        assert_eq!(
            err,
            AuthorityError::InvalidArgument(
                "Child delegation action exceeds parent scope: write".to_string()
            )
        );
        assert!(control.list().iter().all(|r| r.delegation_id != "child"));
    }
}
