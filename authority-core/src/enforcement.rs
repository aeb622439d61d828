//! Enforcement Facade (§4.9, component K).
//!
//! Ties the identity, the built graph, Action Validation, and the
//! Verification Protocol into one call: verify the token, validate the
//! action, detect anomalies, and emit the audit trail both steps leave
//! behind. The only component that decides a final `allow`/`deny`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditDomain, AuditEventInput, AuditTrace, EventDecision};
use crate::authority_graph::AuthorityGraph;
use crate::crypto::{CryptoGateway, KeyMaterial};
use crate::org_graph::OrgGraph;
use crate::policy::Decision;
use crate::validation::{validate, ProposedAction, ValidationResult};
use crate::verification::{verify_portable_token, PortableAuthorityToken, TrustChainStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalySeverity {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    ScopeEscalation,
    BypassedApproval,
    UnauthorizedPathway,
    ContextMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub severity: AnomalySeverity,
    pub message: String,
}

/// §4.9's final result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementResult {
    pub allow: bool,
    pub token_valid: bool,
    pub validation: ValidationResult,
    pub anomalies: Vec<Anomaly>,
}

fn is_critical_or_high(anomalies: &[Anomaly]) -> bool {
    anomalies
        .iter()
        .any(|a| matches!(a.severity, AnomalySeverity::Critical | AnomalySeverity::High))
}

/// §4.9: verifies `token` against `trusted_roots`, validates `action`
/// against `graph`, detects anomalies, and emits `token_verification` +
/// `enforcement_result` events against `trace_id`.
#[allow(clippy::too_many_arguments)]
pub fn enforce(
    gateway: &dyn CryptoGateway,
    token: &PortableAuthorityToken,
    trusted_roots: &[KeyMaterial],
    graph: &AuthorityGraph,
    action: &ProposedAction,
    org_graph: &OrgGraph,
    audit: &AuditTrace,
    trace_id: &str,
    now: DateTime<Utc>,
) -> EnforcementResult {
    let verification = verify_portable_token(gateway, token, trusted_roots, now);
    let token_valid = verification.is_valid;

    audit
        .record(
            AuditEventInput::new(trace_id, AuditDomain::EnforcementDecision, "token_verification")
                .with_subject(token.identity.payload.agent_id.clone())
                .with_decision(if token_valid { EventDecision::Allow } else { EventDecision::Deny })
                .with_details(json!({
                    "trust_chain_status": verification.trust_chain_status,
                    "reason": verification.reason,
                })),
            now,
        )
        .ok();

    let validation = validate(graph, action, org_graph, audit, trace_id, now);

    let mut anomalies = Vec::new();

    let within_declared_scope = graph
        .can_execute
        .iter()
        .chain(graph.requires_approval.iter())
        .filter(|r| r.sources.iter().any(|s| s == "identity:scope" || s.starts_with("role:")))
        .any(|r| crate::pattern::glob_matches(&r.resource, &action.resource) && crate::pattern::glob_matches(&r.action, &action.action));
    let justified_by_delegation = validation.is_delegated;
    if validation.authorized && !within_declared_scope && !justified_by_delegation {
        anomalies.push(Anomaly {
            kind: AnomalyKind::ScopeEscalation,
            severity: AnomalySeverity::High,
            message: format!(
                "({}, {}) is authorized outside the identity's declared/role scope with no delegation source",
                action.resource, action.action
            ),
        });
    }

    if validation.decision == Decision::RequiresApproval {
        anomalies.push(Anomaly {
            kind: AnomalyKind::BypassedApproval,
            severity: AnomalySeverity::Critical,
            message: format!(
                "({}, {}) requires approval that enforcement cannot confirm was obtained",
                action.resource, action.action
            ),
        });
    }

    if validation.decision == Decision::Prohibited {
        anomalies.push(Anomaly {
            kind: AnomalyKind::UnauthorizedPathway,
            severity: AnomalySeverity::High,
            message: format!("no rule matches ({}, {})", action.resource, action.action),
        });
    }

    if action.environment.as_str() != graph.build_context.environment.as_str() {
        anomalies.push(Anomaly {
            kind: AnomalyKind::ContextMismatch,
            severity: AnomalySeverity::Medium,
            message: "action environment does not match the graph's build context".to_string(),
        });
    }

    let allow = validation.authorized && token_valid && !is_critical_or_high(&anomalies);

    tracing::debug!(
        agent_id = %token.identity.payload.agent_id,
        resource = %action.resource,
        action = %action.action,
        allow,
        anomaly_count = anomalies.len(),
        "enforcement decision"
    );

    audit
        .record(
            AuditEventInput::new(trace_id, AuditDomain::EnforcementDecision, "enforcement_result")
                .with_subject(token.identity.payload.agent_id.clone())
                .with_entity(format!("{}:{}", action.resource, action.action))
                .with_decision(if allow { EventDecision::Allow } else { EventDecision::Deny })
                .with_details(json!({
                    "token_valid": token_valid,
                    "authorized": validation.authorized,
                    "anomalies": anomalies,
                    "trust_chain_status": verification.trust_chain_status,
                })),
            now,
        )
        .ok();

    EnforcementResult {
        allow,
        token_valid,
        validation,
        anomalies,
    }
}

/// Convenience accessor mirroring §4.9's `trustChainStatus` surface for
/// callers that only need the verification outcome, not the full
/// `EnforcementResult`.
pub fn trust_chain_status(
    gateway: &dyn CryptoGateway,
    token: &PortableAuthorityToken,
    trusted_roots: &[KeyMaterial],
    now: DateTime<Utc>,
) -> TrustChainStatus {
    verify_portable_token(gateway, token, trusted_roots, now).trust_chain_status
}
