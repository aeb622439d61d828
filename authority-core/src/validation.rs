//! Action Validation (§4.5, component G).
//!
//! Evaluates a built graph against a proposed action: locates the
//! applicable rule, emits violations, and returns the `authorized`/
//! `isDelegated` derived flags the Enforcement Facade consumes (§4.9).
//! Every call records one `authority_check_result` audit event (§4.5).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditDomain, AuditEventInput, AuditTrace, EventDecision};
use crate::authority_graph::{AuthorityGraph, AuthorityRule};
use crate::identity::Environment;
use crate::org_graph::OrgGraph;
use crate::policy::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    ScopeViolation,
    ApprovalRequired,
    ContextMismatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: ViolationSeverity,
    pub message: String,
}

/// The action under evaluation.
#[derive(Debug, Clone)]
pub struct ProposedAction {
    pub resource: String,
    pub action: String,
    pub environment: Environment,
    pub resource_owner_id: Option<String>,
}

/// §4.5's result: decision, violations, and the two derived booleans plus
/// the resolved required-approver list when approval is needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub decision: Decision,
    pub violations: Vec<Violation>,
    pub authorized: bool,
    pub is_delegated: bool,
    pub required_approvers: Vec<String>,
}

/// Evaluates `action` against `graph`. `org_graph` is consulted only when
/// approval is required and a `resource_owner_id` is given, to resolve
/// cross-department approvers (§4.5, reusing `OrgGraph::required_approvers`,
/// §4.1). Records one `authority_check_result` event against `trace_id`.
pub fn validate(
    graph: &AuthorityGraph,
    action: &ProposedAction,
    org_graph: &OrgGraph,
    audit: &AuditTrace,
    trace_id: &str,
    now: DateTime<Utc>,
) -> ValidationResult {
    let (decision, rules) = graph.decide(&action.resource, &action.action);

    let mut violations = Vec::new();
    let mut required_approvers = Vec::new();

    match decision {
        Decision::Prohibited => {
            violations.push(Violation {
                kind: ViolationKind::ScopeViolation,
                severity: ViolationSeverity::Error,
                message: format!(
                    "no rule permits ({}, {}); default decision is prohibited",
                    action.resource, action.action
                ),
            });
        }
        Decision::RequiresApproval => {
            violations.push(Violation {
                kind: ViolationKind::ApprovalRequired,
                severity: ViolationSeverity::Warning,
                message: format!(
                    "({}, {}) requires approval",
                    action.resource, action.action
                ),
            });
            if let Some(owner_id) = &action.resource_owner_id {
                required_approvers = org_graph.required_approvers(&graph.agent_id, owner_id);
            }
        }
        Decision::CanExecute => {}
    }

    if action.environment.as_str() != graph.build_context.environment.as_str() {
        violations.push(Violation {
            kind: ViolationKind::ContextMismatch,
            severity: ViolationSeverity::Error,
            message: format!(
                "action targets {} but graph was built for {}",
                action.environment.as_str(),
                graph.build_context.environment.as_str()
            ),
        });
    }

    let authorized = !violations.iter().any(|v| v.severity == ViolationSeverity::Error);
    let is_delegated = rules.iter().any(|r: &&AuthorityRule| {
        r.sources.iter().any(|s| s.starts_with("delegation:"))
    });
    let sources: Vec<String> = rules.iter().flat_map(|r| r.sources.clone()).collect();

    let event_decision = match decision {
        Decision::CanExecute => EventDecision::Allow,
        Decision::RequiresApproval => EventDecision::RequireApproval,
        Decision::Prohibited => EventDecision::Deny,
    };
    let input = AuditEventInput::new(trace_id, AuditDomain::AuthorityCheck, "authority_check_result")
        .with_subject(graph.agent_id.clone())
        .with_entity(format!("{}:{}", action.resource, action.action))
        .with_decision(event_decision)
        .with_details(json!({
            "resource": action.resource,
            "action": action.action,
            "sources": sources,
            "authorized": authorized,
        }));
    let _ = audit.record(input, now);

    ValidationResult {
        decision,
        violations,
        authorized,
        is_delegated,
        required_approvers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority_graph::{AuthorityGraph, BuildContext};
    use chrono::Utc;

    fn empty_graph(environment: Environment) -> AuthorityGraph {
        let now = Utc::now();
        AuthorityGraph {
            agent_id: "agent-1".to_string(),
            owner_id: "owner-1".to_string(),
            org_id: "org-1".to_string(),
            generated_at: now,
            build_context: BuildContext {
                environment,
                region: None,
                as_of: now,
            },
            can_execute: vec![AuthorityRule {
                resource: "service:prod-api".to_string(),
                action: "deploy".to_string(),
                decision: Decision::CanExecute,
                reasons: vec!["declared".to_string()],
                sources: vec!["identity:scope".to_string()],
            }],
            requires_approval: vec![AuthorityRule {
                resource: "service:billing".to_string(),
                action: "deploy".to_string(),
                decision: Decision::RequiresApproval,
                reasons: vec!["needs sign-off".to_string()],
                sources: vec!["delegation:d1".to_string()],
            }],
            prohibited: vec![],
            default_decision: Decision::Prohibited,
            nodes: vec![],
            edges: vec![],
        }
    }

    #[test]
    fn can_execute_rule_is_authorized_with_no_violations() {
        let graph = empty_graph(Environment::Production);
        let org_graph = OrgGraph::new();
        let action = ProposedAction {
            resource: "service:prod-api".to_string(),
            action: "deploy".to_string(),
            environment: Environment::Production,
            resource_owner_id: None,
        };
        let trace = AuditTrace::new();
        let result = validate(&graph, &action, &org_graph, &trace, "trace-1", Utc::now());
        assert!(result.authorized);
        assert!(result.violations.is_empty());
        assert!(!result.is_delegated);
    }

    #[test]
    fn missing_rule_is_scope_violation() {
        let graph = empty_graph(Environment::Production);
        let org_graph = OrgGraph::new();
        let action = ProposedAction {
            resource: "database:prod".to_string(),
            action: "drop".to_string(),
            environment: Environment::Production,
            resource_owner_id: None,
        };
        let trace = AuditTrace::new();
        let result = validate(&graph, &action, &org_graph, &trace, "trace-1", Utc::now());
        assert!(!result.authorized);
        assert_eq!(result.decision, Decision::Prohibited);
        assert_eq!(result.violations[0].kind, ViolationKind::ScopeViolation);
    }

    #[test]
    fn requires_approval_is_delegated_and_warns() {
        let graph = empty_graph(Environment::Production);
        let org_graph = OrgGraph::new();
        let action = ProposedAction {
            resource: "service:billing".to_string(),
            action: "deploy".to_string(),
            environment: Environment::Production,
            resource_owner_id: None,
        };
        let trace = AuditTrace::new();
        let result = validate(&graph, &action, &org_graph, &trace, "trace-1", Utc::now());
        assert!(result.authorized);
        assert!(result.is_delegated);
        assert_eq!(result.violations[0].kind, ViolationKind::ApprovalRequired);
        assert_eq!(result.violations[0].severity, ViolationSeverity::Warning);
    }

    #[test]
    fn environment_mismatch_is_context_violation() {
        let graph = empty_graph(Environment::Production);
        let org_graph = OrgGraph::new();
        let action = ProposedAction {
            resource: "service:prod-api".to_string(),
            action: "deploy".to_string(),
            environment: Environment::Staging,
            resource_owner_id: None,
        };
        let trace = AuditTrace::new();
        let result = validate(&graph, &action, &org_graph, &trace, "trace-1", Utc::now());
        assert!(!result.authorized);
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == ViolationKind::ContextMismatch));
    }
}
