//! Approval Routing (§4.6, component H).
//!
//! A step DAG state machine grounded on `ccos::approval::types`'s
//! `ApprovalRequest`/`ApprovalStatus` shape and `ccos::approval::storage_memory`'s
//! `RwLock<HashMap<..>>` in-memory store; generalized here from a flat
//! request into a DAG of steps with quorum resolution per step.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditDomain, AuditEventInput, AuditTrace};
use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::AgentId;
use crate::org_graph::OrgGraph;

pub type RouteId = String;
pub type StepId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDomain {
    Managerial,
    Financial,
    Legal,
    CrossDepartmental,
}

impl ApprovalDomain {
    /// Canonical sequential ordering (§4.6).
    fn sequence_rank(&self) -> u8 {
        match self {
            ApprovalDomain::Managerial => 0,
            ApprovalDomain::Financial => 1,
            ApprovalDomain::Legal => 2,
            ApprovalDomain::CrossDepartmental => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPolicy {
    Any,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Locked,
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Pending,
    Approved,
    Rejected,
}

/// `{stepId, mode, domains[], approverIds[], decisionPolicy, dependsOnStepIds[],
/// status, approvedBy[], rejectedBy[]}` from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub step_id: StepId,
    pub mode: StepMode,
    pub domains: Vec<ApprovalDomain>,
    pub approver_ids: Vec<AgentId>,
    pub decision_policy: DecisionPolicy,
    pub depends_on_step_ids: Vec<StepId>,
    pub status: StepStatus,
    pub approved_by: Vec<AgentId>,
    pub rejected_by: Vec<AgentId>,
}

/// `{routeId, traceId, requestRef, domains[], status, reasons[], steps[],
/// events[]}` from §3. `events[]` is not duplicated on the route itself —
/// `trace_id` is the key into `AuditTrace::events_for_trace` for that.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRoute {
    pub route_id: RouteId,
    pub trace_id: String,
    pub request_ref: String,
    pub domains: Vec<ApprovalDomain>,
    pub status: RouteStatus,
    pub reasons: Vec<String>,
    pub steps: Vec<ApprovalStep>,
    /// Free-form risk label carried alongside the route for audit surfacing;
    /// not consumed by routing or decision logic itself.
    pub risk_tag: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRoute {
    pub fn step(&self, step_id: &str) -> Option<&ApprovalStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    fn step_mut(&mut self, step_id: &str) -> Option<&mut ApprovalStep> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    fn is_terminal(&self) -> bool {
        matches!(self.status, RouteStatus::Approved | RouteStatus::Rejected)
    }

    fn recompute_status(&mut self) {
        if self.steps.iter().any(|s| s.status == StepStatus::Rejected) {
            self.status = RouteStatus::Rejected;
        } else if self.steps.iter().all(|s| s.status == StepStatus::Approved) {
            self.status = RouteStatus::Approved;
        } else {
            self.status = RouteStatus::Pending;
        }
    }
}

/// One domain's configured approver set, used to seed a step (§4.6).
#[derive(Debug, Clone)]
pub struct DomainApprovers {
    pub domain: ApprovalDomain,
    pub approver_ids: Vec<AgentId>,
    pub decision_policy: DecisionPolicy,
}

/// How the step DAG should be assembled (§4.6).
#[derive(Debug, Clone)]
pub enum RoutingMode {
    Parallel,
    Sequential,
    Custom(Vec<CustomStepSpec>),
}

#[derive(Debug, Clone)]
pub struct CustomStepSpec {
    pub step_id: StepId,
    pub mode: StepMode,
    pub domains: Vec<ApprovalDomain>,
    pub decision_policy: DecisionPolicy,
    pub depends_on_step_ids: Vec<StepId>,
}

#[derive(Debug)]
pub enum DecisionError {
    UnknownRoute,
    RouteTerminal,
    UnknownStep,
    StepLocked,
    StepTerminal,
    ApproverNotAuthorized,
}

impl std::fmt::Display for DecisionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            DecisionError::UnknownRoute => "unknown route",
            DecisionError::RouteTerminal => "route terminal",
            DecisionError::UnknownStep => "unknown step",
            DecisionError::StepLocked => "step locked",
            DecisionError::StepTerminal => "step terminal",
            DecisionError::ApproverNotAuthorized => "approver not authorized for step",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for DecisionError {}

pub struct SubmitDecision<'a> {
    pub route_id: &'a str,
    pub step_id: &'a str,
    pub approver_id: &'a str,
    pub approved: bool,
}

/// Route state machine (§4.6), grounded on
/// `ccos::approval::storage_memory::InMemoryApprovalStorage`'s
/// `RwLock<HashMap<..>>` store.
pub struct ApprovalRouting<'a> {
    routes: RwLock<HashMap<RouteId, ApprovalRoute>>,
    audit: Option<&'a AuditTrace>,
}

impl<'a> ApprovalRouting<'a> {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: &'a AuditTrace) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Assembles a step DAG per `mode` (§4.6). `managerial` steps resolve
    /// their approver from `subject`'s direct manager; `cross_departmental`
    /// steps resolve approvers via `OrgGraph::required_approvers` with
    /// decision policy `all`; every other domain uses its configured
    /// approver set from `domain_approvers`.
    pub fn construct_route(
        &self,
        trace_id: impl Into<String>,
        request_ref: impl Into<String>,
        mode: RoutingMode,
        subject: &str,
        resource_owner: Option<&str>,
        domain_approvers: &[DomainApprovers],
        org_graph: &OrgGraph,
        risk_tag: Option<String>,
        now: DateTime<Utc>,
    ) -> AuthorityResult<ApprovalRoute> {
        let step_specs: Vec<CustomStepSpec> = match mode {
            RoutingMode::Parallel => domain_approvers
                .iter()
                .map(|d| CustomStepSpec {
                    step_id: format!("step-{:?}", d.domain).to_lowercase(),
                    mode: StepMode::Parallel,
                    domains: vec![d.domain],
                    decision_policy: d.decision_policy,
                    depends_on_step_ids: vec![],
                })
                .collect(),
            RoutingMode::Sequential => {
                let mut domains: Vec<ApprovalDomain> =
                    domain_approvers.iter().map(|d| d.domain).collect();
                domains.sort_by_key(|d| d.sequence_rank());
                let mut specs = Vec::new();
                let mut previous: Option<StepId> = None;
                for domain in domains {
                    let step_id = format!("step-{:?}", domain).to_lowercase();
                    let policy = domain_approvers
                        .iter()
                        .find(|d| d.domain == domain)
                        .map(|d| d.decision_policy)
                        .unwrap_or(DecisionPolicy::Any);
                    specs.push(CustomStepSpec {
                        step_id: step_id.clone(),
                        mode: StepMode::Sequential,
                        domains: vec![domain],
                        decision_policy: policy,
                        depends_on_step_ids: previous.clone().into_iter().collect(),
                    });
                    previous = Some(step_id);
                }
                specs
            }
            RoutingMode::Custom(specs) => {
                validate_acyclic(&specs)?;
                specs
            }
        };

        let mut steps = Vec::new();
        for spec in &step_specs {
            let mut approver_ids: HashSet<String> = HashSet::new();
            for domain in &spec.domains {
                match domain {
                    ApprovalDomain::Managerial => {
                        if let Some(manager) = org_graph.direct_manager(subject) {
                            approver_ids.insert(manager);
                        }
                        for approved in domain_approvers
                            .iter()
                            .find(|d| d.domain == ApprovalDomain::Managerial)
                            .map(|d| d.approver_ids.clone())
                            .unwrap_or_default()
                        {
                            approver_ids.insert(approved);
                        }
                    }
                    ApprovalDomain::CrossDepartmental => {
                        if let Some(owner) = resource_owner {
                            for approver in org_graph.required_approvers(subject, owner) {
                                approver_ids.insert(approver);
                            }
                        }
                    }
                    other => {
                        for approver in domain_approvers
                            .iter()
                            .find(|d| &d.domain == other)
                            .map(|d| d.approver_ids.clone())
                            .unwrap_or_default()
                        {
                            approver_ids.insert(approver);
                        }
                    }
                }
            }

            let decision_policy = if spec.domains.contains(&ApprovalDomain::CrossDepartmental) {
                DecisionPolicy::All
            } else {
                spec.decision_policy
            };

            let status = if spec.depends_on_step_ids.is_empty() {
                StepStatus::Pending
            } else {
                StepStatus::Locked
            };

            steps.push(ApprovalStep {
                step_id: spec.step_id.clone(),
                mode: spec.mode,
                domains: spec.domains.clone(),
                approver_ids: {
                    let mut v: Vec<String> = approver_ids.into_iter().collect();
                    v.sort();
                    v
                },
                decision_policy,
                depends_on_step_ids: spec.depends_on_step_ids.clone(),
                status,
                approved_by: Vec::new(),
                rejected_by: Vec::new(),
            });
        }

        let domains: Vec<ApprovalDomain> = step_specs.iter().flat_map(|s| s.domains.clone()).collect();
        let route_id = uuid::Uuid::new_v4().to_string();
        let route = ApprovalRoute {
            route_id: route_id.clone(),
            trace_id: trace_id.into(),
            request_ref: request_ref.into(),
            domains,
            status: RouteStatus::Pending,
            reasons: Vec::new(),
            steps,
            risk_tag,
            created_at: now,
        };

        let mut routes = self
            .routes
            .write()
            .map_err(|_| AuthorityError::precondition_failed("approval route registry lock poisoned"))?;
        routes.insert(route_id, route.clone());
        Ok(route)
    }

    pub fn get(&self, route_id: &str) -> Option<ApprovalRoute> {
        self.routes.read().ok()?.get(route_id).cloned()
    }

    /// §4.6 decision submission. Fails with a distinct `DecisionError` for
    /// each invalid condition, in the order: unknown route, route terminal,
    /// unknown step, step locked, step terminal, approver not authorized.
    pub fn submit_decision(
        &self,
        decision: SubmitDecision<'_>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRoute, DecisionError> {
        let mut routes = self.routes.write().map_err(|_| DecisionError::UnknownRoute)?;
        let route = routes.get_mut(decision.route_id).ok_or(DecisionError::UnknownRoute)?;

        if route.is_terminal() {
            return Err(DecisionError::RouteTerminal);
        }

        let step = route.step(decision.step_id).ok_or(DecisionError::UnknownStep)?;
        if step.status == StepStatus::Locked {
            return Err(DecisionError::StepLocked);
        }
        if matches!(step.status, StepStatus::Approved | StepStatus::Rejected) {
            return Err(DecisionError::StepTerminal);
        }
        if !step.approver_ids.iter().any(|a| a == decision.approver_id) {
            return Err(DecisionError::ApproverNotAuthorized);
        }

        let mut unlocked_steps: Vec<StepId> = Vec::new();
        let route_id = route.route_id.clone();
        let trace_id = route.trace_id.clone();

        if decision.approved {
            let step = route.step_mut(decision.step_id).unwrap();
            if !step.approved_by.iter().any(|a| a == decision.approver_id) {
                step.approved_by.push(decision.approver_id.to_string());
            }
            let satisfied = match step.decision_policy {
                DecisionPolicy::All => step
                    .approver_ids
                    .iter()
                    .all(|a| step.approved_by.contains(a)),
                DecisionPolicy::Any => !step.approved_by.is_empty(),
            };
            if satisfied {
                step.status = StepStatus::Approved;
                let approved_step_id = step.step_id.clone();

                for candidate in route.steps.iter_mut() {
                    if candidate.status != StepStatus::Locked {
                        continue;
                    }
                    if !candidate.depends_on_step_ids.contains(&approved_step_id) {
                        continue;
                    }
                    let all_deps_approved = candidate.depends_on_step_ids.iter().all(|dep| {
                        route
                            .steps
                            .iter()
                            .find(|s| &s.step_id == dep)
                            .map(|s| s.status == StepStatus::Approved)
                            .unwrap_or(false)
                    });
                    if all_deps_approved {
                        unlocked_steps.push(candidate.step_id.clone());
                    }
                }
                for step_id in &unlocked_steps {
                    if let Some(s) = route.step_mut(step_id) {
                        s.status = StepStatus::Pending;
                    }
                }
            }
        } else {
            let step = route.step_mut(decision.step_id).unwrap();
            step.rejected_by.push(decision.approver_id.to_string());
            step.status = StepStatus::Rejected;
        }

        route.recompute_status();
        let result = route.clone();
        drop(routes);

        if let Some(audit) = self.audit {
            if decision.approved {
                let _ = audit.record(
                    AuditEventInput::new(trace_id.clone(), AuditDomain::ApprovalPath, "step_approved")
                        .with_actor(decision.approver_id)
                        .with_entity(format!("{}:{}", route_id, decision.step_id))
                        .with_details(json!({"step_id": decision.step_id})),
                    now,
                );
                for step_id in &unlocked_steps {
                    let _ = audit.record(
                        AuditEventInput::new(trace_id.clone(), AuditDomain::ApprovalPath, "step_unlocked")
                            .with_entity(format!("{}:{}", route_id, step_id))
                            .with_details(json!({"step_id": step_id})),
                        now,
                    );
                }
                if result.status == RouteStatus::Approved {
                    let _ = audit.record(
                        AuditEventInput::new(trace_id.clone(), AuditDomain::ApprovalPath, "route_approved")
                            .with_entity(route_id.clone())
                            .with_details(json!({})),
                        now,
                    );
                }
            } else {
                let _ = audit.record(
                    AuditEventInput::new(trace_id.clone(), AuditDomain::ApprovalPath, "step_rejected")
                        .with_actor(decision.approver_id)
                        .with_entity(format!("{}:{}", route_id, decision.step_id))
                        .with_details(json!({"step_id": decision.step_id})),
                    now,
                );
            }
        }

        Ok(result)
    }
}

impl<'a> Default for ApprovalRouting<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Validates the custom-workflow DAG is acyclic via a simple DFS cycle
/// check (§9: "validate acyclicity at construction").
fn validate_acyclic(specs: &[CustomStepSpec]) -> AuthorityResult<()> {
    let by_id: HashMap<&str, &CustomStepSpec> =
        specs.iter().map(|s| (s.step_id.as_str(), s)).collect();

    fn visit<'a>(
        id: &'a str,
        by_id: &HashMap<&'a str, &'a CustomStepSpec>,
        visiting: &mut HashSet<&'a str>,
        done: &mut HashSet<&'a str>,
    ) -> AuthorityResult<()> {
        if done.contains(id) {
            return Ok(());
        }
        if !visiting.insert(id) {
            return Err(AuthorityError::invalid_argument(format!(
                "approval step dependency graph contains a cycle at {}",
                id
            )));
        }
        if let Some(spec) = by_id.get(id) {
            for dep in &spec.depends_on_step_ids {
                visit(dep, by_id, visiting, done)?;
            }
        }
        visiting.remove(id);
        done.insert(id);
        Ok(())
    }

    let mut visiting = HashSet::new();
    let mut done = HashSet::new();
    for spec in specs {
        visit(&spec.step_id, &by_id, &mut visiting, &mut done)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_approvers() -> Vec<DomainApprovers> {
        vec![
            DomainApprovers {
                domain: ApprovalDomain::Managerial,
                approver_ids: vec![],
                decision_policy: DecisionPolicy::Any,
            },
            DomainApprovers {
                domain: ApprovalDomain::Financial,
                approver_ids: vec!["cfo".to_string()],
                decision_policy: DecisionPolicy::Any,
            },
        ]
    }

    #[test]
    fn sequential_unlock_scenario() {
        let mut org_graph = OrgGraph::new();
        org_graph.add_node(crate::org_graph::OrgNode {
            id: "subject".to_string(),
            node_type: crate::org_graph::NodeType::User,
            scope: None,
        });
        org_graph.add_node(crate::org_graph::OrgNode {
            id: "manager".to_string(),
            node_type: crate::org_graph::NodeType::User,
            scope: None,
        });
        org_graph
            .add_relationship(
                "subject",
                "manager",
                crate::org_graph::EdgeType::ReportsTo,
                None,
            )
            .unwrap();

        let routing = ApprovalRouting::new();
        let now = Utc::now();
        let route = routing
            .construct_route(
                "trace-1",
                "req-1",
                RoutingMode::Sequential,
                "subject",
                None,
                &domain_approvers(),
                &org_graph,
                None,
                now,
            )
            .unwrap();

        let mgr_step = route.steps.iter().find(|s| s.domains == vec![ApprovalDomain::Managerial]).unwrap();
        let fin_step = route.steps.iter().find(|s| s.domains == vec![ApprovalDomain::Financial]).unwrap();
        assert_eq!(mgr_step.status, StepStatus::Pending);
        assert_eq!(fin_step.status, StepStatus::Locked);

        let err = routing
            .submit_decision(
                SubmitDecision {
                    route_id: &route.route_id,
                    step_id: &fin_step.step_id,
                    approver_id: "cfo",
                    approved: true,
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, DecisionError::StepLocked));

        let after_mgr = routing
            .submit_decision(
                SubmitDecision {
                    route_id: &route.route_id,
                    step_id: &mgr_step.step_id,
                    approver_id: "manager",
                    approved: true,
                },
                now,
            )
            .unwrap();
        let fin_after = after_mgr.step(&fin_step.step_id).unwrap();
        assert_eq!(fin_after.status, StepStatus::Pending);

        let final_route = routing
            .submit_decision(
                SubmitDecision {
                    route_id: &route.route_id,
                    step_id: &fin_step.step_id,
                    approver_id: "cfo",
                    approved: true,
                },
                now,
            )
            .unwrap();
        assert_eq!(final_route.status, RouteStatus::Approved);
    }

    #[test]
    fn single_rejection_terminates_route() {
        let org_graph = OrgGraph::new();
        let routing = ApprovalRouting::new();
        let now = Utc::now();
        let route = routing
            .construct_route(
                "trace-1",
                "req-1",
                RoutingMode::Parallel,
                "subject",
                None,
                &domain_approvers(),
                &org_graph,
                None,
                now,
            )
            .unwrap();
        let fin_step = route.steps.iter().find(|s| s.domains == vec![ApprovalDomain::Financial]).unwrap();

        let result = routing
            .submit_decision(
                SubmitDecision {
                    route_id: &route.route_id,
                    step_id: &fin_step.step_id,
                    approver_id: "cfo",
                    approved: false,
                },
                now,
            )
            .unwrap();
        assert_eq!(result.status, RouteStatus::Rejected);

        let err = routing
            .submit_decision(
                SubmitDecision {
                    route_id: &route.route_id,
                    step_id: &fin_step.step_id,
                    approver_id: "cfo",
                    approved: true,
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, DecisionError::RouteTerminal));
    }

    #[test]
    fn unauthorized_approver_is_rejected() {
        let org_graph = OrgGraph::new();
        let routing = ApprovalRouting::new();
        let now = Utc::now();
        let route = routing
            .construct_route(
                "trace-1",
                "req-1",
                RoutingMode::Parallel,
                "subject",
                None,
                &domain_approvers(),
                &org_graph,
                None,
                now,
            )
            .unwrap();
        let fin_step = route.steps.iter().find(|s| s.domains == vec![ApprovalDomain::Financial]).unwrap();
        let err = routing
            .submit_decision(
                SubmitDecision {
                    route_id: &route.route_id,
                    step_id: &fin_step.step_id,
                    approver_id: "random-agent",
                    approved: true,
                },
                now,
            )
            .unwrap_err();
        assert!(matches!(err, DecisionError::ApproverNotAuthorized));
    }

    #[test]
    fn custom_workflow_rejects_cyclic_dependencies() {
        let specs = vec![
            CustomStepSpec {
                step_id: "a".to_string(),
                mode: StepMode::Sequential,
                domains: vec![ApprovalDomain::Managerial],
                decision_policy: DecisionPolicy::Any,
                depends_on_step_ids: vec!["b".to_string()],
            },
            CustomStepSpec {
                step_id: "b".to_string(),
                mode: StepMode::Sequential,
                domains: vec![ApprovalDomain::Financial],
                decision_policy: DecisionPolicy::Any,
                depends_on_step_ids: vec!["a".to_string()],
            },
        ];
        let org_graph = OrgGraph::new();
        let routing = ApprovalRouting::new();
        let err = routing
            .construct_route(
                "trace-1",
                "req-1",
                RoutingMode::Custom(specs),
                "subject",
                None,
                &[],
                &org_graph,
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, AuthorityError::InvalidArgument(_)));
    }

    #[test]
    fn cross_departmental_uses_all_decision_policy() {
        let mut org_graph = OrgGraph::new();
        for id in ["subject", "owner", "eng", "legal", "legal_lead"] {
            let node_type = if id == "eng" || id == "legal" {
                crate::org_graph::NodeType::Department
            } else {
                crate::org_graph::NodeType::User
            };
            org_graph.add_node(crate::org_graph::OrgNode {
                id: id.to_string(),
                node_type,
                scope: None,
            });
        }
        org_graph
            .add_relationship("subject", "eng", crate::org_graph::EdgeType::MemberOf, None)
            .unwrap();
        org_graph
            .add_relationship("owner", "legal", crate::org_graph::EdgeType::MemberOf, None)
            .unwrap();
        org_graph
            .add_relationship(
                "legal_lead",
                "legal",
                crate::org_graph::EdgeType::ApprovesFor,
                None,
            )
            .unwrap();

        let routing = ApprovalRouting::new();
        let domains = vec![DomainApprovers {
            domain: ApprovalDomain::CrossDepartmental,
            approver_ids: vec![],
            decision_policy: DecisionPolicy::Any,
        }];
        let route = routing
            .construct_route(
                "trace-1",
                "req-1",
                RoutingMode::Parallel,
                "subject",
                Some("owner"),
                &domains,
                &org_graph,
                Some("high".to_string()),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(route.risk_tag.as_deref(), Some("high"));
        let step = &route.steps[0];
        assert_eq!(step.approver_ids, vec!["legal_lead".to_string()]);
        assert_eq!(step.decision_policy, DecisionPolicy::All);
    }
}
