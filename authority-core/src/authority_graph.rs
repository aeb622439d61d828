//! Authority Graph Builder (§4.2, component D).
//!
//! `build()` is pure over its inputs plus `as_of`: same identity, claims,
//! role scopes, policies, delegations, org graph, and `as_of` always
//! produce bit-for-bit the same graph (§8). Candidate rules are grouped by
//! exact `(resource, action)` string pairs contributed by each source, then
//! — because a delegation or policy frequently names a concrete resource
//! that a broader identity/role/policy pattern also matches — every literal
//! (non-wildcard) pair seen anywhere is additionally re-evaluated against
//! every contributor whose pattern matches it, merging sources/reasons and
//! resolving the final decision by precedence (`Deny > RequireApproval >
//! Allow`, §3, §8). Resources that are never named literally are left for
//! Action Validation's exact-then-pattern lookup (§4.5) rather than
//! enumerated here.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::delegation::DelegationRecord;
use crate::identity::{AgentId, Environment, IdentityClaims, OrgId, OwnerId, SignedAgentIdentity};
use crate::org_graph::{EdgeType, NodeType, OrgGraph, OrgNode};
use crate::pattern::glob_matches;
use crate::policy::{AuthorityPolicy, Decision, Effect};

/// One resolved rule in the built graph (§3, §4.2): the resource/action
/// strings as contributed (a pattern or a literal), the merged decision,
/// and the provenance that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityRule {
    pub resource: String,
    pub action: String,
    pub decision: Decision,
    pub reasons: Vec<String>,
    pub sources: Vec<String>,
}

/// `{agentId, ownerId, orgId, generatedAt, canExecute[], requiresApproval[],
/// prohibited[], defaultDecision, nodes[], edges[]}` from §3/§4.2, plus an
/// explicit `build_context` resolving Open Question 1 in §9: the graph
/// records the environment/region it was built for so a later
/// re-validation can compare deterministically instead of re-deriving it
/// from ambient state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityGraph {
    pub agent_id: AgentId,
    pub owner_id: OwnerId,
    pub org_id: OrgId,
    pub generated_at: DateTime<Utc>,
    pub build_context: BuildContext,
    pub can_execute: Vec<AuthorityRule>,
    pub requires_approval: Vec<AuthorityRule>,
    pub prohibited: Vec<AuthorityRule>,
    pub default_decision: Decision,
    pub nodes: Vec<OrgNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildContext {
    pub environment: Environment,
    pub region: Option<String>,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub edge_type: EdgeType,
}

impl AuthorityGraph {
    /// §4.5: an action's applicable rule is the first exact-key match
    /// across `prohibited`, `requiresApproval`, `canExecute` in that
    /// precedence order; failing that, the highest-precedence pattern match
    /// among rules sourced from a held scope (`identity:`/`role:`); failing
    /// that, `defaultDecision`. Policy/delegation/context rules only reach a
    /// query through the exact-match branch, via `resolve()`'s literal-pair
    /// expansion.
    pub fn decide(&self, resource: &str, action: &str) -> (Decision, Vec<&AuthorityRule>) {
        let exact: Vec<&AuthorityRule> = self
            .all_rules()
            .filter(|r| r.resource == resource && r.action == action)
            .collect();
        if !exact.is_empty() {
            let decision = exact.iter().map(|r| r.decision).max_by_key(decision_rank).unwrap();
            return (decision, exact);
        }

        // Only identity/role-sourced rules describe a capability pattern the
        // agent actually holds; policy/delegation/context rules are grants
        // against specific resources and only apply once `resolve()` has
        // materialized them against a literal pair (the exact-match branch
        // above). Letting them fall back to ad hoc glob matching here would
        // make an unrelated narrower policy (e.g. `service:prod-*`) outrank
        // a broader held scope (e.g. `service:*`) for a resource neither one
        // was ever evaluated against.
        let pattern_matches: Vec<&AuthorityRule> = self
            .all_rules()
            .filter(|r| {
                glob_matches(&r.resource, resource)
                    && glob_matches(&r.action, action)
                    && r.sources.iter().any(|s| s.starts_with("identity:") || s.starts_with("role:"))
            })
            .collect();
        if !pattern_matches.is_empty() {
            let decision = pattern_matches
                .iter()
                .map(|r| r.decision)
                .max_by_key(decision_rank)
                .unwrap();
            return (decision, pattern_matches);
        }

        (self.default_decision, Vec::new())
    }

    fn all_rules(&self) -> impl Iterator<Item = &AuthorityRule> {
        self.can_execute
            .iter()
            .chain(self.requires_approval.iter())
            .chain(self.prohibited.iter())
    }
}

fn decision_rank(decision: &Decision) -> u8 {
    match decision {
        Decision::CanExecute => 0,
        Decision::RequiresApproval => 1,
        Decision::Prohibited => 2,
    }
}

fn effect_rank(effect: &Effect) -> u8 {
    match effect {
        Effect::Allow => 0,
        Effect::RequireApproval => 1,
        Effect::Deny => 2,
    }
}

struct Candidate {
    resource: String,
    action: String,
    effect: Effect,
    reason: Option<String>,
    source: String,
}

/// Inputs to `build()` (§4.2): the signed identity being evaluated, its
/// resolved claims, the scopes attached to its resolved roles, the org
/// policies in force, its active delegations, and the org graph used to
/// materialize `nodes`/`edges`.
pub struct AuthorityGraphBuildInput<'a> {
    pub identity: &'a SignedAgentIdentity,
    pub claims: &'a IdentityClaims,
    pub role_scopes: &'a BTreeMap<String, crate::identity::ScopeSpec>,
    pub org_policies: &'a [AuthorityPolicy],
    pub active_delegations: &'a [DelegationRecord],
    pub org_graph: &'a OrgGraph,
    pub as_of: DateTime<Utc>,
    /// Additional policies carrying their own provenance tag instead of
    /// `policy:<idx>` — used by Context Adaptation (§4.4) to append overlay
    /// policies tagged `context:<trigger>`.
    pub extra_policies: &'a [(String, AuthorityPolicy)],
}

/// Builds the Authority Graph for one identity (§4.2). Steps, in order:
/// seed from declared scope, expand with resolved-role scopes, append
/// org policies whose condition is satisfied, append active delegations,
/// normalize/resolve into per-`(resource, action)` rules, then materialize
/// the relevant node/edge subgraph.
pub fn build(input: AuthorityGraphBuildInput<'_>) -> AuthorityGraph {
    let payload = &input.identity.payload;
    let environment = payload.context.environment;
    let region = payload.context.region.clone();

    let mut candidates = Vec::new();

    for resource in &payload.declared_scope.resources {
        for action in &payload.declared_scope.actions {
            candidates.push(Candidate {
                resource: resource.clone(),
                action: action.clone(),
                effect: Effect::Allow,
                reason: Some("declared by identity scope".to_string()),
                source: "identity:scope".to_string(),
            });
        }
    }

    for role_id in &input.claims.roles.resolved {
        if let Some(scope) = input.role_scopes.get(role_id) {
            for resource in &scope.resources {
                for action in &scope.actions {
                    candidates.push(Candidate {
                        resource: resource.clone(),
                        action: action.clone(),
                        effect: Effect::Allow,
                        reason: Some(format!("granted by role {}", role_id)),
                        source: format!("role:{}", role_id),
                    });
                }
            }
        }
    }

    let role_ids = input.claims.roles.resolved.clone();
    let department_ids = input.claims.departments.lineage.clone();
    for (idx, policy) in input.org_policies.iter().enumerate() {
        let satisfied = policy
            .condition
            .as_ref()
            .map(|c| c.is_satisfied(environment, region.as_deref(), &role_ids, &department_ids))
            .unwrap_or(true);
        if !satisfied {
            continue;
        }
        for action in &policy.actions {
            candidates.push(Candidate {
                resource: policy.resource.clone(),
                action: action.clone(),
                effect: policy.effect,
                reason: policy.reason.clone(),
                source: format!("policy:{}", idx),
            });
        }
    }

    for (source, policy) in input.extra_policies {
        let satisfied = policy
            .condition
            .as_ref()
            .map(|c| c.is_satisfied(environment, region.as_deref(), &role_ids, &department_ids))
            .unwrap_or(true);
        if !satisfied {
            continue;
        }
        for action in &policy.actions {
            candidates.push(Candidate {
                resource: policy.resource.clone(),
                action: action.clone(),
                effect: policy.effect,
                reason: policy.reason.clone(),
                source: source.clone(),
            });
        }
    }

    for delegation in input.active_delegations {
        if delegation.grantee_agent_id != payload.agent_id {
            continue;
        }
        if !delegation.is_active_at(input.as_of) {
            continue;
        }
        if let Some(restriction) = &delegation.context_restriction {
            let labels = payload.context.labels.clone().unwrap_or_default();
            if !restriction.is_satisfied(environment, region.as_deref(), &labels) {
                continue;
            }
        }
        for resource in &delegation.scope.resources {
            for action in &delegation.scope.actions {
                candidates.push(Candidate {
                    resource: resource.clone(),
                    action: action.clone(),
                    effect: delegation.effect,
                    reason: delegation.reason.clone(),
                    source: format!("delegation:{}", delegation.delegation_id),
                });
            }
        }
    }

    let rules = resolve(candidates);

    let mut can_execute = Vec::new();
    let mut requires_approval = Vec::new();
    let mut prohibited = Vec::new();
    for rule in rules {
        match rule.decision {
            Decision::CanExecute => can_execute.push(rule),
            Decision::RequiresApproval => requires_approval.push(rule),
            Decision::Prohibited => prohibited.push(rule),
        }
    }

    let (nodes, edges) = materialize_subgraph(input.org_graph, &payload.agent_id, input.active_delegations);

    AuthorityGraph {
        agent_id: payload.agent_id.clone(),
        owner_id: payload.owner_id.clone(),
        org_id: payload.org_id.clone(),
        generated_at: input.as_of,
        build_context: BuildContext {
            environment,
            region,
            as_of: input.as_of,
        },
        can_execute,
        requires_approval,
        prohibited,
        default_decision: Decision::Prohibited,
        nodes,
        edges,
    }
}

/// Groups candidates by exact `(resource, action)` key, then additionally
/// materializes a merged rule for every literal `(resource, action)` pair
/// seen anywhere, folding in every candidate whose pattern matches that
/// literal pair (§4.2 step 5, §8 precedence-merge scenario).
fn resolve(candidates: Vec<Candidate>) -> Vec<AuthorityRule> {
    let mut by_key: BTreeMap<(String, String), Vec<&Candidate>> = BTreeMap::new();
    for c in &candidates {
        by_key
            .entry((c.resource.clone(), c.action.clone()))
            .or_default()
            .push(c);
    }

    let literal_pairs: HashSet<(String, String)> = candidates
        .iter()
        .filter(|c| !c.resource.contains('*') && !c.action.contains('*'))
        .map(|c| (c.resource.clone(), c.action.clone()))
        .collect();

    let mut rules: BTreeMap<(String, String), AuthorityRule> = BTreeMap::new();

    for ((resource, action), group) in &by_key {
        rules.insert(
            (resource.clone(), action.clone()),
            merge(resource.clone(), action.clone(), group.iter().copied()),
        );
    }

    for (resource, action) in &literal_pairs {
        let matching: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| glob_matches(&c.resource, resource) && glob_matches(&c.action, action))
            .collect();
        if matching.len() > 1 || !by_key.contains_key(&(resource.clone(), action.clone())) {
            rules.insert(
                (resource.clone(), action.clone()),
                merge(resource.clone(), action.clone(), matching.into_iter()),
            );
        }
    }

    rules.into_values().collect()
}

fn merge<'a>(resource: String, action: String, group: impl Iterator<Item = &'a Candidate>) -> AuthorityRule {
    let candidates: Vec<&Candidate> = group.collect();
    let best_effect = candidates
        .iter()
        .map(|c| c.effect)
        .max_by_key(effect_rank)
        .unwrap_or(Effect::Allow);
    let reasons: Vec<String> = candidates.iter().filter_map(|c| c.reason.clone()).unique().collect();
    let mut sources: Vec<String> = candidates.iter().map(|c| c.source.clone()).unique().collect();
    sources.sort();
    AuthorityRule {
        resource,
        action,
        decision: Decision::from(best_effect),
        reasons,
        sources,
    }
}

/// Materializes the agent node, its resolved roles/departments present in
/// the org graph, and grantors of its active delegations, together with the
/// edges among them (§4.2 step 6).
fn materialize_subgraph(
    org_graph: &OrgGraph,
    agent_id: &str,
    active_delegations: &[DelegationRecord],
) -> (Vec<OrgNode>, Vec<GraphEdge>) {
    let mut node_ids: HashSet<String> = HashSet::new();
    node_ids.insert(agent_id.to_string());
    for role_id in org_graph
        .edges_of_type(EdgeType::HasRole)
        .into_iter()
        .filter(|e| e.from == agent_id)
        .map(|e| e.to)
    {
        node_ids.insert(role_id);
    }
    for dept_id in org_graph.department_lineage(agent_id) {
        node_ids.insert(dept_id);
    }
    for delegation in active_delegations.iter().filter(|d| d.grantee_agent_id == agent_id) {
        node_ids.insert(delegation.grantor_agent_id.clone());
    }

    let mut nodes: Vec<OrgNode> = node_ids
        .iter()
        .filter_map(|id| org_graph.node(id).cloned())
        .collect();
    nodes.sort_by(|a, b| a.id.cmp(&b.id));

    let mut edges: Vec<GraphEdge> = Vec::new();
    for edge_type in [
        EdgeType::ReportsTo,
        EdgeType::MemberOf,
        EdgeType::PartOf,
        EdgeType::HasRole,
        EdgeType::ApprovesFor,
    ] {
        for e in org_graph.edges_of_type(edge_type) {
            if node_ids.contains(&e.from) && node_ids.contains(&e.to) {
                edges.push(GraphEdge {
                    from: e.from,
                    to: e.to,
                    edge_type: e.edge_type,
                });
            }
        }
    }
    for delegation in active_delegations.iter().filter(|d| d.grantee_agent_id == agent_id) {
        edges.push(GraphEdge {
            from: delegation.grantor_agent_id.clone(),
            to: delegation.grantee_agent_id.clone(),
            edge_type: EdgeType::DelegatedTo,
        });
    }
    edges.sort_by(|a, b| (a.from.as_str(), a.to.as_str()).cmp(&(b.from.as_str(), b.to.as_str())));

    (nodes, edges)
}
