//! Organizational Graph (§4.1, component C).
//!
//! Arena-indexed per §9: nodes live in a flat map keyed by id, edges are
//! adjacency maps keyed by relationship type, and edges hold node ids — not
//! references — so there is no possibility of an ownership cycle. This
//! mirrors the teacher's general approach to id-keyed stores
//! (`ccos::agents::identity::AgentRegistry`, `LedgerIndices` in
//! `causal_chain::ledger`) generalised from a flat map to a typed graph.

use std::collections::HashMap;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::{AuthorityError, AuthorityResult};
use crate::identity::ScopeSpec;

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    User,
    Agent,
    Role,
    Department,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeType {
    ReportsTo,
    MemberOf,
    PartOf,
    HasRole,
    DelegatedTo,
    ApprovesFor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgNode {
    pub id: NodeId,
    pub node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgEdge {
    pub from: NodeId,
    pub to: NodeId,
    pub edge_type: EdgeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ScopeSpec>,
}

/// Typed directed graph of users/roles/departments (§3, §4.1).
#[derive(Debug, Default, Clone)]
pub struct OrgGraph {
    nodes: HashMap<NodeId, OrgNode>,
    /// Outgoing adjacency: (node, edge_type) -> [(target, optional scope)].
    out_edges: HashMap<(NodeId, EdgeType), Vec<(NodeId, Option<ScopeSpec>)>>,
    /// Incoming adjacency, used for `requiredApprovers` (`APPROVES_FOR`
    /// sources targeting a department).
    in_edges: HashMap<(NodeId, EdgeType), Vec<(NodeId, Option<ScopeSpec>)>>,
}

impl OrgGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: OrgNode) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn node(&self, id: &str) -> Option<&OrgNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OrgNode> {
        self.nodes.values()
    }

    /// Rejects unknown endpoints (§4.1).
    pub fn add_relationship(
        &mut self,
        from: &str,
        to: &str,
        edge_type: EdgeType,
        scope: Option<ScopeSpec>,
    ) -> AuthorityResult<()> {
        if !self.nodes.contains_key(from) {
            return Err(AuthorityError::invalid_argument(format!(
                "unknown endpoint: {}",
                from
            )));
        }
        if !self.nodes.contains_key(to) {
            return Err(AuthorityError::invalid_argument(format!(
                "unknown endpoint: {}",
                to
            )));
        }
        self.out_edges
            .entry((from.to_string(), edge_type))
            .or_default()
            .push((to.to_string(), scope.clone()));
        self.in_edges
            .entry((to.to_string(), edge_type))
            .or_default()
            .push((from.to_string(), scope));
        Ok(())
    }

    pub fn edges_of_type(&self, edge_type: EdgeType) -> Vec<OrgEdge> {
        self.out_edges
            .iter()
            .filter(|((_, et), _)| *et == edge_type)
            .flat_map(|((from, et), targets)| {
                targets.iter().map(move |(to, scope)| OrgEdge {
                    from: from.clone(),
                    to: to.clone(),
                    edge_type: *et,
                    scope: scope.clone(),
                })
            })
            .collect()
    }

    fn out_targets(&self, id: &str, edge_type: EdgeType) -> &[(NodeId, Option<ScopeSpec>)] {
        self.out_edges
            .get(&(id.to_string(), edge_type))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    fn in_sources(&self, id: &str, edge_type: EdgeType) -> &[(NodeId, Option<ScopeSpec>)] {
        self.in_edges
            .get(&(id.to_string(), edge_type))
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Walks `REPORTS_TO` edges, never raising: a cycle is detected via a
    /// visited set and terminates the walk early (§4.1, §5).
    pub fn reporting_chain(&self, id: &str) -> Vec<NodeId> {
        let mut chain = Vec::new();
        let mut visited = std::collections::HashSet::new();
        let mut current = id.to_string();
        visited.insert(current.clone());
        loop {
            let targets = self.out_targets(&current, EdgeType::ReportsTo);
            let Some((next, _)) = targets.first() else {
                break;
            };
            if visited.contains(next) {
                break;
            }
            chain.push(next.clone());
            visited.insert(next.clone());
            current = next.clone();
        }
        chain
    }

    /// The direct manager: the first hop of the reporting chain, used by
    /// the approval engine's `managerial` step (§4.6).
    pub fn direct_manager(&self, id: &str) -> Option<NodeId> {
        self.out_targets(id, EdgeType::ReportsTo)
            .first()
            .map(|(to, _)| to.clone())
    }

    /// Starts from the `MEMBER_OF` target (or `id` itself if it is already a
    /// department) and walks `PART_OF` (§4.1).
    pub fn department_lineage(&self, id: &str) -> Vec<NodeId> {
        let start = if matches!(
            self.nodes.get(id).map(|n| n.node_type),
            Some(NodeType::Department)
        ) {
            Some(id.to_string())
        } else {
            self.out_targets(id, EdgeType::MemberOf)
                .first()
                .map(|(to, _)| to.clone())
        };

        let Some(start) = start else {
            return Vec::new();
        };

        let mut lineage = vec![start.clone()];
        let mut visited = std::collections::HashSet::new();
        visited.insert(start.clone());
        let mut current = start;
        loop {
            let targets = self.out_targets(&current, EdgeType::PartOf);
            let Some((next, _)) = targets.first() else {
                break;
            };
            if visited.contains(next) {
                break;
            }
            lineage.push(next.clone());
            visited.insert(next.clone());
            current = next.clone();
        }
        lineage
    }

    fn primary_department(&self, id: &str) -> Option<NodeId> {
        self.department_lineage(id).into_iter().next()
    }

    fn root_department(&self, id: &str) -> Option<NodeId> {
        self.department_lineage(id).into_iter().last()
    }

    /// Union of: scopes on `HAS_ROLE` targets (recursively), scopes on
    /// inbound `DELEGATED_TO` edges, and the node's own scope — via DFS with
    /// a visited set (§4.1).
    pub fn effective_authority(&self, id: &str) -> Vec<ScopeSpec> {
        let mut scopes = Vec::new();
        let mut visited = std::collections::HashSet::new();
        self.collect_effective_authority(id, &mut scopes, &mut visited);
        scopes
    }

    fn collect_effective_authority(
        &self,
        id: &str,
        scopes: &mut Vec<ScopeSpec>,
        visited: &mut std::collections::HashSet<NodeId>,
    ) {
        if !visited.insert(id.to_string()) {
            return;
        }

        if let Some(node) = self.nodes.get(id) {
            if let Some(scope) = &node.scope {
                scopes.push(scope.clone());
            }
        }

        for (role_id, _) in self.out_targets(id, EdgeType::HasRole).to_vec() {
            self.collect_effective_authority(&role_id, scopes, visited);
        }

        for (_, scope) in self.in_sources(id, EdgeType::DelegatedTo).to_vec() {
            if let Some(scope) = scope {
                scopes.push(scope);
            }
        }
    }

    /// Checks any effective scope covers both `action` and `resource` via
    /// glob (§4.1).
    pub fn is_authorized(&self, id: &str, action: &str, resource: &str) -> bool {
        self.effective_authority(id)
            .iter()
            .any(|scope| scope.covers(resource, action))
    }

    /// Empty if `subject`'s primary department equals `resource_owner`'s
    /// primary department; otherwise every `APPROVES_FOR` source targeting
    /// the resource owner's root department (§4.1).
    pub fn required_approvers(&self, subject: &str, resource_owner: &str) -> Vec<NodeId> {
        let subject_dept = self.primary_department(subject);
        let owner_dept = self.primary_department(resource_owner);
        if subject_dept.is_some() && subject_dept == owner_dept {
            return Vec::new();
        }

        let Some(root) = self.root_department(resource_owner) else {
            return Vec::new();
        };

        let mut approvers: Vec<NodeId> = self
            .in_sources(&root, EdgeType::ApprovesFor)
            .iter()
            .map(|(from, _)| from.clone())
            .unique()
            .collect();
        approvers.sort();
        approvers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ScopeSpec;

    fn node(id: &str, ty: NodeType) -> OrgNode {
        OrgNode {
            id: id.to_string(),
            node_type: ty,
            scope: None,
        }
    }

    #[test]
    fn add_relationship_rejects_unknown_endpoint() {
        let mut graph = OrgGraph::new();
        graph.add_node(node("a", NodeType::User));
        let err = graph
            .add_relationship("a", "missing", EdgeType::ReportsTo, None)
            .unwrap_err();
        assert!(matches!(err, AuthorityError::InvalidArgument(_)));
    }

    #[test]
    fn reporting_chain_terminates_on_cycle() {
        let mut graph = OrgGraph::new();
        graph.add_node(node("a", NodeType::User));
        graph.add_node(node("b", NodeType::User));
        graph
            .add_relationship("a", "b", EdgeType::ReportsTo, None)
            .unwrap();
        graph
            .add_relationship("b", "a", EdgeType::ReportsTo, None)
            .unwrap();
        let chain = graph.reporting_chain("a");
        assert_eq!(chain, vec!["b".to_string()]);
    }

    #[test]
    fn department_lineage_walks_part_of() {
        let mut graph = OrgGraph::new();
        graph.add_node(node("user", NodeType::User));
        graph.add_node(node("eng", NodeType::Department));
        graph.add_node(node("platform", NodeType::Department));
        graph
            .add_relationship("user", "eng", EdgeType::MemberOf, None)
            .unwrap();
        graph
            .add_relationship("eng", "platform", EdgeType::PartOf, None)
            .unwrap();
        assert_eq!(
            graph.department_lineage("user"),
            vec!["eng".to_string(), "platform".to_string()]
        );
    }

    #[test]
    fn effective_authority_unions_role_and_delegation_scopes() {
        let mut graph = OrgGraph::new();
        let mut agent = node("agent", NodeType::Agent);
        agent.scope = Some(ScopeSpec::new(vec!["own:*".to_string()], vec!["read".to_string()]));
        graph.add_node(agent);

        let mut role = node("deployer", NodeType::Role);
        role.scope = Some(ScopeSpec::new(
            vec!["service:*".to_string()],
            vec!["deploy".to_string()],
        ));
        graph.add_node(role);
        graph
            .add_relationship("agent", "deployer", EdgeType::HasRole, None)
            .unwrap();

        graph.add_node(node("grantor", NodeType::Agent));
        let delegated_scope = ScopeSpec::new(vec!["repo:*".to_string()], vec!["write".to_string()]);
        graph
            .add_relationship(
                "grantor",
                "agent",
                EdgeType::DelegatedTo,
                Some(delegated_scope),
            )
            .unwrap();

        assert!(graph.is_authorized("agent", "read", "own:thing"));
        assert!(graph.is_authorized("agent", "deploy", "service:prod"));
        assert!(graph.is_authorized("agent", "write", "repo:team-a"));
        assert!(!graph.is_authorized("agent", "delete", "anything"));
    }

    #[test]
    fn required_approvers_empty_within_same_department() {
        let mut graph = OrgGraph::new();
        graph.add_node(node("alice", NodeType::User));
        graph.add_node(node("bob", NodeType::User));
        graph.add_node(node("eng", NodeType::Department));
        graph
            .add_relationship("alice", "eng", EdgeType::MemberOf, None)
            .unwrap();
        graph
            .add_relationship("bob", "eng", EdgeType::MemberOf, None)
            .unwrap();
        assert!(graph.required_approvers("alice", "bob").is_empty());
    }

    #[test]
    fn required_approvers_cross_department() {
        let mut graph = OrgGraph::new();
        graph.add_node(node("alice", NodeType::User));
        graph.add_node(node("bob", NodeType::User));
        graph.add_node(node("eng", NodeType::Department));
        graph.add_node(node("legal", NodeType::Department));
        graph.add_node(node("legal_lead", NodeType::User));
        graph
            .add_relationship("alice", "eng", EdgeType::MemberOf, None)
            .unwrap();
        graph
            .add_relationship("bob", "legal", EdgeType::MemberOf, None)
            .unwrap();
        graph
            .add_relationship("legal_lead", "legal", EdgeType::ApprovesFor, None)
            .unwrap();

        let approvers = graph.required_approvers("alice", "bob");
        assert_eq!(approvers, vec!["legal_lead".to_string()]);
    }
}
