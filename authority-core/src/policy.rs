//! Authority Policy types (§3) and the governance limit knobs that tune the
//! Delegation Control and Context Adaptation components.
//!
//! `GovernanceLimits` groups the named constants `spec.md` leaves implicit
//! (`maxTtl`, `maxChainDepth`, overlay default TTL) into one configuration
//! struct with a `Default` impl, following the teacher's preset-struct
//! pattern (`ccos::security_policies::SecurityPolicies`,
//! `ccos::agents::identity::AgentConstraints`) rather than scattering them
//! as magic literals through the builder and delegation modules.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::identity::Environment;

/// `effect` values from §3, ordered by precedence (`Deny > RequireApproval >
/// Allow`, §3, §4.2 step 5, §8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Effect {
    Allow = 0,
    RequireApproval = 1,
    Deny = 2,
}

/// The decision recorded against a `(resource, action)` pair in the built
/// Authority Graph (§3, §4.2). Distinct from `Effect`: a policy's `effect`
/// is an input; `Decision` is the resolved output after precedence merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    CanExecute,
    RequiresApproval,
    Prohibited,
}

impl From<Effect> for Decision {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Allow => Decision::CanExecute,
            Effect::RequireApproval => Decision::RequiresApproval,
            Effect::Deny => Decision::Prohibited,
        }
    }
}

/// `condition{environments[], regions[], roleIdsAny[], departmentIdsAny[]}`
/// from §3. Every present dimension must be satisfied (all-of); an absent
/// dimension is unrestricted, matching delegation context-restriction
/// semantics in §4.3.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environments: Option<Vec<Environment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_ids_any: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department_ids_any: Option<Vec<String>>,
}

impl PolicyCondition {
    /// Evaluated against the identity's context/claim set (§4.2 step 3).
    pub fn is_satisfied(
        &self,
        environment: Environment,
        region: Option<&str>,
        role_ids: &[String],
        department_ids: &[String],
    ) -> bool {
        if let Some(envs) = &self.environments {
            if !envs.iter().any(|e| e.as_str() == environment.as_str()) {
                return false;
            }
        }
        if let Some(regions) = &self.regions {
            let matches = region.map(|r| regions.iter().any(|x| x == r)).unwrap_or(false);
            if !matches {
                return false;
            }
        }
        if let Some(required_roles) = &self.role_ids_any {
            if !required_roles.iter().any(|r| role_ids.contains(r)) {
                return false;
            }
        }
        if let Some(required_depts) = &self.department_ids_any {
            if !required_depts.iter().any(|d| department_ids.contains(d)) {
                return false;
            }
        }
        true
    }
}

/// `{resource, actions[], effect, reason?, constraints?, condition?}` from
/// §3. `*` and single-segment glob patterns are matched via `pattern.rs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthorityPolicy {
    pub resource: String,
    pub actions: Vec<String>,
    pub effect: Effect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<HashMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<PolicyCondition>,
}

impl AuthorityPolicy {
    pub fn allow(resource: impl Into<String>, actions: Vec<String>) -> Self {
        Self {
            resource: resource.into(),
            actions,
            effect: Effect::Allow,
            reason: None,
            constraints: None,
            condition: None,
        }
    }

    pub fn deny(resource: impl Into<String>, actions: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            actions,
            effect: Effect::Deny,
            reason: Some(reason.into()),
            constraints: None,
            condition: None,
        }
    }

    pub fn require_approval(
        resource: impl Into<String>,
        actions: Vec<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            actions,
            effect: Effect::RequireApproval,
            reason: Some(reason.into()),
            constraints: None,
            condition: None,
        }
    }
}

/// Tunable limits for Delegation Control (§3, §7 `LimitExceeded`) and
/// Context Adaptation (§4.4), grouped per the teacher's named-preset idiom
/// instead of scattered literals.
#[derive(Debug, Clone)]
pub struct GovernanceLimits {
    /// §3: `expiresAt - createdAt <= maxTtl`.
    pub max_delegation_ttl: Duration,
    /// §3: `parent.chain.len + 1 <= maxChainDepth`.
    pub max_chain_depth: usize,
    /// §4.4: default overlay expiry when a trigger doesn't supply its own.
    pub default_overlay_ttl: Duration,
}

impl Default for GovernanceLimits {
    fn default() -> Self {
        Self {
            max_delegation_ttl: Duration::days(90),
            max_chain_depth: 5,
            default_overlay_ttl: Duration::hours(24),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effect_precedence_orders_deny_highest() {
        assert!(Effect::Deny > Effect::RequireApproval);
        assert!(Effect::RequireApproval > Effect::Allow);
    }

    #[test]
    fn condition_requires_every_present_dimension() {
        let cond = PolicyCondition {
            environments: Some(vec![Environment::Production]),
            regions: None,
            role_ids_any: Some(vec!["role-a".to_string()]),
            department_ids_any: None,
        };
        assert!(cond.is_satisfied(
            Environment::Production,
            None,
            &["role-a".to_string()],
            &[]
        ));
        assert!(!cond.is_satisfied(Environment::Staging, None, &["role-a".to_string()], &[]));
        assert!(!cond.is_satisfied(Environment::Production, None, &["role-b".to_string()], &[]));
    }

    #[test]
    fn missing_dimension_is_unrestricted() {
        let cond = PolicyCondition::default();
        assert!(cond.is_satisfied(Environment::Development, Some("eu"), &[], &[]));
    }
}
