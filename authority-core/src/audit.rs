//! Audit Trace (§4.8, component J): a hash-chained event log plus decision
//! chain reconstruction and compliance checks.
//!
//! Grounded on `ccos::causal_chain::ledger::ImmutableLedger`: append-only
//! `Vec`, a parallel hash chain, `verify_integrity` walking both in lock
//! step and failing closed at the first mismatch. The teacher persists to
//! SQLite; this crate is interfaces-only for persistence (§1 Non-goals), so
//! `AuditTrace` keeps the in-memory vector as the sole store, guarded by the
//! same `RwLock` discipline the rest of the crate uses (§5: "append-only
//! under exclusive lock; hash computation precedes append").

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AuthorityError, AuthorityResult};
use crate::serialize::stable_bytes;

const GENESIS: &str = "GENESIS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditDomain {
    AuthorityCheck,
    DelegationEvent,
    ApprovalPath,
    EnforcementDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventDecision {
    Allow,
    Deny,
    RequireApproval,
}

/// A request to append a new event. `sequence`, `previous_hash`, and `hash`
/// are computed by `AuditTrace::record` — callers never set them directly.
///
/// `trace_id` is not explicitly listed among §3's Audit Event fields, but
/// decision-chain reconstruction (§4.8) requires correlating events to a
/// trace; we carry it as a first-class field rather than smuggling it
/// through `details`. Documented as an Open Question resolution in
/// `DESIGN.md`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEventInput {
    pub trace_id: String,
    pub domain: AuditDomain,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<EventDecision>,
    #[serde(default)]
    pub compliance_tags: Vec<String>,
    pub details: serde_json::Value,
}

impl AuditEventInput {
    pub fn new(trace_id: impl Into<String>, domain: AuditDomain, event_type: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
            domain,
            event_type: event_type.into(),
            actor_id: None,
            subject_id: None,
            entity_id: None,
            decision: None,
            compliance_tags: Vec::new(),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    pub fn with_entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_decision(mut self, decision: EventDecision) -> Self {
        self.decision = Some(decision);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// `{eventId, sequence, timestamp, domain, type, actorId?, subjectId?,
/// entityId?, decision?, complianceTags[], details, previousHash, hash}`
/// from §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub trace_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub domain: AuditDomain,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub subject_id: Option<String>,
    pub entity_id: Option<String>,
    pub decision: Option<EventDecision>,
    pub compliance_tags: Vec<String>,
    pub details: serde_json::Value,
    pub previous_hash: String,
    pub hash: String,
}

/// The fields that are actually hashed — everything except `hash` itself,
/// matching the invariant `hash == H(stableSerialize(payload \ {hash}))`
/// (§8).
#[derive(Serialize)]
struct HashedPayload<'a> {
    event_id: &'a str,
    trace_id: &'a str,
    sequence: u64,
    timestamp: DateTime<Utc>,
    domain: AuditDomain,
    event_type: &'a str,
    actor_id: &'a Option<String>,
    subject_id: &'a Option<String>,
    entity_id: &'a Option<String>,
    decision: &'a Option<EventDecision>,
    compliance_tags: &'a [String],
    details: &'a serde_json::Value,
    previous_hash: &'a str,
}

fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Result of `validateCompliance` (§4.8).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceResult {
    pub compliant: bool,
    pub violations: Vec<String>,
    pub checks: Vec<AuditEvent>,
}

/// Result of `verifyIntegrity` (§4.8, §8).
#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub reason: Option<String>,
}

/// Partition of a trace's events by domain (§4.8).
#[derive(Debug, Clone, Default)]
pub struct DecisionChain {
    pub authority_check: Vec<AuditEvent>,
    pub delegation_event: Vec<AuditEvent>,
    pub approval_path: Vec<AuditEvent>,
    pub enforcement_decision: Vec<AuditEvent>,
}

/// Hash-chained, append-only audit log (§4.8, §5: "append-only under
/// exclusive lock").
#[derive(Debug, Default)]
pub struct AuditTrace {
    events: RwLock<Vec<AuditEvent>>,
}

impl AuditTrace {
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Vec::new()),
        }
    }

    /// Appends a new event. `previousHash` is the tail hash (`GENESIS` if
    /// empty), `sequence` is `len + 1`, and `hash` covers every other field
    /// (§3, §4.8, §8).
    pub fn record(&self, input: AuditEventInput, now: DateTime<Utc>) -> AuthorityResult<AuditEvent> {
        let mut events = self
            .events
            .write()
            .map_err(|_| AuthorityError::precondition_failed("audit log lock poisoned"))?;

        let previous_hash = events
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        let sequence = events.len() as u64 + 1;
        let event_id = uuid::Uuid::new_v4().to_string();

        let hashed = HashedPayload {
            event_id: &event_id,
            trace_id: &input.trace_id,
            sequence,
            timestamp: now,
            domain: input.domain,
            event_type: &input.event_type,
            actor_id: &input.actor_id,
            subject_id: &input.subject_id,
            entity_id: &input.entity_id,
            decision: &input.decision,
            compliance_tags: &input.compliance_tags,
            details: &input.details,
            previous_hash: &previous_hash,
        };
        let hash = hash_hex(&stable_bytes(&hashed));

        let event = AuditEvent {
            event_id,
            trace_id: input.trace_id,
            sequence,
            timestamp: now,
            domain: input.domain,
            event_type: input.event_type,
            actor_id: input.actor_id,
            subject_id: input.subject_id,
            entity_id: input.entity_id,
            decision: input.decision,
            compliance_tags: input.compliance_tags,
            details: input.details,
            previous_hash,
            hash,
        };

        events.push(event.clone());
        log::info!(
            "[AuditTrace] recorded event {} ({:?}/{}) at sequence {}",
            event.event_id,
            event.domain,
            event.event_type,
            event.sequence
        );
        Ok(event)
    }

    /// Walks the chain, returning the first break (sequence gap, linkage
    /// mismatch, or hash mismatch) it finds (§4.8, §8).
    pub fn verify_integrity(&self) -> IntegrityReport {
        let events = match self.events.read() {
            Ok(e) => e,
            Err(_) => {
                return IntegrityReport {
                    valid: false,
                    reason: Some("audit log lock poisoned".to_string()),
                }
            }
        };

        let mut previous_hash = GENESIS.to_string();
        for (i, event) in events.iter().enumerate() {
            let expected_sequence = i as u64 + 1;
            if event.sequence != expected_sequence {
                return IntegrityReport {
                    valid: false,
                    reason: Some(format!(
                        "Sequence mismatch at position {}: expected {}, found {}",
                        i, expected_sequence, event.sequence
                    )),
                };
            }
            if event.previous_hash != previous_hash {
                return IntegrityReport {
                    valid: false,
                    reason: Some(format!(
                        "Linkage mismatch at sequence {}: previous hash does not match",
                        event.sequence
                    )),
                };
            }

            let hashed = HashedPayload {
                event_id: &event.event_id,
                trace_id: &event.trace_id,
                sequence: event.sequence,
                timestamp: event.timestamp,
                domain: event.domain,
                event_type: &event.event_type,
                actor_id: &event.actor_id,
                subject_id: &event.subject_id,
                entity_id: &event.entity_id,
                decision: &event.decision,
                compliance_tags: &event.compliance_tags,
                details: &event.details,
                previous_hash: &event.previous_hash,
            };
            let expected_hash = hash_hex(&stable_bytes(&hashed));
            if event.hash != expected_hash {
                return IntegrityReport {
                    valid: false,
                    reason: Some(format!(
                        "Hash verification failed at sequence {}",
                        event.sequence
                    )),
                };
            }

            previous_hash = event.hash.clone();
        }

        IntegrityReport {
            valid: true,
            reason: None,
        }
    }

    pub fn events_for_trace(&self, trace_id: &str) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| {
                events
                    .iter()
                    .filter(|e| e.trace_id == trace_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn all_events(&self) -> Vec<AuditEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    /// Reconstructs the decision chain for `trace_id`: the trace's own
    /// events, partitioned by domain, plus delegation events whose
    /// `entityId` appears among the trace's authority-check sources tagged
    /// `delegation:<id>` (§4.8).
    pub fn decision_chain(&self, trace_id: &str) -> DecisionChain {
        let trace_events = self.events_for_trace(trace_id);

        let delegation_ids: std::collections::HashSet<String> = trace_events
            .iter()
            .filter(|e| e.domain == AuditDomain::AuthorityCheck)
            .filter_map(|e| e.details.get("sources"))
            .filter_map(|v| v.as_array())
            .flatten()
            .filter_map(|v| v.as_str())
            .filter_map(|s| s.strip_prefix("delegation:"))
            .map(|s| s.to_string())
            .collect();

        let all_events = self.all_events();
        let extra_delegation_events: Vec<AuditEvent> = all_events
            .into_iter()
            .filter(|e| e.domain == AuditDomain::DelegationEvent)
            .filter(|e| e.trace_id != trace_id)
            .filter(|e| {
                e.entity_id
                    .as_ref()
                    .map(|id| delegation_ids.contains(id))
                    .unwrap_or(false)
            })
            .collect();

        let mut chain = DecisionChain::default();
        for event in trace_events.into_iter().chain(extra_delegation_events) {
            match event.domain {
                AuditDomain::AuthorityCheck => chain.authority_check.push(event),
                AuditDomain::DelegationEvent => chain.delegation_event.push(event),
                AuditDomain::ApprovalPath => chain.approval_path.push(event),
                AuditDomain::EnforcementDecision => chain.enforcement_decision.push(event),
            }
        }
        chain
    }

    /// §4.8 compliance rules:
    /// - require >=1 `authority_check_result`;
    /// - if any approval was required, require an `approval_path` event
    ///   whose type is `route_approved` or `step_approved`;
    /// - an `enforcement_decision` with `decision=allow` must not coexist
    ///   with an `authority_check_result` whose decision is `deny` for the
    ///   same trace.
    pub fn validate_compliance(&self, trace_id: &str) -> ComplianceResult {
        let chain = self.decision_chain(trace_id);
        let mut violations = Vec::new();

        let checks: Vec<AuditEvent> = chain
            .authority_check
            .iter()
            .filter(|e| e.event_type == "authority_check_result")
            .cloned()
            .collect();

        if checks.is_empty() {
            violations.push("missing authority_check_result event".to_string());
        }

        let approval_required = checks
            .iter()
            .any(|e| e.decision == Some(EventDecision::RequireApproval));
        if approval_required {
            let has_approval_path = chain.approval_path.iter().any(|e| {
                e.event_type == "route_approved" || e.event_type == "step_approved"
            });
            if !has_approval_path {
                violations.push(
                    "approval was required but no route_approved/step_approved event was recorded"
                        .to_string(),
                );
            }
        }

        let enforcement_allowed = chain
            .enforcement_decision
            .iter()
            .any(|e| e.decision == Some(EventDecision::Allow));
        let has_denied_check = checks.iter().any(|e| e.decision == Some(EventDecision::Deny));
        if enforcement_allowed && has_denied_check {
            violations.push(
                "enforcement_decision=allow coexists with a denied authority_check_result"
                    .to_string(),
            );
        }

        ComplianceResult {
            compliant: violations.is_empty(),
            violations,
            checks,
        }
    }
}
