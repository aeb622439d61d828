//! Authority and governance core for autonomous agent fleets.
//!
//! Owns agent identity, the organizational graph, policy-driven authority
//! resolution, delegation, context adaptation, action validation, approval
//! routing, the audit trace, and the offline-verifiable authority token —
//! the pieces listed in component table §1. Integration adapters (identity
//! providers, transports, persistence) live outside this crate; see
//! `identity::IdentityClaimProvider` and `crypto::CryptoGateway` for the
//! external boundaries this crate consumes rather than implements.

pub mod approval;
pub mod audit;
pub mod authority_graph;
pub mod context_adaptation;
pub mod crypto;
pub mod delegation;
pub mod enforcement;
pub mod error;
pub mod identity;
pub mod org_graph;
pub mod pattern;
pub mod policy;
pub mod serialize;
pub mod validation;
pub mod verification;

pub use error::{AuthorityError, AuthorityResult};
