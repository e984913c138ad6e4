//! Admission policy for CI system access.
//!
//! A [`PolicyConfig`] describes which organizations gate access and which
//! teams elevate or restrict it. The [`AdmissionEngine`] walks the policy's
//! state machine, asking a [`MembershipOracle`] one question at a time, and
//! returns a [`Verdict`].

mod engine;
mod membership;
mod policy;

pub use engine::{AccessRequest, AdmissionEngine, DecisionContext, UserRecord};
pub use membership::{LookupError, Membership, MembershipOracle, OrgRole, TeamId};
pub use policy::{
    DecisionState, DenyReason, PolicyConfig, PolicyError, PolicyMode, Query, TeamGate, Verdict,
};
