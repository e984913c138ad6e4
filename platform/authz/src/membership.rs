use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// Stable identifier of a team, resolved from its name at startup.
pub type TeamId = u64;

/// Role a user holds inside an organization.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrgRole {
    Admin,
    Member,
}

impl OrgRole {
    pub fn as_str(self) -> &'static str {
        match self {
            OrgRole::Admin => "admin",
            OrgRole::Member => "member",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("membership lookup failed: {0}")]
    Failed(String),
    #[error("membership lookup exceeded the request deadline")]
    DeadlineExceeded,
}

impl LookupError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }
}

/// Answers membership questions against the identity provider.
///
/// `Ok(None)` and `Ok(false)` are definitive "not a member" answers. Errors
/// are lookup failures; the policy treats both the same way but keeps the
/// distinction visible in logs.
#[async_trait]
pub trait MembershipOracle: Send + Sync {
    async fn org_role(&self, login: &str, org: &str) -> Result<Option<OrgRole>, LookupError>;

    async fn team_membership(&self, team: TeamId, login: &str) -> Result<bool, LookupError>;
}

/// Outcome of a single membership query as seen by the policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Membership {
    Admin,
    Member,
    NotMember,
    LookupFailed(LookupError),
}

impl Membership {
    pub fn from_org_lookup(result: Result<Option<OrgRole>, LookupError>) -> Self {
        match result {
            Ok(Some(OrgRole::Admin)) => Membership::Admin,
            Ok(Some(OrgRole::Member)) => Membership::Member,
            Ok(None) => Membership::NotMember,
            Err(err) => Membership::LookupFailed(err),
        }
    }

    pub fn from_team_lookup(result: Result<bool, LookupError>) -> Self {
        match result {
            Ok(true) => Membership::Member,
            Ok(false) => Membership::NotMember,
            Err(err) => Membership::LookupFailed(err),
        }
    }

    /// Fail-closed collapse: only a definitive positive answer counts.
    pub fn is_member(&self) -> bool {
        matches!(self, Membership::Admin | Membership::Member)
    }

    pub fn is_admin(&self) -> bool {
        matches!(self, Membership::Admin)
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Membership::Admin => f.write_str("admin"),
            Membership::Member => f.write_str("member"),
            Membership::NotMember => f.write_str("not a member"),
            Membership::LookupFailed(err) => write!(f, "{err}"),
        }
    }
}
