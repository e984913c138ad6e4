use std::{fmt, str::FromStr};

use serde::Serialize;
use thiserror::Error;

use crate::membership::{Membership, TeamId};

/// Which admission policy the service enforces.
///
/// `Single` denies plain org members that are outside a configured access
/// team. `Multi` scans several orgs and always admits plain members of any
/// of them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyMode {
    #[default]
    Single,
    Multi,
}

impl PolicyMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyMode::Single => "single",
            PolicyMode::Multi => "multi",
        }
    }
}

impl FromStr for PolicyMode {
    type Err = PolicyError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "single" => Ok(PolicyMode::Single),
            "multi" => Ok(PolicyMode::Multi),
            other => Err(PolicyError::UnknownMode(other.to_string())),
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("at least one organization must be configured")]
    NoOrganizations,
    #[error("single-organization policy takes exactly one organization, got {0}")]
    TooManyOrganizations(usize),
    #[error("single-organization policy takes at most one admin team, got {0}")]
    TooManyAdminTeams(usize),
    #[error("access teams are only supported by the single-organization policy")]
    AccessTeamUnsupported,
    #[error("unknown policy mode {0:?}, expected single or multi")]
    UnknownMode(String),
}

/// Why a user was turned away.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    #[error("not an organization member")]
    NotOrgMember,
    #[error("not a member of any configured organization")]
    NoConfiguredOrg,
    #[error("not a member of the access team")]
    NotInAccessTeam,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    AdmitAdmin,
    AdmitStandard,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Verdict::Deny(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::AdmitAdmin => f.write_str("admit as administrator"),
            Verdict::AdmitStandard => f.write_str("admit with standard access"),
            Verdict::Deny(reason) => write!(f, "deny: {reason}"),
        }
    }
}

/// Which gate a team query feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamGate {
    Admin,
    Access,
}

/// The membership question a state needs answered before it can advance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Query<'a> {
    OrgRole { org: &'a str },
    Team { team: TeamId, gate: TeamGate },
}

/// Position of a single decision inside the admission state machine.
///
/// Organization and team positions are indexes into the owning
/// [`PolicyConfig`]; `matched`/`org` record the first org in which the user
/// was found as a plain member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DecisionState {
    ScanningOrgs { next: usize, matched: Option<usize> },
    FoundPlainMember { org: usize },
    CheckingAdminTeam { next: usize, org: usize },
    CheckingAccessTeam { org: usize },
    Denied(DenyReason),
    AdmitAdmin,
    AdmitStandard,
}

impl DecisionState {
    pub const START: DecisionState = DecisionState::ScanningOrgs {
        next: 0,
        matched: None,
    };

    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            DecisionState::Denied(reason) => Some(Verdict::Deny(*reason)),
            DecisionState::AdmitAdmin => Some(Verdict::AdmitAdmin),
            DecisionState::AdmitStandard => Some(Verdict::AdmitStandard),
            _ => None,
        }
    }

    /// Index of the org the user was matched in as a plain member, if any.
    pub fn matched_org(&self) -> Option<usize> {
        match self {
            DecisionState::ScanningOrgs { matched, .. } => *matched,
            DecisionState::FoundPlainMember { org }
            | DecisionState::CheckingAdminTeam { org, .. }
            | DecisionState::CheckingAccessTeam { org } => Some(*org),
            _ => None,
        }
    }
}

/// Immutable admission policy, resolved once at startup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyConfig {
    mode: PolicyMode,
    orgs: Vec<String>,
    admin_teams: Vec<TeamId>,
    access_team: Option<TeamId>,
}

impl PolicyConfig {
    /// Single organization, optional admin team, optional access team.
    /// A team id of zero means "not configured".
    pub fn single(
        org: impl Into<String>,
        admin_team: Option<TeamId>,
        access_team: Option<TeamId>,
    ) -> Result<Self, PolicyError> {
        Self::new(
            PolicyMode::Single,
            vec![org.into()],
            admin_team.into_iter().collect(),
            access_team,
        )
    }

    /// Ordered organization fallback chain plus ordered admin teams.
    pub fn multi<I, S>(orgs: I, admin_teams: Vec<TeamId>) -> Result<Self, PolicyError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(
            PolicyMode::Multi,
            orgs.into_iter().map(Into::into).collect(),
            admin_teams,
            None,
        )
    }

    pub fn new(
        mode: PolicyMode,
        orgs: Vec<String>,
        admin_teams: Vec<TeamId>,
        access_team: Option<TeamId>,
    ) -> Result<Self, PolicyError> {
        let orgs = orgs
            .into_iter()
            .map(|org| org.trim().to_string())
            .filter(|org| !org.is_empty())
            .collect::<Vec<_>>();
        let admin_teams = admin_teams
            .into_iter()
            .filter(|id| *id != 0)
            .collect::<Vec<_>>();
        let access_team = access_team.filter(|id| *id != 0);

        Self::check_shape(mode, orgs.len(), admin_teams.len(), access_team.is_some())?;

        Ok(Self {
            mode,
            orgs,
            admin_teams,
            access_team,
        })
    }

    /// Validate list sizes for `mode` before team names are resolved.
    pub fn check_shape(
        mode: PolicyMode,
        orgs: usize,
        admin_teams: usize,
        has_access_team: bool,
    ) -> Result<(), PolicyError> {
        if orgs == 0 {
            return Err(PolicyError::NoOrganizations);
        }
        match mode {
            PolicyMode::Single if orgs > 1 => Err(PolicyError::TooManyOrganizations(orgs)),
            PolicyMode::Single if admin_teams > 1 => {
                Err(PolicyError::TooManyAdminTeams(admin_teams))
            }
            PolicyMode::Multi if has_access_team => Err(PolicyError::AccessTeamUnsupported),
            _ => Ok(()),
        }
    }

    pub fn mode(&self) -> PolicyMode {
        self.mode
    }

    pub fn orgs(&self) -> &[String] {
        &self.orgs
    }

    pub fn admin_teams(&self) -> &[TeamId] {
        &self.admin_teams
    }

    pub fn access_team(&self) -> Option<TeamId> {
        self.access_team
    }

    /// The query that must be answered before `state` can advance. `None`
    /// for terminal states and for states that advance without a lookup.
    pub fn pending_query(&self, state: &DecisionState) -> Option<Query<'_>> {
        match state {
            DecisionState::ScanningOrgs { next, .. } => self
                .orgs
                .get(*next)
                .map(|org| Query::OrgRole { org: org.as_str() }),
            DecisionState::CheckingAdminTeam { next, .. } => {
                self.admin_teams.get(*next).map(|team| Query::Team {
                    team: *team,
                    gate: TeamGate::Admin,
                })
            }
            DecisionState::CheckingAccessTeam { .. } => self.access_team.map(|team| Query::Team {
                team,
                gate: TeamGate::Access,
            }),
            _ => None,
        }
    }

    /// Pure transition function. `answer` is the result of the query named
    /// by [`PolicyConfig::pending_query`]; a missing answer where one was
    /// required counts as "not a member".
    pub fn advance(&self, state: DecisionState, answer: Option<&Membership>) -> DecisionState {
        let is_member = answer.is_some_and(Membership::is_member);
        let is_admin = answer.is_some_and(Membership::is_admin);

        match state {
            DecisionState::ScanningOrgs { next, matched } if next < self.orgs.len() => {
                if is_admin {
                    DecisionState::AdmitAdmin
                } else if is_member {
                    DecisionState::ScanningOrgs {
                        next: next + 1,
                        matched: matched.or(Some(next)),
                    }
                } else {
                    DecisionState::ScanningOrgs {
                        next: next + 1,
                        matched,
                    }
                }
            }
            DecisionState::ScanningOrgs { matched, .. } => match matched {
                Some(org) => DecisionState::FoundPlainMember { org },
                None => DecisionState::Denied(self.no_org_reason()),
            },
            DecisionState::FoundPlainMember { org } => {
                DecisionState::CheckingAdminTeam { next: 0, org }
            }
            DecisionState::CheckingAdminTeam { next, org } if next < self.admin_teams.len() => {
                if is_member {
                    DecisionState::AdmitAdmin
                } else {
                    DecisionState::CheckingAdminTeam {
                        next: next + 1,
                        org,
                    }
                }
            }
            DecisionState::CheckingAdminTeam { org, .. } => match self.access_team {
                Some(_) => DecisionState::CheckingAccessTeam { org },
                None => DecisionState::AdmitStandard,
            },
            DecisionState::CheckingAccessTeam { .. } if self.access_team.is_none() => {
                DecisionState::AdmitStandard
            }
            DecisionState::CheckingAccessTeam { .. } => {
                if is_member {
                    DecisionState::AdmitStandard
                } else {
                    DecisionState::Denied(DenyReason::NotInAccessTeam)
                }
            }
            terminal => terminal,
        }
    }

    fn no_org_reason(&self) -> DenyReason {
        match self.mode {
            PolicyMode::Single => DenyReason::NotOrgMember,
            PolicyMode::Multi => DenyReason::NoConfiguredOrg,
        }
    }
}
