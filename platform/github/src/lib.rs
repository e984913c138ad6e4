//! GitHub REST lookups backing the admission policy.
//!
//! Works against github.com and GitHub Enterprise; enterprise endpoints get
//! the `api/v3/` prefix appended the same way the official clients do it.

use std::time::Duration;

use async_trait::async_trait;
use platform_authz::{LookupError, MembershipOracle, OrgRole, TeamId};
use reqwest::{
    StatusCode,
    header::{self, HeaderMap, HeaderValue},
};
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://api.github.com/";

const USER_AGENT: &str = concat!("admit-members/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum GithubError {
    #[error("invalid GitHub endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    #[error("GitHub request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("GitHub returned {status} for {url}")]
    Status { status: StatusCode, url: String },
    #[error("cannot find team {slug} in any of {orgs:?}")]
    TeamNotFound { slug: String, orgs: Vec<String> },
}

#[derive(Clone, Debug, Deserialize)]
pub struct OrgMembership {
    pub role: String,
    #[serde(default)]
    pub state: String,
}

impl OrgMembership {
    /// Only `admin` elevates; every other role passes the org gate as a
    /// plain member.
    pub fn org_role(&self) -> OrgRole {
        if self.role == "admin" {
            OrgRole::Admin
        } else {
            OrgRole::Member
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct TeamMembership {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Team {
    pub id: TeamId,
    pub slug: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone, Debug)]
pub struct GithubClient {
    http: reqwest::Client,
    base: Url,
    token: Option<String>,
}

impl GithubClient {
    pub fn new(endpoint: &str, token: &str) -> Result<Self, GithubError> {
        let base = normalize_endpoint(endpoint)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static("application/vnd.github.v3+json"),
        );
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let token = Some(token.trim())
            .filter(|token| !token.is_empty())
            .map(str::to_string);
        Ok(Self { http, base, token })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// `GET orgs/{org}/memberships/{login}`; `None` when GitHub answers 404.
    pub async fn get_org_membership(
        &self,
        org: &str,
        login: &str,
    ) -> Result<Option<OrgMembership>, GithubError> {
        self.get_optional(&["orgs", org, "memberships", login]).await
    }

    /// `GET teams/{id}/memberships/{login}`; `None` when GitHub answers 404.
    pub async fn get_team_membership(
        &self,
        team: TeamId,
        login: &str,
    ) -> Result<Option<TeamMembership>, GithubError> {
        let team = team.to_string();
        self.get_optional(&["teams", &team, "memberships", login]).await
    }

    pub async fn get_team_by_slug(
        &self,
        org: &str,
        slug: &str,
    ) -> Result<Option<Team>, GithubError> {
        self.get_optional(&["orgs", org, "teams", slug]).await
    }

    /// Resolve a team slug to its id by trying each organization in order.
    pub async fn resolve_team(&self, orgs: &[String], slug: &str) -> Result<Team, GithubError> {
        for org in orgs {
            match self.get_team_by_slug(org, slug).await {
                Ok(Some(team)) => {
                    debug!(
                        org = %org,
                        team = %team.slug,
                        name = %team.name,
                        id = team.id,
                        "resolved team"
                    );
                    return Ok(team);
                }
                Ok(None) => debug!(org = %org, team = slug, "team not found in organization"),
                Err(err) => warn!(org = %org, team = slug, error = %err, "cannot look up team"),
            }
        }
        Err(GithubError::TeamNotFound {
            slug: slug.to_string(),
            orgs: orgs.to_vec(),
        })
    }

    async fn get_optional<T>(&self, segments: &[&str]) -> Result<Option<T>, GithubError>
    where
        T: DeserializeOwned,
    {
        let url = self.url(segments);
        let mut request = self.http.get(url.clone());
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("token {token}"));
        }

        let response = request.send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json::<T>().await?)),
            status => Err(GithubError::Status {
                status,
                url: url.to_string(),
            }),
        }
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

#[async_trait]
impl MembershipOracle for GithubClient {
    async fn org_role(&self, login: &str, org: &str) -> Result<Option<OrgRole>, LookupError> {
        let membership = self
            .get_org_membership(org, login)
            .await
            .map_err(LookupError::failed)?;
        let role = membership.map(|membership| {
            let role = membership.org_role();
            debug!(
                user = login,
                org,
                role = %membership.role,
                state = %membership.state,
                granted = role.as_str(),
                "organization membership found"
            );
            role
        });
        Ok(role)
    }

    async fn team_membership(&self, team: TeamId, login: &str) -> Result<bool, LookupError> {
        let membership = self
            .get_team_membership(team, login)
            .await
            .map_err(LookupError::failed)?;
        if let Some(membership) = &membership {
            debug!(
                user = login,
                team,
                role = %membership.role,
                state = %membership.state,
                "team membership found"
            );
        }
        Ok(membership.is_some())
    }
}

/// Ensure a trailing slash and, for enterprise hosts, the `api/v3/` prefix.
pub fn normalize_endpoint(endpoint: &str) -> Result<Url, GithubError> {
    let invalid = |reason: String| GithubError::InvalidEndpoint {
        endpoint: endpoint.to_string(),
        reason,
    };

    let mut url = Url::parse(endpoint.trim()).map_err(|err| invalid(err.to_string()))?;
    if url.cannot_be_a_base() || !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("expected an http(s) URL".into()));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }

    let host = url.host_str().unwrap_or_default();
    let public_api = host.starts_with("api.") || host.contains(".api.");
    if !public_api && !url.path().ends_with("/api/v3/") {
        let path = format!("{}api/v3/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
