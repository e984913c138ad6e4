use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use platform_authz::{PolicyConfig, PolicyMode};
use platform_github::DEFAULT_ENDPOINT;

const DEFAULT_BIND: &str = ":3000";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug)]
pub struct AppConfig {
    /// Listen address; host names are resolved when the listener binds.
    pub bind: String,
    pub debug: bool,
    pub secret: String,
    pub github_token: String,
    pub github_endpoint: String,
    pub policy_mode: PolicyMode,
    pub orgs: Vec<String>,
    /// Admin team slugs, resolved to ids at startup.
    pub admin_teams: Vec<String>,
    /// Access team slug, resolved to an id at startup.
    pub access_team: Option<String>,
    pub decision_timeout: Duration,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let bind = parse_bind(&var("DRONE_BIND").unwrap_or_else(|| DEFAULT_BIND.into()))?;
        let debug = var("DRONE_DEBUG").is_some_and(|value| parse_bool(&value));
        let secret = var("DRONE_SECRET").unwrap_or_default();
        let github_token = var("DRONE_GITHUB_TOKEN").unwrap_or_default();
        let github_endpoint =
            var("DRONE_GITHUB_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.into());

        let policy_mode = var("DRONE_ADMIT_POLICY")
            .unwrap_or_default()
            .parse::<PolicyMode>()
            .context("invalid DRONE_ADMIT_POLICY")?;
        let orgs = split_list(&var("DRONE_GITHUB_ORG").unwrap_or_default());
        let admin_teams = split_list(&var("DRONE_GITHUB_TEAM").unwrap_or_default());
        let access_team = var("DRONE_GITHUB_TEAM_ACCESS");

        PolicyConfig::check_shape(
            policy_mode,
            orgs.len(),
            admin_teams.len(),
            access_team.is_some(),
        )
        .context("invalid DRONE_GITHUB_ORG / DRONE_GITHUB_TEAM settings")?;

        let decision_timeout = match var("DRONE_ADMIT_TIMEOUT") {
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .with_context(|| {
                    format!("DRONE_ADMIT_TIMEOUT must be a positive number, got {raw:?}")
                })?,
            None => Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        };

        Ok(Self {
            bind,
            debug,
            secret,
            github_token,
            github_endpoint,
            policy_mode,
            orgs,
            admin_teams,
            access_team,
            decision_timeout,
        })
    }

    /// The webhook refuses to start without a shared secret.
    pub fn require_secret(&self) -> Result<&str> {
        if self.secret.is_empty() {
            return Err(anyhow!("missing secret key (DRONE_SECRET)"));
        }
        Ok(&self.secret)
    }
}

/// Accepts `host:port` and the bare `:port` form, which binds every interface.
pub fn parse_bind(raw: &str) -> Result<String> {
    let (host, port) = raw
        .rsplit_once(':')
        .with_context(|| format!("invalid bind address {raw:?}: missing port"))?;
    port.parse::<u16>()
        .with_context(|| format!("invalid bind address {raw:?}: bad port"))?;
    if host.is_empty() {
        Ok(format!("0.0.0.0:{port}"))
    } else {
        Ok(raw.to_string())
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "1" | "true" | "yes")
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter_map(|item| {
            let trimmed = item.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
        .collect()
}
