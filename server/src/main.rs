mod admission;
mod config;
mod http;
mod signature;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use platform_authz::{AdmissionEngine, DecisionContext, PolicyConfig, TeamId, Verdict};
use platform_github::GithubClient;
use platform_obs::{ObsConfig, init_tracing};
use serde::Serialize;
use tracing::info;

use crate::{
    config::AppConfig,
    http::{AppState, ServeConfig},
    signature::Verifier,
};

#[derive(Parser, Debug)]
#[command(
    name = "admit-members",
    version,
    about = "Drone admission webhook backed by GitHub organization membership"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve admission webhooks (default).
    Serve(ServeCommand),
    /// Evaluate the configured policy for one user and print the verdict.
    Check {
        #[arg(value_name = "LOGIN")]
        login: String,
    },
}

#[derive(Args, Debug, Default)]
struct ServeCommand {
    #[arg(long, value_parser = config::parse_bind, help = "Listen address, overrides DRONE_BIND")]
    bind: Option<String>,
}

#[derive(Serialize)]
struct CheckReport<'a> {
    login: &'a str,
    #[serde(flatten)]
    verdict: Verdict,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load()?;
    init_tracing(ObsConfig::default().with_debug(config.debug))?;

    match cli.command {
        Some(Command::Check { login }) => run_check(&config, &login).await,
        Some(Command::Serve(cmd)) => run_server(cmd, config).await,
        None => run_server(ServeCommand::default(), config).await,
    }
}

async fn run_server(cmd: ServeCommand, config: AppConfig) -> Result<()> {
    let verifier = Verifier::new(config.require_secret()?);
    let engine = build_engine(&config).await?;
    let state = AppState {
        engine,
        verifier,
        decision_timeout: config.decision_timeout,
    };
    let bind = cmd.bind.unwrap_or(config.bind);
    http::serve(ServeConfig::new(bind), state).await
}

async fn run_check(config: &AppConfig, login: &str) -> Result<()> {
    let engine = build_engine(config).await?;
    let ctx = DecisionContext::with_timeout(config.decision_timeout);
    let verdict = engine.decide(&ctx, login).await;
    println!("{}", check_report(login, verdict)?);
    Ok(())
}

fn check_report(login: &str, verdict: Verdict) -> Result<String> {
    Ok(serde_json::to_string_pretty(&CheckReport { login, verdict })?)
}

/// Resolve team names to ids and assemble the policy. Any team that cannot
/// be found in the configured organizations aborts startup.
async fn build_engine(config: &AppConfig) -> Result<AdmissionEngine> {
    let client = GithubClient::new(&config.github_endpoint, &config.github_token)
        .context("cannot create GitHub client")?;

    let mut admin_teams = Vec::with_capacity(config.admin_teams.len());
    for slug in &config.admin_teams {
        admin_teams.push(resolve_team(&client, &config.orgs, slug).await?);
    }
    let access_team = match &config.access_team {
        Some(slug) => Some(resolve_team(&client, &config.orgs, slug).await?),
        None => None,
    };

    let policy = PolicyConfig::new(
        config.policy_mode,
        config.orgs.clone(),
        admin_teams,
        access_team,
    )
    .context("invalid admission policy")?;
    let endpoint = client.base_url().clone();
    let engine = AdmissionEngine::new(policy, Arc::new(client));

    let policy = engine.policy();
    info!(
        mode = %policy.mode(),
        orgs = ?policy.orgs(),
        admin_teams = ?policy.admin_teams(),
        access_team = ?policy.access_team(),
        %endpoint,
        "admission policy ready"
    );
    Ok(engine)
}

async fn resolve_team(client: &GithubClient, orgs: &[String], slug: &str) -> Result<TeamId> {
    let team = client
        .resolve_team(orgs, slug)
        .await
        .with_context(|| format!("cannot find team {slug}"))?;
    Ok(team.id)
}
