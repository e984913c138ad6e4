use std::{future::Future, sync::Arc, time::Duration};

use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::{
    membership::{LookupError, Membership, MembershipOracle},
    policy::{DecisionState, PolicyConfig, Query, TeamGate, Verdict},
};

/// A user record the engine can elevate in place.
pub trait UserRecord {
    fn login(&self) -> &str;
    fn set_admin(&mut self, admin: bool);
}

/// Minimal user record: a login plus the administrator flag.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AccessRequest {
    pub login: String,
    pub admin: bool,
}

impl AccessRequest {
    pub fn new(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            admin: false,
        }
    }
}

impl UserRecord for AccessRequest {
    fn login(&self) -> &str {
        &self.login
    }

    fn set_admin(&mut self, admin: bool) {
        self.admin = admin;
    }
}

/// Per-request limits propagated into every membership query.
#[derive(Clone, Copy, Debug, Default)]
pub struct DecisionContext {
    deadline: Option<Instant>,
}

impl DecisionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    async fn bounded<T, F>(&self, lookup: F) -> Result<T, LookupError>
    where
        F: Future<Output = Result<T, LookupError>>,
    {
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, lookup)
                .await
                .unwrap_or(Err(LookupError::DeadlineExceeded)),
            None => lookup.await,
        }
    }
}

/// Applies a [`PolicyConfig`] to membership answers from an oracle.
///
/// Holds no mutable state; clones share the same policy and oracle and can
/// serve any number of concurrent decisions.
#[derive(Clone)]
pub struct AdmissionEngine {
    policy: Arc<PolicyConfig>,
    oracle: Arc<dyn MembershipOracle>,
}

impl AdmissionEngine {
    pub fn new(policy: PolicyConfig, oracle: Arc<dyn MembershipOracle>) -> Self {
        Self {
            policy: Arc::new(policy),
            oracle,
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Decide whether `login` is admitted. Queries run one at a time and stop
    /// as soon as the verdict is known; lookup failures count as "not a
    /// member" and never surface as errors.
    #[instrument(name = "admission.decide", skip(self, ctx), fields(mode = %self.policy.mode()))]
    pub async fn decide(&self, ctx: &DecisionContext, login: &str) -> Verdict {
        debug!(user = login, deadline = ?ctx.deadline(), "requesting system access");

        let mut state = DecisionState::START;
        loop {
            if let Some(verdict) = state.verdict() {
                return verdict;
            }
            let answer = match self.policy.pending_query(&state) {
                Some(query) => Some(self.ask(ctx, login, query).await),
                None => None,
            };
            let next = self.policy.advance(state.clone(), answer.as_ref());
            if let Some(verdict) = next.verdict() {
                self.log_verdict(login, &state, verdict);
            }
            state = next;
        }
    }

    /// Same decision as [`AdmissionEngine::decide`], marking the record as
    /// an administrator when the verdict is [`Verdict::AdmitAdmin`].
    pub async fn admit<U>(&self, ctx: &DecisionContext, user: &mut U) -> Verdict
    where
        U: UserRecord + ?Sized,
    {
        let verdict = self.decide(ctx, user.login()).await;
        if verdict == Verdict::AdmitAdmin {
            user.set_admin(true);
        }
        verdict
    }

    async fn ask(&self, ctx: &DecisionContext, login: &str, query: Query<'_>) -> Membership {
        match query {
            Query::OrgRole { org } => {
                let answer = Membership::from_org_lookup(
                    ctx.bounded(self.oracle.org_role(login, org)).await,
                );
                match &answer {
                    Membership::LookupFailed(err) => debug!(
                        user = login,
                        org,
                        error = %err,
                        "cannot get organization membership"
                    ),
                    other => debug!(
                        user = login,
                        org,
                        membership = %other,
                        "organization membership"
                    ),
                }
                answer
            }
            Query::Team { team, gate } => {
                let answer = Membership::from_team_lookup(
                    ctx.bounded(self.oracle.team_membership(team, login)).await,
                );
                let gate = match gate {
                    TeamGate::Admin => "admin",
                    TeamGate::Access => "access",
                };
                debug!(user = login, team, gate, membership = %answer, "team membership");
                answer
            }
        }
    }

    fn log_verdict(&self, login: &str, last: &DecisionState, verdict: Verdict) {
        let org = last
            .matched_org()
            .and_then(|idx| self.policy.orgs().get(idx))
            .map(String::as_str)
            .unwrap_or_default();
        match (last, verdict) {
            (DecisionState::ScanningOrgs { next, .. }, Verdict::AdmitAdmin) => {
                let org = self
                    .policy
                    .orgs()
                    .get(*next)
                    .map(String::as_str)
                    .unwrap_or_default();
                debug!(user = login, org, role = "admin", "granted admin system access");
            }
            (DecisionState::CheckingAdminTeam { next, .. }, Verdict::AdmitAdmin) => {
                let team = self.policy.admin_teams().get(*next).copied();
                debug!(user = login, org, team, "granted admin system access");
            }
            (_, Verdict::AdmitStandard) => {
                debug!(user = login, org, "grant standard system access");
            }
            (_, Verdict::Deny(reason)) => {
                debug!(user = login, org, reason = %reason, "deny standard system access");
            }
            (_, Verdict::AdmitAdmin) => {
                debug!(user = login, org, "granted admin system access");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::{
        membership::{OrgRole, TeamId},
        policy::DenyReason,
    };

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Call {
        Org(String),
        Team(TeamId),
    }

    /// Scripted oracle: anything not scripted is a definitive "not a member".
    #[derive(Default)]
    struct ScriptedOracle {
        orgs: HashMap<String, Result<Option<OrgRole>, LookupError>>,
        teams: HashMap<TeamId, Result<bool, LookupError>>,
        delay: Option<Duration>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedOracle {
        fn org(mut self, org: &str, role: OrgRole) -> Self {
            self.orgs.insert(org.into(), Ok(Some(role)));
            self
        }

        fn org_error(mut self, org: &str) -> Self {
            self.orgs.insert(org.into(), Err(LookupError::failed("500 internal error")));
            self
        }

        fn team(mut self, team: TeamId) -> Self {
            self.teams.insert(team, Ok(true));
            self
        }

        fn team_error(mut self, team: TeamId) -> Self {
            self.teams.insert(team, Err(LookupError::failed("404 not found")));
            self
        }

        fn slow(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MembershipOracle for ScriptedOracle {
        async fn org_role(&self, _login: &str, org: &str) -> Result<Option<OrgRole>, LookupError> {
            self.calls.lock().unwrap().push(Call::Org(org.into()));
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.orgs.get(org).cloned().unwrap_or(Ok(None))
        }

        async fn team_membership(&self, team: TeamId, _login: &str) -> Result<bool, LookupError> {
            self.calls.lock().unwrap().push(Call::Team(team));
            self.teams.get(&team).cloned().unwrap_or(Ok(false))
        }
    }

    fn build(
        policy: PolicyConfig,
        oracle: ScriptedOracle,
    ) -> (AdmissionEngine, Arc<ScriptedOracle>) {
        let oracle = Arc::new(oracle);
        (AdmissionEngine::new(policy, oracle.clone()), oracle)
    }

    fn member_of(org: &str) -> ScriptedOracle {
        ScriptedOracle::default().org(org, OrgRole::Member)
    }

    async fn decide(engine: &AdmissionEngine) -> Verdict {
        engine.decide(&DecisionContext::new(), "octocat").await
    }

    #[tokio::test]
    async fn single_org_admin_skips_team_checks() {
        let policy = PolicyConfig::single("acme", Some(42), Some(7)).unwrap();
        let oracle = ScriptedOracle::default().org("acme", OrgRole::Admin);
        let (engine, oracle) = build(policy, oracle);

        assert_eq!(decide(&engine).await, Verdict::AdmitAdmin);
        assert_eq!(oracle.calls(), vec![Call::Org("acme".into())]);
    }

    #[tokio::test]
    async fn single_org_lookup_failure_denies() {
        let policy = PolicyConfig::single("acme", Some(42), None).unwrap();
        let (engine, oracle) = build(policy, ScriptedOracle::default().org_error("acme"));

        assert_eq!(
            decide(&engine).await,
            Verdict::Deny(DenyReason::NotOrgMember)
        );
        assert_eq!(oracle.calls(), vec![Call::Org("acme".into())]);
    }

    #[tokio::test]
    async fn single_org_admin_team_short_circuits_access_team() {
        let policy = PolicyConfig::single("acme", Some(42), Some(7)).unwrap();
        let (engine, oracle) = build(policy, member_of("acme").team(42));

        assert_eq!(decide(&engine).await, Verdict::AdmitAdmin);
        assert_eq!(
            oracle.calls(),
            vec![Call::Org("acme".into()), Call::Team(42)]
        );
    }

    #[tokio::test]
    async fn single_org_admin_team_miss_without_access_team_admits_standard() {
        let policy = PolicyConfig::single("acme", Some(42), None).unwrap();
        let (engine, oracle) = build(policy, member_of("acme").team_error(42));

        assert_eq!(decide(&engine).await, Verdict::AdmitStandard);
        assert_eq!(
            oracle.calls(),
            vec![Call::Org("acme".into()), Call::Team(42)]
        );
    }

    #[tokio::test]
    async fn single_org_access_team_gates_plain_members() {
        let policy = PolicyConfig::single("acme", None, Some(7)).unwrap();
        let (engine, _) = build(policy.clone(), member_of("acme"));
        assert_eq!(
            decide(&engine).await,
            Verdict::Deny(DenyReason::NotInAccessTeam)
        );

        let (engine, oracle) = build(policy, member_of("acme").team(7));
        assert_eq!(decide(&engine).await, Verdict::AdmitStandard);
        assert_eq!(
            oracle.calls(),
            vec![Call::Org("acme".into()), Call::Team(7)]
        );
    }

    #[tokio::test]
    async fn single_org_without_teams_admits_plain_member() {
        let policy = PolicyConfig::single("acme", None, None).unwrap();
        let (engine, oracle) = build(policy, member_of("acme"));

        assert_eq!(decide(&engine).await, Verdict::AdmitStandard);
        assert_eq!(oracle.calls(), vec![Call::Org("acme".into())]);
    }

    #[tokio::test]
    async fn multi_org_scans_past_plain_membership_for_admin() {
        let policy = PolicyConfig::multi(["acme", "globex", "initech"], vec![42]).unwrap();
        let oracle = member_of("acme")
            .org("globex", OrgRole::Admin)
            .org("initech", OrgRole::Admin);
        let (engine, oracle) = build(policy, oracle);

        assert_eq!(decide(&engine).await, Verdict::AdmitAdmin);
        assert_eq!(
            oracle.calls(),
            vec![Call::Org("acme".into()), Call::Org("globex".into())]
        );
    }

    #[tokio::test]
    async fn multi_org_failures_fall_back_to_later_orgs() {
        let policy = PolicyConfig::multi(["acme", "globex"], vec![]).unwrap();
        let (engine, _) = build(policy, member_of("globex").org_error("acme"));

        assert_eq!(decide(&engine).await, Verdict::AdmitStandard);
    }

    #[tokio::test]
    async fn multi_org_denies_outsiders() {
        let policy = PolicyConfig::multi(["acme", "globex"], vec![42]).unwrap();
        let (engine, oracle) = build(policy, ScriptedOracle::default().org_error("globex"));

        assert_eq!(
            decide(&engine).await,
            Verdict::Deny(DenyReason::NoConfiguredOrg)
        );
        assert_eq!(
            oracle.calls(),
            vec![Call::Org("acme".into()), Call::Org("globex".into())]
        );
    }

    #[tokio::test]
    async fn multi_org_admin_teams_checked_in_order() {
        let policy = PolicyConfig::multi(["acme"], vec![1, 2, 3]).unwrap();
        let oracle = member_of("acme").team_error(1).team(2).team(3);
        let (engine, oracle) = build(policy, oracle);

        assert_eq!(decide(&engine).await, Verdict::AdmitAdmin);
        assert_eq!(
            oracle.calls(),
            vec![Call::Org("acme".into()), Call::Team(1), Call::Team(2)]
        );
    }

    #[tokio::test]
    async fn multi_org_plain_member_outside_admin_teams_admits_standard() {
        let policy = PolicyConfig::multi(["acme", "globex"], vec![1, 2]).unwrap();
        let (engine, oracle) = build(policy, member_of("globex"));

        assert_eq!(decide(&engine).await, Verdict::AdmitStandard);
        assert_eq!(oracle.calls().len(), 4);
    }

    #[tokio::test]
    async fn repeated_decisions_agree() {
        let policy = PolicyConfig::single("acme", Some(42), Some(7)).unwrap();
        let (engine, _) = build(policy, member_of("acme"));

        let first = decide(&engine).await;
        let second = decide(&engine).await;
        assert_eq!(first, second);
        assert!(!first.is_admitted());
        assert_eq!(engine.policy().access_team(), Some(7));
    }

    #[tokio::test]
    async fn deadline_expiry_fails_closed() {
        let policy = PolicyConfig::single("acme", None, None).unwrap();
        let oracle = ScriptedOracle::default()
            .org("acme", OrgRole::Admin)
            .slow(Duration::from_secs(5));
        let (engine, _) = build(policy, oracle);

        let ctx = DecisionContext::with_timeout(Duration::from_millis(20));
        assert!(ctx.deadline().is_some());
        assert_eq!(
            engine.decide(&ctx, "octocat").await,
            Verdict::Deny(DenyReason::NotOrgMember)
        );
    }

    #[tokio::test]
    async fn admit_marks_admins_only() {
        let policy = PolicyConfig::multi(["acme"], vec![]).unwrap();
        let oracle = ScriptedOracle::default().org("acme", OrgRole::Admin);
        let (engine, _) = build(policy, oracle);
        let mut user = AccessRequest::new("octocat");
        let verdict = engine.admit(&DecisionContext::new(), &mut user).await;
        assert_eq!(verdict, Verdict::AdmitAdmin);
        assert!(user.admin);

        let policy = PolicyConfig::multi(["acme"], vec![]).unwrap();
        let (engine, _) = build(policy, member_of("acme"));
        let mut user = AccessRequest::new("octocat");
        let verdict = engine.admit(&DecisionContext::new(), &mut user).await;
        assert_eq!(verdict, Verdict::AdmitStandard);
        assert!(!user.admin);
    }
}
