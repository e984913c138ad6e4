use std::time::Duration;

use anyhow::Context;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, HeaderName, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use platform_authz::{AdmissionEngine, DecisionContext, Verdict};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{debug, error, info};

use crate::{admission::AdmissionRequest, signature::Verifier};

pub const ACCESS_DENIED: &str = "admission: access denied";

#[derive(Clone)]
pub struct AppState {
    pub engine: AdmissionEngine,
    pub verifier: Verifier,
    pub decision_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ServeConfig {
    addr: String,
}

impl ServeConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

pub async fn serve(config: ServeConfig, state: AppState) -> anyhow::Result<()> {
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.addr.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.addr))?;

    let addr = listener.local_addr().context("listener has no local address")?;
    info!(bind = %config.addr, %addr, "server listening");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let header_name = HeaderName::from_static("x-request-id");
    Router::new()
        .route("/", post(admission_handler))
        .route("/healthz", get(health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(header_name.clone(), MakeRequestUuid))
                .layer(PropagateRequestIdLayer::new(header_name))
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(state)
}

async fn health_handler() -> &'static str {
    "ok"
}

/// Admin ⇒ 200 with the elevated user, standard ⇒ 204, denied ⇒ 403.
async fn admission_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Response> {
    state
        .verifier
        .verify(&method, &uri, &headers, &body)
        .map_err(|err| {
            debug!(error = %err, "admission: invalid or missing signature");
            HttpError::new(StatusCode::BAD_REQUEST, &err.to_string())
        })?;

    let mut request: AdmissionRequest = serde_json::from_slice(&body).map_err(|err| {
        debug!(error = %err, "admission: cannot decode request");
        HttpError::new(StatusCode::BAD_REQUEST, "invalid admission request")
    })?;
    if request.user.login.is_empty() {
        return Err(HttpError::new(StatusCode::BAD_REQUEST, "missing user login"));
    }

    let ctx = DecisionContext::with_timeout(state.decision_timeout);
    let verdict = state.engine.admit(&ctx, &mut request.user).await;
    info!(
        user = %request.user.login,
        event = %request.event,
        admitted = verdict.is_admitted(),
        %verdict,
        "admission decided"
    );

    match verdict {
        Verdict::AdmitAdmin => Ok(Json(request.user).into_response()),
        Verdict::AdmitStandard => Ok(StatusCode::NO_CONTENT.into_response()),
        Verdict::Deny(_) => Err(HttpError::new(StatusCode::FORBIDDEN, ACCESS_DENIED)),
    }
}

type HttpResult<T> = Result<T, HttpError>;

#[derive(Debug)]
struct HttpError {
    status: StatusCode,
    message: String,
}

impl HttpError {
    fn new(status: StatusCode, msg: &str) -> Self {
        Self {
            status,
            message: msg.to_string(),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{Request, header},
    };
    use http_body_util::BodyExt;
    use platform_authz::{LookupError, MembershipOracle, OrgRole, PolicyConfig, TeamId};
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use super::*;
    use crate::signature::body_digest;

    const SECRET: &str = "correct-horse";

    /// alice is an org admin, bob a plain member, carol in the access team.
    struct FixedOracle;

    #[async_trait]
    impl MembershipOracle for FixedOracle {
        async fn org_role(&self, login: &str, _org: &str) -> Result<Option<OrgRole>, LookupError> {
            match login {
                "alice" => Ok(Some(OrgRole::Admin)),
                "bob" | "carol" => Ok(Some(OrgRole::Member)),
                "flaky" => Err(LookupError::failed("503 service unavailable")),
                _ => Ok(None),
            }
        }

        async fn team_membership(&self, team: TeamId, login: &str) -> Result<bool, LookupError> {
            Ok(team == 7 && login == "carol")
        }
    }

    fn router(policy: PolicyConfig) -> Router {
        build_router(AppState {
            engine: AdmissionEngine::new(policy, Arc::new(FixedOracle)),
            verifier: Verifier::new(SECRET),
            decision_timeout: Duration::from_secs(5),
        })
    }

    fn signed_request(login: &str) -> Request<Body> {
        let body = serde_json::to_vec(&json!({
            "event": "login",
            "user": {"id": 1, "login": login, "email": format!("{login}@acme.test"), "synced": 42}
        }))
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("date", "Mon, 02 Jan 2006 15:04:05 GMT".parse().unwrap());
        headers.insert("digest", body_digest(&body).parse().unwrap());
        let signature = Verifier::new(SECRET)
            .sign(
                &Method::POST,
                &Uri::from_static("/"),
                &headers,
                &["(request-target)", "date", "digest"],
            )
            .unwrap();

        let mut request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .header(header::CONTENT_TYPE, "application/json")
            .header("signature", signature)
            .body(Body::from(body))
            .unwrap();
        request.headers_mut().extend(headers);
        request
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn org_admin_gets_elevated_user_back() {
        let app = router(PolicyConfig::single("acme", None, None).unwrap());
        let response = app.oneshot(signed_request("alice")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let user: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(user["login"], json!("alice"));
        assert_eq!(user["admin"], json!(true));
        assert_eq!(user["synced"], json!(42));
    }

    #[tokio::test]
    async fn plain_member_gets_no_content() {
        let app = router(PolicyConfig::single("acme", None, None).unwrap());
        let response = app.oneshot(signed_request("bob")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn access_team_gate_returns_forbidden() {
        let policy = PolicyConfig::single("acme", None, Some(7)).unwrap();

        let response = router(policy.clone())
            .oneshot(signed_request("bob"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(body_text(response).await, ACCESS_DENIED);

        let response = router(policy)
            .oneshot(signed_request("carol"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn lookup_failures_are_denials_not_errors() {
        let app = router(PolicyConfig::multi(["acme", "globex"], vec![]).unwrap());
        let response = app.oneshot(signed_request("flaky")).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unsigned_requests_are_bad_requests() {
        let app = router(PolicyConfig::single("acme", None, None).unwrap());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::from(r#"{"user":{"login":"alice"}}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected() {
        let app = router(PolicyConfig::single("acme", None, None).unwrap());
        let mut request = signed_request("bob");
        *request.body_mut() = Body::from(r#"{"user":{"login":"alice"}}"#);
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_is_unsigned_and_tagged() {
        let app = router(PolicyConfig::single("acme", None, None).unwrap());
        let request = Request::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(body_text(response).await, "ok");
    }
}
