//! End-to-end tests for the `/auth` routes over a real listener.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::task::JoinHandle;
use trenova_auth::error::INVALID_CREDENTIALS_MESSAGE;
use trenova_auth::{
    AuthConfig, AuthService, AuthState, BootstrapUser, InMemoryUserRepository, ProxyConfig, http,
};
use trenova_cache::InMemoryCache;

const EMAIL: &str = "dispatch@trenova.app";
const PASSWORD: &str = "correct horse";

async fn start_server() -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    start_server_with(AuthConfig::default()).await
}

/// Trusts forwarding headers from any peer, so tests can pose as other clients.
async fn start_behind_proxy() -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    start_server_with(AuthConfig {
        proxy: ProxyConfig {
            trust_headers: true,
            trusted_proxies: Vec::new(),
        },
        ..AuthConfig::default()
    })
    .await
}

async fn start_server_with(
    config: AuthConfig,
) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let users = InMemoryUserRepository::from_bootstrap(&[BootstrapUser {
        email_address: EMAIL.to_string(),
        password: PASSWORD.to_string(),
        name: "Dispatch".to_string(),
        username: "dispatch".to_string(),
        ..BootstrapUser::default()
    }])
    .expect("bootstrap users");
    let service = AuthService::new(Arc::new(InMemoryCache::new()), Arc::new(users), &config);
    let app = http::router(
        AuthState::new(Arc::new(service), config.cookie.clone()).with_proxy(config.proxy.clone()),
    );

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let _ = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = rx.await;
        })
        .await;
    });

    (format!("http://{addr}"), tx, server)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .cookie_store(true)
        .build()
        .expect("client")
}

#[tokio::test]
async fn login_validate_logout_flow() {
    let (base, shutdown, handle) = start_behind_proxy().await;
    let client = client();

    let resp = client
        .post(format!("{base}/auth/login"))
        .header("user-agent", "t1")
        .json(&json!({ "emailAddress": EMAIL, "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let set_cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(set_cookie.starts_with("trenova-session-id="));
    assert!(set_cookie.contains("HttpOnly"));
    let body: Value = resp.json().await.unwrap();
    let session_id = body["sessionId"].as_str().unwrap().to_string();
    assert!(session_id.starts_with("ses_"));
    assert_eq!(body["user"]["emailAddress"], EMAIL);
    assert!(body["user"].get("passwordHash").is_none());

    let sessions: Value = client
        .get(format!("{base}/auth/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions.as_array().unwrap().len(), 1);
    assert_eq!(sessions[0]["id"], session_id.as_str());

    // Same cookie from a different address.
    let resp = client
        .get(format!("{base}/auth/sessions"))
        .header("x-forwarded-for", "9.9.9.9")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["detail"], INVALID_CREDENTIALS_MESSAGE);

    let resp = client
        .post(format!("{base}/auth/logout"))
        .header("user-agent", "t1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    // Replay the revoked session id explicitly.
    let resp = reqwest::Client::new()
        .post(format!("{base}/auth/refresh"))
        .header("cookie", format!("trenova-session-id={session_id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn repeated_bad_passwords_are_rate_limited() {
    let (base, shutdown, handle) = start_server().await;
    let client = client();
    let attempt = || {
        client
            .post(format!("{base}/auth/login"))
            .json(&json!({ "emailAddress": EMAIL, "password": "wrong" }))
            .send()
    };

    for _ in 0..5 {
        let resp = attempt().await.unwrap();
        assert_eq!(resp.status(), 401);
        let problem: Value = resp.json().await.unwrap();
        assert_eq!(problem["detail"], INVALID_CREDENTIALS_MESSAGE);
    }

    let resp = attempt().await.unwrap();
    assert_eq!(resp.status(), 429);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "application/problem+json"
    );
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["invalidParams"][0]["name"], "emailAddress");
    assert!(problem["detail"].as_str().unwrap().contains("Too many login attempts"));

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn ip_mismatch_reads_like_bad_credentials() {
    let (base, shutdown, handle) = start_behind_proxy().await;
    let client = client();

    let resp = client
        .post(format!("{base}/auth/login"))
        .header("x-forwarded-for", "1.2.3.4")
        .json(&json!({ "emailAddress": EMAIL, "password": "wrong" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let bad_password: Value = resp.json().await.unwrap();

    let resp = client
        .post(format!("{base}/auth/login"))
        .header("x-forwarded-for", "1.2.3.4")
        .json(&json!({ "emailAddress": EMAIL, "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = client
        .post(format!("{base}/auth/refresh"))
        .header("x-forwarded-for", "5.6.7.8")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let mismatch: Value = resp.json().await.unwrap();

    assert_eq!(bad_password["detail"], mismatch["detail"]);
    assert_eq!(bad_password["title"], mismatch["title"]);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn forged_forwarding_headers_do_not_reset_the_limiter() {
    let (base, shutdown, handle) = start_server().await;
    let client = client();

    for i in 0..5 {
        let resp = client
            .post(format!("{base}/auth/login"))
            .header("x-forwarded-for", format!("10.0.0.{i}"))
            .header("x-real-ip", format!("10.1.0.{i}"))
            .json(&json!({ "emailAddress": EMAIL, "password": "wrong" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401);
    }

    let resp = client
        .post(format!("{base}/auth/login"))
        .header("x-forwarded-for", "10.0.0.99")
        .json(&json!({ "emailAddress": EMAIL, "password": "wrong" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 429);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn check_email_and_validation_errors() {
    let (base, shutdown, handle) = start_server().await;
    let client = client();

    let body: Value = client
        .post(format!("{base}/auth/check-email"))
        .json(&json!({ "emailAddress": EMAIL }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["valid"], true);

    let resp = client
        .post(format!("{base}/auth/login"))
        .json(&json!({ "emailAddress": "nope", "password": "" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["invalidParams"][0]["name"], "emailAddress");

    let resp = client
        .post(format!("{base}/auth/login"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let _ = shutdown.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn protected_routes_require_a_session() {
    let (base, shutdown, handle) = start_server().await;

    let resp = reqwest::Client::new()
        .get(format!("{base}/auth/sessions"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let problem: Value = resp.json().await.unwrap();
    assert_eq!(problem["type"], "authentication-error");

    let _ = shutdown.send(());
    let _ = handle.await;
}
