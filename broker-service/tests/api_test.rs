//! End-to-end tests over the HTTP surface: router, middleware, handlers.

mod common;

use broker_service::build_router;
use common::{TEST_ADMIN_API_KEY, TestBroker, principal};
use serde_json::json;

struct TestServer {
    base: String,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn(broker: &TestBroker) -> Self {
        let router = build_router(broker.state.clone())
            .await
            .expect("Failed to build router");
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("server failed");
        });

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap();
        Self {
            base: format!("http://127.0.0.1:{}", port),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

#[tokio::test]
async fn health_endpoint_reports_healthy() {
    let broker = TestBroker::spawn().await;
    let server = TestServer::spawn(&broker).await;

    let response = server.client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["checks"]["revocation_index"], "up");
}

#[tokio::test]
async fn jwks_endpoint_publishes_rsa_keys() {
    let broker = TestBroker::spawn().await;
    let server = TestServer::spawn(&broker).await;

    let response = server
        .client
        .get(server.url("/.well-known/jwks.json"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["alg"], "RS256");
    assert!(keys[0]["kid"].is_string());

    // After rotation both keys are published.
    broker.state.keyring.rotate().unwrap();
    let body: serde_json::Value = server
        .client
        .get(server.url("/.well-known/jwks.json"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["keys"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn admin_surface_requires_the_admin_api_key() {
    let broker = TestBroker::spawn().await;
    let server = TestServer::spawn(&broker).await;

    let response = server
        .client
        .get(server.url("/admin/apps"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/admin/apps"))
        .header("x-admin-api-key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/admin/apps"))
        .header("x-admin-api-key", TEST_ADMIN_API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn full_login_flow_over_http() {
    let broker = TestBroker::spawn().await;
    let server = TestServer::spawn(&broker).await;

    // Admin: register the application, a role, and a mapping.
    let response = server
        .client
        .post(server.url("/admin/apps"))
        .header("x-admin-api-key", TEST_ADMIN_API_KEY)
        .json(&json!({
            "client_id": "app_hr",
            "display_name": "HR Portal",
            "owner": "hr-platform",
            "redirect_uris": ["http://localhost:3000/callback"],
            "allow_discovery": false
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    broker.seed_hr_graph("app_hr");

    let response = server
        .client
        .put(server.url("/admin/apps/app_hr/roles/HR_Manager"))
        .header("x-admin-api-key", TEST_ADMIN_API_KEY)
        .json(&json!({
            "grants": [
                { "resource": "employees", "action": "read", "category": "pii" }
            ],
            "rls_filters": [
                {
                    "resource": "employees",
                    "expression": "manager_email = @current_user_email",
                    "operator": "AND"
                }
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = server
        .client
        .post(server.url("/admin/apps/app_hr/mappings"))
        .header("x-admin-api-key", TEST_ADMIN_API_KEY)
        .json(&json!({ "group_name": "HR Managers", "role_name": "HR_Manager" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Login initiation redirects to the identity provider.
    let response = server
        .client
        .get(server.url(
            "/auth/login?client_id=app_hr&redirect_uri=http://localhost:3000/callback&state=xyz",
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 307);
    let location = response.headers()["location"].to_str().unwrap();
    assert!(location.contains("state=xyz"));

    // Exchange a (pre-registered) code for tokens.
    broker
        .idp
        .register_code("code-abc", principal("alice", &["HR Managers"]));
    let response = server
        .client
        .post(server.url("/auth/token"))
        .json(&json!({
            "grant_type": "authorization_code",
            "code": "code-abc",
            "client_id": "app_hr",
            "redirect_uri": "http://localhost:3000/callback"
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let tokens: serde_json::Value = response.json().await.unwrap();
    let access_token = tokens["access_token"].as_str().unwrap().to_string();
    let refresh_token = tokens["refresh_token"].as_str().unwrap().to_string();
    assert_eq!(tokens["token_type"], "Bearer");

    // Validate: full claims come back.
    let response = server
        .client
        .post(server.url("/auth/validate"))
        .json(&json!({ "token": access_token, "audience": "app_hr" }))
        .send()
        .await
        .unwrap();
    let verdict: serde_json::Value = response.json().await.unwrap();
    assert_eq!(verdict["valid"], true);
    let permissions = verdict["claims"]["permissions"].as_array().unwrap();
    assert!(permissions.contains(&json!("employees.read.pii")));
    assert!(
        verdict["claims"]["rls_filters"]["employees.read"][0]["expr"]
            .as_str()
            .unwrap()
            .contains("@current_user_email")
    );

    // Wrong audience is invalid with a specific reason.
    let response = server
        .client
        .post(server.url("/auth/validate"))
        .json(&json!({ "token": access_token, "audience": "app_other" }))
        .send()
        .await
        .unwrap();
    let verdict: serde_json::Value = response.json().await.unwrap();
    assert_eq!(verdict["valid"], false);
    assert_eq!(verdict["reason"], "WRONG_AUDIENCE");

    // Refresh over HTTP rotates the pair.
    let response = server
        .client
        .post(server.url("/auth/refresh"))
        .json(&json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let rotated: serde_json::Value = response.json().await.unwrap();
    assert_ne!(rotated["refresh_token"], tokens["refresh_token"]);

    // Replaying the old refresh token is rejected.
    let response = server
        .client
        .post(server.url("/auth/refresh"))
        .json(&json!({ "refresh_token": refresh_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Revoke the access token, then it stops validating.
    let response = server
        .client
        .post(server.url("/auth/revoke"))
        .json(&json!({ "token": access_token }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let verdict: serde_json::Value = server
        .client
        .post(server.url("/auth/validate"))
        .json(&json!({ "token": access_token, "audience": "app_hr" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(verdict["valid"], false);
    assert_eq!(verdict["reason"], "REVOKED");
}

#[tokio::test]
async fn a2a_flow_over_http() {
    let broker = TestBroker::spawn().await;
    let server = TestServer::spawn(&broker).await;

    broker.register_app("app_source", None).await;
    broker.register_app("app_target", None).await;

    // Configure the allow-list and mint a key through the admin surface.
    let response = server
        .client
        .put(server.url("/admin/a2a"))
        .header("x-admin-api-key", TEST_ADMIN_API_KEY)
        .json(&json!({
            "source_client_id": "app_source",
            "target_client_id": "app_target",
            "allowed_scopes": ["orders.read"],
            "max_token_duration_seconds": 300
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let credential: serde_json::Value = server
        .client
        .post(server.url("/admin/apps/app_source/credentials"))
        .header("x-admin-api-key", TEST_ADMIN_API_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let api_key = credential["api_key"].as_str().unwrap().to_string();

    // Request a service token with the key as bearer credential.
    let response = server
        .client
        .post(server.url("/a2a/token"))
        .bearer_auth(&api_key)
        .json(&json!({
            "target_client_id": "app_target",
            "scopes": ["orders.read"],
            "duration_seconds": 600
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    // Clamped to the allow-list maximum.
    assert_eq!(body["expires_in"], 300);
    assert!(body["a2a_id"].is_string());

    // Over-broad request: 403 with the denied scopes named.
    let response = server
        .client
        .post(server.url("/a2a/token"))
        .bearer_auth(&api_key)
        .json(&json!({
            "target_client_id": "app_target",
            "scopes": ["orders.read", "orders.delete"]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
    let body: serde_json::Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("orders.delete"));

    // Missing credential: 401 before any A2A logic.
    let response = server
        .client
        .post(server.url("/a2a/token"))
        .json(&json!({ "target_client_id": "app_target" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}
