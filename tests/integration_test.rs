// Integration tests for restauth
//
// These tests drive the public API end to end: credential resolution,
// token exchange against a mock identity server, header stamping, and
// response classification over a real HTTP transport.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use mockito::{Matcher, Server};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use restauth::auth::{authenticator_from_credentials, ApiKeyExchange, CredentialMap};
use restauth::{Authenticator, CredentialStrategy, RestClient, RestError, RestRequest};

// ==================================================================================================
// Test Helpers
// ==================================================================================================

const IAM_RESPONSE: &str = r#"{
    "access_token": "iam-access-token",
    "refresh_token": "iam-refresh-token",
    "token_type": "Bearer",
    "expires_in": 3600
}"#;

#[derive(Debug, Deserialize, PartialEq)]
struct Workspace {
    id: String,
    name: String,
}

fn api_key_authenticator(server: &Server) -> Authenticator {
    Authenticator::new(CredentialStrategy::ApiKeyExchange(
        ApiKeyExchange::new("test-apikey").with_url(format!("{}/identity/token", server.url())),
    ))
}

fn client_for(authenticator: Authenticator) -> RestClient {
    RestClient::new(Arc::new(authenticator)).expect("Failed to create REST client")
}

/// Unsigned JWT whose `exp` is an hour from now
fn jwt_expiring_in_an_hour() -> String {
    let exp = chrono::Utc::now().timestamp() + 3600;
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"admin","exp":{}}}"#, exp));
    format!("eyJhbGciOiJub25lIn0.{}.signature", payload)
}

// ==================================================================================================
// Token Exchange
// ==================================================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_share_one_token_exchange() {
    let mut server = Server::new_async().await;
    let token_mock = server
        .mock("POST", "/identity/token")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded(
                "grant_type".into(),
                "urn:ibm:params:oauth:grant-type:apikey".into(),
            ),
            Matcher::UrlEncoded("apikey".into(), "test-apikey".into()),
        ]))
        .with_status(200)
        .with_body(IAM_RESPONSE)
        .expect(1)
        .create_async()
        .await;
    let api_mock = server
        .mock("GET", "/v1/workspaces/ws-1")
        .match_header("authorization", "Bearer iam-access-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"ws-1","name":"Primary"}"#)
        .expect(16)
        .create_async()
        .await;

    let client = Arc::new(client_for(api_key_authenticator(&server)));
    let url = format!("{}/v1/workspaces/ws-1", server.url());

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let client = client.clone();
            let url = url.clone();
            tokio::spawn(async move { client.response_object::<Workspace>(RestRequest::get(url)).await })
        })
        .collect();

    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(
            response.result,
            Workspace {
                id: "ws-1".to_string(),
                name: "Primary".to_string()
            }
        );
    }

    token_mock.assert_async().await;
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_failed_exchange_never_reaches_service() {
    let mut server = Server::new_async().await;
    let token_mock = server
        .mock("POST", "/identity/token")
        .with_status(400)
        .with_body(r#"{"errorCode":"BXNIM0415E","errorMessage":"Provided API key could not be found"}"#)
        .expect(2)
        .create_async()
        .await;
    let api_mock = server
        .mock("GET", "/v1/workspaces")
        .expect(0)
        .create_async()
        .await;

    let client = client_for(api_key_authenticator(&server));
    let url = format!("{}/v1/workspaces", server.url());

    // Failures are not cached, so each call tries the exchange again
    for _ in 0..2 {
        let err = client
            .response_void(RestRequest::get(url.clone()))
            .await
            .unwrap_err();
        assert!(err.is_auth_failure(), "unexpected error: {:?}", err);
        assert!(err.to_string().contains("400"));
    }

    token_mock.assert_async().await;
    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_password_exchange_end_to_end() {
    let mut server = Server::new_async().await;
    let jwt = jwt_expiring_in_an_hour();

    let login_mock = server
        .mock("GET", "/v1/preauth/validateAuth")
        // base64("admin:secret")
        .match_header("authorization", "Basic YWRtaW46c2VjcmV0")
        .with_status(200)
        .with_body(format!(r#"{{"accessToken":"{}","message":"success"}}"#, jwt))
        .expect(1)
        .create_async()
        .await;
    let api_mock = server
        .mock("GET", "/v1/projects")
        .match_header("authorization", format!("Bearer {}", jwt).as_str())
        .with_status(200)
        .with_body("[]")
        .expect(2)
        .create_async()
        .await;

    let client = client_for(Authenticator::password("admin", "secret", server.url()));
    let url = format!("{}/v1/projects", server.url());

    for _ in 0..2 {
        let response = client.response_string(RestRequest::get(url.clone())).await.unwrap();
        assert_eq!(response.result, "[]");
    }

    login_mock.assert_async().await;
    api_mock.assert_async().await;
}

// ==================================================================================================
// Static Strategies
// ==================================================================================================

#[tokio::test]
async fn test_basic_auth_end_to_end() {
    let mut server = Server::new_async().await;
    let api_mock = server
        .mock("POST", "/v1/messages")
        // base64("user:pass")
        .match_header("authorization", "Basic dXNlcjpwYXNz")
        .match_header("content-type", "application/json")
        .match_query(Matcher::UrlEncoded("version".into(), "2024-01-01".into()))
        .match_body(Matcher::JsonString(r#"{"text":"hello"}"#.to_string()))
        .with_status(201)
        .with_body(r#"{"id":"m-1","name":"hello"}"#)
        .create_async()
        .await;

    let client = client_for(Authenticator::basic("user", "pass"));
    let request = RestRequest::post(format!("{}/v1/messages", server.url()))
        .query("version", "2024-01-01")
        .json(&serde_json::json!({"text": "hello"}))
        .unwrap();

    let response = client.response_object::<Workspace>(request).await.unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.result.id, "m-1");

    api_mock.assert_async().await;
}

#[tokio::test]
async fn test_bearer_and_no_auth_end_to_end() {
    let mut server = Server::new_async().await;
    let bearer_mock = server
        .mock("GET", "/secure")
        .match_header("authorization", "Bearer static-token")
        .with_status(200)
        .create_async()
        .await;
    let open_mock = server
        .mock("GET", "/open")
        .match_header("authorization", Matcher::Missing)
        .with_status(200)
        .create_async()
        .await;

    let bearer = client_for(Authenticator::bearer("static-token"));
    bearer
        .response_void(RestRequest::get(format!("{}/secure", server.url())))
        .await
        .unwrap();

    let open = client_for(Authenticator::no_auth());
    open.response_void(RestRequest::get(format!("{}/open", server.url())))
        .await
        .unwrap();

    bearer_mock.assert_async().await;
    open_mock.assert_async().await;
}

// ==================================================================================================
// Response Classification
// ==================================================================================================

#[tokio::test]
async fn test_status_classification() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/v1/items/1")
        .with_status(204)
        .create_async()
        .await;
    server
        .mock("GET", "/v1/items/2")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"Item not found","code":404}"#)
        .create_async()
        .await;
    server
        .mock("GET", "/v1/items/3")
        .with_status(502)
        .create_async()
        .await;

    let client = client_for(Authenticator::bearer("t"));

    let deleted = client
        .response_data(RestRequest::new(
            reqwest::Method::DELETE,
            format!("{}/v1/items/1", server.url()),
        ))
        .await
        .unwrap();
    assert_eq!(deleted.status, 204);
    assert!(deleted.result.is_empty());

    match client
        .response_data(RestRequest::get(format!("{}/v1/items/2", server.url())))
        .await
    {
        Err(RestError::Http {
            status,
            message,
            metadata,
            headers,
        }) => {
            assert_eq!(status, 404);
            assert_eq!(message, "Item not found");
            assert_eq!(metadata.unwrap()["code"], 404);
            assert_eq!(headers["content-type"], "application/json");
        }
        other => panic!("expected HTTP 404, got {:?}", other),
    }

    let err = client
        .response_data(RestRequest::get(format!("{}/v1/items/3", server.url())))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "HTTP 502: Bad Gateway");
}

#[tokio::test]
async fn test_unreachable_service_is_no_response() {
    let client = client_for(Authenticator::bearer("t"));
    let err = client
        .response_void(RestRequest::get("http://127.0.0.1:1/v1/items"))
        .await
        .unwrap_err();

    assert!(matches!(err, RestError::NoResponse(_)));
    assert_eq!(err.status_code(), None);
}

// ==================================================================================================
// Credential Resolution
// ==================================================================================================

#[tokio::test]
async fn test_authenticator_from_credential_map() {
    let mut server = Server::new_async().await;
    let token_mock = server
        .mock("POST", "/identity/token")
        // base64("bx:bx")
        .match_header("authorization", "Basic Yng6Yng=")
        .with_status(200)
        .with_body(IAM_RESPONSE)
        .create_async()
        .await;

    let credentials: CredentialMap = BTreeMap::from([
        ("apikey".to_string(), "test-apikey".to_string()),
        ("auth_url".to_string(), format!("{}/identity/token", server.url())),
        ("client_id".to_string(), "bx".to_string()),
        ("client_secret".to_string(), "bx".to_string()),
    ]);

    let authenticator = authenticator_from_credentials(&credentials).unwrap();
    assert!(authenticator.strategy().is_dynamic());

    let header = authenticator.authorization_header().await.unwrap();
    assert_eq!(header.as_deref(), Some("Bearer iam-access-token"));

    token_mock.assert_async().await;
}
