//! E2E tests for .well-known endpoints

mod common;

use common::TestServer;
use serde_json::Value;

#[tokio::test]
async fn test_webfinger_describes_local_user() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=acct:admin@local.test"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/jrd+json"
    );
    let json: Value = response.json().await.unwrap();
    assert_eq!(json["subject"], "acct:admin@local.test");
    assert_eq!(json["links"][0]["rel"], "self");
    assert_eq!(json["links"][0]["type"], "application/activity+json");
    assert_eq!(json["links"][0]["href"], "https://local.test/u/admin");
}

#[tokio::test]
async fn test_webfinger_rejects_other_domains_and_users() {
    let server = TestServer::new().await;

    for resource in ["acct:admin@elsewhere.test", "acct:nobody@local.test"] {
        let response = server
            .client
            .get(server.url(&format!("/.well-known/webfinger?resource={resource}")))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404, "{resource}");
    }

    let response = server
        .client
        .get(server.url("/.well-known/webfinger?resource=admin"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_host_meta_points_at_webfinger() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/.well-known/host-meta"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("https://local.test/.well-known/webfinger?resource={uri}"));
}
