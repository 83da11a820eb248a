//! E2E tests for health check, metrics and basic server functionality

mod common;

use common::TestServer;

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn test_404_for_unknown_routes() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/unknown/route"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_metrics_exposes_federation_instruments() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body = response.text().await.unwrap();
    assert!(body.contains("tidepool_delivery_queue_depth"));
}

#[tokio::test]
async fn test_admin_user_created_on_start() {
    let server = TestServer::new().await;

    assert_eq!(server.admin.username, "admin");
    assert_eq!(server.admin.url, "https://local.test/u/admin");
    assert!(server.admin.public_key_pem.contains("PUBLIC KEY"));
}
