//! Admin API against a live registry and reseed controller.


use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use harness::Harness;
use seedkeeper_scheduler::admin::{create_router, AdminState};
use tokio::sync::watch;
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    create_router(AdminState::new(
        "itest",
        h.registry.clone(),
        h.reseed.clone(),
        h.launcher.state(),
    ))
}

async fn send(router: Router, method: Method, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz() {
    let h = Harness::new(3, Duration::from_millis(10), true).await;
    let (status, json) = send(router(&h), Method::GET, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["cluster"], "itest");

    h.shutdown().await;
}

#[tokio::test]
async fn test_members_lists_running_members() {
    let mut h = Harness::new(3, Duration::from_millis(10), true).await;
    let members = h.bring_up(&["h1", "h2"]).await;

    let (status, json) = send(router(&h), Method::GET, "/v1/members").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["generation"], 1);

    let listed = json["members"].as_array().unwrap();
    assert_eq!(listed.len(), 2);
    for member in listed {
        assert_eq!(member["state"], "running");
    }
    let ids: Vec<String> = listed
        .iter()
        .map(|m| m["id"].as_str().unwrap().to_string())
        .collect();
    assert!(ids.contains(&members[0].to_string()));

    h.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_registry_and_launcher() {
    let mut h = Harness::new(3, Duration::from_millis(10), true).await;
    h.bring_up(&["h1"]).await;

    let (status, json) = send(router(&h), Method::GET, "/v1/status").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["cluster"], "itest");
    assert_eq!(json["launcher"], "idle");
    assert_eq!(json["registry"]["generation"], 1);
    assert_eq!(json["controller"]["phase"], "degraded");
    assert_eq!(json["controller"]["quorum"], 2);

    h.shutdown().await;
}

#[tokio::test]
async fn test_reseed_is_accepted_and_carried_out() {
    let mut h = Harness::new(3, Duration::from_millis(10), true).await;
    let members = h.bring_up(&["h1", "h2"]).await;
    let app = router(&h);

    let Harness {
        registry,
        driver,
        controller,
        ..
    } = h;
    let (shutdown, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(controller.run(shutdown_rx));

    let (status, json) = send(app, Method::POST, "/v1/reseed").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "accepted");

    let mut generation = registry.subscribe_generation();
    tokio::time::timeout(Duration::from_secs(5), generation.wait_for(|g| *g == 2))
        .await
        .unwrap()
        .unwrap();
    for id in &members {
        assert!(driver
            .kills()
            .iter()
            .any(|task| task.member_id() == *id && task.generation() == 1));
    }

    let _ = shutdown.send(true);
    worker.await.unwrap();
}

#[tokio::test]
async fn test_reseed_without_controller_is_unavailable() {
    let h = Harness::new(3, Duration::from_millis(10), true).await;
    let app = router(&h);

    let Harness { controller, .. } = h;
    drop(controller);

    let (status, json) = send(app, Method::POST, "/v1/reseed").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["code"], "controller_unavailable");
}
