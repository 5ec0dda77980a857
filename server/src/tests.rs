use super::*;
use axum::{
    body::{to_bytes, Body},
    http::Request,
};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tower::ServiceExt;

const TEMPLATES: &str = r#"
rng_seed: 3
templates:
  basic:
    prizes:
      - { id: a, label: A, weight: 1 }
      - { id: b, label: B, weight: 2 }
      - { id: c, label: C, weight: 3 }
"#;

async fn service_from(yaml: &str) -> Arc<Service> {
    let config = Config::from_yaml(yaml).unwrap().validate().unwrap();
    Arc::new(Service::build(config).await.unwrap())
}

async fn app() -> (Router, Arc<Service>) {
    let service = service_from(TEMPLATES).await;
    (Api::new(service.clone()).router(), service)
}

async fn send(router: &Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();
    router.clone().oneshot(request).await.unwrap()
}

async fn call(
    router: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let response = send(router, method, uri, body).await;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_spin_and_claim() {
    let (router, service) = app().await;
    let mut updates = service.update_subscriber();

    let (status, spin) = call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "sessionId": "s1", "playerId": "p1", "template": "basic" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(spin["entryId"], 1);
    assert_eq!(spin["replayed"], false);
    assert_eq!(spin["budget"]["spinsUsed"], 1);
    assert_eq!(spin["outcome"]["spinIndex"], 1);
    assert_eq!(updates.try_recv().unwrap().id, 1);

    let claim = json!({ "entryId": 1, "sessionId": "s1" });
    let (status, claimed) = call(&router, Method::POST, "/claim", Some(claim.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claimed["type"], "spin");
    assert!(claimed["claimedAt"].is_u64());
    let update = updates.try_recv().unwrap();
    assert_eq!(update.outcome_ref, Some(1));

    let (status, body) = call(&router, Method::POST, "/claim", Some(claim)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], ERROR_ALREADY_CLAIMED);

    let (status, history) = call(&router, Method::GET, "/history?sessionId=s1", None).await;
    assert_eq!(status, StatusCode::OK);
    let history = history.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["type"], "claim");
    assert_eq!(history[1]["id"], 1);

    let (_, history) = call(&router, Method::GET, "/history?sessionId=s2", None).await;
    assert!(history.as_array().unwrap().is_empty());

    let (status, stats) = call(&router, Method::GET, "/stats?template=basic", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["totalSpins"], 1);
    assert_eq!(stats["totalClaims"], 1);
    assert_eq!(stats["activeSessions"], 1);
}

#[tokio::test]
async fn test_limits_and_grants() {
    let (router, _) = app().await;
    let (status, budget) = call(
        &router,
        Method::PUT,
        "/players/p1/limit",
        Some(json!({ "maxSpins": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(budget["maxSpins"], 1);

    let spin = json!({ "sessionId": "s1", "playerId": "p1", "template": "basic" });
    let (status, _) = call(&router, Method::POST, "/spin", Some(spin.clone())).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = call(&router, Method::POST, "/spin", Some(spin.clone())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"], ERROR_NO_SPINS_REMAINING);

    let (status, budget) = call(
        &router,
        Method::POST,
        "/players/p1/grant",
        Some(json!({ "additional": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(budget["maxSpins"], 3);

    let (_, budget) = call(&router, Method::GET, "/players/p1/limit", None).await;
    assert_eq!(budget["spinsUsed"], 1);
    assert_eq!(budget["maxSpins"], 3);
    let (status, _) = call(&router, Method::POST, "/spin", Some(spin)).await;
    assert_eq!(status, StatusCode::OK);

    // Players nobody configured are unlimited.
    let (_, budget) = call(&router, Method::GET, "/players/p9/limit", None).await;
    assert_eq!(budget["maxSpins"], Value::Null);
    assert_eq!(budget["spinsUsed"], 0);
}

#[tokio::test]
async fn test_request_id_replays() {
    let (router, service) = app().await;
    let mut updates = service.update_subscriber();
    let spin = json!({
        "sessionId": "s1",
        "playerId": "p1",
        "template": "basic",
        "requestId": "r1",
    });

    let (_, first) = call(&router, Method::POST, "/spin", Some(spin.clone())).await;
    let (status, second) = call(&router, Method::POST, "/spin", Some(spin)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["replayed"], true);
    assert_eq!(second["entryId"], first["entryId"]);
    assert_eq!(second["outcome"], first["outcome"]);
    assert_eq!(second["budget"]["spinsUsed"], 1);

    // Only the first spin is published.
    assert!(updates.try_recv().is_ok());
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));

    // The same id from another session is refused, not replayed.
    let other = json!({
        "sessionId": "s2",
        "playerId": "p1",
        "template": "basic",
        "requestId": "r1",
    });
    let (status, body) = call(&router, Method::POST, "/spin", Some(other)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], ERROR_INVALID_REQUEST);
    assert!(body.get("outcome").is_none());
    assert!(matches!(updates.try_recv(), Err(TryRecvError::Empty)));
}

#[tokio::test]
async fn test_templates() {
    let (router, _) = app().await;
    let (status, ids) = call(&router, Method::GET, "/templates", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids, json!(["basic"]));

    let promo = json!({
        "prizes": [
            { "id": "x", "label": "X", "weight": 1 },
            { "id": "y", "label": "Y", "weight": 3 },
        ],
        "guaranteedPrizeId": "y",
        "guaranteedEnabled": true,
        "cycleLength": 50,
    });
    let (status, stored) = call(&router, Method::PUT, "/templates/promo", Some(promo)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["cycleLength"], 2);
    assert_eq!(stored["excludeGuaranteedFromFree"], true);

    let (status, fetched) = call(&router, Method::GET, "/templates/promo", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched, stored);

    let (status, probabilities) =
        call(&router, Method::GET, "/templates/promo/probabilities", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(probabilities[0]["prize"]["id"], "x");
    assert_eq!(probabilities[0]["percent"], 25.0);
    assert_eq!(probabilities[1]["fraction"], 0.75);

    let bad = json!({ "prizes": [{ "id": "x", "label": "X", "weight": 0 }] });
    let (status, body) = call(&router, Method::PUT, "/templates/bad", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], ERROR_INVALID_CONFIG);

    let (status, body) = call(&router, Method::GET, "/templates/bad", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], ERROR_UNKNOWN_TEMPLATE);
    let (status, _) = call(&router, Method::GET, "/templates/bad/probabilities", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, ids) = call(&router, Method::GET, "/templates", None).await;
    assert_eq!(ids, json!(["basic", "promo"]));
}

#[tokio::test]
async fn test_exclusion_override_holds_for_runtime_templates() {
    let service = service_from(&format!("{TEMPLATES}exclude_guaranteed_from_free: false\n")).await;
    let router = Api::new(service).router();

    let (_, basic) = call(&router, Method::GET, "/templates/basic", None).await;
    assert_eq!(basic["excludeGuaranteedFromFree"], false);

    let promo = json!({
        "prizes": [
            { "id": "x", "label": "X", "weight": 1 },
            { "id": "y", "label": "Y", "weight": 3 },
        ],
        "guaranteedPrizeId": "y",
        "guaranteedEnabled": true,
        "excludeGuaranteedFromFree": true,
    });
    let (status, stored) = call(&router, Method::PUT, "/templates/promo", Some(promo)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["excludeGuaranteedFromFree"], false);

    let (_, fetched) = call(&router, Method::GET, "/templates/promo", None).await;
    assert_eq!(fetched["excludeGuaranteedFromFree"], false);
}

#[tokio::test]
async fn test_spin_errors() {
    let (router, _) = app().await;

    let (status, body) = call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "sessionId": "s1", "template": "missing" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], ERROR_UNKNOWN_TEMPLATE);

    let (status, body) = call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "sessionId": " ", "template": "basic" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], ERROR_INVALID_REQUEST);

    let (status, body) = call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "template": "basic" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], ERROR_INVALID_REQUEST);

    call(
        &router,
        Method::PUT,
        "/templates/empty",
        Some(json!({ "prizes": [] })),
    )
    .await;
    let (status, body) = call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "sessionId": "s1", "playerId": "p1", "template": "empty" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], ERROR_EMPTY_POOL);
    let (_, budget) = call(&router, Method::GET, "/players/p1/limit", None).await;
    assert_eq!(budget["spinsUsed"], 0);
}

#[tokio::test]
async fn test_claim_errors() {
    let (router, _) = app().await;
    let (status, body) = call(
        &router,
        Method::POST,
        "/claim",
        Some(json!({ "entryId": 7, "sessionId": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], ERROR_NOT_FOUND);

    call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "sessionId": "s1", "template": "basic" })),
    )
    .await;
    call(
        &router,
        Method::POST,
        "/claim",
        Some(json!({ "entryId": 1, "sessionId": "s1" })),
    )
    .await;
    let (status, body) = call(
        &router,
        Method::POST,
        "/claim",
        Some(json!({ "entryId": 2, "sessionId": "s1" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], ERROR_INVALID_REQUEST);
}

#[tokio::test]
async fn test_malformed_body() {
    let (router, _) = app().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/spin")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.error, ERROR_INVALID_REQUEST);
}

#[tokio::test]
async fn test_health_and_metrics() {
    let (router, _) = app().await;
    let (status, health) = call(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        health,
        json!({ "status": "ok", "degraded": false, "backend": "memory" })
    );

    call(
        &router,
        Method::POST,
        "/spin",
        Some(json!({ "sessionId": "s1", "template": "basic" })),
    )
    .await;
    let response = send(&router, Method::GET, "/metrics", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("wheelspin_spins_total 1"));
    assert!(text.contains("wheelspin_degraded 0"));
}

#[tokio::test]
async fn test_unavailable_hides_details() {
    let error = ApiError::from(SpinError::Unavailable(StoreError::Timeout(
        Duration::from_secs(2),
    )));
    let response = error.into_response();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body.error, ERROR_UNAVAILABLE);
    assert_eq!(body.message, "temporarily unavailable, try again");

    let status = ApiError::from(StoreError::Unavailable("disk full".to_string()))
        .into_response()
        .status();
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_journal_survives_restart() {
    let dir = std::env::temp_dir().join(format!("wheelspin-{}", uuid::Uuid::new_v4()));
    let yaml = format!(
        "journal: {}\n{TEMPLATES}",
        dir.join("journal.jsonl").display()
    );

    let service = service_from(&yaml).await;
    assert_eq!(service.engine().health().backend, "journal");
    service
        .engine()
        .set_limit("p1", Some(2), None)
        .await
        .unwrap();
    let receipt = service
        .engine()
        .spin(SpinRequest::new("s1", "basic").with_player("p1"))
        .await
        .unwrap();
    drop(service);

    let service = service_from(&yaml).await;
    let history = service
        .engine()
        .history(&HistoryFilter::default())
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, receipt.entry.id);
    assert_eq!(history[0].outcome.prize, receipt.entry.outcome.prize);
    let budget = service.engine().status("p1", None).await.unwrap();
    assert_eq!((budget.max_spins, budget.spins_used), (Some(2), 1));

    let _ = std::fs::remove_dir_all(dir);
}

#[tokio::test]
async fn test_rate_limited_router_builds() {
    let service = service_from(TEMPLATES).await;
    let _router = Api::new(service).with_rate_limit(10, 20).router();
}
