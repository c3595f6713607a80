//! End-to-end tests of the review endpoint, driven through the router without TLS.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use assert_json_diff::assert_json_include;
use axum::{
    body::{to_bytes, Body},
    http::{header::CONTENT_TYPE, Method, Request, StatusCode},
    Router,
};
use mcluster_core::{
    policy::{rule_fn, Verdict},
    PolicyConfig, PolicyEngine,
};
use mcluster_webhook::{handler::AppState, server::router};
use serde_json::{json, Value};
use tower::ServiceExt;

const UID: &str = "705ab4f5-6393-11e8-b7cc-42010a800002";

fn app(engine: PolicyEngine) -> Router {
    router(AppState::new(engine, Duration::from_secs(10)))
}

fn default_app() -> Router {
    app(PolicyEngine::from_config(&PolicyConfig::default()))
}

fn review(api_version: &str, uid: &str, operation: &str, object: Value, old_object: Value) -> Value {
    json!({
        "apiVersion": api_version,
        "kind": "AdmissionReview",
        "request": {
            "uid": uid,
            "kind": {"group": "mcluster.io", "version": "v1alpha1", "kind": "MCluster"},
            "resource": {"group": "mcluster.io", "version": "v1alpha1", "resource": "mclusters"},
            "name": "east",
            "namespace": "infra",
            "operation": operation,
            "userInfo": {"username": "system:admin", "groups": ["system:masters"]},
            "object": object,
            "oldObject": old_object,
            "dryRun": false,
        }
    })
}

fn cluster() -> Value {
    json!({
        "apiVersion": "mcluster.io/v1alpha1",
        "kind": "MCluster",
        "metadata": {"name": "east", "namespace": "infra"},
        "spec": {"replicas": 3, "version": "1.31"}
    })
}

async fn send(app: Router, body: impl Into<Body>) -> (StatusCode, Value) {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/validate-mcluster")
        .header(CONTENT_TYPE, "application/json")
        .body(body.into())
        .unwrap();
    let res = app.oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn send_json(app: Router, review: &Value) -> (StatusCode, Value) {
    send(app, serde_json::to_vec(review).unwrap()).await
}

#[tokio::test]
async fn allows_a_valid_create() {
    let (status, body) = send_json(
        default_app(),
        &review("admission.k8s.io/v1", UID, "CREATE", cluster(), Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "response": {"uid": UID, "allowed": true}
        })
    );
}

#[tokio::test]
async fn denies_a_create_without_spec() {
    let mut object = cluster();
    object.as_object_mut().unwrap().remove("spec");
    let (status, body) = send_json(
        default_app(),
        &review("admission.k8s.io/v1", UID, "CREATE", object, Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body.clone(),
        expected: json!({
            "response": {
                "uid": UID,
                "allowed": false,
                "status": {
                    "status": "Failure",
                    "code": 403,
                    "reason": "Forbidden",
                    "message": "missing required field spec",
                    "details": {
                        "name": "east",
                        "group": "mcluster.io",
                        "kind": "MCluster",
                        "causes": [{"reason": "required-fields"}]
                    }
                }
            }
        })
    );
    assert!(body.get("request").is_none());
}

#[tokio::test]
async fn allows_an_unprotected_delete() {
    let (status, body) = send_json(
        default_app(),
        &review("admission.k8s.io/v1", UID, "DELETE", Value::Null, cluster()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"]["allowed"], json!(true));
}

#[tokio::test]
async fn denies_a_protected_delete() {
    let mut old = cluster();
    old["metadata"]["annotations"] = json!({"mcluster.io/deletion-protection": "true"});
    let (status, body) = send_json(
        default_app(),
        &review("admission.k8s.io/v1", UID, "DELETE", Value::Null, old),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["response"]["allowed"], json!(false));
    let message = body["response"]["status"]["message"].as_str().unwrap();
    assert!(message.contains("protected from deletion"), "{message}");
}

#[tokio::test]
async fn echoes_the_request_version() {
    let (status, body) = send_json(
        default_app(),
        &review("admission.k8s.io/v1beta1", UID, "CREATE", cluster(), Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["apiVersion"], json!("admission.k8s.io/v1beta1"));
    assert_eq!(body["response"]["uid"], json!(UID));
}

#[tokio::test]
async fn malformed_bodies_are_rejected_without_evaluation() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let engine = PolicyEngine::new().with_rule(rule_fn("count", move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        Ok(Verdict::Allow)
    }));

    for body in [
        b"{not json".to_vec(),
        Vec::new(),
        serde_json::to_vec(&json!({"apiVersion": "admission.k8s.io/v1", "kind": "AdmissionReview"})).unwrap(),
        serde_json::to_vec(&review("admission.k8s.io/v2", UID, "CREATE", cluster(), Value::Null)).unwrap(),
        serde_json::to_vec(&json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "ConfigMap",
            "request": review("admission.k8s.io/v1", UID, "CREATE", cluster(), Value::Null)["request"]
        }))
        .unwrap(),
    ] {
        let (status, body) = send(app(engine.clone()), body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_json_include!(
            actual: body,
            expected: json!({
                "apiVersion": "admission.k8s.io/v1",
                "kind": "AdmissionReview",
                "response": {"uid": "", "allowed": false, "status": {"code": 400}}
            })
        );
    }
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn large_updates_get_a_verdict() {
    let mut object = cluster();
    object["spec"]["topology"] = json!("x".repeat(1_500_000));
    let review = review("admission.k8s.io/v1", UID, "UPDATE", object.clone(), object);
    let body = serde_json::to_vec(&review).unwrap();
    assert!(body.len() > 2 * 1024 * 1024);

    let (status, body) = send(default_app(), body).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(actual: body, expected: json!({"response": {"uid": UID, "allowed": true}}));
}

#[tokio::test]
async fn body_limit_is_configurable() {
    let state = AppState::new(PolicyEngine::new(), Duration::from_secs(10)).with_max_body_bytes(1024);
    let mut object = cluster();
    object["spec"]["topology"] = json!("x".repeat(4096));
    let body = serde_json::to_vec(&review("admission.k8s.io/v1", UID, "CREATE", object, Value::Null)).unwrap();
    let req = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap();
    let res = router(state).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn rejects_other_content_types_and_methods() {
    let req = Request::builder()
        .method(Method::POST)
        .uri("/")
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from("hello"))
        .unwrap();
    let res = default_app().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    let req = Request::builder().method(Method::GET).uri("/").body(Body::empty()).unwrap();
    let res = default_app().oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn slow_reviews_are_denied_with_a_timeout() {
    let engine = PolicyEngine::new().with_rule(rule_fn("slow", |_| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(Verdict::Allow)
    }));
    let app = router(AppState::new(engine, Duration::from_millis(50)));
    let (status, body) = send_json(
        app,
        &review("admission.k8s.io/v1", UID, "CREATE", cluster(), Value::Null),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body.clone(),
        expected: json!({
            "response": {"uid": UID, "allowed": false, "status": {"code": 504, "reason": "Timeout"}}
        })
    );
    let message = body["response"]["status"]["message"].as_str().unwrap();
    assert!(message.starts_with("admission review timed out"), "{message}");
}

#[tokio::test]
async fn stuck_rules_keep_their_evaluation_slot() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let engine = PolicyEngine::new().with_rule(rule_fn("stuck", move |_| {
        counted.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(Duration::from_secs(1));
        Ok(Verdict::Allow)
    }));
    let app = router(AppState::new(engine, Duration::from_millis(50)).with_max_concurrent_reviews(1));

    for _ in 0..3 {
        let (status, body) = send_json(
            app.clone(),
            &review("admission.k8s.io/v1", UID, "CREATE", cluster(), Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["status"]["code"], json!(504));
    }
    // later reviews time out waiting for the slot instead of starting another thread
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn panicking_rules_deny_without_taking_the_server_down() {
    let engine = PolicyEngine::new().with_rule(rule_fn("explodes", |_| panic!("boom")));
    let app = app(engine);

    for _ in 0..2 {
        let (status, body) = send_json(
            app.clone(),
            &review("admission.k8s.io/v1", UID, "CREATE", cluster(), Value::Null),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["response"]["allowed"], json!(false));
    }
}

#[tokio::test]
async fn repeated_reviews_get_identical_answers() {
    let mut object = cluster();
    object["metadata"]["name"] = json!("East_1");
    let review = review("admission.k8s.io/v1", UID, "CREATE", object, Value::Null);

    let first = send_json(default_app(), &review).await;
    let second = send_json(default_app(), &review).await;
    assert_eq!(first, second);
    assert_eq!(first.1["response"]["allowed"], json!(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reviews_keep_their_own_uid() {
    let app = default_app();
    let mut tasks = Vec::new();
    for i in 0..32 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            let uid = format!("uid-{i}");
            let mut object = cluster();
            let allowed = i % 2 == 0;
            if !allowed {
                object.as_object_mut().unwrap().remove("spec");
            }
            let (status, body) = send_json(
                app,
                &review("admission.k8s.io/v1", &uid, "CREATE", object, Value::Null),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["response"]["uid"], json!(uid));
            assert_eq!(body["response"]["allowed"], json!(allowed));
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}
