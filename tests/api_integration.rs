//! Integration tests for the moderation REST API.
//!
//! Each test spins up an Axum server on a random port backed by an
//! in-memory store and drives it over HTTP with reqwest.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use letter_guard::api::{ApiState, api_routes};
use letter_guard::config::{BatchConfig, GateConfig, LearningConfig, ScannerConfig, WorkflowConfig};
use letter_guard::gate::AutoApprovalGate;
use letter_guard::item::{ItemId, LETTER_KIND};
use letter_guard::jobs::{AdminReset, BatchRunner, RESET_CONFIRMATION};
use letter_guard::learning::{CachedPatternProvider, LearningEngine};
use letter_guard::notify::NoopNotifier;
use letter_guard::pipeline::ModerationPipeline;
use letter_guard::refiner::Refiner;
use letter_guard::safety::SafetyScanner;
use letter_guard::store::{Database, LibSqlBackend};
use letter_guard::workflow::Workflow;

const KIND_LETTER: &str = "Dear stranger, I hope this letter finds you on a good day. You matter \
    more than you know, and the people around you are lucky to have you. Keep going, be gentle \
    with yourself, and remember that hard days pass.";

struct Server {
    base: String,
    db: Arc<LibSqlBackend>,
    workflow: Arc<Workflow>,
    http: reqwest::Client,
}

impl Server {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn letter(&self, body: &str) -> ItemId {
        let id = self.db.insert_item(LETTER_KIND, body, None).await.unwrap();
        self.workflow.register_new(id).await.unwrap();
        id
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self.http.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn get(&self, path: &str) -> (u16, Value) {
        let resp = self.http.get(self.url(path)).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }
}

/// Start an Axum server on a random port.
async fn start_server() -> Server {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let workflow = Arc::new(Workflow::new(db.clone(), WorkflowConfig::default()));
    let patterns = Arc::new(CachedPatternProvider::new(db.clone(), Duration::from_secs(60)));
    let learning = Arc::new(LearningEngine::new(
        db.clone(),
        patterns.clone(),
        LearningConfig::default(),
    ));
    workflow.register_observer(learning.clone());
    let gate = AutoApprovalGate::new(
        db.clone(),
        workflow.clone(),
        Arc::new(NoopNotifier),
        db.clone(),
        GateConfig::default(),
    );
    let refiner = Refiner::new(db.clone(), workflow.clone(), patterns.clone());
    let pipeline = Arc::new(ModerationPipeline::new(
        db.clone(),
        workflow.clone(),
        SafetyScanner::new(&ScannerConfig::default()),
        gate,
        refiner,
        "api-test",
    ));
    let runner = Arc::new(BatchRunner::new(
        db.clone(),
        db.clone(),
        db.clone(),
        pipeline.clone(),
        BatchConfig::default(),
    ));
    let reset = Arc::new(AdminReset::new(
        db.clone(),
        db.clone(),
        db.clone(),
        workflow.clone(),
        patterns,
    ));
    let app = api_routes(ApiState {
        db: db.clone(),
        pipeline,
        learning,
        runner,
        reset,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://127.0.0.1:{port}"),
        db,
        workflow,
        http: reqwest::Client::new(),
    }
}

#[tokio::test]
async fn scan_reports_flags() {
    let server = start_server().await;
    let (status, body) = server
        .post(
            "/api/scan",
            json!({"text": "You're worthless and nobody will miss you if you jump off a bridge tonight."}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["pass"], json!(false));
    let flags = body["flags"].as_array().unwrap();
    assert!(flags.contains(&json!("imminent_danger")));
    assert!(flags.contains(&json!("encouragement_of_harm")));

    let (_, body) = server.post("/api/scan", json!({"text": KIND_LETTER})).await;
    assert_eq!(body["pass"], json!(true));
}

#[tokio::test]
async fn stage_read_and_override() {
    let server = start_server().await;
    let id = server.letter(KIND_LETTER).await;

    let (status, body) = server.get(&format!("/api/items/{id}/stage")).await;
    assert_eq!(status, 200);
    assert_eq!(body["stage"], json!("unprocessed"));

    let resp = server
        .http
        .put(server.url(&format!("/api/items/{id}/stage")))
        .json(&json!({"stage": "archived", "note": "duplicate", "actor": "mod"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["changed"], json!(true));

    let (_, body) = server.get(&format!("/api/items/{id}/stage")).await;
    assert_eq!(body["stage"], json!("archived"));
    let audit = body["audit"].as_array().unwrap();
    assert!(audit.iter().any(|e| e["note"] == json!("duplicate")));

    let (status, body) = server.get("/api/items/9999/stage").await;
    assert_eq!(status, 404);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn process_refine_and_revert() {
    let server = start_server().await;
    let id = server.letter(KIND_LETTER).await;

    let (status, body) = server.post(&format!("/api/items/{id}/process"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["stage"], json!("published"));
    assert_eq!(body["decision"]["safe"], json!(true));

    // Processing wrapped the body in paragraphs; revert restores the submission.
    let (_, body) = server.post(&format!("/api/items/{id}/revert"), json!({})).await;
    assert_eq!(body["reverted"], json!(true));
    assert_eq!(
        server.db.get_item(id).await.unwrap().unwrap().body,
        KIND_LETTER
    );

    let (_, body) = server
        .post(&format!("/api/items/{id}/refine"), json!({"force": false}))
        .await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["message"], json!("Refined"));
    let (_, body) = server.get(&format!("/api/items/{id}/stage")).await;
    assert_eq!(body["stage"], json!("published"));

    let (status, _) = server.post("/api/items/4242/revert", json!({})).await;
    assert_eq!(status, 404);
}

#[tokio::test]
async fn evaluate_uses_stored_body_or_given_text() {
    let server = start_server().await;
    let id = server.letter(KIND_LETTER).await;

    let (status, body) = server.post(&format!("/api/items/{id}/evaluate"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["safe"], json!(true));
    assert_eq!(body["score"], json!(100));

    let (_, body) = server
        .post(
            &format!("/api/items/{id}/evaluate"),
            json!({"text": "CLICK HERE FOR FREE MONEY"}),
        )
        .await;
    assert_eq!(body["safe"], json!(false));
}

#[tokio::test]
async fn learn_and_list_patterns() {
    let server = start_server().await;
    let id = server.letter(KIND_LETTER).await;

    let (status, body) = server
        .post(
            &format!("/api/items/{id}/learn"),
            json!({"before": "<p>I love my Iphone.</p>", "after": "<p>I love my iPhone.</p>"}),
        )
        .await;
    assert_eq!(status, 200);
    assert!(!body["observations"].as_array().unwrap().is_empty());

    let (status, body) = server.get("/api/patterns/proper_noun").await;
    assert_eq!(status, 200);
    assert_eq!(body, json!(["iPhone"]));

    let (_, body) = server.get("/api/patterns").await;
    let stats = body.as_array().unwrap();
    assert!(stats.iter().all(|p| p["confidence"].is_number()));

    let (status, _) = server.get("/api/patterns/made_up").await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn bulk_jobs_validate_input() {
    let server = start_server().await;
    let id = server.letter(KIND_LETTER).await;

    let (status, body) = server
        .post("/api/bulk", json!({"type": "rescan", "item_ids": [id]}))
        .await;
    assert_eq!(status, 202);
    assert!(body["token"].is_string());

    let (status, _) = server
        .post(
            "/api/bulk",
            json!({"type": "action", "action": "archive", "item_ids": []}),
        )
        .await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn nuclear_reset_requires_confirmation() {
    let server = start_server().await;

    let (status, _) = server
        .post("/api/admin/reset", json!({"actor": "root", "confirmation": "yes"}))
        .await;
    assert_eq!(status, 403);

    let (status, body) = server
        .post(
            "/api/admin/reset",
            json!({"actor": "root", "confirmation": RESET_CONFIRMATION}),
        )
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["patterns_cleared"], json!(0));

    let (_, log) = server.get("/api/admin/reset").await;
    assert_eq!(log.as_array().unwrap().len(), 1);
}
