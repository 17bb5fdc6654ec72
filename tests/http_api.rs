mod common;

use common::{harness, settings, spawn_server};
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;

#[tokio::test]
async fn health_reports_service() {
    let h = harness(settings(Duration::from_secs(30)));
    let addr = spawn_server(h.state).await;

    let body: Value = reqwest::get(format!("http://{}/api/health", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "cli-quest-api");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn catalog_never_exposes_flags() {
    let h = harness(settings(Duration::from_secs(30)));
    let addr = spawn_server(h.state).await;
    let client = reqwest::Client::new();

    let list = client
        .get(format!("http://{}/api/challenges", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    let challenges: Vec<Value> = serde_json::from_str(&list).unwrap();
    assert_eq!(challenges.len(), 2);
    assert!(!list.contains("CLI_QUEST_"));

    for id in ["basic-ls", "basic-cat"] {
        let detail = client
            .get(format!("http://{}/api/challenges/{}", addr, id))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(!detail.contains("CLI_QUEST_"), "{detail}");
        assert!(!detail.contains("\"flag\""), "{detail}");
    }

    let started = client
        .post(format!("http://{}/api/challenges/basic-cat/start", addr))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(!started.contains("CLI_QUEST_"), "{started}");
}

#[tokio::test]
async fn unknown_challenge_is_404() {
    let h = harness(settings(Duration::from_secs(30)));
    let addr = spawn_server(h.state).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/api/challenges/nope", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["detail"], "Challenge not found");

    for path in ["start", "submit"] {
        let response = client
            .post(format!("http://{}/api/challenges/nope/{}", addr, path))
            .json(&json!({ "flag": "x" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
    }
}

#[tokio::test]
async fn start_reserves_session_and_submit_checks_flag() {
    let h = harness(settings(Duration::from_secs(30)));
    let registry = h.registry.clone();
    let addr = spawn_server(h.state).await;
    let client = reqwest::Client::new();

    let started: Value = client
        .post(format!("http://{}/api/challenges/basic-cat/start", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let session_id = started["session_id"].as_str().unwrap();
    assert_eq!(started["challenge_id"], "basic-cat");
    assert_eq!(started["websocket_url"], format!("/api/terminal/{}", session_id));
    assert_eq!(started["setup_files"], json!(["readme.txt", "secret.txt"]));
    assert!(registry.get(session_id).is_some());

    let session: Value = client
        .get(format!("http://{}/api/sessions/{}", addr, session_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(session["state"], "created");
    assert_eq!(session["challenge_id"], "basic-cat");

    let right: Value = client
        .post(format!("http://{}/api/challenges/basic-cat/submit", addr))
        .json(&json!({ "flag": " CLI_QUEST_CAT_READER " }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(right["success"], true);
    assert_eq!(right["points"], 100);
    assert_eq!(right["message"], "Congratulations! You've completed the challenge!");

    let wrong: Value = client
        .post(format!("http://{}/api/challenges/basic-cat/submit", addr))
        .json(&json!({ "flag": "CLI_QUEST_LS_MASTER" }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(wrong["success"], false);
    assert_eq!(wrong["points"], 0);
}

#[tokio::test]
async fn delete_session_terminates_it() {
    let h = harness(settings(Duration::from_secs(30)));
    let backend = h.backend.clone();
    h.registry.get_or_create("to-delete").await.unwrap();
    let addr = spawn_server(h.state).await;
    let client = reqwest::Client::new();

    let sessions: Vec<Value> = client
        .get(format!("http://{}/api/sessions", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["state"], "ready");
    assert_eq!(sessions[0]["container"], "cli-quest-to-delete");

    let url = format!("http://{}/api/sessions/to-delete", addr);
    assert_eq!(client.delete(&url).send().await.unwrap().status(), StatusCode::NO_CONTENT);
    assert_eq!(backend.live_containers(), 0);
    assert_eq!(client.delete(&url).send().await.unwrap().status(), StatusCode::NOT_FOUND);
    assert_eq!(client.get(&url).send().await.unwrap().status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cors_allows_configured_origin() {
    let h = harness(settings(Duration::from_secs(30)));
    let addr = spawn_server(h.state).await;
    let client = reqwest::Client::new();

    let allowed = client
        .get(format!("http://{}/api/challenges", addr))
        .header("Origin", "http://localhost:5173")
        .send()
        .await
        .unwrap();
    assert_eq!(
        allowed.headers()["access-control-allow-origin"],
        "http://localhost:5173"
    );

    let other = client
        .get(format!("http://{}/api/challenges", addr))
        .header("Origin", "http://evil.example")
        .send()
        .await
        .unwrap();
    assert!(other.headers().get("access-control-allow-origin").is_none());
}
