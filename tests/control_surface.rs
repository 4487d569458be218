use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use surfer_agent::face::{AppState, router};
use surfer_agent::queue::{DEFAULT_AGENT_ID, MemoryTaskStore, TaskStore};
use surfer_agent::state::{AgentHandle, AgentStatus};

const DEFAULT_TASK: &str = "Browse the job board and apply.";

async fn serve(agent: AgentHandle, store: Arc<MemoryTaskStore>) -> SocketAddr {
    let state = AppState::new(agent, store, DEFAULT_TASK);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    addr
}

async fn control(addr: SocketAddr, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://{addr}/control"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn state_reports_snapshot() {
    let agent = AgentHandle::new();
    agent.log("Orchestrator active.");
    agent.set_screenshot(vec![1, 2, 3]);
    let addr = serve(agent, Arc::new(MemoryTaskStore::new())).await;

    let body: Value = reqwest::get(format!("http://{addr}/state"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["active"], false);
    assert_eq!(body["status"], "Idle");
    assert_eq!(body["latest_screenshot"], "AQID");
    assert_eq!(body["current_task"], Value::Null);
    assert!(body["logs"][0].as_str().unwrap().ends_with("Orchestrator active."));
}

#[tokio::test]
async fn start_seeds_default_task_into_empty_slot() {
    let agent = AgentHandle::new();
    let store = Arc::new(MemoryTaskStore::new());
    let addr = serve(agent.clone(), store.clone()).await;

    let response = control(addr, json!({ "command": "start" })).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.json::<Value>().await.unwrap(), json!({ "success": true }));

    assert!(agent.is_active());
    assert_eq!(agent.status(), AgentStatus::Starting);
    assert_eq!(
        store.peek(DEFAULT_AGENT_ID).unwrap().as_deref(),
        Some(DEFAULT_TASK)
    );
}

#[tokio::test]
async fn start_keeps_a_queued_task_unless_one_is_given() {
    let agent = AgentHandle::new();
    let store = Arc::new(MemoryTaskStore::new());
    store.enqueue(DEFAULT_AGENT_ID, "browse queued").unwrap();
    let addr = serve(agent, store.clone()).await;

    control(addr, json!({ "command": "start" })).await;
    assert_eq!(
        store.peek(DEFAULT_AGENT_ID).unwrap().as_deref(),
        Some("browse queued")
    );

    control(addr, json!({ "command": "start", "task": "apply to acme" })).await;
    assert_eq!(
        store.peek(DEFAULT_AGENT_ID).unwrap().as_deref(),
        Some("apply to acme")
    );
}

#[tokio::test]
async fn stop_is_idempotent() {
    let agent = AgentHandle::new();
    let addr = serve(agent.clone(), Arc::new(MemoryTaskStore::new())).await;

    control(addr, json!({ "command": "start" })).await;
    for _ in 0..2 {
        let response = control(addr, json!({ "command": "stop" })).await;
        assert_eq!(response.status(), 200);
    }
    assert!(!agent.is_active());
    assert_eq!(agent.status(), AgentStatus::Stopping);
}

#[tokio::test]
async fn bad_commands_get_structured_errors() {
    let agent = AgentHandle::new();
    let addr = serve(agent.clone(), Arc::new(MemoryTaskStore::new())).await;

    let response = control(addr, json!({ "command": "dance" })).await;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("dance"));

    let response = control(addr, json!({ "task": "no command" })).await;
    assert_eq!(response.status(), 400);
    assert!(response.json::<Value>().await.unwrap()["error"].is_string());

    assert!(!agent.is_active());
}

#[tokio::test]
async fn result_endpoint_serves_persisted_summary() {
    let store = Arc::new(MemoryTaskStore::new());
    store
        .write_result(DEFAULT_AGENT_ID, "BROWSER TASK: x\nOUTCOME: completed: ok")
        .unwrap();
    let addr = serve(AgentHandle::new(), store).await;

    let response = reqwest::get(format!("http://{addr}/result/{DEFAULT_AGENT_ID}"))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["agent_id"], DEFAULT_AGENT_ID);
    assert!(body["result"].as_str().unwrap().contains("completed: ok"));

    let missing = reqwest::get(format!("http://{addr}/result/b2_backend"))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}
