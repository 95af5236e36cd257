//! End-to-end agent flows: a tool-using job against a mocked LLM and MCP
//! server, and webhook delivery with retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use modelgate_common::agent::{JobStatus, Task};
use modelgate_server::agent::AgentJobService;
use modelgate_server::model_config::{LoadDefaults, ModelConfigLoader};
use modelgate_server::system::SystemState;

struct Harness {
    tmp: TempDir,
    service: Arc<AgentJobService>,
    _shutdown_tx: watch::Sender<bool>,
}

/// Bring up a service whose model "m" talks to the given MCP endpoint and
/// whose LLM calls land on `llm_address`.
async fn harness(llm_address: &str, mcp_url: &str) -> Harness {
    let tmp = TempDir::new().unwrap();
    let system = Arc::new(
        SystemState::new(
            tmp.path().join("models"),
            tmp.path().join("backends"),
            tmp.path().join("system-backends"),
            tmp.path().join("generated"),
        )
        .unwrap(),
    );

    let model_yaml = format!(
        concat!(
            "name: m\n",
            "backend: llama-cpp\n",
            "template:\n",
            "  chat: \"{{{{.Input}}}}\"\n",
            "mcp:\n",
            "  remote: |\n",
            "    mcpServers:\n",
            "      calc:\n",
            "        url: {}\n",
        ),
        mcp_url
    );
    std::fs::write(system.models_path.join("m.yaml"), model_yaml).unwrap();

    let config_loader = Arc::new(ModelConfigLoader::new(system.clone()));
    config_loader
        .load_from_directory(&system.models_path, &LoadDefaults::default())
        .await
        .unwrap();

    let configs_dir = tmp.path().join("configuration");
    std::fs::create_dir_all(&configs_dir).unwrap();

    let service = AgentJobService::new(config_loader, &configs_dir, llm_address, "", 30);
    service.set_webhook_backoff(Duration::from_millis(50));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    service.start(shutdown_rx).await;

    Harness {
        tmp,
        service,
        _shutdown_tx: shutdown_tx,
    }
}

/// Mock an MCP server with one `add` tool that answers "5".
async fn mount_mcp(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/list"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "tools": [{
                    "name": "add",
                    "description": "Add two numbers",
                    "inputSchema": {"type": "object"}
                }]
            }
        })))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/mcp"))
        .and(body_partial_json(json!({"method": "tools/call"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": {"content": [{"type": "text", "text": "5"}]}
        })))
        .mount(server)
        .await;
}

/// Mock the chat surface: one tool-calling turn, then plain answers.
async fn mount_llm(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "add", "arguments": "{\"x\": 2, \"y\": 3}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }]
        })))
        .up_to_n_times(1)
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": {"role": "assistant", "content": "2+3 is 5."},
                "finish_reason": "stop"
            }]
        })))
        .mount(server)
        .await;
}

async fn wait_terminal(service: &AgentJobService, job_id: &str) -> modelgate_common::agent::Job {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(job) = service.get_job(job_id) {
                if job.status.is_terminal() {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state")
}

fn add_task() -> Task {
    Task {
        name: "add".to_string(),
        model: "m".to_string(),
        prompt: "What is {{.x}}+{{.y}}?".to_string(),
        enabled: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_agent_job_happy_path() {
    let server = MockServer::start().await;
    mount_mcp(&server).await;
    mount_llm(&server).await;

    let llm_address = server.uri().trim_start_matches("http://").to_string();
    let h = harness(&llm_address, &format!("{}/mcp", server.uri())).await;

    let task_id = h.service.create_task(add_task()).unwrap();
    let mut params = HashMap::new();
    params.insert("x".to_string(), "2".to_string());
    params.insert("y".to_string(), "3".to_string());

    let job_id = h
        .service
        .execute_job(&task_id, params, "api")
        .await
        .unwrap();

    let job = wait_terminal(&h.service, &job_id).await;
    assert_eq!(job.status, JobStatus::Completed, "error: {}", job.error);
    assert_eq!(job.result, "2+3 is 5.");
    assert_eq!(job.triggered_by, "api");
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());

    // Traces captured the tool round-trip.
    assert!(job.traces.iter().any(|t| t.kind == "tool_call" && t.tool_name == "add"));
    assert!(job.traces.iter().any(|t| t.kind == "tool_result"));

    // The rendered prompt reached the LLM with parameters substituted.
    let requests = server.received_requests().await.unwrap();
    let chat_bodies: Vec<String> = requests
        .iter()
        .filter(|r| r.url.path() == "/v1/chat/completions")
        .map(|r| String::from_utf8_lossy(&r.body).into_owned())
        .collect();
    assert!(chat_bodies.iter().any(|b| b.contains("What is 2+3?")));

    // The job landed in the persisted file.
    let persisted =
        std::fs::read_to_string(h.tmp.path().join("configuration/agent_jobs.json")).unwrap();
    assert!(persisted.contains(&job_id));
}

#[tokio::test]
async fn test_agent_job_fails_without_mcp_config() {
    let server = MockServer::start().await;
    mount_llm(&server).await;

    let tmp = TempDir::new().unwrap();
    let system = Arc::new(
        SystemState::new(
            tmp.path().join("models"),
            tmp.path().join("backends"),
            tmp.path().join("system-backends"),
            tmp.path().join("generated"),
        )
        .unwrap(),
    );
    // Model config with no MCP section at all.
    std::fs::write(
        system.models_path.join("m.yaml"),
        "name: m\nbackend: llama-cpp\n",
    )
    .unwrap();
    let config_loader = Arc::new(ModelConfigLoader::new(system.clone()));
    config_loader
        .load_from_directory(&system.models_path, &LoadDefaults::default())
        .await
        .unwrap();

    let configs_dir = tmp.path().join("configuration");
    std::fs::create_dir_all(&configs_dir).unwrap();
    let llm_address = server.uri().trim_start_matches("http://").to_string();
    let service = AgentJobService::new(config_loader, &configs_dir, &llm_address, "", 30);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    service.start(shutdown_rx).await;

    let task_id = service.create_task(add_task()).unwrap();
    let job_id = service
        .execute_job(&task_id, HashMap::new(), "api")
        .await
        .unwrap();

    let job = wait_terminal(&service, &job_id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.contains("no MCP servers configured"));
}

#[tokio::test]
async fn test_webhook_retry_until_success() {
    let server = MockServer::start().await;
    mount_mcp(&server).await;
    mount_llm(&server).await;

    // Webhook target: 500 twice, then 200.
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let llm_address = server.uri().trim_start_matches("http://").to_string();
    let h = harness(&llm_address, &format!("{}/mcp", server.uri())).await;

    let mut task = add_task();
    task.webhook_url = format!("{}/hook", server.uri());
    task.webhook_auth = "Bearer secret".to_string();
    let task_id = h.service.create_task(task).unwrap();

    let job_id = h
        .service
        .execute_job(&task_id, HashMap::new(), "api")
        .await
        .unwrap();
    wait_terminal(&h.service, &job_id).await;

    // Delivery is asynchronous; wait for it to settle.
    let job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = h.service.get_job(&job_id).unwrap();
            if job.webhook_sent || !job.webhook_error.is_empty() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(job.webhook_sent, "webhook error: {}", job.webhook_error);
    assert!(job.webhook_sent_at.is_some());

    let hook_requests: Vec<_> = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/hook")
        .collect();
    assert_eq!(hook_requests.len(), 3, "expected two retries then success");
    for request in &hook_requests {
        assert_eq!(
            request.headers.get("Authorization").unwrap().to_str().unwrap(),
            "Bearer secret"
        );
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        assert_eq!(body["task_name"], "add");
        assert_eq!(body["status"], "completed");
    }
}

#[tokio::test]
async fn test_webhook_all_attempts_fail_keeps_job_completed() {
    let server = MockServer::start().await;
    mount_mcp(&server).await;
    mount_llm(&server).await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let llm_address = server.uri().trim_start_matches("http://").to_string();
    let h = harness(&llm_address, &format!("{}/mcp", server.uri())).await;

    let mut task = add_task();
    task.webhook_url = format!("{}/hook", server.uri());
    let task_id = h.service.create_task(task).unwrap();
    let job_id = h
        .service
        .execute_job(&task_id, HashMap::new(), "api")
        .await
        .unwrap();
    wait_terminal(&h.service, &job_id).await;

    let job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let job = h.service.get_job(&job_id).unwrap();
            if !job.webhook_error.is_empty() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Delivery failure is recorded but never flips the job status.
    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.webhook_sent);
    assert!(job.webhook_error.contains("failed after 3 attempts"));
}

#[tokio::test]
async fn test_cron_triggered_job() {
    let server = MockServer::start().await;
    mount_mcp(&server).await;
    mount_llm(&server).await;

    let llm_address = server.uri().trim_start_matches("http://").to_string();
    let h = harness(&llm_address, &format!("{}/mcp", server.uri())).await;

    let mut task = add_task();
    task.cron = "* * * * * *".to_string();
    task.cron_parameters
        .insert("x".to_string(), "1".to_string());
    task.cron_parameters
        .insert("y".to_string(), "4".to_string());
    let task_id = h.service.create_task(task).unwrap();

    // The every-second schedule fires and enqueues a job on its own.
    let job = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let jobs = h.service.list_jobs(Some(&task_id), None, 0);
            if let Some(job) = jobs.iter().find(|j| j.status.is_terminal()) {
                return job.clone();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("cron never fired");

    assert_eq!(job.triggered_by, "cron");
    assert_eq!(job.status, JobStatus::Completed, "error: {}", job.error);

    // Stop the schedule so the test does not keep enqueueing.
    h.service.delete_task(&task_id).unwrap();
}
