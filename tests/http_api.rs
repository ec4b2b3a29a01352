mod common;

use base64::Engine;
use common::{harness, spawn_server};
use labbox::runtime::ExecOutput;
use serde_json::{json, Value};

#[tokio::test]
async fn health_check() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;

    let body = reqwest::get(format!("http://{}/health", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn sandbox_endpoint_returns_the_handle() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/sandbox", addr))
        .json(&json!({"userId": "u1"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert!(body["name"].as_str().unwrap().starts_with("lab_exam_u1_"));
    assert!(body["volumeName"].as_str().unwrap().starts_with("lab_data_u1_"));
    assert!(body["port"].as_u64().is_some());
}

#[tokio::test]
async fn save_file_creates_the_sandbox_and_writes() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/save-file", addr))
        .json(&json!({"userId": "u1", "filename": "a.c", "code": "int x;"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"success": true, "path": "/home/labuser/a.c"}));

    let record = h.state.store.latest_for_user("u1").await.unwrap().unwrap();
    assert_eq!(h.remote.file(record.port, "/home/labuser/a.c").unwrap(), b"int x;");
}

#[tokio::test]
async fn save_file_prefers_the_full_path_and_decodes_base64() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();
    let encoded = base64::engine::general_purpose::STANDARD.encode([0u8, 159, 146, 150]);

    let response = client
        .post(format!("http://{}/api/save-file", addr))
        .json(&json!({
            "userId": "u1",
            "filename": "blob.bin",
            "filePath": "data/blob.bin",
            "code": encoded,
            "encoding": "base64"
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let record = h.state.store.latest_for_user("u1").await.unwrap().unwrap();
    assert_eq!(
        h.remote.file(record.port, "/home/labuser/data/blob.bin").unwrap(),
        vec![0u8, 159, 146, 150]
    );

    let response = client
        .post(format!("http://{}/api/save-file", addr))
        .json(&json!({"userId": "u1", "filename": "x", "code": "%%%", "encoding": "base64"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn missing_user_falls_back_to_the_default() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/save-file", addr))
        .json(&json!({"filename": "a.c", "code": ""}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(h
        .state
        .store
        .latest_for_user("testuser123")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn save_failure_is_a_generic_server_error() {
    let h = harness().await;
    h.remote
        .fail_writes
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/save-file", addr))
        .json(&json!({"userId": "u1", "filename": "a.c", "code": ""}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Failed to save file"}));
}

#[tokio::test]
async fn rename_file_runs_in_the_sandbox() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/rename-file", addr))
        .json(&json!({"userId": "u1", "oldPath": "a.c", "newPath": "b.c"}))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    assert!(h.runtime.execs().iter().any(|(_, request)| request
        .cmd
        .last()
        .is_some_and(|script| script.contains("mv '/home/labuser/a.c' '/home/labuser/b.c'"))));
}

#[tokio::test]
async fn list_and_read_files() {
    let h = harness().await;
    {
        let mut state = h.runtime.state();
        state.responses.insert(
            "ls".to_string(),
            ExecOutput {
                stdout: "a.c\nb.py\nc.o\n".to_string(),
                ..ExecOutput::default()
            },
        );
        state.responses.insert(
            "cat".to_string(),
            ExecOutput {
                stdout: "print(1)\n".to_string(),
                ..ExecOutput::default()
            },
        );
    }
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let listed: Value = client
        .get(format!("http://{}/api/list-files?userId=u1", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed, json!({"files": ["a.c", "b.py"]}));

    let read: Value = client
        .get(format!("http://{}/api/read-file?userId=u1&cwd=/home/labuser/lab2&filename=b.py", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(read, json!({"code": "print(1)\n"}));
    let (_, request) = h.runtime.execs().last().unwrap().clone();
    assert_eq!(request.cmd, vec!["cat", "--", "/home/labuser/lab2/b.py"]);

    let response = client
        .get(format!("http://{}/api/read-file?userId=u1", addr))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn read_failure_is_a_generic_server_error() {
    let h = harness().await;
    h.runtime.state().responses.insert(
        "cat".to_string(),
        ExecOutput {
            stderr: "cat: x.c: No such file or directory".to_string(),
            exit_code: 1,
            ..ExecOutput::default()
        },
    );
    let addr = spawn_server(h.state.clone()).await;

    let response = reqwest::get(format!("http://{}/api/read-file?filename=x.c", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body, json!({"error": "Failed to read file"}));
}

#[tokio::test]
async fn run_evaluate_returns_results() {
    let h = harness().await;
    h.runtime.state().script_output = labbox::runtime::ExecOutput {
        stdout: "RESULT:FAIL:wrong output\n".to_string(),
        stderr: String::new(),
        exit_code: 1,
    };
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("http://{}/api/run-evaluate", addr))
        .header("Authorization", "Bearer test-token")
        .json(&json!({
            "userId": "u1",
            "filename": "a.c",
            "code": "int main(){}",
            "language": "c",
            "evaluationScript": "evaluate_server1.sh",
            "testCases": [{"input": "1"}]
        }))
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        json!({"results": [{"stdout": "RESULT:FAIL:wrong output", "stderr": "", "exitCode": 1}]})
    );
}

#[tokio::test]
async fn active_sessions_and_module_assignment() {
    let h = harness().await;
    let addr = spawn_server(h.state.clone()).await;
    let client = reqwest::Client::new();
    let u1 = h.state.registry.ensure_sandbox("u1").await.unwrap();
    h.state.registry.ensure_sandbox("u2").await.unwrap();

    let sessions: Value = client
        .get(format!("http://{}/api/sessions/active", addr))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sessions[0]["sessionId"], u1.session_id.as_str());
    assert_eq!(sessions[0]["studentCount"], 2);

    let assigned: Value = client
        .post(format!("http://{}/api/sessions/assign-module", addr))
        .json(&json!({"moduleId": "sockets-1", "sessionId": u1.session_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(assigned["studentCount"], 2);
    let record = h.state.store.latest_for_user("u2").await.unwrap().unwrap();
    assert_eq!(record.active_module.as_deref(), Some("sockets-1"));

    let response = client
        .post(format!("http://{}/api/sessions/assign-module", addr))
        .json(&json!({"moduleId": "sockets-1", "sessionId": "19990101_FN"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
}
