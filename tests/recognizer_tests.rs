// Integration tests for the recognition engine HTTP client
//
// A wiremock server stands in for the engine's submit and poll endpoints.

use anyhow::Result;
use asr_gateway::config::RecognizerConfig;
use asr_gateway::recognizer::{HttpRecognizer, Recognizer};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn recognizer(base_url: &str) -> HttpRecognizer {
    HttpRecognizer::new(&RecognizerConfig {
        base_url: base_url.to_string(),
        poll_interval_ms: 10,
        timeout_secs: 2,
        request_timeout_secs: 5,
    })
    .unwrap()
}

async fn mount_submit(server: &MockServer, task_id: &str) {
    Mock::given(method("POST"))
        .and(path("/api/v1/asr/submit"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "task_id": task_id,
            "status": "queued",
            "position": 1,
            "estimated_wait": 2
        })))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_recognize_submits_wav_and_polls_until_done() -> Result<()> {
    let server = MockServer::start().await;
    mount_submit(&server, "t1").await;

    Mock::given(method("GET"))
        .and(path("/api/v1/asr/result/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "task_id": "t1",
            "status": "processing"
        })))
        .up_to_n_times(2)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/v1/asr/result/t1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "task_id": "t1",
            "status": "done",
            "text": "hello there",
            "duration": 2.5,
            "processing_time": 0.4
        })))
        .mount(&server)
        .await;

    let pcm = vec![0u8; 3200];
    let recognition = recognizer(&server.uri()).recognize(&pcm).await?;
    assert_eq!(recognition.text, "hello there");
    assert_eq!(recognition.duration, 2.5);

    let requests = server.received_requests().await.unwrap();
    let submit = requests
        .iter()
        .find(|r| r.url.path() == "/api/v1/asr/submit")
        .expect("submit request");
    let body = String::from_utf8_lossy(&submit.body);
    assert!(body.contains("name=\"audio\""));
    assert!(body.contains("filename=\"chunk.wav\""));
    assert!(body.contains("RIFF"));

    let polls = requests
        .iter()
        .filter(|r| r.url.path() == "/api/v1/asr/result/t1")
        .count();
    assert_eq!(polls, 3);

    Ok(())
}

#[tokio::test]
async fn test_failed_task_is_an_error() -> Result<()> {
    let server = MockServer::start().await;
    mount_submit(&server, "t2").await;

    Mock::given(method("GET"))
        .and(path("/api/v1/asr/result/t2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "task_id": "t2",
            "status": "failed",
            "error": "unsupported audio"
        })))
        .mount(&server)
        .await;

    let err = recognizer(&server.uri())
        .recognize(&[0u8; 320])
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("unsupported audio"));

    Ok(())
}

#[tokio::test]
async fn test_rejected_submission_is_an_error() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/v1/asr/submit"))
        .respond_with(ResponseTemplate::new(503).set_body_string("queue full"))
        .mount(&server)
        .await;

    let err = recognizer(&server.uri())
        .submit_audio(vec![0u8; 44], "chunk.wav")
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("queue full"));

    Ok(())
}

#[tokio::test]
async fn test_unknown_task_reports_not_found() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/asr/result/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = recognizer(&server.uri())
        .get_result("missing")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Task not found"));

    Ok(())
}

#[tokio::test]
async fn test_poll_gives_up_after_timeout() -> Result<()> {
    let server = MockServer::start().await;
    mount_submit(&server, "slow").await;

    Mock::given(method("GET"))
        .and(path("/api/v1/asr/result/slow"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "task_id": "slow",
            "status": "queued"
        })))
        .mount(&server)
        .await;

    let client = HttpRecognizer::new(&RecognizerConfig {
        base_url: server.uri(),
        poll_interval_ms: 50,
        timeout_secs: 1,
        request_timeout_secs: 5,
    })?;

    let err = client.recognize(&[0u8; 320]).await.unwrap_err();
    assert!(err.to_string().contains("Timed out"));

    Ok(())
}

#[tokio::test]
async fn test_readiness_check() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    assert!(recognizer(&server.uri()).is_ready().await);
    assert!(!recognizer("http://127.0.0.1:1").is_ready().await);

    Ok(())
}
