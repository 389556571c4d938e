use asr_gateway::dispatch::ChunkResult;
use asr_gateway::nats::{subject_token, ResultMessage, TaskMessage};
use base64::Engine;

#[test]
fn test_task_message_serialization() {
    let msg = TaskMessage::stream_chunk("test-session", 4, &[0u8; 100], "asr-gateway");

    let json = serde_json::to_string(&msg).unwrap();
    assert!(json.contains("\"type\":\"stream\""));
    assert!(json.contains("\"task_id\":\"test-session\""));
    assert!(json.contains("\"chunk_index\":4"));
    assert!(json.contains("\"origin\":\"asr-gateway\""));

    let deserialized: TaskMessage = serde_json::from_str(&json).unwrap();
    assert_eq!(deserialized, msg);

    let audio = base64::engine::general_purpose::STANDARD
        .decode(&deserialized.payload.audio_data)
        .unwrap();
    assert_eq!(audio, vec![0u8; 100]);
}

#[test]
fn test_result_deserialization() {
    let json = r#"{
        "chunk_index": 2,
        "text": "Hello world",
        "duration": 3.2,
        "error": ""
    }"#;

    let msg = ResultMessage::decode(json.as_bytes()).unwrap();
    assert_eq!(msg.chunk_index, 2);
    assert_eq!(msg.text, "Hello world");
    assert_eq!(msg.duration, 3.2);

    // Empty error means success
    let result = ChunkResult::from(msg);
    assert!(!result.is_error());
}

#[test]
fn test_result_with_error() {
    let json = r#"{"chunk_index": 5, "error": "model crashed"}"#;

    let result = ChunkResult::from(ResultMessage::decode(json.as_bytes()).unwrap());
    assert_eq!(result.chunk_index, 5);
    assert_eq!(result.text, "");
    assert_eq!(result.error.as_deref(), Some("model crashed"));
}

#[test]
fn test_result_requires_chunk_index() {
    assert!(ResultMessage::decode(br#"{"text": "orphan"}"#).is_err());
    assert!(ResultMessage::decode(br#"{"chunk_index": "one"}"#).is_err());
    assert!(ResultMessage::decode(b"garbage").is_err());
}

#[test]
fn test_subject_token_is_single_token() {
    assert_eq!(subject_token("8f0c-11ee"), "8f0c-11ee");
    assert_eq!(subject_token("user.session>1"), "user_session_1");
}
