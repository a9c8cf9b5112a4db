use bytes::Bytes;
use futures::stream::StreamExt;
use mockito::Matcher;
use serde_json::json;

use super::*;
use crate::chat::ChatMessage;

fn config(base_url: String) -> ProviderConfig {
    ProviderConfig {
        base_url,
        api_key: Some(SecretString::new("sk-test".to_string())),
        ..ProviderConfig::default()
    }
}

fn request(stream: bool) -> ChatCompletionRequest {
    let messages = vec![ChatMessage::user().content("What is 2+2?").build()];
    ChatCompletionRequest::new("gpt-4o-mini", &messages, stream)
}

fn sse_response(body: &'static [u8]) -> reqwest::Response {
    crate::testing::create_mock_response(vec![Ok(Bytes::from_static(body))])
}

#[test]
fn completions_url_normalizes_trailing_slash() {
    let with = ProviderClient::new(&config("http://localhost:9/v1/".into()));
    let without = ProviderClient::new(&config("http://localhost:9/v1".into()));

    assert_eq!(with.completions_url(), "http://localhost:9/v1/chat/completions");
    assert_eq!(with.completions_url(), without.completions_url());
}

#[test]
fn extract_payload_joins_data_lines() {
    assert_eq!(
        extract_payload("event: message\ndata: {\"a\":\ndata: 1}\n\n").as_deref(),
        Some("{\"a\":\n1}")
    );
    assert_eq!(
        extract_payload("data: first\ndata:second\n\n").as_deref(),
        Some("first\nsecond")
    );
    assert_eq!(extract_payload(": keep-alive\n\n"), None);
    assert_eq!(extract_payload("data: [DONE]\n\n").as_deref(), Some(DONE_EVENT));
}

#[tokio::test]
async fn terminator_ends_stream_without_decoding() {
    let response = sse_response(
        b"data: {\"choices\":[{\"delta\":{\"content\":\"4\"}}]}\n\n\
          data: [DONE]\n\n\
          data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
    );

    let frames: Vec<_> = frame_stream(response).collect().await;

    assert_eq!(frames.len(), 1);
    let frame = frames[0].as_ref().unwrap();
    assert_eq!(frame.choices[0].delta.content.as_deref(), Some("4"));
}

#[tokio::test]
async fn malformed_frame_surfaces_as_format_error() {
    let response = sse_response(b"data: {not json}\n\n");

    let frames: Vec<_> = frame_stream(response).collect().await;

    assert!(matches!(
        frames.as_slice(),
        [Err(ProviderError::ResponseFormatError { .. })]
    ));
}

#[tokio::test]
async fn complete_posts_json_and_decodes_response() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o-mini",
            "stream": false,
            "messages": [{"role": "user", "content": "What is 2+2?"}]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "choices": [{"message": {"role": "assistant", "content": "4"}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 1, "total_tokens": 11}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let client = ProviderClient::new(&config(server.url()));
    let response = client.complete(&request(false)).await.unwrap();

    mock.assert_async().await;
    assert_eq!(response.choices[0].message.content.as_deref(), Some("4"));
    assert_eq!(response.usage.map(|u| u.total_tokens), Some(11));
}

#[tokio::test]
async fn error_status_is_reported_with_code() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_body("slow down")
        .create_async()
        .await;

    let client = ProviderClient::new(&config(server.url()));
    let err = client.complete(&request(false)).await.unwrap_err();

    assert_eq!(err.status(), Some(429));
    assert!(err.to_string().contains("slow down"));
}

#[tokio::test]
async fn stream_reads_sse_frames_over_http() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .match_body(Matcher::PartialJson(json!({"stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(
            "data: {\"choices\":[{\"delta\":{\"content\":\"2+2\"}}]}\n\n\
             data: {\"choices\":[{\"delta\":{\"content\":\" is 4\"}}]}\n\n\
             data: [DONE]\n\n",
        )
        .create_async()
        .await;

    let client = ProviderClient::new(&config(server.url()));
    let frames: Vec<_> = client.stream(&request(true)).await.unwrap().collect().await;

    let text: String = frames
        .into_iter()
        .map(|frame| frame.unwrap().choices[0].delta.content.clone().unwrap_or_default())
        .collect();
    assert_eq!(text, "2+2 is 4");
}
