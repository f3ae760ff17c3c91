use std::collections::VecDeque;
use std::convert::Infallible;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;

use toolstream_core::errors::GatewayError;
use toolstream_core::provider::{CompletionProvider, CompletionRequest, FrameStream};
use toolstream_core::sse::SseFrame;

use crate::demux::Demuxer;

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    /// Yield these payloads, then the `[DONE]` sentinel.
    Payloads(Vec<String>),
    /// Push raw body bytes through the real demuxer, split exactly as given.
    Chunks(Vec<Bytes>),
    /// Fail the `stream()` call itself, as a non-2xx status would.
    Error(GatewayError),
    /// Yield these payloads, then fail mid-stream.
    FailAfter(Vec<String>, GatewayError),
}

impl MockResponse {
    /// A plain text answer streamed as one fragment per entry.
    pub fn text(message_id: &str, fragments: &[&str]) -> Self {
        let mut payloads = vec![chunks::role(message_id)];
        payloads.extend(fragments.iter().map(|f| chunks::content(message_id, f)));
        payloads.push(chunks::finish(message_id, "stop"));
        Self::Payloads(payloads)
    }

    /// One tool call whose argument text is split across `fragments`.
    pub fn tool_call(message_id: &str, call_id: &str, name: &str, fragments: &[&str]) -> Self {
        let mut payloads = vec![chunks::role(message_id)];
        let mut rest = fragments.iter();
        let first = rest.next().copied().unwrap_or("");
        payloads.push(chunks::tool_call_start(message_id, 0, call_id, name, first));
        payloads.extend(rest.map(|f| chunks::tool_call_args(message_id, 0, f)));
        payloads.push(chunks::finish(message_id, "tool_calls"));
        Self::Payloads(payloads)
    }

    /// Render the payloads as a complete upstream SSE body.
    pub fn body(payloads: &[String]) -> String {
        let mut body: String = payloads.iter().map(|p| format!("data: {p}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records every request it was given.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<FrameStream, GatewayError> {
        let call = {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            requests.len()
        };

        let Some(response) = self.responses.lock().pop_front() else {
            return Err(GatewayError::InvalidRequest(format!(
                "MockProvider: no response configured for call {call}"
            )));
        };

        match response {
            MockResponse::Payloads(payloads) => {
                let frames = payloads
                    .into_iter()
                    .map(|p| Ok(SseFrame::Data(p)))
                    .chain(std::iter::once(Ok(SseFrame::Done)));
                Ok(stream::iter(frames.collect::<Vec<_>>()).boxed())
            }
            MockResponse::Chunks(parts) => {
                let body = stream::iter(parts.into_iter().map(Ok::<_, Infallible>));
                Ok(Demuxer::new(body).boxed())
            }
            MockResponse::Error(error) => Err(error),
            MockResponse::FailAfter(payloads, error) => {
                let frames = payloads
                    .into_iter()
                    .map(|p| Ok(SseFrame::Data(p)))
                    .chain(std::iter::once(Err(error)));
                Ok(stream::iter(frames.collect::<Vec<_>>()).boxed())
            }
        }
    }
}

/// Builders for chat-completion chunk payloads.
pub mod chunks {
    use serde_json::json;

    pub fn role(id: &str) -> String {
        json!({"id": id, "choices": [{"index": 0, "delta": {"role": "assistant", "content": ""}}]}).to_string()
    }

    pub fn content(id: &str, text: &str) -> String {
        json!({"id": id, "choices": [{"index": 0, "delta": {"content": text}}]}).to_string()
    }

    pub fn tool_call_start(id: &str, index: u32, call_id: &str, name: &str, arguments: &str) -> String {
        json!({"id": id, "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": index,
            "id": call_id,
            "type": "function",
            "function": {"name": name, "arguments": arguments}
        }]}}]})
        .to_string()
    }

    pub fn tool_call_args(id: &str, index: u32, arguments: &str) -> String {
        json!({"id": id, "choices": [{"index": 0, "delta": {"tool_calls": [{
            "index": index,
            "function": {"arguments": arguments}
        }]}}]})
        .to_string()
    }

    pub fn finish(id: &str, reason: &str) -> String {
        json!({"id": id, "choices": [{"index": 0, "delta": {}, "finish_reason": reason}]}).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responses_in_sequence_and_requests_recorded() {
        let provider = MockProvider::new(vec![
            MockResponse::text("m1", &["hi"]),
            MockResponse::Error(GatewayError::from_status(500, "down".into())),
        ]);
        let request = CompletionRequest::default();

        let frames: Vec<_> = provider.stream(&request).await.unwrap().collect().await;
        assert_eq!(frames.len(), 4);
        assert!(matches!(frames.last(), Some(Ok(SseFrame::Done))));

        assert!(provider.stream(&request).await.is_err());
        assert!(matches!(
            provider.stream(&request).await,
            Err(GatewayError::InvalidRequest(msg)) if msg.contains("call 3")
        ));
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn raw_chunks_go_through_demuxer() {
        let body = MockResponse::body(&[chunks::content("m", "é")]);
        let bytes = body.as_bytes();
        let split = bytes.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let provider = MockProvider::new(vec![MockResponse::Chunks(vec![
            Bytes::copy_from_slice(&bytes[..split]),
            Bytes::copy_from_slice(&bytes[split..]),
        ])]);

        let frames: Vec<_> = provider
            .stream(&CompletionRequest::default())
            .await
            .unwrap()
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], SseFrame::Data(chunks::content("m", "é")));
        assert_eq!(frames[1], SseFrame::Done);
    }

    #[test]
    fn tool_call_builder_splits_arguments() {
        let MockResponse::Payloads(payloads) =
            MockResponse::tool_call("m", "call_1", "f", &["{\"a\"", ":1}"])
        else {
            panic!("expected payloads");
        };
        assert_eq!(payloads.len(), 4);
        assert!(payloads[1].contains("call_1"));
        assert!(payloads[3].contains("tool_calls"));
    }
}
