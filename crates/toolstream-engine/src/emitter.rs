use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::error;

use toolstream_core::events::{EventEnvelope, ProtocolEvent};

/// The downstream receiver is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Destination for a run's stamped protocol events, in emission order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), SinkClosed>;
}

/// Synthetic typing: long content deltas are re-chunked into pieces of at
/// most `chunk_chars` characters with `delay` between them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TypingConfig {
    pub chunk_chars: usize,
    pub delay: Duration,
}

/// Frames each event as `data: <json>\n\n` and sends it down a channel that
/// feeds the HTTP response body. Every event is flushed on its own.
pub struct ChannelEmitter {
    tx: mpsc::Sender<Bytes>,
    typing: Option<TypingConfig>,
}

impl ChannelEmitter {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx, typing: None }
    }

    pub fn with_typing(mut self, typing: Option<TypingConfig>) -> Self {
        self.typing = typing.filter(|t| t.chunk_chars > 0);
        self
    }

    async fn send(&self, envelope: &EventEnvelope) -> Result<(), SinkClosed> {
        let frame = match envelope.to_sse_frame() {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, event = envelope.event.event_type(), "failed to serialize event");
                return Ok(());
            }
        };
        self.tx.send(Bytes::from(frame)).await.map_err(|_| SinkClosed)
    }
}

#[async_trait]
impl EventSink for ChannelEmitter {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), SinkClosed> {
        let Some(typing) = self.typing else {
            return self.send(&envelope).await;
        };
        let ProtocolEvent::TextMessageContent { message_id, delta } = &envelope.event else {
            return self.send(&envelope).await;
        };

        let pieces = split_chars(delta, typing.chunk_chars);
        if pieces.len() < 2 {
            return self.send(&envelope).await;
        }
        for (i, piece) in pieces.iter().enumerate() {
            if i > 0 && !typing.delay.is_zero() {
                tokio::time::sleep(typing.delay).await;
            }
            let part = EventEnvelope {
                event: ProtocolEvent::TextMessageContent {
                    message_id: message_id.clone(),
                    delta: (*piece).to_string(),
                },
                timestamp: toolstream_core::now_ms(),
                ..envelope.clone()
            };
            self.send(&part).await?;
        }
        Ok(())
    }
}

/// Split on character boundaries into pieces of at most `max` characters.
fn split_chars(text: &str, max: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut count = 0;
    for (offset, _) in text.char_indices() {
        if count == max {
            pieces.push(&text[start..offset]);
            start = offset;
            count = 0;
        }
        count += 1;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

/// Keeps every event in memory.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.events.lock().clone()
    }

    pub fn events(&self) -> Vec<ProtocolEvent> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.event.event_type()).collect()
    }
}

#[async_trait]
impl EventSink for CollectingSink {
    async fn emit(&self, envelope: EventEnvelope) -> Result<(), SinkClosed> {
        self.events.lock().push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolstream_core::events::RunContext;
    use toolstream_core::ids::{MessageId, RunId, ThreadId};

    fn ctx() -> RunContext {
        RunContext::new(Some(ThreadId::from_raw("t1")), Some(RunId::from_raw("r1")))
    }

    fn content(text: &str) -> EventEnvelope {
        ctx().stamp(ProtocolEvent::TextMessageContent {
            message_id: MessageId::from_raw("m1"),
            delta: text.into(),
        })
    }

    fn decode(frame: &Bytes) -> serde_json::Value {
        let text = std::str::from_utf8(frame).unwrap();
        let json = text.strip_prefix("data: ").unwrap().strip_suffix("\n\n").unwrap();
        serde_json::from_str(json).unwrap()
    }

    #[tokio::test]
    async fn frames_one_event_per_record() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = ChannelEmitter::new(tx);

        emitter.emit(ctx().stamp(ProtocolEvent::RunStarted)).await.unwrap();
        emitter.emit(content("Hello")).await.unwrap();

        let first = decode(&rx.recv().await.unwrap());
        assert_eq!(first["type"], "RUN_STARTED");
        assert_eq!(first["threadId"], "t1");
        assert_eq!(first["runId"], "r1");
        assert!(first["timestamp"].as_u64().unwrap() > 0);

        let second = decode(&rx.recv().await.unwrap());
        assert_eq!(second["type"], "TEXT_MESSAGE_CONTENT");
        assert_eq!(second["delta"], "Hello");
    }

    #[tokio::test]
    async fn closed_receiver_reports_sink_closed() {
        let (tx, rx) = mpsc::channel(8);
        let emitter = ChannelEmitter::new(tx);
        drop(rx);

        assert_eq!(emitter.emit(content("x")).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn typing_splits_long_deltas() {
        tokio::time::pause();
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = ChannelEmitter::new(tx).with_typing(Some(TypingConfig {
            chunk_chars: 4,
            delay: Duration::from_millis(15),
        }));

        emitter.emit(content("héllo world")).await.unwrap();
        drop(emitter);

        let mut deltas = Vec::new();
        while let Some(frame) = rx.recv().await {
            let json = decode(&frame);
            assert_eq!(json["messageId"], "m1");
            deltas.push(json["delta"].as_str().unwrap().to_string());
        }
        assert_eq!(deltas, vec!["héll", "o wo", "rld"]);
    }

    #[tokio::test]
    async fn typing_leaves_other_events_alone() {
        let (tx, mut rx) = mpsc::channel(8);
        let emitter = ChannelEmitter::new(tx).with_typing(Some(TypingConfig {
            chunk_chars: 2,
            delay: Duration::ZERO,
        }));

        emitter
            .emit(ctx().stamp(ProtocolEvent::StepStarted {
                step_name: "round-1".into(),
            }))
            .await
            .unwrap();
        emitter.emit(content("ab")).await.unwrap();
        drop(emitter);

        let mut types = Vec::new();
        while let Some(frame) = rx.recv().await {
            types.push(decode(&frame)["type"].as_str().unwrap().to_string());
        }
        assert_eq!(types, vec!["STEP_STARTED", "TEXT_MESSAGE_CONTENT"]);
    }

    #[test]
    fn split_respects_char_boundaries() {
        assert_eq!(split_chars("", 3), Vec::<&str>::new());
        assert_eq!(split_chars("abc", 3), vec!["abc"]);
        assert_eq!(split_chars("日本語テキスト", 3), vec!["日本語", "テキス", "ト"]);
    }

    #[tokio::test]
    async fn collecting_sink_keeps_order() {
        let sink = CollectingSink::new();
        sink.emit(ctx().stamp(ProtocolEvent::RunStarted)).await.unwrap();
        sink.emit(ctx().stamp(ProtocolEvent::RunFinished)).await.unwrap();
        assert_eq!(sink.types(), vec!["RUN_STARTED", "RUN_FINISHED"]);
    }
}
