use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use pin_project_lite::pin_project;

use toolstream_core::events::EventEnvelope;
use toolstream_core::sse::{LineDecoder, SseFrame};

use crate::reducer::RunState;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("undecodable event: {0}")]
    Decode(#[from] serde_json::Error),
}

pin_project! {
    /// Decodes a downstream `text/event-stream` body into event envelopes.
    ///
    /// A frame that is not a valid event is yielded as `Err` and the stream
    /// continues. A transport error is yielded once and ends the stream.
    pub struct EventStream<S> {
        #[pin]
        inner: S,
        decoder: LineDecoder,
        pending: VecDeque<SseFrame>,
        finished: bool,
    }
}

impl<S> EventStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }
}

impl<S, E> Stream for EventStream<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<EventEnvelope, ClientError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            match this.pending.pop_front() {
                Some(SseFrame::Data(payload)) => {
                    return Poll::Ready(Some(serde_json::from_str(&payload).map_err(ClientError::from)));
                }
                Some(SseFrame::Done) => {
                    this.pending.clear();
                    *this.finished = true;
                    return Poll::Ready(None);
                }
                None => {}
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.pending.extend(this.decoder.push(&bytes)),
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(ClientError::Transport(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.pending.extend(this.decoder.finish());
                    *this.finished = true;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Fold a whole response body into `initial`, returning the final state and
/// every envelope seen. Undecodable frames are skipped.
pub async fn fold_stream<S, E>(body: S, initial: RunState) -> Result<(RunState, Vec<EventEnvelope>), ClientError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    let mut state = initial;
    let mut log = Vec::new();
    let mut events = Box::pin(EventStream::new(body));
    while let Some(item) = events.next().await {
        match item {
            Ok(envelope) => {
                state.apply(&envelope);
                log.push(envelope);
            }
            Err(ClientError::Decode(e)) => {
                tracing::warn!(error = %e, "skipping undecodable event");
            }
            Err(e) => return Err(e),
        }
    }
    Ok((state, log))
}
