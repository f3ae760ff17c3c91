use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use tokio::time::Sleep;

use toolstream_core::errors::GatewayError;
use toolstream_core::sse::{LineDecoder, SseFrame};

pin_project! {
    /// Wraps an upstream byte stream and yields `data:` payload frames.
    ///
    /// Ends after `SseFrame::Done` or when the body closes. A transport error
    /// or idle-timeout expiry is yielded once as `Err` and ends the stream.
    pub struct Demuxer<S> {
        #[pin]
        inner: S,
        decoder: LineDecoder,
        pending: VecDeque<SseFrame>,
        idle_deadline: Option<Pin<Box<Sleep>>>,
        idle_duration: Duration,
        finished: bool,
    }
}

impl<S> Demuxer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: LineDecoder::new(),
            pending: VecDeque::new(),
            idle_deadline: None,
            idle_duration: Duration::ZERO,
            finished: false,
        }
    }

    /// Fail the stream if no bytes arrive for `idle`. Must be called from
    /// within a tokio runtime.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_deadline = Some(Box::pin(tokio::time::sleep(idle)));
        self.idle_duration = idle;
        self
    }
}

impl<S, E> Stream for Demuxer<S>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    type Item = Result<SseFrame, GatewayError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        loop {
            if let Some(frame) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if *this.finished {
                return Poll::Ready(None);
            }

            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if let Some(deadline) = this.idle_deadline.as_mut() {
                        let next = tokio::time::Instant::now() + *this.idle_duration;
                        deadline.as_mut().reset(next);
                    }
                    this.pending.extend(this.decoder.push(&bytes));
                    if this.decoder.is_done() {
                        *this.finished = true;
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    this.pending.clear();
                    return Poll::Ready(Some(Err(GatewayError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    this.pending.extend(this.decoder.finish());
                    *this.finished = true;
                }
                Poll::Pending => {
                    if let Some(deadline) = this.idle_deadline.as_mut() {
                        if deadline.as_mut().poll(cx).is_ready() {
                            *this.finished = true;
                            return Poll::Ready(Some(Err(GatewayError::Timeout(*this.idle_duration))));
                        }
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
