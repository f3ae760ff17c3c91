use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::GatewayError;
use crate::messages::Message;
use crate::sse::SseFrame;
use crate::tools::ToolDefinition;

/// Demultiplexed upstream stream: payload frames until `Done` or close,
/// or a transport failure.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<SseFrame, GatewayError>> + Send>>;

/// Everything one round sends upstream.
#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
}

/// An upstream streaming completion endpoint.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// Issue one streaming completion. A non-2xx status or connection
    /// failure is returned here; failures after the stream opened arrive
    /// as `Err` items.
    async fn stream(&self, request: &CompletionRequest) -> Result<FrameStream, GatewayError>;
}
