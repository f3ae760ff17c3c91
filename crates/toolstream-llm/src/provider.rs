use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use toolstream_core::errors::GatewayError;
use toolstream_core::provider::{CompletionProvider, CompletionRequest, FrameStream};

use crate::converter;
use crate::demux::Demuxer;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const COMPLETIONS_PATH: &str = "/chat/completions";

/// Upstream endpoint settings.
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible API, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    pub model: String,
    pub api_key: Option<SecretString>,
    /// Fail the stream when no bytes arrive for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl ProviderConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            idle_timeout: Some(Duration::from_secs(90)),
        }
    }

    pub fn with_api_key(mut self, key: SecretString) -> Self {
        self.api_key = Some(key);
        self
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle_timeout = idle;
        self
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), COMPLETIONS_PATH)
    }
}

/// Streaming chat-completions client for OpenAI-compatible endpoints.
pub struct OpenAiProvider {
    client: Client,
    config: ProviderConfig,
    endpoint: String,
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| GatewayError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        let endpoint = config.endpoint();
        Ok(Self {
            client,
            config,
            endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, request: &CompletionRequest) -> reqwest::RequestBuilder {
        let body = converter::build_request_body(request, &self.config.model);

        let mut req = self
            .client
            .post(&self.endpoint)
            .header("accept", "text/event-stream")
            .json(&body);

        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key.expose_secret());
        }
        req
    }
}

#[async_trait]
impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.config.model
    }

    #[instrument(skip(self, request), fields(model = %self.config.model, messages = request.messages.len()))]
    async fn stream(&self, request: &CompletionRequest) -> Result<FrameStream, GatewayError> {
        let resp = self
            .build_request(request)
            .send()
            .await
            .map_err(|e| GatewayError::NetworkError(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(resp.headers());
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), "upstream rejected completion request");
            return Err(GatewayError::from_status(status.as_u16(), body).with_retry_after(retry_after));
        }

        let demux = Demuxer::new(resp.bytes_stream());
        Ok(match self.config.idle_timeout {
            Some(idle) => demux.with_idle_timeout(idle).boxed(),
            None => demux.boxed(),
        })
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
