use toolstream_core::errors::GatewayError;

use crate::emitter::SinkClosed;

/// Run-level failures. Each one ends the run; all but `SinkClosed` are
/// reported to the client as RUN_ERROR with [`EngineError::code`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{0}")]
    Gateway(#[from] GatewayError),

    #[error("completion ended without an assistant message")]
    MissingAssistantMessage,

    #[error("run exceeded {0} rounds")]
    MaxRoundsExceeded(u32),

    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    SinkClosed(#[from] SinkClosed),
}

impl EngineError {
    /// Machine-readable code carried by RUN_ERROR.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Gateway(e) => e.error_kind(),
            Self::MissingAssistantMessage => "missing_assistant_message",
            Self::MaxRoundsExceeded(_) => "max_rounds_exceeded",
            Self::Cancelled | Self::SinkClosed(_) => "cancelled",
        }
    }
}
