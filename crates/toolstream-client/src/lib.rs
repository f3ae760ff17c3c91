//! Client half of the event protocol: decode a downstream event stream and
//! fold it into renderable state.

pub mod reducer;
pub mod stream;

pub use reducer::{RunState, RunStatus, StreamingMessage, ToolCallProgress, ToolCallStatus};
pub use stream::{fold_stream, ClientError, EventStream};
