pub mod emitter;
pub mod error;
pub mod registry;
pub mod runner;
pub mod tools;

pub use emitter::{ChannelEmitter, CollectingSink, EventSink, SinkClosed, TypingConfig};
pub use error::EngineError;
pub use registry::{ToolListing, ToolRegistry, ToolSource};
pub use runner::{Conversation, RunSummary, Runner, RunnerConfig};
