pub mod accumulator;
pub mod converter;
pub mod demux;
pub mod provider;

pub mod mock;

pub use accumulator::{AssistantTurn, DeltaAccumulator, FragmentStatus, ToolCallFragment};
pub use demux::Demuxer;
pub use mock::{MockProvider, MockResponse};
pub use provider::{OpenAiProvider, ProviderConfig};
