pub mod handlers;
pub mod runs;
pub mod server;
pub mod settings;

pub use runs::{RunGuard, RunRegistry};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
pub use settings::{load_settings, IgnoredOverride, Settings, SettingsError};
