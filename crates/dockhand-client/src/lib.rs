pub mod client;
pub mod error;
pub mod sse;
pub mod watcher;

pub use client::OrchestratorClient;
pub use error::{ClientError, Result};
pub use watcher::{JobWatcher, ReconnectPolicy, WatchEvent, WatchOutcome, WatchPhase};
