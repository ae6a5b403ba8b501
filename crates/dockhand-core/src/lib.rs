pub mod command_lexer;
pub mod command_policy;
pub mod config;
pub mod error;
pub mod output_ring;
pub mod run_guard;

pub use command_lexer::*;
pub use command_policy::*;
pub use config::*;
pub use error::*;
pub use output_ring::*;
pub use run_guard::*;

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
