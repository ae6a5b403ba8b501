pub mod api;
pub mod job;
pub mod stream;

pub use api::*;
pub use job::*;
pub use stream::*;
