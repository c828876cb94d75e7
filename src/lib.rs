pub mod dispatch;
pub mod error;
pub mod names;
pub mod proto;
pub mod queue;
pub mod retry;
pub mod routing;
pub mod server;
pub mod task;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use error::EmulatorError;
pub use server::{Server, ServerOptions};
