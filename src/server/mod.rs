pub mod service;

pub use service::{Server, ServerOptions};
