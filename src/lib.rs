// Re-export modules for the binary and the integration tests
pub mod channel;
pub mod client;
pub mod config;
pub mod conversations;
pub mod error;
pub mod models;
pub mod presence;
pub mod records;
pub mod stream;
pub mod typing;
pub mod windows;

// Re-export main types for convenience
pub use client::ChatClient;
pub use models::*;
