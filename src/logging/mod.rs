//! Structured logging setup and log sanitization
//!
//! Plaintext API keys exist only transiently inside this layer; anything
//! that could carry one into a log line goes through `sanitize_log_message`
//! first.

pub mod sanitization;
pub mod subscriber;

pub use sanitization::sanitize_log_message;
pub use subscriber::setup_tracing;
