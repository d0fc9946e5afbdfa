//! HTTP request handlers

pub mod chat;
pub mod health;

pub use chat::chat_completions;
pub use health::{health, live, metrics, providers, ready, version};
