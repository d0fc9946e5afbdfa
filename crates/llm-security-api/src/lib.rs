//! HTTP front end for the LLM security gateway.
//!
//! Exposes the [`llm_security_core::SecurityGateway`] pipeline over axum,
//! plus health, provider and metrics endpoints.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod settings;
pub mod state;
pub mod telemetry;

pub use error::{ApiError, ApiResult};
pub use router::create_router;
pub use settings::Settings;
pub use state::AppState;
