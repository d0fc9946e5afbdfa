//! Middleware layers
//!
//! ## Available Middleware
//!
//! - `request_id`: correlation id propagation (`x-request-id`)
//!
//! Tracing, CORS and body limits come from `tower-http` and are wired in
//! [`crate::router`].

pub mod request_id;

pub use request_id::{request_id_middleware, RequestId, REQUEST_ID_HEADER};
