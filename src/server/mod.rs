//! HTTP harness for driving the manager standalone.
//!
//! - [`http`]: request/response types and route handlers for
//!   `/v1/append`, `/health`, `/v1/cache/stats`.

pub mod http;

pub use http::{build_router, AppState};
