//! HTTP surface: evaluation, mitigations, KPIs and policy operations.

pub mod request;
pub mod response;
pub mod routes;

pub use routes::{create_router, AppState};
