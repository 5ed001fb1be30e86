//! HTTP surface: the axum router, error mapping and archive endpoints.

pub mod archive;
pub mod handler;
