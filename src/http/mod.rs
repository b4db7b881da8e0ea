//! HTTP entry layer.
//!
//! Extracts the caller identity from the `userId` header, asks the admission
//! backend for a decision, and maps it to a response status.

mod routes;
mod server;

pub use routes::{router, USER_ID_HEADER};
pub use server::HttpServer;
