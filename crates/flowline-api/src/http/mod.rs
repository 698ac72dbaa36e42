//! HTTP/REST API layer for Flowline.
//!
//! Axum-based REST API at `/api/v1/`: trigger ingestion (optionally HMAC
//! signed) and the operator interface (bearer token), with envelope
//! responses.

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod response;
pub mod router;
