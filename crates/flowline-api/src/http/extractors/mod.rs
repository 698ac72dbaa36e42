//! Request extractors: operator authentication and list query parameters.

pub mod auth;
pub mod query;
