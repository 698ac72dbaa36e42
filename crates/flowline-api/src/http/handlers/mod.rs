//! HTTP request handlers for the REST API.

pub mod circuit;
pub mod dead_letter;
pub mod environment;
pub mod execution;
pub mod trigger;
pub mod workflow;
