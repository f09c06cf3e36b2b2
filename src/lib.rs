//! Conversational streaming over a retrieval-augmented generation backend.
//!
//! A prompt is admitted (rate limit, duplicate guard), persisted with a
//! streaming assistant placeholder, and then relayed token by token from the
//! backend to the client as server-sent events while the placeholder fills in.

pub mod cancellation;
pub mod config;
pub mod db;
pub mod errors;
pub mod kv;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod service;
pub mod upstream;
