//! trace-migrate is a library for migrating a tenant's operational data
//! between two instances of a hosted trace/evaluation platform, preserving
//! object identity by name and rewriting cross-object references into the
//! destination's ID space.
pub mod canonical;
pub mod client;
pub mod config;
pub mod errors;
pub mod migrate;
pub mod resource;
pub mod session;
