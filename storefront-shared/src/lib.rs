//! # Storefront Shared Library
//!
//! This crate contains the database access core and the repositories used by
//! the Storefront API server.
//!
//! ## Module Organization
//!
//! - `db`: configuration, connection pool, query execution and transactions
//! - `models`: database models and their persistence operations

pub mod db;
pub mod models;

/// Current version of the Storefront shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
