//! Core Module for dbkit
//!
//! This module contains the building blocks of the connection pool library:
//! URL parsing, value and date/time types, the backend capability traits
//! and the pooled connection layer built on top of them.

pub mod backend;
pub mod datetime;
pub mod db;
pub mod error;
pub mod types;
pub mod url;

// Re-export commonly used types for convenience
pub use error::{DbError, ErrorKind, Result};
