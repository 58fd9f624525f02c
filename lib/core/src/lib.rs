//! Core domain types and utilities for keygate.
//!
//! This crate provides the identifier types and error handling foundation
//! shared by the access-control library and the web server.

pub mod error;
pub mod id;

pub use error::Result;
pub use id::{GroupId, ParseIdError, UserId};
