//! Core domain types and traits for pushbuild.
//!
//! This crate contains:
//! - Resource identifiers and common types
//! - Push, cursor and notification types
//! - Build log, attempt and report records
//! - Trait seams for push sources, builders, command runners, reporters
//! - Storage abstractions (artifacts)

pub mod artifact;
pub mod buildlog;
pub mod error;
pub mod executor;
pub mod id;
pub mod push;
pub mod report;
pub mod source;

pub use error::{Error, Result};
pub use id::ResourceId;
