//! Core infrastructure: shared foundation used across the whole crate.
//!
//! - **config**: configuration loading and resolved types.
//! - **error**: application-wide error enum and exit-code buckets.

pub mod config;
pub mod error;
