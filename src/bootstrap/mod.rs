//! Bootstrap layer: modules that run before any agent or dispatcher starts.
//!
//! - **identity**: ed25519 keypairs, persistence, envelope signatures.
//! - **logger**: tracing-subscriber initialisation.

pub mod identity;
pub mod logger;
