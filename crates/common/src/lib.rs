//! Common types shared across the keygate crates.
//!
//! The engine never owns the list of hostnames it serves. That list lives in a
//! domain registry (normally a database) which the operator grows at runtime.
//! This crate defines the narrow read interface the engine needs from it, plus
//! an in-memory implementation used for standalone deployments and tests.

pub mod registry;

pub use registry::{DomainRecord, DomainRegistry, MemoryRegistry, RegistryError};
