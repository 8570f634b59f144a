//! e3can-core - Core models for the e3can adapter
//!
//! This crate provides the pieces shared by every other e3can crate: the
//! operation mode a device session runs in, and the `StateStore` trait
//! through which decoded values are published to the enclosing host
//! framework.

pub mod mode;
pub mod store;

pub use mode::OpMode;
pub use store::{sanitize_id, MemoryStore, StateStore};
