//! Session context storage

pub mod store;

pub use store::{ContextEntry, ContextSnapshot, ContextStore};
