//! Core types, store traits, and the social graph engine for Rapport.
//!
//! The crate owns the relationship state machine together with its two
//! protective layers (rate limiting and spam flagging) and the account group
//! linker. Persistence is abstracted behind the traits in [`store`]; the
//! in-process [`memory::MemoryStore`] is one implementation, the
//! `rapport-store-sqlite` crate is another.

// Native `async fn` in traits; the store traits spell out `Send` futures
// explicitly where the engine needs them.
#![allow(async_fn_in_trait)]

pub mod account_group;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod locks;
pub mod memory;
pub mod rate_limit;
pub mod relationship;
pub mod spam;
pub mod store;

pub use error::{Error, Result};
pub use graph::SocialGraph;

/// Identifies a login identity. Authentication happens upstream; the core
/// trusts whatever user id it is handed.
pub type UserId = uuid::Uuid;

#[cfg(test)]
mod tests;
