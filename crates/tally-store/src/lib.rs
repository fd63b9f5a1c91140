//! Session storage for tally: the canonical session record, its TTL-backed
//! persistence, roster presence and the rules every action is checked against.

pub mod backend;
pub mod config;
pub mod error;
pub mod memory;
pub mod presence;
pub mod rules;
pub mod sqlite;
mod store;

pub use store::{SessionStore, Updated};
