pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod registry;
pub mod service;
pub mod sse;
