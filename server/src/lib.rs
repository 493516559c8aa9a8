//! Agora messaging core library.
//! This crate exposes internal modules for integration testing.
//! The binary entry point is in main.rs.

pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod hub;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod proto;
pub mod registry;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;

/// Opaque user identity, owned by the external profile service.
pub type UserId = String;

pub use error::{CoreError, Result};
pub use hub::Hub;
