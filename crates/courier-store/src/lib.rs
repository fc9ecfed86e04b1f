//! # courier-store
//!
//! Server-side persistence for Courier, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for users and their
//! device sessions, conversation threads, signal messages with their
//! delivery-state sets, the contact relation records and the lease table
//! behind the server's mutual-exclusion primitive.

pub mod contacts;
pub mod database;
pub mod leases;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod threads;
pub mod users;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::UnreceivedQuery;
pub use models::*;
