//! # courier-shared
//!
//! Types shared by the store and the server: the signal envelope and its
//! payloads, message kinds and their push tiers, deterministic thread ids and
//! payload checksums.

pub mod constants;
pub mod digest;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::ProtocolError;
