//! Ergonomic client over [`Session`](crate::session::Session).
//!
//! `RadioClient` opens a session with sensible defaults and adds typed
//! helpers for the queries most controllers issue right after connecting.
pub mod client;

pub use client::{ClientError, RadioClient};
