//! Shared helpers for the warden sandbox crates.
//!
//! The crate groups the small pieces every other crate leans on: lexical
//! path manipulation, thin filesystem wrappers, temporary file creation,
//! test environment discovery, and the canonical status type carried over
//! the comms channel.

pub mod fileops;
pub mod path;
pub mod status;
pub mod temp;
pub mod testing;

pub use status::{Status, StatusCode};
