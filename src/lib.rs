#![doc = include_str!("../README.md")]
//! ## Feature flags
#![doc = document_features::document_features!()]
//!

// Public modules
mod common;

#[cfg(feature = "async")]
pub mod async_dht;
pub mod contacts;
pub mod db;
mod dht;
mod error;
pub mod republish;
pub mod rpc;
pub mod server;

pub use crate::common::*;
pub use bytes::Bytes;
pub use dht::{Dht, Testnet};
pub use error::Error;
pub use rpc::Config;

/// Alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
