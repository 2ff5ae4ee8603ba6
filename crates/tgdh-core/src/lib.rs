#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
//! # tgdh-core
//!
//! Shared error, identifier, and configuration types for the TGDH crate
//! family. Every other `tgdh-*` crate depends on this one and nothing in
//! this crate depends on the others.

pub mod config;
pub mod errors;
pub mod identifiers;

pub use config::GroupConfig;
pub use errors::{Result, TgdhError};
pub use identifiers::{MemberId, NodePos};
