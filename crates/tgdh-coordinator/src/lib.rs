#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
//! # tgdh-coordinator
//!
//! Transport-facing plumbing for TGDH: the [`messenger::Messenger`] trait
//! any transport must satisfy, an in-process implementation for tests, the
//! wire codec for blind-key announcements, and [`coordinator::GroupCoordinator`],
//! which drives the level-by-level key exchange schedule for the initial
//! group, a join, or a leave.

pub mod coordinator;
pub mod messenger;
pub mod wire;

pub use coordinator::{default_aliases, AliasMap, GroupCoordinator};
pub use messenger::{InProcessMessenger, Messenger, Payload};
