#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
//! # tgdh-session
//!
//! The per-member protocol state machine: [`session::MemberSession`] owns
//! one member's [`tgdh_tree::KeyTree`] and [`tgdh_crypto::KeyEngine`], and
//! tracks which [`session::SessionState`] it is in as join/leave events and
//! incoming blind keys arrive. A session performs no network I/O of its
//! own; `tgdh-coordinator` drives it.

pub mod session;

pub use session::{MemberSession, SessionState};
