#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
//! # tgdh-crypto
//!
//! The modular-exponentiation layer of TGDH: [`engine::KeyEngine`] turns a
//! [`tgdh_core::GroupConfig`]'s `(generator, modulus)` pair into private
//! scalar generation, blind-key publication, and the key-path fold that
//! re-derives the group key after a membership change.

pub mod engine;

pub use engine::KeyEngine;
