#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]
//! # tgdh-tree
//!
//! The TGDH key tree: [`node::KeyNode`] is pure data plus local
//! navigation, [`tree::KeyTree`] owns the set of nodes, enforces
//! structural invariants, and implements the join/leave algebra.

pub mod node;
pub mod tree;

pub use node::{KeyNode, Role};
pub use tree::{JoinOutcome, KeyTree, LeaveOutcome};
