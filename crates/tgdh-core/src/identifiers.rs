//! Core identifier types shared across the TGDH crates

use serde::{Deserialize, Serialize};
use std::fmt;

/// A member's identity, stable for the lifetime of its membership
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u64);

impl MemberId {
    /// Wrap a raw member ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// The raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "member-{}", self.0)
    }
}

impl From<u64> for MemberId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// A node's position within a key tree: level `l` from the root (root = 0)
/// and horizontal index `v` within that level, `v ∈ [0, 2^l)`.
///
/// `(l, v)` is derived from tree structure, never assigned independently;
/// `KeyTree::refresh_names` is the only place that writes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodePos {
    /// Level from the root; the root is level 0
    pub l: u32,
    /// Horizontal index within the level
    pub v: u64,
}

impl NodePos {
    /// The position of the root
    pub const ROOT: NodePos = NodePos { l: 0, v: 0 };

    /// Construct a position directly
    pub fn new(l: u32, v: u64) -> Self {
        Self { l, v }
    }

    /// This position's left child's position
    pub fn left_child(self) -> NodePos {
        NodePos::new(self.l + 1, 2 * self.v)
    }

    /// This position's right child's position
    pub fn right_child(self) -> NodePos {
        NodePos::new(self.l + 1, 2 * self.v + 1)
    }

    /// Whether this position is the left child of its parent
    pub fn is_left(self) -> bool {
        self.v % 2 == 0
    }

    /// The derived `"<l,v>"` name used on the wire and in debug output
    pub fn name(self) -> String {
        format!("<{},{}>", self.l, self.v)
    }
}

impl fmt::Display for NodePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_follow_the_binary_layout_rule() {
        let p = NodePos::new(1, 0);
        assert_eq!(p.left_child(), NodePos::new(2, 0));
        assert_eq!(p.right_child(), NodePos::new(2, 1));
    }

    #[test]
    fn name_matches_the_wire_grammar() {
        assert_eq!(NodePos::new(1, 0).name(), "<1,0>");
        assert_eq!(NodePos::ROOT.name(), "<0,0>");
    }

    #[test]
    fn is_left_matches_parity() {
        assert!(NodePos::new(2, 0).is_left());
        assert!(!NodePos::new(2, 1).is_left());
    }
}
