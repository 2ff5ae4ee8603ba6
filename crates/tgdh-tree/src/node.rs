//! A single vertex of a TGDH key tree

use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use tgdh_core::{MemberId, NodePos};

/// The role a [`KeyNode`] plays in the tree.
///
/// A small closed set, encoded as a tagged variant rather than through
/// inheritance or trait objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// The unique node with no parent
    Root,
    /// A node with two children and no member identity
    Internal,
    /// A leaf carrying one member's identity and key material
    Member,
    /// A leaf temporarily responsible for refreshing and publishing a
    /// path of blind keys during a join or leave round. Cleared back to
    /// [`Role::Member`] when the round completes.
    Sponsor,
}

/// One vertex of the key tree.
///
/// `lchild`/`rchild` are owned: a parent exclusively owns its children.
/// No back-reference to the parent is stored on the node itself — callers
/// that need ancestor context go through [`crate::KeyTree`], which knows
/// how to walk down to any position from the root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyNode {
    /// This node's position within the tree
    pub pos: NodePos,
    /// This node's role
    pub role: Role,
    /// The member identity this leaf carries, if any
    pub mid: Option<MemberId>,
    /// Private scalar, known only if this observer can compute it
    pub priv_scalar: Option<BigUint>,
    /// Blind value `g^priv mod p`, publishable once known
    pub blind: Option<BigUint>,
    /// Owned left child
    pub lchild: Option<Box<KeyNode>>,
    /// Owned right child
    pub rchild: Option<Box<KeyNode>>,
}

impl KeyNode {
    /// Construct a fresh leaf with no key material yet generated
    pub fn new_leaf(pos: NodePos, role: Role, mid: Option<MemberId>) -> Self {
        Self {
            pos,
            role,
            mid,
            priv_scalar: None,
            blind: None,
            lchild: None,
            rchild: None,
        }
    }

    /// Construct a fresh internal node with the given two children
    pub fn new_internal(pos: NodePos, lchild: KeyNode, rchild: KeyNode) -> Self {
        Self {
            pos,
            role: Role::Internal,
            mid: None,
            priv_scalar: None,
            blind: None,
            lchild: Some(Box::new(lchild)),
            rchild: Some(Box::new(rchild)),
        }
    }

    /// A node with no children is a leaf, whether or not it currently
    /// carries a member identity.
    pub fn is_leaf(&self) -> bool {
        self.lchild.is_none() && self.rchild.is_none()
    }

    /// Promote this node to the Root: clear its position to `(0,0)`,
    /// set its role to Root, and wipe its key material. The caller is
    /// responsible for re-deriving the root key and for fixing up the
    /// positions of this node's descendants (`KeyTree::refresh_names`).
    pub fn make_root(&mut self) {
        self.pos = NodePos::ROOT;
        self.role = Role::Root;
        self.mid = None;
        self.priv_scalar = None;
        self.blind = None;
    }

    /// Copy `other`'s role, member identity, children, and key material
    /// into `self`, consuming `other`. `self`'s own position is left
    /// untouched — only identity and subtree structure move.
    ///
    /// Used when a sibling subtree collapses upward into its parent's
    /// slot after a leave.
    pub fn assume_identity_of(&mut self, other: KeyNode) {
        self.role = other.role;
        self.mid = other.mid;
        self.priv_scalar = other.priv_scalar;
        self.blind = other.blind;
        self.lchild = other.lchild;
        self.rchild = other.rchild;
    }

    /// Render this node and its subtree as an indented, pre-order text
    /// listing of `"<l,v>"` names, roles, and (when known) blind values
    /// in hex. Debugging aid only; not part of the correctness contract.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        self.write_text(&mut out, 0);
        out
    }

    fn write_text(&self, out: &mut String, depth: usize) {
        use std::fmt::Write as _;
        let indent = "  ".repeat(depth);
        let mid = self
            .mid
            .map(|m| format!(" mid={m}"))
            .unwrap_or_default();
        let blind = self
            .blind
            .as_ref()
            .map(|b| format!(" blind={:x}", b))
            .unwrap_or_default();
        let _ = writeln!(out, "{indent}{} {:?}{mid}{blind}", self.pos, self.role);
        if let Some(l) = &self.lchild {
            l.write_text(out, depth + 1);
        }
        if let Some(r) = &self.rchild {
            r.write_text(out, depth + 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn make_root_resets_position_and_wipes_keys() {
        let mut n = KeyNode::new_leaf(NodePos::new(2, 3), Role::Member, Some(MemberId::new(1)));
        n.priv_scalar = Some(BigUint::from(7u32));
        n.blind = Some(BigUint::from(9u32));
        n.make_root();
        assert_eq!(n.pos, NodePos::ROOT);
        assert!(matches!(n.role, Role::Root));
        assert!(n.priv_scalar.is_none());
        assert!(n.blind.is_none());
        assert!(n.mid.is_none());
    }

    #[test]
    fn assume_identity_of_copies_everything_but_position() {
        let mut target = KeyNode::new_leaf(NodePos::new(1, 0), Role::Internal, None);
        let mut donor = KeyNode::new_leaf(NodePos::new(2, 1), Role::Member, Some(MemberId::new(5)));
        donor.priv_scalar = Some(BigUint::from(11u32));
        donor.blind = Some(BigUint::from(13u32));
        let donor_pos = donor.pos;
        target.assume_identity_of(donor);
        assert_eq!(target.pos, NodePos::new(1, 0));
        assert_ne!(target.pos, donor_pos);
        assert!(matches!(target.role, Role::Member));
        assert_eq!(target.mid, Some(MemberId::new(5)));
        assert_eq!(target.priv_scalar, Some(BigUint::from(11u32)));
    }

    #[test]
    fn assume_identity_of_round_trips_through_a_fresh_pair() {
        let mut original_b = KeyNode::new_leaf(NodePos::new(2, 1), Role::Member, Some(MemberId::new(5)));
        original_b.priv_scalar = Some(BigUint::from(11u32));
        original_b.blind = Some(BigUint::from(13u32));
        let b_pos = original_b.pos;
        let b_role = original_b.role;
        let b_mid = original_b.mid;
        let b_priv = original_b.priv_scalar.clone();
        let b_blind = original_b.blind.clone();

        let mut a = KeyNode::new_leaf(NodePos::new(1, 0), Role::Internal, None);
        let a_pos = a.pos;
        a.assume_identity_of(original_b);
        assert_eq!(a.pos, a_pos, "a's own position must not move");

        // Inverse transfer: carry the identity `a` just absorbed back onto a
        // fresh node pinned at `b`'s original position, as if undoing the
        // first transfer.
        let mut restored = KeyNode::new_leaf(b_pos, Role::Internal, None);
        restored.assume_identity_of(a);

        assert_eq!(restored.pos, b_pos);
        assert_eq!(restored.role, b_role);
        assert_eq!(restored.mid, b_mid);
        assert_eq!(restored.priv_scalar, b_priv);
        assert_eq!(restored.blind, b_blind);
    }

    #[test]
    fn leaf_with_no_children_reports_is_leaf() {
        let n = KeyNode::new_leaf(NodePos::ROOT, Role::Member, Some(MemberId::new(1)));
        assert!(n.is_leaf());
    }
}
