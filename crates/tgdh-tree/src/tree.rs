//! The key tree: structural invariants, traversal, and the join/leave algebra

use crate::node::{KeyNode, Role};
use serde::{Deserialize, Serialize};
use tgdh_core::{MemberId, NodePos, Result, TgdhError};
use tracing::{debug, instrument, warn};

/// What a completed `join` produced: who must sponsor the refresh and
/// which nodes need their keys recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The member displaced downward, now responsible for refreshing keys
    pub sponsor: MemberId,
    /// The member ID assigned to the new leaf
    pub new_mid: MemberId,
    /// Key-path of the new member; every node on it must be recomputed
    pub refresh_path: Vec<NodePos>,
}

/// What a completed `leave` produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// The member responsible for refreshing keys along `refresh_path`
    pub sponsor: MemberId,
    /// Key-path of the sponsor; every node on it must be recomputed
    pub refresh_path: Vec<NodePos>,
}

/// Owns the set of [`KeyNode`]s that make up one member's view of the
/// group's key tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyTree {
    root: KeyNode,
    next_mid: MemberId,
}

impl KeyTree {
    /// Build the initial tree for a group of `size` members, identifying
    /// `my_uid` as one of them.
    ///
    /// The shape is produced by repeatedly subdividing the shallowest
    /// rightmost leaf until `2*size - 1` nodes exist, and member IDs are
    /// assigned by the member-id layout rule so that every member in the
    /// group derives the same mapping independently.
    #[instrument(skip_all, fields(size, my_uid = my_uid.get()))]
    pub fn build(size: u64, my_uid: MemberId) -> Result<KeyTree> {
        if size == 0 {
            return Err(TgdhError::protocol_state("group size must be at least 1"));
        }
        if size == 1 {
            let mut root = KeyNode::new_leaf(NodePos::ROOT, Role::Root, None);
            root.role = Role::Member;
            root.mid = Some(my_uid);
            return Ok(KeyTree {
                root,
                next_mid: MemberId::new(2),
            });
        }

        let nodemax = 2 * size - 1;
        let mut root = KeyNode::new_leaf(NodePos::ROOT, Role::Root, None);
        let mut nodetrack = 1u64;
        while nodetrack != nodemax {
            walk_tree_build(&mut root, &mut nodetrack, nodemax);
        }

        assign_leaf_roles(&mut root);

        let height = floor_log2(nodemax - 1);
        let layout = member_id_layout(size, height);
        let mut cursor = 0usize;
        assign_member_ids(&mut root, &layout, &mut cursor);

        debug!(nodemax, height, "built initial key tree");

        Ok(KeyTree {
            root,
            next_mid: MemberId::new(size + 1),
        })
    }

    /// The next member ID that will be assigned by `join`.
    pub fn next_mid(&self) -> MemberId {
        self.next_mid
    }

    /// This member's root node (read-only).
    pub fn root(&self) -> &KeyNode {
        &self.root
    }

    /// Look up a node by member ID.
    pub fn find_by_mid(&self, mid: MemberId) -> Option<&KeyNode> {
        find_by_mid(&self.root, mid)
    }

    fn find_by_mid_mut(&mut self, mid: MemberId) -> Option<&mut KeyNode> {
        find_by_mid_mut(&mut self.root, mid)
    }

    /// Look up a node by its `(l, v)` position.
    pub fn find_by_pos(&self, pos: NodePos) -> Option<&KeyNode> {
        descend(&self.root, pos)
    }

    fn find_by_pos_mut(&mut self, pos: NodePos) -> Option<&mut KeyNode> {
        descend_mut(&mut self.root, pos)
    }

    /// Every leaf, left to right.
    pub fn leaves(&self) -> Vec<&KeyNode> {
        let mut out = Vec::new();
        collect_leaves(&self.root, &mut out);
        out
    }

    /// The rightmost node on the shallowest level among current leaves;
    /// this is where a joining member attaches. Ties broken by the
    /// largest `v`.
    pub fn insertion_point(&self) -> Option<NodePos> {
        let leaves = self.leaves();
        let shallowest = leaves.iter().map(|n| n.pos.l).min()?;
        leaves
            .into_iter()
            .filter(|n| n.pos.l == shallowest)
            .map(|n| n.pos)
            .max_by_key(|pos| pos.v)
    }

    /// The key-path from `target` up to and including the Root, target
    /// first.
    pub fn path_to_root(&self, target: NodePos) -> Option<Vec<NodePos>> {
        let mut root_order = self.root_to_target(target)?;
        root_order.reverse();
        Some(root_order)
    }

    /// The co-path of `target`: for each node on its key-path except the
    /// Root, that node's sibling, in the same order as `path_to_root`.
    pub fn co_path(&self, target: NodePos) -> Option<Vec<NodePos>> {
        let root_order = self.root_to_target(target)?;
        let mut co = Vec::with_capacity(root_order.len().saturating_sub(1));
        for pair in root_order.windows(2) {
            let (parent_pos, child_pos) = (pair[0], pair[1]);
            let parent = self.find_by_pos(parent_pos)?;
            let sibling = if child_pos.is_left() {
                parent.rchild.as_deref()?
            } else {
                parent.lchild.as_deref()?
            };
            co.push(sibling.pos);
        }
        co.reverse();
        Some(co)
    }

    /// `target`'s sibling position, or `None` if `target` is the Root.
    pub fn sibling(&self, target: NodePos) -> Option<NodePos> {
        if target.l == 0 {
            return None;
        }
        let parent_pos = NodePos::new(target.l - 1, target.v / 2);
        let parent = self.find_by_pos(parent_pos)?;
        let sibling = if target.is_left() {
            parent.rchild.as_deref()?
        } else {
            parent.lchild.as_deref()?
        };
        Some(sibling.pos)
    }

    fn root_to_target(&self, target: NodePos) -> Option<Vec<NodePos>> {
        let mut positions = Vec::with_capacity(target.l as usize + 1);
        let mut current = &self.root;
        positions.push(current.pos);
        if target.l == 0 {
            return (current.pos == target).then_some(positions);
        }
        for depth in 1..=target.l {
            let bit = (target.v >> (target.l - depth)) & 1;
            let next = if bit == 0 {
                current.lchild.as_deref()
            } else {
                current.rchild.as_deref()
            };
            current = next?;
            positions.push(current.pos);
        }
        (current.pos == target).then_some(positions)
    }

    /// Re-derive every node's `(l, v)` from its parent. Required after
    /// any structural mutation, since position is derived, not stored
    /// independently of shape.
    pub fn refresh_names(&mut self) {
        self.root.pos = NodePos::ROOT;
        refresh_subtree(&mut self.root);
    }

    /// Attach a new member at the insertion point, displacing its current
    /// occupant one level down and designating that occupant the sponsor
    /// of the refresh.
    #[instrument(skip(self))]
    pub fn join(&mut self) -> Result<JoinOutcome> {
        let new_mid = self.next_mid;
        let insertion_pos = self
            .insertion_point()
            .ok_or_else(|| TgdhError::protocol_state("tree has no leaves to insert at"))?;

        let occupant = self.find_by_pos(insertion_pos).expect("insertion point exists");
        let (old_mid, old_priv, old_blind) = (
            occupant.mid,
            occupant.priv_scalar.clone(),
            occupant.blind.clone(),
        );
        let sponsor = old_mid.ok_or_else(|| {
            TgdhError::protocol_state("insertion point had no member to displace")
        })?;

        let l_pos = insertion_pos.left_child();
        let r_pos = insertion_pos.right_child();
        let mut displaced = KeyNode::new_leaf(l_pos, Role::Sponsor, old_mid);
        displaced.priv_scalar = old_priv;
        displaced.blind = old_blind;
        let incoming = KeyNode::new_leaf(r_pos, Role::Member, Some(new_mid));

        let target = self
            .find_by_pos_mut(insertion_pos)
            .expect("insertion point exists");
        target.mid = None;
        target.priv_scalar = None;
        target.blind = None;
        target.role = Role::Internal;
        target.lchild = Some(Box::new(displaced));
        target.rchild = Some(Box::new(incoming));

        self.refresh_names();
        let refresh_path = self
            .path_to_root(r_pos)
            .ok_or_else(|| TgdhError::protocol_state("new member has no path to root"))?;

        self.next_mid = MemberId::new(new_mid.get() + 1);
        debug!(sponsor = sponsor.get(), new_mid = new_mid.get(), "join applied");

        Ok(JoinOutcome {
            sponsor,
            new_mid,
            refresh_path,
        })
    }

    /// Remove a member's leaf, promoting or collapsing the tree as
    /// required, and designate the sponsor of the refresh.
    ///
    /// Returns `Err(TgdhError::GroupEmpty)` once the mutation leaves at
    /// most one member in the tree; the tree itself is still mutated
    /// consistently in that case.
    #[instrument(skip(self), fields(mid = mid.get()))]
    pub fn leave(&mut self, mid: MemberId) -> Result<LeaveOutcome> {
        let leaf_pos = self
            .find_by_mid(mid)
            .map(|n| n.pos)
            .ok_or_else(|| TgdhError::invalid_member(mid.get(), "no leaf carries this member id"))?;

        if leaf_pos.l == 0 {
            return Err(TgdhError::protocol_state(
                "cannot remove the sole remaining member",
            ));
        }

        let parent_pos = NodePos::new(leaf_pos.l - 1, leaf_pos.v / 2);
        let sponsor_pos = if parent_pos == NodePos::ROOT {
            let lchild = self.root.lchild.take();
            let rchild = self.root.rchild.take();
            let (leaving, sibling) = if leaf_pos.is_left() {
                (lchild, rchild)
            } else {
                (rchild, lchild)
            };
            drop(leaving);
            let mut sibling = *sibling
                .ok_or_else(|| TgdhError::protocol_state("root is missing a child"))?;
            sibling.make_root();
            self.root = sibling;
            self.refresh_names();
            rightmost_leaf_pos(&self.root)
        } else {
            let parent = self
                .find_by_pos_mut(parent_pos)
                .ok_or_else(|| TgdhError::protocol_state("leaving member's parent is missing"))?;
            let lchild = parent.lchild.take();
            let rchild = parent.rchild.take();
            let (leaving, sibling) = if leaf_pos.is_left() {
                (lchild, rchild)
            } else {
                (rchild, lchild)
            };
            drop(leaving);
            let sibling =
                *sibling.ok_or_else(|| TgdhError::protocol_state("leaving member has no sibling"))?;
            parent.assume_identity_of(sibling);
            self.refresh_names();
            let collapsed = self.find_by_pos(parent_pos).expect("parent still present");
            rightmost_leaf_pos(collapsed)
        };

        if let Some(sponsor_node) = self.find_by_pos_mut(sponsor_pos) {
            if !matches!(sponsor_node.role, Role::Root) {
                sponsor_node.role = Role::Sponsor;
            }
        }

        let sponsor_node = self.find_by_pos(sponsor_pos).expect("sponsor position exists");
        let sponsor = sponsor_node
            .mid
            .ok_or_else(|| TgdhError::protocol_state("sponsor position has no member"))?;
        let refresh_path = self
            .path_to_root(sponsor_pos)
            .ok_or_else(|| TgdhError::protocol_state("sponsor has no path to root"))?;

        let remaining = self.leaves().iter().filter(|n| n.mid.is_some()).count();
        if remaining <= 1 {
            warn!(remaining, "group is empty after leave");
            return Err(TgdhError::group_empty(format!(
                "{remaining} member(s) remain"
            )));
        }

        debug!(sponsor = sponsor.get(), "leave applied");
        Ok(LeaveOutcome {
            sponsor,
            refresh_path,
        })
    }

    /// Write a node's key material. The sanctioned write path for
    /// [`crate::tree::KeyTree`] key fields outside of `join`/`leave`:
    /// `KeyEngine` is the only other caller.
    pub fn set_node_keys(
        &mut self,
        pos: NodePos,
        priv_scalar: Option<num_bigint::BigUint>,
        blind: Option<num_bigint::BigUint>,
    ) -> Result<()> {
        let node = self
            .find_by_pos_mut(pos)
            .ok_or_else(|| TgdhError::protocol_state(format!("no node at {pos}")))?;
        node.priv_scalar = priv_scalar;
        node.blind = blind;
        Ok(())
    }

    /// A full structural copy of this tree suitable for handing to a
    /// freshly joined member, with the sponsor's private scalar scrubbed
    /// so the new member never learns it merely by receiving the
    /// snapshot.
    pub fn snapshot_for_new_member(&self, sponsor_mid: MemberId) -> KeyTree {
        let mut copy = self.clone();
        if let Some(node) = copy.find_by_mid_mut(sponsor_mid) {
            node.priv_scalar = None;
        }
        copy
    }

    /// Render the tree as indented text for debugging; not part of the
    /// correctness contract.
    pub fn to_text(&self) -> String {
        self.root.to_text()
    }
}

fn walk_tree_build(node: &mut KeyNode, nodetrack: &mut u64, nodemax: u64) {
    if !node.is_leaf() {
        walk_tree_build(node.rchild.as_deref_mut().expect("internal node has rchild"), nodetrack, nodemax);
        if *nodetrack != nodemax {
            walk_tree_build(node.lchild.as_deref_mut().expect("internal node has lchild"), nodetrack, nodemax);
        }
    } else {
        let lpos = node.pos.left_child();
        let rpos = node.pos.right_child();
        node.lchild = Some(Box::new(KeyNode::new_leaf(lpos, Role::Internal, None)));
        node.rchild = Some(Box::new(KeyNode::new_leaf(rpos, Role::Internal, None)));
        *nodetrack += 2;
    }
}

fn assign_leaf_roles(node: &mut KeyNode) {
    if node.is_leaf() {
        if !matches!(node.role, Role::Root) {
            node.role = Role::Member;
        }
        return;
    }
    if let Some(l) = node.lchild.as_deref_mut() {
        assign_leaf_roles(l);
    }
    if let Some(r) = node.rchild.as_deref_mut() {
        assign_leaf_roles(r);
    }
}

fn assign_member_ids(node: &mut KeyNode, layout: &[u64], cursor: &mut usize) {
    if node.is_leaf() {
        node.mid = Some(MemberId::new(layout[*cursor]));
        *cursor += 1;
        return;
    }
    if let Some(l) = node.lchild.as_deref_mut() {
        assign_member_ids(l, layout, cursor);
    }
    if let Some(r) = node.rchild.as_deref_mut() {
        assign_member_ids(r, layout, cursor);
    }
}

/// The member-ID layout rule: start from `[1, 2]`, interleave in a
/// descending block at every extra level, then strike every value that
/// exceeds `size`. Deterministic for a given `(size, height)`; the tests
/// below pin it for several sizes.
fn member_id_layout(size: u64, height: u32) -> Vec<u64> {
    let mut baselist: Vec<u64> = vec![1, 2];
    if height >= 1 {
        for i in 0..height.saturating_sub(1) {
            let top = 2u64.pow(i + 2);
            let bottom = top - 2u64.pow(i + 1) + 1;
            let newlist: Vec<u64> = (bottom..=top).rev().collect();
            baselist = interleave(&baselist, &newlist);
        }
    }
    let max_size = 2u64.pow(height);
    let rm_count = max_size.saturating_sub(size);
    if rm_count > 0 {
        let bottom = max_size - rm_count + 1;
        for num in (bottom..=max_size).rev() {
            if let Some(idx) = baselist.iter().position(|&x| x == num) {
                baselist.remove(idx);
            }
        }
    }
    baselist
}

fn interleave(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    for (x, y) in a.iter().zip(b.iter()) {
        out.push(*x);
        out.push(*y);
    }
    out
}

fn floor_log2(x: u64) -> u32 {
    debug_assert!(x >= 1);
    63 - x.leading_zeros()
}

fn find_by_mid(node: &KeyNode, mid: MemberId) -> Option<&KeyNode> {
    if node.mid == Some(mid) {
        return Some(node);
    }
    node.lchild
        .as_deref()
        .and_then(|l| find_by_mid(l, mid))
        .or_else(|| node.rchild.as_deref().and_then(|r| find_by_mid(r, mid)))
}

fn find_by_mid_mut(node: &mut KeyNode, mid: MemberId) -> Option<&mut KeyNode> {
    if node.mid == Some(mid) {
        return Some(node);
    }
    if let Some(l) = node.lchild.as_deref_mut() {
        if let Some(found) = find_by_mid_mut(l, mid) {
            return Some(found);
        }
    }
    if let Some(r) = node.rchild.as_deref_mut() {
        if let Some(found) = find_by_mid_mut(r, mid) {
            return Some(found);
        }
    }
    None
}

fn descend(node: &KeyNode, pos: NodePos) -> Option<&KeyNode> {
    let mut current = node;
    if pos.l == 0 {
        return (current.pos == pos).then_some(current);
    }
    for depth in 1..=pos.l {
        let bit = (pos.v >> (pos.l - depth)) & 1;
        current = if bit == 0 {
            current.lchild.as_deref()?
        } else {
            current.rchild.as_deref()?
        };
    }
    (current.pos == pos).then_some(current)
}

fn descend_mut(node: &mut KeyNode, pos: NodePos) -> Option<&mut KeyNode> {
    let mut current = node;
    if pos.l == 0 {
        return (current.pos == pos).then_some(current);
    }
    for depth in 1..=pos.l {
        let bit = (pos.v >> (pos.l - depth)) & 1;
        current = if bit == 0 {
            current.lchild.as_deref_mut()?
        } else {
            current.rchild.as_deref_mut()?
        };
    }
    (current.pos == pos).then_some(current)
}

fn collect_leaves<'a>(node: &'a KeyNode, out: &mut Vec<&'a KeyNode>) {
    if node.is_leaf() {
        out.push(node);
        return;
    }
    if let Some(l) = node.lchild.as_deref() {
        collect_leaves(l, out);
    }
    if let Some(r) = node.rchild.as_deref() {
        collect_leaves(r, out);
    }
}

fn refresh_subtree(node: &mut KeyNode) {
    let pos = node.pos;
    if let Some(l) = node.lchild.as_deref_mut() {
        l.pos = pos.left_child();
        refresh_subtree(l);
    }
    if let Some(r) = node.rchild.as_deref_mut() {
        r.pos = pos.right_child();
        refresh_subtree(r);
    }
}

fn rightmost_leaf_pos(node: &KeyNode) -> NodePos {
    let mut current = node;
    while !current.is_leaf() {
        current = current
            .rchild
            .as_deref()
            .or(current.lchild.as_deref())
            .expect("internal node has a child");
    }
    current.pos
}
