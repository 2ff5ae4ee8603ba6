//! One member's view of the protocol: its tree, its key engine, and the
//! state machine that governs which events it may currently act on.

use num_bigint::BigUint;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tgdh_core::{GroupConfig, MemberId, NodePos, Result, TgdhError};
use tgdh_crypto::KeyEngine;
use tgdh_tree::{KeyTree, Role};
use tracing::{debug, instrument, warn};

/// The state a [`MemberSession`] is currently in. See the module-level
/// diagram in this crate's documentation for the transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Idle, able to react to `join`/`leave` events from the group
    Ready,
    /// This member was elected sponsor of the current refresh round
    Sponsor,
    /// This member just joined and is waiting on the sponsor's blind key
    NewMem,
    /// Terminal: `GroupEmpty` or an unrecoverable transport failure
    Closed,
}

/// Per-member protocol state: owns the [`KeyTree`] exclusively, delegates
/// all modular arithmetic to [`KeyEngine`], and tracks [`SessionState`].
///
/// A session never performs network I/O itself — it computes what to
/// publish and consumes what it is told was received. A `GroupCoordinator`
/// (see `tgdh-coordinator`) is responsible for the actual message passing.
#[derive(Debug, Clone)]
pub struct MemberSession {
    my_mid: MemberId,
    tree: KeyTree,
    engine: KeyEngine,
    rng: ChaCha20Rng,
    state: SessionState,
}

impl MemberSession {
    /// Build the initial tree for a group of `size` members, identify
    /// `my_uid` within it, and generate this member's own leaf keys.
    /// Does not perform the initial key exchange; that is the
    /// `GroupCoordinator`'s job, driving this session's `receive_blind`
    /// and `derive_one_level` methods level by level.
    #[instrument(skip(config), fields(size, my_uid = my_uid.get()))]
    pub fn initialise(config: &GroupConfig, size: u64, my_uid: MemberId) -> Result<Self> {
        let engine = KeyEngine::new(config)?;
        let tree = KeyTree::build(size, my_uid)?;
        let mut rng = match config.rng_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        let leaf_pos = tree
            .find_by_mid(my_uid)
            .map(|n| n.pos)
            .ok_or_else(|| TgdhError::protocol_state("my_uid has no leaf in the built tree"))?;

        let mut session = Self {
            my_mid: my_uid,
            tree,
            engine,
            rng,
            state: SessionState::Ready,
        };
        session.generate_and_store_leaf_keys(leaf_pos)?;
        Ok(session)
    }

    /// A brand-new member awaiting the sponsor's tree snapshot: holds its
    /// own identity and a fresh cryptographic engine, but no group state
    /// yet. Call [`Self::on_tree_received`] once the snapshot arrives.
    #[instrument(skip(config), fields(my_uid = my_uid.get()))]
    pub fn awaiting_join(config: &GroupConfig, my_uid: MemberId) -> Result<Self> {
        let engine = KeyEngine::new(config)?;
        let tree = KeyTree::build(1, my_uid)?;
        let rng = match config.rng_seed {
            Some(seed) => ChaCha20Rng::seed_from_u64(seed),
            None => ChaCha20Rng::from_entropy(),
        };
        Ok(Self {
            my_mid: my_uid,
            tree,
            engine,
            rng,
            state: SessionState::NewMem,
        })
    }

    fn generate_and_store_leaf_keys(&mut self, pos: NodePos) -> Result<()> {
        let priv_scalar = self.engine.gen_private(&mut self.rng);
        let blind = self.engine.gen_blind(&priv_scalar);
        self.tree.set_node_keys(pos, Some(priv_scalar), Some(blind))?;
        Ok(())
    }

    /// This session's current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// This member's own identity.
    pub fn my_mid(&self) -> MemberId {
        self.my_mid
    }

    /// Read-only access to the local tree.
    pub fn tree(&self) -> &KeyTree {
        &self.tree
    }

    /// This member's own leaf position; `None` only after the member has
    /// been removed from its own view (shouldn't normally be observed).
    pub fn leaf_pos(&self) -> Option<NodePos> {
        self.tree.find_by_mid(self.my_mid).map(|n| n.pos)
    }

    /// The group key, if this session has derived it all the way to the
    /// Root.
    pub fn group_key(&self) -> Option<&BigUint> {
        self.tree.root().priv_scalar.as_ref()
    }

    /// The blind value published (or publishable) at `pos`, for handing to
    /// a coordinator to send on the wire.
    pub fn blind_at(&self, pos: NodePos) -> Option<BigUint> {
        self.tree.find_by_pos(pos).and_then(|n| n.blind.clone())
    }

    /// Record a blind value learned from a peer at `pos`. Does not advance
    /// derivation; call `derive_one_level` once all of a level's inputs
    /// have arrived.
    #[instrument(skip(self, blind), fields(pos = %pos))]
    pub fn receive_blind(&mut self, pos: NodePos, blind: BigUint) -> Result<()> {
        self.engine.validate_blind(&blind)?;
        let existing_priv = self.tree.find_by_pos(pos).and_then(|n| n.priv_scalar.clone());
        self.tree.set_node_keys(pos, existing_priv, Some(blind))?;
        Ok(())
    }

    /// Fold one level of this member's key-path, starting at `current_pos`.
    /// Returns the parent position now holding the freshly derived key, so
    /// the caller can loop until it reaches the Root.
    pub fn derive_one_level(&mut self, current_pos: NodePos) -> Result<NodePos> {
        self.engine.derive_one_level(&mut self.tree, current_pos)
    }

    /// A freshly joined member locates itself and adopts the snapshot of
    /// the tree handed to it by the sponsor, then generates its own leaf
    /// keys and enters `NewMem`, awaiting the sponsor's blind key.
    #[instrument(skip(self, tree))]
    pub fn on_tree_received(&mut self, tree: KeyTree, my_mid: MemberId) -> Result<()> {
        self.tree = tree;
        self.my_mid = my_mid;
        let pos = self
            .tree
            .find_by_mid(my_mid)
            .map(|n| n.pos)
            .ok_or_else(|| TgdhError::protocol_state("snapshot has no leaf for the new member"))?;
        self.generate_and_store_leaf_keys(pos)?;
        self.state = SessionState::NewMem;
        Ok(())
    }

    /// Apply a join locally. If this session's own node was the insertion
    /// point's occupant, it becomes the Sponsor and is responsible for
    /// publishing the refreshed path. Otherwise it stays Ready and waits
    /// for blind keys to arrive on the intersection of its co-path with
    /// the refresh path.
    #[instrument(skip(self))]
    pub fn on_join_event(&mut self) -> Result<tgdh_tree::JoinOutcome> {
        self.require_not_closed()?;
        let outcome = self.tree.join()?;
        if outcome.sponsor == self.my_mid {
            self.state = SessionState::Sponsor;
            let sponsor_pos = self
                .tree
                .find_by_mid(self.my_mid)
                .map(|n| n.pos)
                .ok_or_else(|| TgdhError::protocol_state("sponsor has no leaf after join"))?;
            self.generate_and_store_leaf_keys(sponsor_pos)?;
            debug!("became sponsor of join round");
        }
        Ok(outcome)
    }

    /// Apply a leave locally. If this session's own node is the elected
    /// sponsor, generate a fresh leaf key and move to `Sponsor`.
    /// `GroupEmpty` closes the session.
    #[instrument(skip(self), fields(mid = mid.get()))]
    pub fn on_leave_event(&mut self, mid: MemberId) -> Result<tgdh_tree::LeaveOutcome> {
        self.require_not_closed()?;
        match self.tree.leave(mid) {
            Ok(outcome) => {
                if outcome.sponsor == self.my_mid {
                    self.state = SessionState::Sponsor;
                    let sponsor_pos = self
                        .tree
                        .find_by_mid(self.my_mid)
                        .map(|n| n.pos)
                        .ok_or_else(|| TgdhError::protocol_state("sponsor has no leaf after leave"))?;
                    self.generate_and_store_leaf_keys(sponsor_pos)?;
                    debug!("became sponsor of leave round");
                }
                Ok(outcome)
            }
            Err(err @ TgdhError::GroupEmpty { .. }) => {
                warn!("closing session: group is empty");
                self.state = SessionState::Closed;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Called once a refresh round (join or leave) has finished deriving
    /// all the way to the Root: a Sponsor or NewMem returns to `Ready`.
    pub fn finish_round(&mut self) {
        if matches!(self.state, SessionState::Sponsor | SessionState::NewMem) {
            self.state = SessionState::Ready;
        }
    }

    /// A structural copy of this session's tree suitable for handing to a
    /// freshly joined member, with this member's own private scalar
    /// scrubbed. Only meaningful while this session is `Sponsor`.
    pub fn snapshot_for_new_member(&self) -> KeyTree {
        self.tree.snapshot_for_new_member(self.my_mid)
    }

    /// Whether this node currently carries the `Sponsor` role in the tree.
    pub fn is_sponsor(&self) -> bool {
        self.leaf_pos()
            .and_then(|pos| self.tree.find_by_pos(pos))
            .map(|n| matches!(n.role, Role::Sponsor))
            .unwrap_or(false)
    }

    fn require_not_closed(&self) -> Result<()> {
        if matches!(self.state, SessionState::Closed) {
            return Err(TgdhError::protocol_state("session is closed"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GroupConfig {
        GroupConfig {
            rng_seed: Some(42),
            ..GroupConfig::default()
        }
    }

    #[test]
    fn initialise_generates_this_members_own_leaf_keys() {
        let session = MemberSession::initialise(&config(), 3, MemberId::new(2)).unwrap();
        let pos = session.leaf_pos().unwrap();
        assert!(session.blind_at(pos).is_some());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn two_member_group_can_derive_the_shared_root_key_by_hand() {
        let cfg = config();
        let mut one = MemberSession::initialise(&cfg, 2, MemberId::new(1)).unwrap();
        let mut two = MemberSession::initialise(&cfg, 2, MemberId::new(1)).unwrap();

        let pos1 = one.leaf_pos().unwrap();
        let pos2 = two.leaf_pos().unwrap();
        assert_ne!(pos1, pos2);

        let blind1 = one.blind_at(pos1).unwrap();
        let blind2 = two.blind_at(pos2).unwrap();
        one.receive_blind(pos2, blind2).unwrap();
        two.receive_blind(pos1, blind1).unwrap();

        let root1 = one.derive_one_level(pos1).unwrap();
        let root2 = two.derive_one_level(pos2).unwrap();
        assert_eq!(root1, NodePos::ROOT);
        assert_eq!(root2, NodePos::ROOT);
        assert_eq!(one.group_key(), two.group_key());
    }

    #[test]
    fn on_join_event_makes_the_displaced_member_the_sponsor() {
        let cfg = config();
        let mut session = MemberSession::initialise(&cfg, 2, MemberId::new(2)).unwrap();
        let outcome = session.on_join_event().unwrap();
        assert_eq!(outcome.sponsor, MemberId::new(2));
        assert_eq!(session.state(), SessionState::Sponsor);
        assert!(session.is_sponsor());
    }

    #[test]
    fn on_leave_event_closes_the_session_when_the_group_becomes_empty() {
        let cfg = config();
        let mut session = MemberSession::initialise(&cfg, 2, MemberId::new(1)).unwrap();
        let err = session.on_leave_event(MemberId::new(2)).unwrap_err();
        assert!(matches!(err, TgdhError::GroupEmpty { .. }));
        assert_eq!(session.state(), SessionState::Closed);
        let err = session.on_leave_event(MemberId::new(1)).unwrap_err();
        assert!(matches!(err, TgdhError::ProtocolState { .. }));
    }

    #[test]
    fn finish_round_returns_sponsor_and_new_member_to_ready() {
        let cfg = config();
        let mut session = MemberSession::initialise(&cfg, 2, MemberId::new(2)).unwrap();
        session.on_join_event().unwrap();
        assert_eq!(session.state(), SessionState::Sponsor);
        session.finish_round();
        assert_eq!(session.state(), SessionState::Ready);
    }
}
