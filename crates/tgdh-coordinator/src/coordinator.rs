//! Drives the level-by-level key exchange schedule across a group of
//! [`MemberSession`]s, using a [`Messenger`] for transport and an explicit
//! acknowledgement-count barrier as the per-round synchronization point.
//!
//! The key tree is rarely balanced, so two members can be a different
//! number of levels from the Root. Rather than re-synchronizing at every
//! absolute tree level (which would need a differently-sized barrier per
//! level), every participant subscribes to everything it will ever need to
//! receive *before* a single shared barrier releases the round; after that
//! point each participant's publish/await/derive loop proceeds
//! independently; no message can be published before its subscriber
//! exists, however uneven the two sides' paths are.

use crate::messenger::{Messenger, Payload};
use std::collections::HashMap;
use std::sync::Arc;
use tgdh_core::{MemberId, NodePos, Result, TgdhError};
use tgdh_session::MemberSession;
use tgdh_tree::KeyTree;
use tokio::sync::Barrier;
use tracing::{debug, instrument};

/// A group's publishing alias for every member, stable for the session's
/// lifetime. Canonically `"member-{id}"`, matching `MemberId`'s `Display`.
pub type AliasMap = HashMap<MemberId, String>;

/// Derive the default alias map for a set of member ids.
pub fn default_aliases(members: impl IntoIterator<Item = MemberId>) -> AliasMap {
    members.into_iter().map(|m| (m, m.to_string())).collect()
}

/// One step of a member's climb toward the Root: the key-path node it
/// already holds a value for, and that node's sibling whose blind must be
/// folded in to produce the next key-path node up.
struct Step {
    current_pos: NodePos,
    sibling_pos: NodePos,
    owner_alias: String,
}

/// Drives the key-exchange schedule for one member's [`MemberSession`]
/// over a shared [`Messenger`].
pub struct GroupCoordinator<M: Messenger + ?Sized> {
    messenger: Arc<M>,
}

impl<M: Messenger + ?Sized> GroupCoordinator<M> {
    /// Build a coordinator over a shared transport.
    pub fn new(messenger: Arc<M>) -> Self {
        Self { messenger }
    }

    /// Run the full initial key exchange for one member. `barrier` must be
    /// shared by (and sized to) every member participating in this round;
    /// every member calls this method once, concurrently.
    #[instrument(skip(self, session, aliases, barrier))]
    pub async fn run_initial_exchange(
        &self,
        session: &mut MemberSession,
        aliases: &AliasMap,
        barrier: Arc<Barrier>,
    ) -> Result<()> {
        let start_pos = session
            .leaf_pos()
            .ok_or_else(|| TgdhError::protocol_state("session has no leaf position"))?;
        self.run_climb(session, aliases, barrier, start_pos).await?;
        debug!("initial key exchange complete");
        Ok(())
    }

    /// Run the reduced join-time schedule: only the sponsor publishes
    /// along the whole refresh path; other members resume from wherever
    /// their own key-path first meets it. Every existing member in the
    /// group calls this once; members with no overlap return immediately
    /// after the shared barrier releases. When this session is the
    /// sponsor, `new_member_handoff` carries the new member's alias, the
    /// scrubbed snapshot to send it, and a two-party barrier shared with
    /// that member's [`Self::run_new_member_join`] call, guaranteeing the
    /// new member is already subscribed before the snapshot is sent.
    #[instrument(skip(self, session, aliases, barrier, new_member_handoff))]
    pub async fn run_join_exchange(
        &self,
        session: &mut MemberSession,
        refresh_path: &[NodePos],
        sponsor: MemberId,
        new_member_handoff: Option<(&str, Box<KeyTree>, Arc<Barrier>)>,
        aliases: &AliasMap,
        barrier: Arc<Barrier>,
    ) -> Result<()> {
        if let Some((target_alias, snapshot, handoff_barrier)) = new_member_handoff {
            self.messenger.bind(target_alias).await?;
            handoff_barrier.wait().await;
            self.messenger
                .send(target_alias, Payload::TreeSnapshot(snapshot))
                .await?;
        }
        self.run_reduced_exchange(session, refresh_path, sponsor, aliases, barrier)
            .await
    }

    /// Run the join-time flow for the brand-new member: wait at the
    /// two-party handoff barrier shared with the sponsor's
    /// [`Self::run_join_exchange`] call, receive the scrubbed tree
    /// snapshot, locate and key its own leaf, then join the same reduced
    /// exchange every other member is running.
    #[instrument(skip(self, session, aliases, barrier, handoff_barrier), fields(new_mid = new_mid.get()))]
    pub async fn run_new_member_join(
        &self,
        session: &mut MemberSession,
        my_alias: &str,
        new_mid: MemberId,
        handoff_barrier: Arc<Barrier>,
        refresh_path: &[NodePos],
        sponsor: MemberId,
        aliases: &AliasMap,
        barrier: Arc<Barrier>,
    ) -> Result<()> {
        let mut receiver = self.messenger.connect(my_alias).await?;
        handoff_barrier.wait().await;
        let tree = loop {
            match receiver.recv().await {
                Ok(Payload::TreeSnapshot(tree)) => break *tree,
                Ok(_) => continue,
                Err(_) => {
                    return Err(TgdhError::transport_failure(
                        "channel closed awaiting tree snapshot",
                    ))
                }
            }
        };
        session.on_tree_received(tree, new_mid)?;
        self.run_reduced_exchange(session, refresh_path, sponsor, aliases, barrier)
            .await
    }

    /// Run the reduced leave-time schedule; same shape as join, driven by
    /// the sponsor elected by `KeyTree::leave`.
    #[instrument(skip(self, session, aliases, barrier))]
    pub async fn run_leave_exchange(
        &self,
        session: &mut MemberSession,
        refresh_path: &[NodePos],
        sponsor: MemberId,
        aliases: &AliasMap,
        barrier: Arc<Barrier>,
    ) -> Result<()> {
        self.run_reduced_exchange(session, refresh_path, sponsor, aliases, barrier)
            .await
    }

    async fn run_reduced_exchange(
        &self,
        session: &mut MemberSession,
        refresh_path: &[NodePos],
        sponsor: MemberId,
        aliases: &AliasMap,
        barrier: Arc<Barrier>,
    ) -> Result<()> {
        let my_pos = match session.leaf_pos() {
            Some(pos) => pos,
            None => {
                barrier.wait().await;
                return Ok(());
            }
        };

        // The sponsor always climbs from its own leaf (on a join this is
        // the displaced member's new position, not the new member's leaf
        // that `refresh_path` starts from). Any other member only needs to
        // resume from the point where its own key-path first meets the
        // refresh path (the lowest common ancestor); everything below that
        // point is untouched by this round.
        let start_pos = if session.my_mid() == sponsor {
            Some(my_pos)
        } else {
            let my_key_path = session
                .tree()
                .path_to_root(my_pos)
                .ok_or_else(|| TgdhError::protocol_state("no key-path from this member's leaf"))?;
            match my_key_path.iter().position(|p| refresh_path.contains(p)) {
                Some(0) | None => None,
                Some(lca_index) => Some(my_key_path[lca_index - 1]),
            }
        };

        let Some(start_pos) = start_pos else {
            barrier.wait().await;
            return Ok(());
        };

        self.run_climb(session, aliases, barrier, start_pos).await?;
        session.finish_round();
        Ok(())
    }

    /// Bind this member's own alias, pre-subscribe to every peer it will
    /// need blind keys from on the way from `start_pos` to the Root, wait
    /// at the shared barrier, then publish and derive one level at a time.
    async fn run_climb(
        &self,
        session: &mut MemberSession,
        aliases: &AliasMap,
        barrier: Arc<Barrier>,
        start_pos: NodePos,
    ) -> Result<()> {
        let my_alias = self.alias_for(session.my_mid(), aliases)?;
        self.messenger.bind(&my_alias).await?;

        let mut steps = Vec::new();
        let mut pos = start_pos;
        while pos != NodePos::ROOT {
            let sibling_pos = session
                .tree()
                .sibling(pos)
                .ok_or_else(|| TgdhError::protocol_state(format!("{pos} has no sibling")))?;
            let owner_alias = self.owner_alias(session.tree(), sibling_pos, aliases)?;
            steps.push(Step {
                current_pos: pos,
                sibling_pos,
                owner_alias,
            });
            pos = NodePos::new(pos.l - 1, pos.v / 2);
        }

        let mut receivers = Vec::with_capacity(steps.len());
        for step in &steps {
            receivers.push(self.messenger.connect(&step.owner_alias).await?);
        }

        barrier.wait().await;

        for (step, mut receiver) in steps.into_iter().zip(receivers) {
            let blind = session.blind_at(step.current_pos).ok_or_else(|| {
                TgdhError::protocol_state(format!("{} has no blind to publish", step.current_pos))
            })?;
            self.messenger
                .send(
                    &my_alias,
                    Payload::BlindKeyAnnouncement {
                        pos: step.current_pos,
                        value: blind,
                    },
                )
                .await?;

            loop {
                match receiver.recv().await {
                    Ok(Payload::BlindKeyAnnouncement { pos, value }) if pos == step.sibling_pos => {
                        session.receive_blind(pos, value)?;
                        break;
                    }
                    Ok(_) => continue,
                    Err(_) => {
                        return Err(TgdhError::transport_failure(format!(
                            "channel closed awaiting blind for {}",
                            step.sibling_pos
                        )))
                    }
                }
            }

            session.derive_one_level(step.current_pos)?;
        }
        Ok(())
    }

    fn alias_for(&self, mid: MemberId, aliases: &AliasMap) -> Result<String> {
        aliases
            .get(&mid)
            .cloned()
            .ok_or_else(|| TgdhError::protocol_state(format!("no alias registered for {mid}")))
    }

    fn owner_alias(&self, tree: &KeyTree, pos: NodePos, aliases: &AliasMap) -> Result<String> {
        let mid = leftmost_member(tree, pos)
            .ok_or_else(|| TgdhError::protocol_state(format!("no member owns subtree at {pos}")))?;
        self.alias_for(mid, aliases)
    }
}

/// The member identity of the leftmost leaf under the subtree rooted at
/// `pos`: the canonical publisher for that subtree's key-path value.
fn leftmost_member(tree: &KeyTree, pos: NodePos) -> Option<MemberId> {
    let mut current = tree.find_by_pos(pos)?;
    while !current.is_leaf() {
        current = current.lchild.as_deref().or(current.rchild.as_deref())?;
    }
    current.mid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::InProcessMessenger;
    use tgdh_core::GroupConfig;

    fn config() -> GroupConfig {
        GroupConfig {
            rng_seed: Some(7),
            ..GroupConfig::default()
        }
    }

    async fn run_initial_exchange_for_group(size: u64, seed: u64) -> Vec<num_bigint::BigUint> {
        let cfg = GroupConfig {
            rng_seed: Some(seed),
            ..GroupConfig::default()
        };
        let mids: Vec<MemberId> = (1..=size).map(MemberId::new).collect();
        let aliases = default_aliases(mids.iter().copied());
        let messenger = Arc::new(InProcessMessenger::new());
        let barrier = Arc::new(Barrier::new(mids.len()));

        let mut handles = Vec::new();
        for mid in mids {
            let cfg = cfg.clone();
            let aliases = aliases.clone();
            let messenger = messenger.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                let mut session = MemberSession::initialise(&cfg, size, mid).unwrap();
                let coordinator = GroupCoordinator::new(messenger);
                coordinator
                    .run_initial_exchange(&mut session, &aliases, barrier)
                    .await
                    .unwrap();
                session.group_key().cloned().unwrap()
            }));
        }

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        keys
    }

    #[tokio::test]
    async fn three_member_group_converges_on_the_same_root_key() {
        let keys = run_initial_exchange_for_group(3, 7).await;
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn five_member_unbalanced_tree_still_converges() {
        let keys = run_initial_exchange_for_group(5, 11).await;
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn leave_exchange_rederives_a_consistent_root_key_for_the_survivors() {
        let cfg = config();
        let size = 4u64;
        let mids: Vec<MemberId> = (1..=size).map(MemberId::new).collect();
        let aliases = default_aliases(mids.iter().copied());
        let messenger = Arc::new(InProcessMessenger::new());
        let barrier = Arc::new(Barrier::new(mids.len()));

        let mut bootstrap_handles = Vec::new();
        for mid in &mids {
            let cfg = cfg.clone();
            let aliases = aliases.clone();
            let messenger = messenger.clone();
            let barrier = barrier.clone();
            let mid = *mid;
            bootstrap_handles.push(tokio::spawn(async move {
                let mut session = MemberSession::initialise(&cfg, size, mid).unwrap();
                let coordinator = GroupCoordinator::new(messenger);
                coordinator
                    .run_initial_exchange(&mut session, &aliases, barrier)
                    .await
                    .unwrap();
                session
            }));
        }
        let mut sessions = Vec::new();
        for handle in bootstrap_handles {
            sessions.push(handle.await.unwrap());
        }
        sessions.sort_by_key(|s| s.my_mid());
        let initial_keys: Vec<_> = sessions.iter().map(|s| s.group_key().cloned().unwrap()).collect();
        assert!(initial_keys.windows(2).all(|w| w[0] == w[1]));

        let leaving = MemberId::new(4);
        let survivors: Vec<MemberId> = mids.iter().copied().filter(|m| *m != leaving).collect();
        let leave_barrier = Arc::new(Barrier::new(survivors.len()));

        let mut outcome = None;
        for session in sessions.iter_mut() {
            if session.my_mid() == leaving {
                continue;
            }
            match session.on_leave_event(leaving) {
                Ok(o) => outcome = Some(o),
                Err(err) => panic!("unexpected error applying leave: {err}"),
            }
        }
        let outcome = outcome.unwrap();

        let mut handles = Vec::new();
        for mid in survivors {
            let messenger = messenger.clone();
            let aliases = aliases.clone();
            let barrier = leave_barrier.clone();
            let refresh_path = outcome.refresh_path.clone();
            let sponsor = outcome.sponsor;
            let mut session = sessions
                .iter()
                .find(|s| s.my_mid() == mid)
                .cloned()
                .unwrap();
            handles.push(tokio::spawn(async move {
                let coordinator = GroupCoordinator::new(messenger);
                coordinator
                    .run_leave_exchange(&mut session, &refresh_path, sponsor, &aliases, barrier)
                    .await
                    .unwrap();
                session.group_key().cloned().unwrap()
            }));
        }

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_ne!(keys[0], initial_keys[0]);
    }

    #[tokio::test]
    async fn join_exchange_brings_a_new_member_into_agreement() {
        let cfg = config();
        let size = 3u64;
        let mids: Vec<MemberId> = (1..=size).map(MemberId::new).collect();
        let mut aliases = default_aliases(mids.iter().copied());
        let messenger = Arc::new(InProcessMessenger::new());
        let bootstrap_barrier = Arc::new(Barrier::new(mids.len()));

        let mut bootstrap_handles = Vec::new();
        for mid in &mids {
            let cfg = cfg.clone();
            let aliases = aliases.clone();
            let messenger = messenger.clone();
            let barrier = bootstrap_barrier.clone();
            let mid = *mid;
            bootstrap_handles.push(tokio::spawn(async move {
                let mut session = MemberSession::initialise(&cfg, size, mid).unwrap();
                let coordinator = GroupCoordinator::new(messenger);
                coordinator
                    .run_initial_exchange(&mut session, &aliases, barrier)
                    .await
                    .unwrap();
                session
            }));
        }
        let mut sessions = Vec::new();
        for handle in bootstrap_handles {
            sessions.push(handle.await.unwrap());
        }
        sessions.sort_by_key(|s| s.my_mid());
        let initial_key = sessions[0].group_key().cloned().unwrap();

        let mut outcome = None;
        for session in sessions.iter_mut() {
            outcome = Some(session.on_join_event().unwrap());
        }
        let outcome = outcome.unwrap();

        let sponsor_session = sessions
            .iter()
            .find(|s| s.my_mid() == outcome.sponsor)
            .unwrap();
        let snapshot = Box::new(sponsor_session.snapshot_for_new_member());

        let new_alias = outcome.new_mid.to_string();
        aliases.insert(outcome.new_mid, new_alias.clone());

        let round_barrier = Arc::new(Barrier::new(mids.len() + 1));
        let handoff_barrier = Arc::new(Barrier::new(2));

        let mut handles = Vec::new();
        for mid in &mids {
            let mid = *mid;
            let messenger = messenger.clone();
            let aliases = aliases.clone();
            let barrier = round_barrier.clone();
            let refresh_path = outcome.refresh_path.clone();
            let sponsor = outcome.sponsor;
            let new_alias = new_alias.clone();
            let handoff_barrier = if mid == sponsor {
                Some(handoff_barrier.clone())
            } else {
                None
            };
            let snapshot = if mid == sponsor {
                Some(snapshot.clone())
            } else {
                None
            };
            let mut session = sessions
                .iter()
                .find(|s| s.my_mid() == mid)
                .cloned()
                .unwrap();
            handles.push(tokio::spawn(async move {
                let coordinator = GroupCoordinator::new(messenger);
                let handoff = handoff_barrier
                    .zip(snapshot)
                    .map(|(hb, snap)| (new_alias.as_str(), snap, hb));
                coordinator
                    .run_join_exchange(&mut session, &refresh_path, sponsor, handoff, &aliases, barrier)
                    .await
                    .unwrap();
                session.group_key().cloned().unwrap()
            }));
        }

        let new_member_handle = {
            let messenger = messenger.clone();
            let aliases = aliases.clone();
            let barrier = round_barrier.clone();
            let handoff_barrier = handoff_barrier.clone();
            let refresh_path = outcome.refresh_path.clone();
            let sponsor = outcome.sponsor;
            let new_mid = outcome.new_mid;
            let new_alias = new_alias.clone();
            tokio::spawn(async move {
                let mut session = MemberSession::awaiting_join(&cfg, new_mid).unwrap();
                let coordinator = GroupCoordinator::new(messenger);
                coordinator
                    .run_new_member_join(
                        &mut session,
                        &new_alias,
                        new_mid,
                        handoff_barrier,
                        &refresh_path,
                        sponsor,
                        &aliases,
                        barrier,
                    )
                    .await
                    .unwrap();
                session.group_key().cloned().unwrap()
            })
        };

        let mut keys = Vec::new();
        for handle in handles {
            keys.push(handle.await.unwrap());
        }
        keys.push(new_member_handle.await.unwrap());

        assert!(keys.windows(2).all(|w| w[0] == w[1]));
        assert_ne!(keys[0], initial_key);
    }
}
