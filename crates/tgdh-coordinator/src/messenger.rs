//! The transport abstraction `GroupCoordinator` is generic over, plus an
//! in-process implementation for tests and single-process demonstrations.

use async_trait::async_trait;
use num_bigint::BigUint;
use std::collections::HashMap;
use tgdh_core::{NodePos, Result, TgdhError};
use tgdh_tree::KeyTree;
use tokio::sync::{broadcast, Mutex};

/// One value carried over the wire between members.
#[derive(Debug, Clone)]
pub enum Payload {
    /// A published blind key for one tree position
    BlindKeyAnnouncement {
        /// The position this blind value belongs to
        pos: NodePos,
        /// `g^priv mod p`
        value: BigUint,
    },
    /// A full tree snapshot, sent exactly once to a freshly joined member
    TreeSnapshot(Box<KeyTree>),
}

/// A capability for publishing to, and subscribing from, named channels.
///
/// Object-safe and async so a `GroupCoordinator` can be generic over
/// `Arc<dyn Messenger>` without depending on any concrete network library.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Make `alias` a publishing channel this member can send on.
    async fn bind(&self, alias: &str) -> Result<()>;

    /// Subscribe to `alias`'s future publications.
    async fn connect(&self, alias: &str) -> Result<broadcast::Receiver<Payload>>;

    /// Publish `payload` on `alias`.
    async fn send(&self, alias: &str, payload: Payload) -> Result<()>;

    /// Drop every binding and subscription this implementation holds for
    /// `alias`.
    async fn close_all(&self, alias: &str) -> Result<()>;
}

/// An in-process `Messenger` backed by `tokio::sync::broadcast` channels,
/// keyed by alias. Every `connect`ed receiver sees every message sent on
/// its alias after the subscription was established.
#[derive(Debug, Default)]
pub struct InProcessMessenger {
    channels: Mutex<HashMap<String, broadcast::Sender<Payload>>>,
}

const CHANNEL_CAPACITY: usize = 256;

impl InProcessMessenger {
    /// An empty messenger with no bindings yet.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Messenger for InProcessMessenger {
    async fn bind(&self, alias: &str) -> Result<()> {
        let mut channels = self.channels.lock().await;
        channels
            .entry(alias.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(())
    }

    async fn connect(&self, alias: &str) -> Result<broadcast::Receiver<Payload>> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(alias.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }

    async fn send(&self, alias: &str, payload: Payload) -> Result<()> {
        let channels = self.channels.lock().await;
        let sender = channels
            .get(alias)
            .ok_or_else(|| TgdhError::transport_failure(format!("no binding for alias {alias}")))?;
        // No subscribers yet is not a transport failure here: the barrier
        // that follows every send guarantees a subscriber connects before
        // the corresponding recv is attempted.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn close_all(&self, alias: &str) -> Result<()> {
        let mut channels = self.channels.lock().await;
        channels.remove(alias);
        Ok(())
    }
}
