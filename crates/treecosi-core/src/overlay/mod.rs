//! Overlay runtime the protocol instances run on
//!
//! Every tree node runs as its own task and talks to its parent and
//! children through typed bounded channels; channels are the only
//! synchronization primitive. The orchestrator drives a running shard
//! through a [`ShardHandle`], and the [`Launcher`] trait is the seam
//! through which shard instances are created, so tests and alternative
//! transports can swap the runtime out.

mod local;

pub use local::LocalRunner;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k256::ProjectivePoint;
use tokio::sync::mpsc;

use crate::cosi::Keypair;
use crate::error::{Error, Result};
use crate::messages::{Announcement, Challenge, Commitment, Response, Stop};
use crate::tree::Tree;

/// Phase timeouts injected into every engine instance of a run
#[derive(Clone, Copy, Debug)]
pub struct EngineConfig {
    /// How long a shard root waits for its subleader's commitment
    pub subleader_timeout: Duration,
    /// How long a subleader waits for its leaves, per phase
    pub leaves_timeout: Duration,
}

/// Any protocol message, for parent/child sends
#[derive(Clone, Debug)]
pub enum Message {
    Announcement(Announcement),
    Commitment(Commitment),
    Challenge(Challenge),
    Response(Response),
    Stop(Stop),
}

impl From<Announcement> for Message {
    fn from(message: Announcement) -> Self {
        Message::Announcement(message)
    }
}

impl From<Commitment> for Message {
    fn from(message: Commitment) -> Self {
        Message::Commitment(message)
    }
}

impl From<Challenge> for Message {
    fn from(message: Challenge) -> Self {
        Message::Challenge(message)
    }
}

impl From<Response> for Message {
    fn from(message: Response) -> Self {
        Message::Response(message)
    }
}

impl From<Stop> for Message {
    fn from(message: Stop) -> Self {
        Message::Stop(message)
    }
}

/// Senders for one node's inbound channels
#[derive(Clone)]
pub(crate) struct NodeSender {
    pub announcement: mpsc::Sender<Announcement>,
    pub commitment: mpsc::Sender<Commitment>,
    pub challenge: mpsc::Sender<Challenge>,
    pub response: mpsc::Sender<Response>,
    pub stop: mpsc::Sender<Stop>,
}

impl NodeSender {
    async fn send(&self, message: Message) -> Result<()> {
        let closed = match message {
            Message::Announcement(m) => self.announcement.send(m).await.is_err(),
            Message::Commitment(m) => self.commitment.send(m).await.is_err(),
            Message::Challenge(m) => self.challenge.send(m).await.is_err(),
            Message::Response(m) => self.response.send(m).await.is_err(),
            Message::Stop(m) => self.stop.send(m).await.is_err(),
        };
        if closed {
            return Err(Error::Transport("peer channel closed".into()));
        }
        Ok(())
    }
}

/// Receivers for one node's inbound channels
pub(crate) struct NodeInbound {
    pub announcement: mpsc::Receiver<Announcement>,
    pub commitment: mpsc::Receiver<Commitment>,
    pub challenge: mpsc::Receiver<Challenge>,
    pub response: mpsc::Receiver<Response>,
    pub stop: mpsc::Receiver<Stop>,
}

/// Keeps the runner's active-instance count honest even when a task
/// unwinds without reaching `done()`
pub(crate) struct ActiveGuard {
    counter: Arc<AtomicUsize>,
}

impl ActiveGuard {
    pub(crate) fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One tree node's view of the overlay: its position in the tree, its
/// keypair, and channels to its parent and children
pub struct NodeContext {
    pub(crate) tree: Arc<Tree>,
    pub(crate) node_id: usize,
    pub(crate) keypair: Keypair,
    pub(crate) peers: HashMap<usize, NodeSender>,
    pub(crate) inbound: NodeInbound,
    guard: Option<ActiveGuard>,
}

impl NodeContext {
    pub(crate) fn new(
        tree: Arc<Tree>,
        node_id: usize,
        keypair: Keypair,
        peers: HashMap<usize, NodeSender>,
        inbound: NodeInbound,
        active: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            tree,
            node_id,
            keypair,
            peers,
            inbound,
            guard: Some(ActiveGuard::new(active)),
        }
    }

    pub fn is_root(&self) -> bool {
        self.node_id == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.tree.node(self.node_id).children.is_empty()
    }

    pub fn n_children(&self) -> usize {
        self.tree.node(self.node_id).children.len()
    }

    /// The node's own network address, for logging
    pub fn address(&self) -> &str {
        &self.tree.signer(self.node_id).address
    }

    pub async fn send_to_parent(&self, message: Message) -> Result<()> {
        let parent = self
            .tree
            .node(self.node_id)
            .parent
            .ok_or_else(|| Error::Transport("root node has no parent".into()))?;
        self.peer(parent)?.send(message).await
    }

    pub async fn send_to_children(&self, message: Message) -> Result<()> {
        for &child in &self.tree.node(self.node_id).children {
            self.peer(child)?.send(message.clone()).await?;
        }
        Ok(())
    }

    fn peer(&self, node_id: usize) -> Result<&NodeSender> {
        self.peers
            .get(&node_id)
            .ok_or_else(|| Error::Transport(format!("no channel to node {node_id}")))
    }

    /// Best-effort stop relay to the children; never blocks
    pub fn forward_stop(&self) {
        for &child in &self.tree.node(self.node_id).children {
            if let Some(peer) = self.peers.get(&child) {
                let _ = peer.stop.try_send(Stop);
            }
        }
    }

    /// Release the node's runtime slot; called on every dispatch exit
    pub fn done(&mut self) {
        self.guard.take();
    }
}

/// Channels a shard-root engine uses to signal the orchestrator
pub(crate) struct Upward {
    pub commitment: mpsc::Sender<Commitment>,
    pub response: mpsc::Sender<Response>,
    pub subleader_gone: mpsc::Sender<()>,
}

/// The orchestrator's handle on one running shard instance
pub struct ShardHandle {
    pub(crate) announcement: mpsc::Sender<Announcement>,
    pub(crate) challenge: mpsc::Sender<Challenge>,
    pub(crate) stops: Vec<mpsc::Sender<Stop>>,
    /// The shard's aggregated commitment, forwarded by the shard root
    pub sub_commitment: mpsc::Receiver<Commitment>,
    /// The shard's aggregated response, forwarded by the shard root
    pub sub_response: mpsc::Receiver<Response>,
    /// Fires when the shard root gave up on its subleader
    pub subleader_gone: mpsc::Receiver<()>,
}

impl ShardHandle {
    /// Kick the shard off by injecting the announcement into its root
    pub async fn start(&self, proposal: &[u8], publics: &[ProjectivePoint]) -> Result<()> {
        if proposal.is_empty() {
            return Err(Error::InvalidArgument(
                "shard started without a proposal".into(),
            ));
        }
        if publics.is_empty() {
            return Err(Error::InvalidArgument(
                "shard started without public keys".into(),
            ));
        }
        self.announcement
            .send(Announcement::new(proposal, publics))
            .await
            .map_err(|_| Error::Transport("shard root is gone".into()))
    }

    /// Push the global challenge into the shard root
    pub async fn challenge(&self, challenge: Challenge) -> Result<()> {
        self.challenge
            .send(challenge)
            .await
            .map_err(|_| Error::Transport("shard root is gone".into()))
    }

    /// Deliver a cooperative stop to every node of the instance
    pub fn stop(&self) {
        for stop in &self.stops {
            let _ = stop.try_send(Stop);
        }
    }
}

/// Factory seam through which the orchestrator creates shard instances
pub trait Launcher: Send + Sync {
    /// Materialize a sub-protocol instance over `tree` and return the
    /// orchestrator's handle on it
    fn launch(&self, tree: &Tree, config: &EngineConfig) -> Result<ShardHandle>;
}
