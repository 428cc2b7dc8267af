//! In-process overlay: every signer lives in this process and messages
//! travel over direct channels
//!
//! This is the runtime used by the CLI and the protocol tests. It owns
//! the keypair of every roster member, spawns one engine task per tree
//! node on launch, and can be told to make individual signers
//! unresponsive to exercise the failure paths.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use k256::Scalar;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tracing::debug;

use super::{
    EngineConfig, Launcher, NodeContext, NodeInbound, NodeSender, ShardHandle, Upward,
};
use crate::cosi::Keypair;
use crate::error::{Error, Result};
use crate::subprotocol::SubProtocol;
use crate::tree::{Roster, Signer, Tree};

/// Local overlay holding every signer of a roster in one process
pub struct LocalRunner {
    roster: Roster,
    keypairs: Vec<Keypair>,
    unresponsive: Mutex<HashSet<String>>,
    active: Arc<AtomicUsize>,
}

impl LocalRunner {
    /// Spin up `n` local signers with fresh keys
    pub fn new(n: usize) -> Result<Self> {
        let keypairs: Vec<Keypair> = (0..n).map(|_| Keypair::generate(&mut OsRng)).collect();
        let list = keypairs
            .iter()
            .enumerate()
            .map(|(i, keypair)| Signer {
                address: format!("local://signer-{i}"),
                public: keypair.public,
            })
            .collect();
        Ok(Self {
            roster: Roster::new(list)?,
            keypairs,
            unresponsive: Mutex::new(HashSet::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Rebuild a runner from a persisted roster and its private scalars
    pub fn from_parts(roster: Roster, privates: Vec<Scalar>) -> Result<Self> {
        if privates.len() != roster.len() {
            return Err(Error::InvalidArgument(format!(
                "{} private keys for a roster of {}",
                privates.len(),
                roster.len()
            )));
        }
        let keypairs: Vec<Keypair> = privates.into_iter().map(Keypair::from_private).collect();
        for (signer, keypair) in roster.list().iter().zip(&keypairs) {
            if signer.public != keypair.public {
                return Err(Error::InvalidArgument(format!(
                    "private key does not match roster entry {}",
                    signer.address
                )));
            }
        }
        Ok(Self {
            roster,
            keypairs,
            unresponsive: Mutex::new(HashSet::new()),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Keypair of the signer at a global roster index
    pub fn keypair(&self, index: usize) -> Result<Keypair> {
        self.keypairs
            .get(index)
            .cloned()
            .ok_or_else(|| Error::InvalidArgument(format!("no signer at roster index {index}")))
    }

    /// Make the signer at a global roster index drop all traffic from now on
    pub fn set_unresponsive(&self, index: usize) -> Result<()> {
        let signer = self
            .roster
            .get(index)
            .ok_or_else(|| Error::InvalidArgument(format!("no signer at roster index {index}")))?;
        self.unresponsive
            .lock()
            .map_err(|_| Error::Internal("unresponsive set poisoned".into()))?
            .insert(signer.address.clone());
        Ok(())
    }

    /// Number of engine tasks currently holding a runtime slot
    pub fn active_nodes(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn keypair_for(&self, address: &str) -> Result<Keypair> {
        self.roster
            .list()
            .iter()
            .position(|signer| signer.address == address)
            .map(|index| self.keypairs[index].clone())
            .ok_or_else(|| Error::InvalidArgument(format!("unknown signer {address}")))
    }

    fn is_unresponsive(&self, address: &str) -> bool {
        self.unresponsive
            .lock()
            .map(|set| set.contains(address))
            .unwrap_or(false)
    }
}

impl Launcher for LocalRunner {
    fn launch(&self, tree: &Tree, config: &EngineConfig) -> Result<ShardHandle> {
        let tree = Arc::new(tree.clone());

        let mut senders = Vec::with_capacity(tree.size());
        let mut inbounds = Vec::with_capacity(tree.size());
        for node in tree.nodes() {
            let fan_in = node.children.len().max(1);
            let (announcement_tx, announcement_rx) = mpsc::channel(1);
            let (commitment_tx, commitment_rx) = mpsc::channel(fan_in);
            let (challenge_tx, challenge_rx) = mpsc::channel(1);
            let (response_tx, response_rx) = mpsc::channel(fan_in);
            let (stop_tx, stop_rx) = mpsc::channel(1);
            senders.push(NodeSender {
                announcement: announcement_tx,
                commitment: commitment_tx,
                challenge: challenge_tx,
                response: response_tx,
                stop: stop_tx,
            });
            inbounds.push(NodeInbound {
                announcement: announcement_rx,
                commitment: commitment_rx,
                challenge: challenge_rx,
                response: response_rx,
                stop: stop_rx,
            });
        }

        let (up_commitment_tx, up_commitment_rx) = mpsc::channel(1);
        let (up_response_tx, up_response_rx) = mpsc::channel(1);
        let (subleader_gone_tx, subleader_gone_rx) = mpsc::channel(1);

        let handle = ShardHandle {
            announcement: senders[0].announcement.clone(),
            challenge: senders[0].challenge.clone(),
            stops: senders.iter().map(|sender| sender.stop.clone()).collect(),
            sub_commitment: up_commitment_rx,
            sub_response: up_response_rx,
            subleader_gone: subleader_gone_rx,
        };

        for (id, inbound) in inbounds.into_iter().enumerate() {
            let node = tree.node(id);
            let mut peers = HashMap::new();
            if let Some(parent) = node.parent {
                peers.insert(parent, senders[parent].clone());
            }
            for &child in &node.children {
                peers.insert(child, senders[child].clone());
            }

            let signer = tree.signer(id);
            let keypair = self.keypair_for(&signer.address)?;
            let ctx = NodeContext::new(
                tree.clone(),
                id,
                keypair,
                peers,
                inbound,
                self.active.clone(),
            );

            // the root is the orchestrator's own node and is never faulty
            if id != 0 && self.is_unresponsive(&signer.address) {
                tokio::spawn(black_hole(ctx));
                continue;
            }

            let upward = (id == 0).then(|| Upward {
                commitment: up_commitment_tx.clone(),
                response: up_response_tx.clone(),
                subleader_gone: subleader_gone_tx.clone(),
            });
            tokio::spawn(SubProtocol::new(ctx, *config, upward).dispatch());
        }

        Ok(handle)
    }
}

/// Dispatch loop of an unresponsive signer: consume everything, say
/// nothing, exit when the instance's senders are gone
async fn black_hole(mut ctx: NodeContext) {
    debug!(node = ctx.address(), "node is dropping all messages");
    {
        let NodeInbound {
            announcement,
            commitment,
            challenge,
            response,
            stop,
        } = &mut ctx.inbound;
        tokio::join!(
            async { while announcement.recv().await.is_some() {} },
            async { while commitment.recv().await.is_some() {} },
            async { while challenge.recv().await.is_some() {} },
            async { while response.recv().await.is_some() {} },
            async { while stop.recv().await.is_some() {} },
        );
    }
    ctx.done();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::build_shards;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            subleader_timeout: Duration::from_millis(500),
            leaves_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn shard_produces_an_aggregated_commitment() {
        let runner = LocalRunner::new(4).unwrap();
        let trees = build_shards(runner.roster(), 4, 1).unwrap();
        let publics = runner.roster().publics();

        let mut handle = runner.launch(&trees[0], &config()).unwrap();
        handle.start(b"proposal", &publics).await.unwrap();

        let commitment = handle.sub_commitment.recv().await.unwrap();
        commitment.decode_commitment().unwrap();
        // subleader + 2 leaves participated
        assert_eq!(commitment.mask, [0b1110]);
    }

    #[tokio::test]
    async fn silent_subleader_reported_gone() {
        let runner = LocalRunner::new(3).unwrap();
        runner.set_unresponsive(1).unwrap();
        let trees = build_shards(runner.roster(), 3, 1).unwrap();
        let publics = runner.roster().publics();

        let mut handle = runner.launch(&trees[0], &config()).unwrap();
        handle.start(b"proposal", &publics).await.unwrap();

        handle.subleader_gone.recv().await.unwrap();
    }

    #[tokio::test]
    async fn stop_winds_an_instance_down() {
        let runner = LocalRunner::new(4).unwrap();
        let trees = build_shards(runner.roster(), 4, 1).unwrap();

        let handle = runner.launch(&trees[0], &config()).unwrap();
        assert_eq!(runner.active_nodes(), 4);

        handle.stop();
        drop(handle);
        for _ in 0..50 {
            if runner.active_nodes() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("nodes still active after stop");
    }

    #[test]
    fn from_parts_rejects_mismatched_keys() {
        let runner = LocalRunner::new(2).unwrap();
        let roster = runner.roster().clone();
        let privates = vec![
            runner.keypair(1).unwrap().private,
            runner.keypair(0).unwrap().private,
        ];
        assert!(LocalRunner::from_parts(roster, privates).is_err());
    }
}
