//! Leader orchestrator: drives every shard in parallel and assembles the
//! collective signature
//!
//! The orchestrator runs only at the overall root. It builds the shard
//! trees, launches one sub-protocol instance per shard, gathers their
//! aggregated commitments while rotating unresponsive subleaders,
//! computes the global challenge, fans it back out, gathers the
//! aggregated responses and emits `R* || s* || mask*` on the signature
//! channel.

use std::sync::Arc;
use std::time::Duration;

use k256::ProjectivePoint;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::cosi::{self, Keypair, Mask};
use crate::error::{Error, Result};
use crate::messages::{Challenge, Commitment};
use crate::overlay::{EngineConfig, Launcher, ShardHandle};
use crate::tree::{self, Roster, Tree};

/// Default bound on each of commit collection and response collection
pub const DEFAULT_PROTOCOL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on a shard root waiting for its subleader
pub const DEFAULT_SUBLEADER_TIMEOUT: Duration = Duration::from_secs(2);

/// Default bound on a subleader waiting for its leaves
pub const DEFAULT_LEAVES_TIMEOUT: Duration = Duration::from_secs(1);

// timeouts below this floor are treated as unset
const MIN_TIMEOUT: Duration = Duration::from_millis(10);

/// Tunables of a signing run
#[derive(Clone, Copy, Debug)]
pub struct ProtocolConfig {
    /// Requested shard count; clamped to the roster
    pub n_subtrees: usize,
    pub protocol_timeout: Duration,
    pub subleader_timeout: Duration,
    pub leaves_timeout: Duration,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            n_subtrees: 1,
            protocol_timeout: DEFAULT_PROTOCOL_TIMEOUT,
            subleader_timeout: DEFAULT_SUBLEADER_TIMEOUT,
            leaves_timeout: DEFAULT_LEAVES_TIMEOUT,
        }
    }
}

impl ProtocolConfig {
    fn normalized(mut self) -> Self {
        if self.n_subtrees < 1 {
            self.n_subtrees = 1;
        }
        if self.protocol_timeout < MIN_TIMEOUT {
            self.protocol_timeout = DEFAULT_PROTOCOL_TIMEOUT;
        }
        if self.subleader_timeout < MIN_TIMEOUT {
            self.subleader_timeout = DEFAULT_SUBLEADER_TIMEOUT;
        }
        if self.leaves_timeout < MIN_TIMEOUT {
            self.leaves_timeout = DEFAULT_LEAVES_TIMEOUT;
        }
        self
    }
}

/// Caller's handle on a running root protocol
pub struct RootHandle {
    start: Option<oneshot::Sender<()>>,
    /// Receives the final signature; stays empty on failure
    pub signature: mpsc::Receiver<Vec<u8>>,
}

impl RootHandle {
    /// Release the protocol; listeners should be attached before this
    pub fn start(&mut self) -> Result<()> {
        self.start
            .take()
            .ok_or_else(|| Error::InvalidArgument("protocol already started".into()))?
            .send(())
            .map_err(|_| Error::Transport("protocol task is gone".into()))
    }
}

/// The collective-signing protocol as seen by the leader
pub struct RootProtocol {
    launcher: Arc<dyn Launcher>,
    roster: Roster,
    n_nodes: usize,
    keypair: Keypair,
    proposal: Vec<u8>,
    config: ProtocolConfig,
    start: Option<oneshot::Receiver<()>>,
    signature: mpsc::Sender<Vec<u8>>,
}

impl RootProtocol {
    /// Validate the parameters and wire up the control channels
    pub fn new(
        launcher: Arc<dyn Launcher>,
        roster: Roster,
        n_nodes: usize,
        keypair: Keypair,
        proposal: &[u8],
        config: ProtocolConfig,
    ) -> Result<(Self, RootHandle)> {
        if proposal.is_empty() {
            return Err(Error::InvalidArgument("no proposal specified".into()));
        }
        if n_nodes < 1 || roster.len() < n_nodes {
            return Err(Error::InvalidArgument(format!(
                "cannot run over {} of {} signers",
                n_nodes,
                roster.len()
            )));
        }
        let leader = roster
            .get(0)
            .ok_or_else(|| Error::InvalidArgument("empty roster".into()))?;
        if leader.public != keypair.public {
            return Err(Error::InvalidArgument(
                "leader keypair does not match the roster head".into(),
            ));
        }

        let (start_tx, start_rx) = oneshot::channel();
        let (signature_tx, signature_rx) = mpsc::channel(1);
        let protocol = Self {
            launcher,
            roster,
            n_nodes,
            keypair,
            proposal: proposal.to_vec(),
            config: config.normalized(),
            start: Some(start_rx),
            signature: signature_tx,
        };
        let handle = RootHandle {
            start: Some(start_tx),
            signature: signature_rx,
        };
        Ok((protocol, handle))
    }

    /// Drive one full signing run
    #[instrument(
        name = "cosi_root",
        skip(self),
        fields(nodes = self.n_nodes, shards = self.config.n_subtrees)
    )]
    pub async fn run(mut self) -> Result<()> {
        let publics: Vec<ProjectivePoint> = self
            .roster
            .publics()
            .into_iter()
            .take(self.n_nodes)
            .collect();
        let trees = tree::build_shards(&self.roster, self.n_nodes, self.config.n_subtrees)?;

        // hold until the caller has attached its listeners
        let start = self
            .start
            .take()
            .ok_or_else(|| Error::Internal("protocol already ran".into()))?;
        start.await.map_err(|_| Error::Stopped)?;

        // a single signer signs without any shard instances
        if self.n_nodes == 1 {
            let signature = self.sign_alone(&publics)?;
            return self.emit(signature).await;
        }

        let engine_config = EngineConfig {
            subleader_timeout: self.config.subleader_timeout,
            leaves_timeout: self.config.leaves_timeout,
        };

        let mut shards = Vec::with_capacity(trees.len());
        for tree in trees {
            let handle = self.launcher.launch(&tree, &engine_config)?;
            handle.start(&self.proposal, &publics).await?;
            shards.push((tree, handle));
        }
        info!(shards = shards.len(), "all shard instances started");

        // collect every shard's commitment in parallel, rotating failed
        // subleaders, all under one global deadline
        let deadline = Instant::now() + self.config.protocol_timeout;
        let mut tasks = Vec::with_capacity(shards.len());
        for (shard, (tree, handle)) in shards.into_iter().enumerate() {
            let launcher = self.launcher.clone();
            let proposal = self.proposal.clone();
            let publics = publics.clone();
            tasks.push(tokio::spawn(collect_shard_commitment(
                launcher,
                shard,
                tree,
                handle,
                proposal,
                publics,
                engine_config,
            )));
        }

        let mut collected = Vec::with_capacity(tasks.len());
        let mut failure = None;
        for (shard, mut task) in tasks.into_iter().enumerate() {
            if failure.is_some() {
                task.abort();
                continue;
            }
            match timeout_at(deadline, &mut task).await {
                Ok(Ok(Ok(pair))) => collected.push(pair),
                Ok(Ok(Err(error))) => failure = Some(error),
                Ok(Err(join_error)) => {
                    failure = Some(Error::Internal(format!(
                        "commit collection task failed: {join_error}"
                    )));
                }
                Err(_) => {
                    task.abort();
                    failure = Some(Error::Timeout(format!("commitment from shard {shard}")));
                }
            }
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let mut shard_commitments = Vec::with_capacity(collected.len());
        let mut handles = Vec::with_capacity(collected.len());
        for (message, handle) in collected {
            shard_commitments.push(message);
            handles.push(handle);
        }

        // fold the leader's own commitment into the global aggregate
        let (own_secret, own_commitment) = cosi::commit(&mut OsRng);
        let mut commitments = vec![own_commitment];
        let mut masks = vec![Mask::with_signer(&publics, &self.keypair.public)?];
        for message in &shard_commitments {
            commitments.push(message.decode_commitment()?);
            let mut mask = Mask::new(&publics)?;
            mask.merge(&message.mask)?;
            masks.push(mask);
        }
        let (aggregate, mask) = cosi::aggregate_commitments(&commitments, &masks)?;
        let challenge = cosi::challenge(&aggregate, &mask.aggregate_public(), &self.proposal);
        debug!(
            signers = mask.count_enabled(),
            "broadcasting global challenge"
        );
        for handle in &handles {
            handle.challenge(Challenge::new(&challenge)).await?;
        }

        // gather the shard responses under a fresh deadline
        let deadline = Instant::now() + self.config.protocol_timeout;
        let mut responses = vec![cosi::response(
            &self.keypair.private,
            &own_secret,
            &challenge,
        )];
        for (shard, handle) in handles.iter_mut().enumerate() {
            let message = timeout_at(deadline, handle.sub_response.recv())
                .await
                .map_err(|_| Error::Timeout(format!("response from shard {shard}")))?
                .ok_or_else(|| {
                    Error::Transport(format!("shard {shard} ended before responding"))
                })?;
            responses.push(message.decode()?);
        }
        let response = cosi::aggregate_responses(&responses)?;

        let signature = cosi::sign(&aggregate, &response, &mask);
        info!(
            signers = mask.count_enabled(),
            total = mask.positions(),
            "collective signature complete"
        );
        self.emit(signature).await
    }

    /// The single-signer short circuit: an ordinary Schnorr signature
    /// with a one-bit mask
    fn sign_alone(&self, publics: &[ProjectivePoint]) -> Result<Vec<u8>> {
        let (secret, commitment) = cosi::commit(&mut OsRng);
        let mask = Mask::with_signer(publics, &self.keypair.public)?;
        let challenge = cosi::challenge(&commitment, &mask.aggregate_public(), &self.proposal);
        let response = cosi::response(&self.keypair.private, &secret, &challenge);
        Ok(cosi::sign(&commitment, &response, &mask))
    }

    async fn emit(&self, signature: Vec<u8>) -> Result<()> {
        self.signature
            .send(signature)
            .await
            .map_err(|_| Error::Transport("signature listener is gone".into()))
    }
}

/// What one shard produced while the orchestrator was waiting on it
enum ShardEvent {
    Commitment(Commitment),
    SubleaderGone,
    Dead,
}

/// Wait for one shard's commitment, swapping out its subleader as often
/// as needed; each rotation stops the old instance and relaunches the
/// shard with the next candidate in the sub-roster
async fn collect_shard_commitment(
    launcher: Arc<dyn Launcher>,
    shard: usize,
    mut tree: Tree,
    mut handle: ShardHandle,
    proposal: Vec<u8>,
    publics: Vec<ProjectivePoint>,
    config: EngineConfig,
) -> Result<(Commitment, ShardHandle)> {
    let candidates = tree.roster().len() - 1;
    let mut tried = 1;
    loop {
        let event = next_shard_event(&mut handle).await;
        match event {
            ShardEvent::Commitment(message) => {
                debug!(shard, "shard commitment received");
                return Ok((message, handle));
            }
            ShardEvent::SubleaderGone => {
                warn!(shard, tried, "subleader not responding, rotating");
                handle.stop();
                if tried >= candidates {
                    return Err(Error::ShardExhausted(format!(
                        "shard {shard} tried all {candidates} subleader candidates"
                    )));
                }
                let current = tree
                    .subleader_roster_index()
                    .ok_or_else(|| Error::Internal(format!("shard {shard} has no subleader")))?;
                let mut next = current + 1;
                if next >= tree.roster().len() {
                    next = 1;
                }
                tree = tree::build_subtree(tree.roster(), next)?;
                handle = launcher.launch(&tree, &config)?;
                handle.start(&proposal, &publics).await?;
                tried += 1;
            }
            ShardEvent::Dead => {
                return Err(Error::Transport(format!(
                    "shard {shard} instance terminated without a commitment"
                )));
            }
        }
    }
}

async fn next_shard_event(handle: &mut ShardHandle) -> ShardEvent {
    // raced channel closes are resolved by draining the other channel
    // outside the select
    enum Raw {
        Commitment(Option<Commitment>),
        Gone(Option<()>),
    }
    let raw = tokio::select! {
        message = handle.sub_commitment.recv() => Raw::Commitment(message),
        signal = handle.subleader_gone.recv() => Raw::Gone(signal),
    };
    match raw {
        Raw::Commitment(Some(message)) => ShardEvent::Commitment(message),
        Raw::Commitment(None) => match handle.subleader_gone.try_recv() {
            Ok(()) => ShardEvent::SubleaderGone,
            Err(_) => ShardEvent::Dead,
        },
        Raw::Gone(Some(())) => ShardEvent::SubleaderGone,
        Raw::Gone(None) => match handle.sub_commitment.try_recv() {
            Ok(message) => ShardEvent::Commitment(message),
            Err(_) => ShardEvent::Dead,
        },
    }
}

/// Create, start and await a full signing run, returning the signature
pub async fn collective_sign(
    launcher: Arc<dyn Launcher>,
    roster: Roster,
    n_nodes: usize,
    keypair: Keypair,
    proposal: &[u8],
    config: ProtocolConfig,
) -> Result<Vec<u8>> {
    let (protocol, mut handle) = RootProtocol::new(
        launcher, roster, n_nodes, keypair, proposal, config,
    )?;
    let task = tokio::spawn(protocol.run());
    handle.start()?;

    match handle.signature.recv().await {
        Some(signature) => {
            task.await.map_err(|e| Error::Internal(e.to_string()))??;
            Ok(signature)
        }
        None => match task.await.map_err(|e| Error::Internal(e.to_string()))? {
            Ok(()) => Err(Error::Internal("run ended without a signature".into())),
            Err(error) => Err(error),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cosi::CompletePolicy;
    use crate::overlay::LocalRunner;

    #[test]
    fn rejects_empty_proposal() {
        let runner = Arc::new(LocalRunner::new(3).unwrap());
        let roster = runner.roster().clone();
        let keypair = runner.keypair(0).unwrap();
        let result = RootProtocol::new(
            runner,
            roster,
            3,
            keypair,
            b"",
            ProtocolConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn rejects_foreign_leader_key() {
        let runner = Arc::new(LocalRunner::new(3).unwrap());
        let roster = runner.roster().clone();
        let keypair = runner.keypair(1).unwrap();
        let result = RootProtocol::new(
            runner,
            roster,
            3,
            keypair,
            b"proposal",
            ProtocolConfig::default(),
        );
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn config_floors_are_applied() {
        let config = ProtocolConfig {
            n_subtrees: 0,
            protocol_timeout: Duration::ZERO,
            subleader_timeout: Duration::from_millis(1),
            leaves_timeout: Duration::from_secs(3),
        }
        .normalized();
        assert_eq!(config.n_subtrees, 1);
        assert_eq!(config.protocol_timeout, DEFAULT_PROTOCOL_TIMEOUT);
        assert_eq!(config.subleader_timeout, DEFAULT_SUBLEADER_TIMEOUT);
        assert_eq!(config.leaves_timeout, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn single_signer_short_circuit() {
        let runner = Arc::new(LocalRunner::new(1).unwrap());
        let roster = runner.roster().clone();
        let publics = roster.publics();
        let keypair = runner.keypair(0).unwrap();

        let signature = collective_sign(
            runner,
            roster,
            1,
            keypair,
            b"solo",
            ProtocolConfig::default(),
        )
        .await
        .unwrap();

        cosi::verify(&publics, b"solo", &signature, &CompletePolicy).unwrap();
        assert_eq!(signature[signature.len() - 1], 0b1);
    }
}
