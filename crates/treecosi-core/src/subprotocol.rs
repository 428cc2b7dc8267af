//! Per-node sub-protocol engine: one shard's view of the four signing
//! phases
//!
//! A single dispatcher serves all three roles. The shard root only
//! relays: announcements and challenges go down, the subleader's
//! aggregates go up to the orchestrator. The subleader and the leaves
//! produce commitments and responses, the subleader folding its
//! children's contributions into its own before sending up. A stop
//! signal observed at any suspension point ends the dispatch early.

use std::time::Duration;

use k256::Scalar;
use rand::rngs::OsRng;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, instrument, warn};

use crate::cosi::{self, Mask};
use crate::error::{Error, Result};
use crate::messages::{Commitment, Response, Stop};
use crate::overlay::{EngineConfig, NodeContext, Upward};

/// One tree node's engine instance for a single signing run
pub struct SubProtocol {
    ctx: NodeContext,
    config: EngineConfig,
    upward: Option<Upward>,
}

impl SubProtocol {
    pub(crate) fn new(ctx: NodeContext, config: EngineConfig, upward: Option<Upward>) -> Self {
        Self {
            ctx,
            config,
            upward,
        }
    }

    /// Run all four phases, releasing the runtime slot on every exit path
    #[instrument(name = "sub_protocol", skip(self), fields(node = %self.ctx.address()))]
    pub async fn dispatch(mut self) -> Result<()> {
        let result = self.run().await;
        match &result {
            Ok(()) => debug!("dispatch complete"),
            Err(Error::Stopped) => {
                debug!("dispatch stopped");
                self.ctx.forward_stop();
            }
            Err(error) => warn!(%error, "dispatch failed"),
        }
        self.ctx.done();
        result
    }

    async fn run(&mut self) -> Result<()> {
        // ----- announcement -----
        let announcement = recv_or_stop(
            &mut self.ctx.inbound.announcement,
            &mut self.ctx.inbound.stop,
            "announcement",
        )
        .await?;
        debug!("received announcement");
        let publics = announcement.decode_publics()?;
        self.ctx.send_to_children(announcement.into()).await?;

        // ----- commitment -----
        let mut secret: Option<Scalar> = None;
        if self.ctx.is_root() {
            let upward = self
                .upward
                .as_ref()
                .ok_or_else(|| Error::Internal("shard root without upward channels".into()))?;
            tokio::select! {
                message = self.ctx.inbound.commitment.recv() => {
                    let commitment = message
                        .ok_or_else(|| Error::Transport("commitment channel closed".into()))?;
                    debug!("forwarding shard commitment");
                    upward
                        .commitment
                        .send(commitment)
                        .await
                        .map_err(|_| Error::Transport("orchestrator is gone".into()))?;
                }
                _ = self.ctx.inbound.stop.recv() => return Err(Error::Stopped),
                _ = sleep(self.config.subleader_timeout) => {
                    debug!("subleader not responding");
                    let _ = upward.subleader_gone.send(()).await;
                    return Ok(());
                }
            }
        } else {
            let want = self.ctx.n_children();
            let window = self.config.leaves_timeout;
            let received = collect_phase(
                &mut self.ctx.inbound.commitment,
                &mut self.ctx.inbound.stop,
                want,
                window,
            )
            .await?;
            debug!(
                received = received.len(),
                expected = want,
                "collected commitments"
            );

            let (own_secret, own_commitment) = cosi::commit(&mut OsRng);
            secret = Some(own_secret);

            let mut commitments = vec![own_commitment];
            let mut masks = vec![Mask::with_signer(&publics, &self.ctx.keypair.public)?];
            for message in &received {
                commitments.push(message.decode_commitment()?);
                let mut mask = Mask::new(&publics)?;
                mask.merge(&message.mask)?;
                masks.push(mask);
            }
            let (aggregate, mask) = cosi::aggregate_commitments(&commitments, &masks)?;
            self.ctx
                .send_to_parent(Commitment::new(&aggregate, &mask).into())
                .await?;
        }

        // ----- challenge -----
        let challenge = recv_or_stop(
            &mut self.ctx.inbound.challenge,
            &mut self.ctx.inbound.stop,
            "challenge",
        )
        .await?;
        debug!("received challenge");
        let challenge_scalar = challenge.decode()?;
        self.ctx.send_to_children(challenge.into()).await?;

        // ----- response -----
        if self.ctx.is_root() {
            let upward = self
                .upward
                .as_ref()
                .ok_or_else(|| Error::Internal("shard root without upward channels".into()))?;
            tokio::select! {
                message = self.ctx.inbound.response.recv() => {
                    let response = message
                        .ok_or_else(|| Error::Transport("response channel closed".into()))?;
                    debug!("forwarding shard response");
                    upward
                        .response
                        .send(response)
                        .await
                        .map_err(|_| Error::Transport("orchestrator is gone".into()))?;
                }
                _ = self.ctx.inbound.stop.recv() => return Err(Error::Stopped),
            }
        } else {
            let want = self.ctx.n_children();
            let window = self.config.leaves_timeout;
            let received = collect_phase(
                &mut self.ctx.inbound.response,
                &mut self.ctx.inbound.stop,
                want,
                window,
            )
            .await?;
            debug!(
                received = received.len(),
                expected = want,
                "collected responses"
            );

            let own_secret =
                secret.ok_or_else(|| Error::Internal("response phase without a commitment".into()))?;
            let mut responses = vec![cosi::response(
                &self.ctx.keypair.private,
                &own_secret,
                &challenge_scalar,
            )];
            for message in &received {
                responses.push(message.decode()?);
            }
            let aggregate = cosi::aggregate_responses(&responses)?;
            self.ctx
                .send_to_parent(Response::new(&aggregate).into())
                .await?;
        }

        Ok(())
    }
}

/// Wait for one phase message, bailing out on a stop signal
async fn recv_or_stop<T>(
    channel: &mut mpsc::Receiver<T>,
    stop: &mut mpsc::Receiver<Stop>,
    what: &str,
) -> Result<T> {
    tokio::select! {
        message = channel.recv() => {
            message.ok_or_else(|| Error::Transport(format!("{what} channel closed")))
        }
        _ = stop.recv() => Err(Error::Stopped),
    }
}

/// Gather up to `want` messages within `window`, returning whatever made
/// it in time; the mask reflects the ones that did not
async fn collect_phase<T>(
    channel: &mut mpsc::Receiver<T>,
    stop: &mut mpsc::Receiver<Stop>,
    want: usize,
    window: Duration,
) -> Result<Vec<T>> {
    let mut received = Vec::with_capacity(want);
    if want == 0 {
        return Ok(received);
    }
    let deadline = Instant::now() + window;
    while received.len() < want {
        tokio::select! {
            message = channel.recv() => match message {
                Some(message) => received.push(message),
                None => break,
            },
            _ = stop.recv() => return Err(Error::Stopped),
            _ = sleep_until(deadline) => {
                debug!(received = received.len(), expected = want, "phase window expired");
                break;
            }
        }
    }
    Ok(received)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Challenge;
    use crate::overlay::{Launcher, LocalRunner};
    use crate::tree::build_shards;
    use k256::ProjectivePoint;

    fn config() -> EngineConfig {
        EngineConfig {
            subleader_timeout: Duration::from_millis(500),
            leaves_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn shard_aggregate_satisfies_the_signing_equation() {
        let runner = LocalRunner::new(5).unwrap();
        let trees = build_shards(runner.roster(), 5, 1).unwrap();
        let publics = runner.roster().publics();

        let mut handle = runner.launch(&trees[0], &config()).unwrap();
        handle.start(b"proposal", &publics).await.unwrap();

        let commitment = handle.sub_commitment.recv().await.unwrap();
        let aggregate = commitment.decode_commitment().unwrap();
        let mut mask = Mask::new(&publics).unwrap();
        mask.merge(&commitment.mask).unwrap();
        assert_eq!(mask.count_enabled(), 4); // everyone but the shard root

        let challenge = cosi::challenge(&aggregate, &mask.aggregate_public(), b"proposal");
        handle.challenge(Challenge::new(&challenge)).await.unwrap();

        let response = handle.sub_response.recv().await.unwrap();
        let s = response.decode().unwrap();
        assert_eq!(
            ProjectivePoint::GENERATOR * s,
            aggregate + mask.aggregate_public() * challenge,
        );
    }

    #[tokio::test]
    async fn silent_leaf_leaves_its_bit_clear() {
        let runner = LocalRunner::new(4).unwrap();
        runner.set_unresponsive(3).unwrap();
        let trees = build_shards(runner.roster(), 4, 1).unwrap();
        let publics = runner.roster().publics();

        let mut handle = runner.launch(&trees[0], &config()).unwrap();
        handle.start(b"proposal", &publics).await.unwrap();

        let commitment = handle.sub_commitment.recv().await.unwrap();
        let mut mask = Mask::new(&publics).unwrap();
        mask.merge(&commitment.mask).unwrap();
        assert!(mask.bit(1));
        assert!(mask.bit(2));
        assert!(!mask.bit(3));
    }

    #[tokio::test]
    async fn stop_before_start_closes_the_upward_channels() {
        let runner = LocalRunner::new(3).unwrap();
        let trees = build_shards(runner.roster(), 3, 1).unwrap();

        let mut handle = runner.launch(&trees[0], &config()).unwrap();
        handle.stop();

        assert!(handle.sub_commitment.recv().await.is_none());
    }
}
