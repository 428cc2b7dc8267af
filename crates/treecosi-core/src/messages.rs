//! Wire messages exchanged between tree nodes
//!
//! Points and scalars travel as byte encodings, so the same message types
//! serve the in-process overlay and any serialized transport.

use k256::{ProjectivePoint, Scalar};
use serde::{Deserialize, Serialize};

use crate::cosi::{self, Mask};
use crate::error::Result;

/// Announcement phase payload: the proposal and the global public key list
///
/// Sent root → subleader → leaves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Announcement {
    pub proposal: Vec<u8>,
    /// Compressed public keys, in global roster order
    pub publics: Vec<Vec<u8>>,
}

impl Announcement {
    pub fn new(proposal: &[u8], publics: &[ProjectivePoint]) -> Self {
        Self {
            proposal: proposal.to_vec(),
            publics: publics.iter().map(cosi::point_to_bytes).collect(),
        }
    }

    pub fn decode_publics(&self) -> Result<Vec<ProjectivePoint>> {
        self.publics
            .iter()
            .map(|bytes| cosi::point_from_bytes(bytes))
            .collect()
    }
}

/// Commitment phase payload: an aggregated commitment and its mask
///
/// Sent leaves → subleader → shard root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Commitment {
    pub commitment: Vec<u8>,
    pub mask: Vec<u8>,
}

impl Commitment {
    pub fn new(commitment: &ProjectivePoint, mask: &Mask) -> Self {
        Self {
            commitment: cosi::point_to_bytes(commitment),
            mask: mask.bytes().to_vec(),
        }
    }

    pub fn decode_commitment(&self) -> Result<ProjectivePoint> {
        cosi::point_from_bytes(&self.commitment)
    }
}

/// Challenge phase payload: the global challenge scalar
///
/// Sent root → subleader → leaves.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge: Vec<u8>,
}

impl Challenge {
    pub fn new(challenge: &Scalar) -> Self {
        Self {
            challenge: cosi::scalar_to_bytes(challenge).to_vec(),
        }
    }

    pub fn decode(&self) -> Result<Scalar> {
        cosi::scalar_from_bytes(&self.challenge)
    }
}

/// Response phase payload: an aggregated response scalar
///
/// Sent leaves → subleader → shard root.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub response: Vec<u8>,
}

impl Response {
    pub fn new(response: &Scalar) -> Self {
        Self {
            response: cosi::scalar_to_bytes(response).to_vec(),
        }
    }

    pub fn decode(&self) -> Result<Scalar> {
        cosi::scalar_from_bytes(&self.response)
    }
}

/// Cooperative abort, delivered to every node of a shard instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stop;
