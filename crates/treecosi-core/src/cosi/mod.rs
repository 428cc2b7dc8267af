//! Schnorr-style collective signing primitives over secp256k1
//!
//! A collective signature is `R* || s* || mask*`: the aggregate commitment,
//! the aggregate response, and the participation mask naming which roster
//! positions contributed. Verification checks `s*·G == R* + c·A*` where `A*`
//! sums the public keys whose mask bits are set and the challenge binds the
//! commitment, the aggregate key and the proposal.

mod mask;

pub use mask::Mask;

use k256::{
    elliptic_curve::{
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field, PrimeField,
    },
    AffinePoint, EncodedPoint, ProjectivePoint, Scalar, U256,
};
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Length of a compressed SEC1 point encoding
pub const POINT_LEN: usize = 33;

/// Length of a scalar encoding
pub const SCALAR_LEN: usize = 32;

/// A signer's private scalar and matching public key
#[derive(Clone)]
pub struct Keypair {
    pub private: Scalar,
    pub public: ProjectivePoint,
}

impl Keypair {
    /// Generate a fresh random keypair
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_private(Scalar::random(rng))
    }

    /// Build the keypair for a known private scalar
    pub fn from_private(private: Scalar) -> Self {
        Self {
            private,
            public: ProjectivePoint::GENERATOR * private,
        }
    }
}

/// Draw a commitment nonce: secret `r` and commitment `R = r·G`
pub fn commit<R: RngCore + CryptoRng>(rng: &mut R) -> (Scalar, ProjectivePoint) {
    let secret = Scalar::random(rng);
    (secret, ProjectivePoint::GENERATOR * secret)
}

/// Collective challenge `c = H(R* || A* || M)` reduced to a scalar
pub fn challenge(
    commitment: &ProjectivePoint,
    aggregate_public: &ProjectivePoint,
    proposal: &[u8],
) -> Scalar {
    let mut hasher = Sha256::new();
    hasher.update(point_to_bytes(commitment));
    hasher.update(point_to_bytes(aggregate_public));
    hasher.update(proposal);
    let hash: [u8; 32] = hasher.finalize().into();
    <Scalar as Reduce<U256>>::reduce_bytes(&hash.into())
}

/// A signer's response `s = r + c·x`
pub fn response(private: &Scalar, secret: &Scalar, challenge: &Scalar) -> Scalar {
    secret + challenge * private
}

/// Sum commitments and OR their masks into a single shard aggregate
pub fn aggregate_commitments(
    commitments: &[ProjectivePoint],
    masks: &[Mask],
) -> Result<(ProjectivePoint, Mask)> {
    if commitments.is_empty() || commitments.len() != masks.len() {
        return Err(Error::Crypto(format!(
            "aggregation shape mismatch: {} commitments, {} masks",
            commitments.len(),
            masks.len()
        )));
    }
    let mut aggregate = ProjectivePoint::IDENTITY;
    for commitment in commitments {
        aggregate += commitment;
    }
    let mut mask = masks[0].clone();
    for other in &masks[1..] {
        mask.merge(other.bytes())?;
    }
    Ok((aggregate, mask))
}

/// Sum responses into a single scalar
pub fn aggregate_responses(responses: &[Scalar]) -> Result<Scalar> {
    if responses.is_empty() {
        return Err(Error::Crypto("no responses to aggregate".into()));
    }
    Ok(responses.iter().fold(Scalar::ZERO, |sum, s| sum + s))
}

/// Encode a collective signature as `R || s || mask`
pub fn sign(commitment: &ProjectivePoint, response: &Scalar, mask: &Mask) -> Vec<u8> {
    let mut signature = Vec::with_capacity(POINT_LEN + SCALAR_LEN + mask.bytes().len());
    signature.extend_from_slice(&point_to_bytes(commitment));
    signature.extend_from_slice(&scalar_to_bytes(response));
    signature.extend_from_slice(mask.bytes());
    signature
}

/// Verify a collective signature over `proposal` under a participation policy
pub fn verify(
    publics: &[ProjectivePoint],
    proposal: &[u8],
    signature: &[u8],
    policy: &dyn Policy,
) -> Result<()> {
    if publics.is_empty() {
        return Err(Error::InvalidArgument("empty public key list".into()));
    }
    let expected = POINT_LEN + SCALAR_LEN + Mask::mask_len(publics.len());
    if signature.len() != expected {
        return Err(Error::Crypto(format!(
            "signature is {} bytes, expected {}",
            signature.len(),
            expected
        )));
    }

    let commitment = point_from_bytes(&signature[..POINT_LEN])?;
    let response = scalar_from_bytes(&signature[POINT_LEN..POINT_LEN + SCALAR_LEN])?;
    let mut mask = Mask::new(publics)?;
    mask.merge(&signature[POINT_LEN + SCALAR_LEN..])?;

    if !policy.check(&mask) {
        return Err(Error::Crypto(format!(
            "participation policy rejected {}/{} signers",
            mask.count_enabled(),
            mask.positions()
        )));
    }

    let aggregate_public = mask.aggregate_public();
    let c = challenge(&commitment, &aggregate_public, proposal);
    let lhs = ProjectivePoint::GENERATOR * response;
    let rhs = commitment + aggregate_public * c;
    if lhs != rhs {
        return Err(Error::Crypto("signature does not verify".into()));
    }
    Ok(())
}

/// Decides whether a participation mask is acceptable for verification
pub trait Policy {
    fn check(&self, mask: &Mask) -> bool;
}

/// Requires every roster position to have signed
pub struct CompletePolicy;

impl Policy for CompletePolicy {
    fn check(&self, mask: &Mask) -> bool {
        mask.count_enabled() == mask.positions()
    }
}

/// Requires at least `threshold` roster positions to have signed
pub struct ThresholdPolicy {
    threshold: usize,
}

impl ThresholdPolicy {
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }
}

impl Policy for ThresholdPolicy {
    fn check(&self, mask: &Mask) -> bool {
        mask.count_enabled() >= self.threshold
    }
}

/// Compressed SEC1 encoding of a point
pub fn point_to_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Decode a compressed SEC1 point
pub fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded =
        EncodedPoint::from_bytes(bytes).map_err(|e| Error::Crypto(format!("bad point: {e}")))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::Crypto("point not on curve".into()))?;
    Ok(ProjectivePoint::from(affine))
}

/// Big-endian scalar encoding
pub fn scalar_to_bytes(scalar: &Scalar) -> [u8; 32] {
    scalar.to_bytes().into()
}

/// Decode a 32-byte scalar, rejecting out-of-range values
pub fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Crypto(format!("scalar is {} bytes, expected 32", bytes.len())))?;
    Option::<Scalar>::from(Scalar::from_repr(array.into()))
        .ok_or_else(|| Error::Crypto("scalar out of range".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypairs(n: usize) -> Vec<Keypair> {
        (0..n).map(|_| Keypair::generate(&mut OsRng)).collect()
    }

    /// Run the full commit/challenge/response flow for the signers whose
    /// indices are listed, masking everyone else out.
    fn collective(keys: &[Keypair], signers: &[usize], proposal: &[u8]) -> Vec<u8> {
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();

        let mut secrets = Vec::new();
        let mut commitments = Vec::new();
        let mut masks = Vec::new();
        for &i in signers {
            let (secret, commitment) = commit(&mut OsRng);
            secrets.push(secret);
            commitments.push(commitment);
            masks.push(Mask::with_signer(&publics, &keys[i].public).unwrap());
        }

        let (aggregate, mask) = aggregate_commitments(&commitments, &masks).unwrap();
        let c = challenge(&aggregate, &mask.aggregate_public(), proposal);

        let responses: Vec<Scalar> = signers
            .iter()
            .zip(&secrets)
            .map(|(&i, secret)| response(&keys[i].private, secret, &c))
            .collect();
        let s = aggregate_responses(&responses).unwrap();

        sign(&aggregate, &s, &mask)
    }

    #[test]
    fn single_signer_round_trip() {
        let keys = keypairs(1);
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();
        let signature = collective(&keys, &[0], b"lone proposal");
        verify(&publics, b"lone proposal", &signature, &CompletePolicy).unwrap();
        assert_eq!(signature[POINT_LEN + SCALAR_LEN..], [0b1]);
    }

    #[test]
    fn all_signers_verify_under_complete_policy() {
        let keys = keypairs(5);
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();
        let signature = collective(&keys, &[0, 1, 2, 3, 4], b"proposal");
        verify(&publics, b"proposal", &signature, &CompletePolicy).unwrap();
    }

    #[test]
    fn tampered_proposal_fails() {
        let keys = keypairs(3);
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();
        let signature = collective(&keys, &[0, 1, 2], b"original");
        assert!(verify(&publics, b"0riginal", &signature, &CompletePolicy).is_err());
    }

    #[test]
    fn absent_signer_needs_threshold_policy() {
        let keys = keypairs(4);
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();
        let signature = collective(&keys, &[0, 1, 3], b"partial");

        assert!(verify(&publics, b"partial", &signature, &CompletePolicy).is_err());
        verify(&publics, b"partial", &signature, &ThresholdPolicy::new(3)).unwrap();
        assert!(verify(&publics, b"partial", &signature, &ThresholdPolicy::new(4)).is_err());
    }

    #[test]
    fn truncated_signature_rejected() {
        let keys = keypairs(2);
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();
        let signature = collective(&keys, &[0, 1], b"msg");
        assert!(verify(&publics, b"msg", &signature[..signature.len() - 1], &CompletePolicy).is_err());
    }

    #[test]
    fn aggregation_shape_mismatch_rejected() {
        let keys = keypairs(2);
        let publics: Vec<ProjectivePoint> = keys.iter().map(|k| k.public).collect();
        let (_, commitment) = commit(&mut OsRng);
        let mask = Mask::with_signer(&publics, &keys[0].public).unwrap();
        assert!(aggregate_commitments(&[commitment], &[mask.clone(), mask]).is_err());
        assert!(aggregate_commitments(&[], &[]).is_err());
        assert!(aggregate_responses(&[]).is_err());
    }

    #[test]
    fn point_and_scalar_codecs_reject_garbage() {
        assert!(point_from_bytes(&[0u8; 33]).is_err());
        assert!(point_from_bytes(&[]).is_err());
        assert!(scalar_from_bytes(&[1u8; 31]).is_err());
        assert!(scalar_from_bytes(&[0xFFu8; 32]).is_err());

        let (_, commitment) = commit(&mut OsRng);
        let bytes = point_to_bytes(&commitment);
        assert_eq!(point_from_bytes(&bytes).unwrap(), commitment);
    }
}
