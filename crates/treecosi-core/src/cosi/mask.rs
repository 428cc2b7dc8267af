//! Participation masks over a roster of public keys
//!
//! A mask carries one bit per roster position, LSB-first within each byte.
//! A set bit means the signer at that position contributed to the aggregate,
//! and the mask keeps the matching aggregate public key up to date as bits
//! are flipped.

use k256::ProjectivePoint;

use crate::error::{Error, Result};

/// Bit mask of participating signers, tied to the roster it was built from
#[derive(Clone)]
pub struct Mask {
    bits: Vec<u8>,
    publics: Vec<ProjectivePoint>,
    aggregate: ProjectivePoint,
}

impl Mask {
    /// Create an empty mask over the given roster of public keys
    pub fn new(publics: &[ProjectivePoint]) -> Result<Self> {
        if publics.is_empty() {
            return Err(Error::Crypto("mask over an empty public key list".into()));
        }
        Ok(Self {
            bits: vec![0u8; Self::mask_len(publics.len())],
            publics: publics.to_vec(),
            aggregate: ProjectivePoint::IDENTITY,
        })
    }

    /// Create a mask with only the bit of `own` set
    ///
    /// The signer's position is located by comparing public keys, so callers
    /// never need to know their global roster index.
    pub fn with_signer(publics: &[ProjectivePoint], own: &ProjectivePoint) -> Result<Self> {
        let mut mask = Self::new(publics)?;
        let position = publics
            .iter()
            .position(|public| public == own)
            .ok_or_else(|| Error::Crypto("signer public key not in roster".into()))?;
        mask.set_bit(position, true)?;
        Ok(mask)
    }

    /// Number of bytes a mask over `n` positions occupies
    pub fn mask_len(n: usize) -> usize {
        (n + 7) / 8
    }

    /// Number of roster positions this mask covers
    pub fn positions(&self) -> usize {
        self.publics.len()
    }

    /// Raw mask bytes
    pub fn bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Sum of the public keys whose bits are set
    pub fn aggregate_public(&self) -> ProjectivePoint {
        self.aggregate
    }

    /// Whether the bit at `position` is set
    pub fn bit(&self, position: usize) -> bool {
        if position >= self.publics.len() {
            return false;
        }
        self.bits[position >> 3] & (1 << (position & 7)) != 0
    }

    /// Set or clear one bit, adjusting the aggregate public key
    pub fn set_bit(&mut self, position: usize, enable: bool) -> Result<()> {
        if position >= self.publics.len() {
            return Err(Error::Crypto(format!(
                "mask position {} out of range for {} signers",
                position,
                self.publics.len()
            )));
        }
        let byte = position >> 3;
        let flag = 1 << (position & 7);
        if enable && self.bits[byte] & flag == 0 {
            self.bits[byte] |= flag;
            self.aggregate += self.publics[position];
        }
        if !enable && self.bits[byte] & flag != 0 {
            self.bits[byte] &= !flag;
            self.aggregate -= self.publics[position];
        }
        Ok(())
    }

    /// Merge another mask of the same shape into this one (bitwise OR)
    pub fn merge(&mut self, other: &[u8]) -> Result<()> {
        if other.len() != self.bits.len() {
            return Err(Error::Crypto(format!(
                "mask length mismatch: {} bytes, expected {}",
                other.len(),
                self.bits.len()
            )));
        }
        for position in 0..self.publics.len() {
            if other[position >> 3] & (1 << (position & 7)) != 0 {
                self.set_bit(position, true)?;
            }
        }
        Ok(())
    }

    /// Number of set bits
    pub fn count_enabled(&self) -> usize {
        (0..self.publics.len()).filter(|&i| self.bit(i)).count()
    }
}
