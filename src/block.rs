//! A 128-bit [`Block`], the unit of wire-key material.

use std::fmt;
use std::ops::{BitXor, BitXorAssign, Not};

use rand::{distr::StandardUniform, prelude::Distribution, Rng};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A 128-bit block, used for κ-bit wire keys and PRG output.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Block(pub(crate) u128);

impl Block {
    /// All bits set to 0.
    pub const ZERO: Self = Self(0);
    /// 16 bytes in a block.
    pub const BYTES: usize = 16;
    /// 128 bits in a block.
    pub const BITS: usize = 128;

    /// Creates a block from little-endian bytes.
    #[inline]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(u128::from_le_bytes(bytes))
    }

    /// The little-endian bytes of the block.
    #[inline]
    pub const fn to_bytes(self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    /// Multiplies the block by a bit: returns `self` if `bit` is set,
    /// [`Block::ZERO`] otherwise.
    #[inline]
    pub fn select(self, bit: bool) -> Self {
        if bit {
            self
        } else {
            Self::ZERO
        }
    }
}

impl BitXor for Block {
    type Output = Self;

    #[inline]
    fn bitxor(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }
}

impl BitXorAssign for Block {
    #[inline]
    fn bitxor_assign(&mut self, rhs: Self) {
        self.0 ^= rhs.0;
    }
}

impl Not for Block {
    type Output = Self;

    #[inline]
    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl Distribution<Block> for StandardUniform {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Block {
        Block(rng.random())
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:032x})", self.0)
    }
}

/// Serializes a slice of blocks into little-endian bytes.
pub(crate) fn blocks_to_bytes(blocks: &[Block]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(blocks.len() * Block::BYTES);
    for block in blocks {
        bytes.extend_from_slice(&block.to_bytes());
    }
    bytes
}

/// Deserializes blocks from little-endian bytes, expecting exactly `count`
/// blocks.
pub(crate) fn bytes_to_blocks(bytes: &[u8], count: usize) -> Result<Vec<Block>, Error> {
    if bytes.len() != count * Block::BYTES {
        return Err(Error::ProtocolViolation(format!(
            "payload of {} bytes does not hold {count} blocks",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(Block::BYTES)
        .map(|chunk| {
            let mut arr = [0u8; 16];
            arr.copy_from_slice(chunk);
            Block::from_bytes(arr)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let mut rng = rand::rng();
        let blocks: Vec<Block> = (0..9).map(|_| rng.random()).collect();
        let bytes = blocks_to_bytes(&blocks);
        assert_eq!(bytes_to_blocks(&bytes, 9).unwrap(), blocks);
        assert!(bytes_to_blocks(&bytes, 8).is_err());
    }

    #[test]
    fn select_is_multiplication_by_a_bit() {
        let b: Block = rand::random();
        assert_eq!(b.select(true), b);
        assert_eq!(b.select(false), Block::ZERO);
    }
}
