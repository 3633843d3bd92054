//! Seekable RNG tapes based on AES-128 in counter mode.
//!
//! A [`SharedRng`] is a keyed tape whose streams can be derived in any
//! order: both endpoints of a correlated pair hold the same key and read
//! identical bits for the same stream id without coordinating offsets. The
//! same construction also backs each party's *private* tape, where the
//! stream id is a gate id, so per-gate sampling is reproducible regardless
//! of task scheduling.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::bits::BitVec;
use crate::block::Block;

/// The stream namespaces of a [`SharedRng`], keeping independently allocated
/// id spaces from colliding on the same counter blocks.
#[derive(Debug, Clone, Copy)]
pub(crate) enum StreamKind {
    /// Per-input-wire sharing randomness.
    Input = 1,
    /// Base randomness of correlated-OT instances.
    Ot = 2,
    /// Party-local per-gate sampling (the tape's seed is never shared).
    Gate = 3,
}

/// A keyed, seekable random tape.
///
/// Each `(kind, id)` pair names an independent stream; the counter block
/// layout is `kind ‖ id ‖ block-index`, so streams never overlap and can be
/// read in any order.
#[derive(Clone)]
pub(crate) struct SharedRng {
    aes: Aes128,
}

impl SharedRng {
    /// Derives the tape from a 32-byte seed as exchanged in the hello
    /// handshake.
    pub(crate) fn from_seed(seed: [u8; 32]) -> Self {
        let key: [u8; 16] = ChaCha20Rng::from_seed(seed).random();
        Self {
            aes: Aes128::new(GenericArray::from_slice(&key)),
        }
    }

    fn raw_block(&self, kind: StreamKind, id: u64, index: u64) -> [u8; 16] {
        let counter = ((kind as u128) << 112) | ((id as u128) << 48) | index as u128;
        let mut block = GenericArray::from(counter.to_le_bytes());
        self.aes.encrypt_block(&mut block);
        let mut out = [0u8; 16];
        out.copy_from_slice(&block);
        out
    }

    /// The `num_bits`-bit prefix of stream `(kind, id)`.
    pub(crate) fn bits(&self, kind: StreamKind, id: u64, num_bits: usize) -> BitVec {
        let mut bytes = Vec::with_capacity(num_bits.div_ceil(128) * 16);
        for index in 0..num_bits.div_ceil(128) as u64 {
            bytes.extend_from_slice(&self.raw_block(kind, id, index));
        }
        bytes.truncate(num_bits.div_ceil(8));
        let mut bits = BitVec::from_vec(bytes);
        bits.truncate(num_bits);
        bits
    }

    /// The first `count` blocks of stream `(kind, id)`.
    pub(crate) fn blocks(&self, kind: StreamKind, id: u64, count: usize) -> Vec<Block> {
        (0..count as u64)
            .map(|index| Block::from_bytes(self.raw_block(kind, id, index)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streams_are_deterministic_and_independent() {
        let seed = [7u8; 32];
        let a = SharedRng::from_seed(seed);
        let b = SharedRng::from_seed(seed);
        assert_eq!(
            a.bits(StreamKind::Input, 3, 200),
            b.bits(StreamKind::Input, 3, 200)
        );
        assert_ne!(
            a.bits(StreamKind::Input, 3, 200),
            a.bits(StreamKind::Input, 4, 200)
        );
        assert_ne!(
            a.bits(StreamKind::Input, 3, 128),
            a.bits(StreamKind::Ot, 3, 128)
        );
        assert_eq!(
            a.blocks(StreamKind::Ot, 9, 4),
            b.blocks(StreamKind::Ot, 9, 4)
        );
        assert_ne!(SharedRng::from_seed([8u8; 32]).bits(StreamKind::Input, 3, 64), a.bits(StreamKind::Input, 3, 64));
    }

    #[test]
    fn prefix_consistency() {
        let tape = SharedRng::from_seed([1u8; 32]);
        let long = tape.bits(StreamKind::Input, 0, 300);
        let short = tape.bits(StreamKind::Input, 0, 100);
        assert_eq!(&long[..100], &short[..]);
    }
}
