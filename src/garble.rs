//! The keyed mask function used to garble AND-gate rows.
//!
//! Each party masks its row contribution under both of its input-wire keys
//! with `π_k(tweak) ⊕ tweak`, AES-128 keyed by the wire key itself. The
//! construction is correlation robust only in the semi-honest setting, which
//! is the trust model of the whole engine.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::block::Block;

/// Masks derived from key `a` and key `b` for one row entry, XORed together.
pub(crate) fn row_mask(key_a: Block, key_b: Block, tweak: Block) -> Block {
    keyed_mask(key_a, tweak) ^ keyed_mask(key_b, !tweak)
}

/// `π_key(tweak) ⊕ tweak` under AES-128.
fn keyed_mask(key: Block, tweak: Block) -> Block {
    let aes = Aes128::new(GenericArray::from_slice(&key.to_bytes()));
    let mut block = GenericArray::from(tweak.to_bytes());
    aes.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    Block::from_bytes(out) ^ tweak
}

/// The tweak separating every `(gate, row, slot, position)` mask from every
/// other one.
pub(crate) fn row_tweak(gate_id: u64, row: usize, slot: usize, position: usize) -> Block {
    let low = ((position as u128) << 32) | ((slot as u128) << 8) | row as u128;
    Block(((gate_id as u128) << 64) | low)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_differ_by_key_and_tweak() {
        let k1: Block = rand::random();
        let k2: Block = rand::random();
        let t1 = row_tweak(1, 0, 0, 0);
        let t2 = row_tweak(1, 1, 0, 0);
        assert_ne!(row_mask(k1, k2, t1), row_mask(k1, k2, t2));
        assert_ne!(row_mask(k1, k2, t1), row_mask(k2, k1, t1));
        assert_eq!(row_mask(k1, k2, t1), row_mask(k1, k2, t1));
    }
}
