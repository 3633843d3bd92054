//! Bit vectors as carried on wires and in messages.
//!
//! All payloads on the wire use MSB-first ordering within each byte, which is
//! what the [`bitvec::order::Msb0`] ordering stores natively, so serializing a
//! bit vector is a plain copy of its backing bytes.

use rand::RngCore;

use crate::error::Error;

/// A growable vector of bits, MSB-first within each backing byte.
pub type BitVec = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// A borrowed slice of bits.
pub type BitSlice = bitvec::slice::BitSlice<u8, bitvec::order::Msb0>;

/// Samples `num_bits` random bits from the given generator.
pub fn random_bits(rng: &mut impl RngCore, num_bits: usize) -> BitVec {
    let mut bytes = vec![0u8; num_bits.div_ceil(8)];
    rng.fill_bytes(&mut bytes);
    let mut bits = BitVec::from_vec(bytes);
    bits.truncate(num_bits);
    bits
}

/// Builds a bit vector from a slice of booleans.
pub fn from_bools(bools: &[bool]) -> BitVec {
    bools.iter().copied().collect()
}

/// Serializes a bit vector into its backing bytes, padding the final byte
/// with zero bits.
pub(crate) fn to_bytes(bits: &BitVec) -> Vec<u8> {
    let mut bits = bits.clone();
    bits.set_uninitialized(false);
    bits.into_vec()
}

/// Deserializes `num_bits` bits from `bytes`, checking that the byte count
/// matches the announced bit length exactly.
pub(crate) fn from_bytes(bytes: Vec<u8>, num_bits: usize) -> Result<BitVec, Error> {
    if bytes.len() != num_bits.div_ceil(8) {
        return Err(Error::ProtocolViolation(format!(
            "payload of {} bytes does not hold {num_bits} bits",
            bytes.len()
        )));
    }
    let mut bits = BitVec::from_vec(bytes);
    bits.truncate(num_bits);
    Ok(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let bits = from_bools(&[true, false, true, true, false, false, true, false, true]);
        let bytes = to_bytes(&bits);
        assert_eq!(bytes, vec![0b1011_0010, 0b1000_0000]);
        assert_eq!(from_bytes(bytes, 9).unwrap(), bits);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        assert!(from_bytes(vec![0u8; 2], 20).is_err());
        assert!(from_bytes(vec![0u8; 3], 8).is_err());
    }

    #[test]
    fn random_bits_have_requested_length() {
        let mut rng = rand::rng();
        for n in [0, 1, 7, 8, 9, 128, 1000] {
            assert_eq!(random_bits(&mut rng, n).len(), n);
        }
    }
}
