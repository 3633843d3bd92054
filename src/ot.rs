//! Correlated oblivious transfer (XCOT) at bit and κ-bit granularity.
//!
//! Each instance is bound to a peer and an instance id drawn from a
//! per-direction counter, so both endpoints of a pair allocate matching ids
//! by constructing their gates in the same order. The receiver chooses a bit
//! per position, the sender supplies a correlation, and after the
//! correction/message exchange the outputs satisfy
//! `t ⊕ q = choice · correlation` per position.
//!
//! The base random OTs are derived from the pair's shared random tape. This
//! is a deliberately insecure stand-in for the external base-OT /
//! OT-extension primitive (both endpoints could reconstruct each other's
//! values), in the same spirit as a trusted-dealer preprocessor: the
//! derandomization messages are exchanged for real, the base randomness is
//! not. Do not use outside of simulation and testing without swapping the
//! base.

use std::sync::Arc;

use crate::backend::Core;
use crate::bits::BitVec;
use crate::block::{self, Block};
use crate::comm::{MsgFuture, MsgKind};
use crate::error::Error;
use crate::rng::StreamKind;

/// Sub-stream of the instance tape holding the zero-messages.
const SUB_M0: u64 = 0;
/// Sub-stream of the instance tape holding the one-messages.
const SUB_M1: u64 = 1;
/// Sub-stream of the instance tape holding the receiver's random choices.
const SUB_CHOICE: u64 = 2;

/// Wire id of the sender's masked messages for instance `ot_id`.
fn messages_id(ot_id: u64) -> u64 {
    ot_id * 2
}

/// Wire id of the receiver's choice corrections for instance `ot_id`.
fn corrections_id(ot_id: u64) -> u64 {
    ot_id * 2 + 1
}

fn xor(mut a: BitVec, b: &BitVec) -> BitVec {
    a ^= b.as_bitslice();
    a
}

fn and(mut a: BitVec, b: &BitVec) -> BitVec {
    a &= b.as_bitslice();
    a
}

/// The sender side of a bit-level correlated OT.
pub(crate) struct XcotBitSender {
    core: Arc<Core>,
    peer: usize,
    ot_id: u64,
    num_ots: usize,
    correlations: Option<BitVec>,
    corrections: Option<MsgFuture>,
    outputs: Option<BitVec>,
}

impl XcotBitSender {
    /// Registers a sender instance towards `peer` for `num_ots` transfers.
    pub(crate) fn register(core: &Arc<Core>, peer: usize, num_ots: usize) -> Result<Self, Error> {
        let ot_id = core.next_ot_id(core.my_id(), peer);
        let corrections =
            core.registry()
                .register(MsgKind::Ot, peer, corrections_id(ot_id), Some(num_ots))?;
        Ok(Self {
            core: core.clone(),
            peer,
            ot_id,
            num_ots,
            correlations: None,
            corrections: Some(corrections),
            outputs: None,
        })
    }

    fn base(&self) -> Result<(BitVec, BitVec), Error> {
        let tape = self.core.pair_tape(self.core.my_id(), self.peer)?;
        Ok((
            tape.bits(StreamKind::Ot, self.ot_id * 4 + SUB_M0, self.num_ots),
            tape.bits(StreamKind::Ot, self.ot_id * 4 + SUB_M1, self.num_ots),
        ))
    }

    /// Sets the per-position correlation bits.
    pub(crate) fn set_correlations(&mut self, correlations: BitVec) -> Result<(), Error> {
        if correlations.len() != self.num_ots {
            return Err(Error::ConfigInvalid(format!(
                "{} correlation bits for {} transfers",
                correlations.len(),
                self.num_ots
            )));
        }
        self.correlations = Some(correlations);
        Ok(())
    }

    /// Sends the correlation-masked messages to the receiver.
    pub(crate) fn send_messages(&mut self) -> Result<(), Error> {
        let correlations = self
            .correlations
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("correlations not set".into()))?;
        let (m0, m1) = self.base()?;
        let v = xor(xor(m0, &m1), correlations);
        self.core
            .registry()
            .send_bits(self.peer, messages_id(self.ot_id), &v)
    }

    /// Awaits the receiver's corrections and derives the sender outputs.
    pub(crate) async fn compute_outputs(&mut self) -> Result<(), Error> {
        let corrections = self
            .corrections
            .take()
            .ok_or_else(|| Error::ConfigInvalid("outputs already computed".into()))?;
        let u = corrections.recv().await?;
        let (m0, m1) = self.base()?;
        let swapped = and(xor(m0.clone(), &m1), &u);
        self.outputs = Some(xor(m0, &swapped));
        Ok(())
    }

    /// The sender outputs `q`.
    pub(crate) fn outputs(&self) -> &BitVec {
        self.outputs.as_ref().expect("outputs computed")
    }
}

/// The receiver side of a bit-level correlated OT.
pub(crate) struct XcotBitReceiver {
    core: Arc<Core>,
    peer: usize,
    ot_id: u64,
    num_ots: usize,
    choices: Option<BitVec>,
    messages: Option<MsgFuture>,
    outputs: Option<BitVec>,
}

impl XcotBitReceiver {
    /// Registers a receiver instance towards `peer` for `num_ots` transfers.
    pub(crate) fn register(core: &Arc<Core>, peer: usize, num_ots: usize) -> Result<Self, Error> {
        let ot_id = core.next_ot_id(peer, core.my_id());
        let messages =
            core.registry()
                .register(MsgKind::Ot, peer, messages_id(ot_id), Some(num_ots))?;
        Ok(Self {
            core: core.clone(),
            peer,
            ot_id,
            num_ots,
            choices: None,
            messages: Some(messages),
            outputs: None,
        })
    }

    fn base(&self) -> Result<(BitVec, BitVec), Error> {
        let tape = self.core.pair_tape(self.peer, self.core.my_id())?;
        let m0 = tape.bits(StreamKind::Ot, self.ot_id * 4 + SUB_M0, self.num_ots);
        let m1 = tape.bits(StreamKind::Ot, self.ot_id * 4 + SUB_M1, self.num_ots);
        let r = tape.bits(StreamKind::Ot, self.ot_id * 4 + SUB_CHOICE, self.num_ots);
        let chosen = xor(m0.clone(), &and(xor(m0, &m1), &r));
        Ok((r, chosen))
    }

    /// Sets the per-position choice bits.
    pub(crate) fn set_choices(&mut self, choices: BitVec) -> Result<(), Error> {
        if choices.len() != self.num_ots {
            return Err(Error::ConfigInvalid(format!(
                "{} choice bits for {} transfers",
                choices.len(),
                self.num_ots
            )));
        }
        self.choices = Some(choices);
        Ok(())
    }

    /// Sends the corrections derandomizing the base choices.
    pub(crate) fn send_corrections(&mut self) -> Result<(), Error> {
        let choices = self
            .choices
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("choices not set".into()))?;
        let (r, _) = self.base()?;
        let u = xor(r, choices);
        self.core
            .registry()
            .send_bits(self.peer, corrections_id(self.ot_id), &u)
    }

    /// Awaits the sender's messages and derives the receiver outputs.
    pub(crate) async fn compute_outputs(&mut self) -> Result<(), Error> {
        let messages = self
            .messages
            .take()
            .ok_or_else(|| Error::ConfigInvalid("outputs already computed".into()))?;
        let v = messages.recv().await?;
        let choices = self
            .choices
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("choices not set".into()))?;
        let (_, chosen) = self.base()?;
        self.outputs = Some(xor(chosen, &and(v, choices)));
        Ok(())
    }

    /// The receiver outputs `t = q ⊕ choice · correlation`.
    pub(crate) fn outputs(&self) -> &BitVec {
        self.outputs.as_ref().expect("outputs computed")
    }
}

/// The sender side of a κ-bit (block) correlated OT.
pub(crate) struct XcotBlockSender {
    core: Arc<Core>,
    peer: usize,
    ot_id: u64,
    num_ots: usize,
    correlations: Option<Vec<Block>>,
    corrections: Option<MsgFuture>,
    outputs: Option<Vec<Block>>,
}

impl XcotBlockSender {
    /// Registers a block sender instance towards `peer`.
    pub(crate) fn register(core: &Arc<Core>, peer: usize, num_ots: usize) -> Result<Self, Error> {
        let ot_id = core.next_ot_id(core.my_id(), peer);
        let corrections =
            core.registry()
                .register(MsgKind::Ot, peer, corrections_id(ot_id), Some(num_ots))?;
        Ok(Self {
            core: core.clone(),
            peer,
            ot_id,
            num_ots,
            correlations: None,
            corrections: Some(corrections),
            outputs: None,
        })
    }

    fn base(&self) -> Result<(Vec<Block>, Vec<Block>), Error> {
        let tape = self.core.pair_tape(self.core.my_id(), self.peer)?;
        Ok((
            tape.blocks(StreamKind::Ot, self.ot_id * 4 + SUB_M0, self.num_ots),
            tape.blocks(StreamKind::Ot, self.ot_id * 4 + SUB_M1, self.num_ots),
        ))
    }

    /// Sets the per-position κ-bit correlations.
    pub(crate) fn set_correlations(&mut self, correlations: Vec<Block>) -> Result<(), Error> {
        if correlations.len() != self.num_ots {
            return Err(Error::ConfigInvalid(format!(
                "{} correlation blocks for {} transfers",
                correlations.len(),
                self.num_ots
            )));
        }
        self.correlations = Some(correlations);
        Ok(())
    }

    /// Sends the correlation-masked message blocks to the receiver.
    pub(crate) fn send_messages(&mut self) -> Result<(), Error> {
        let correlations = self
            .correlations
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("correlations not set".into()))?;
        let (m0, m1) = self.base()?;
        let v: Vec<Block> = m0
            .iter()
            .zip(&m1)
            .zip(correlations)
            .map(|((m0, m1), d)| *m0 ^ *m1 ^ *d)
            .collect();
        self.core.registry().send(
            MsgKind::Ot,
            self.peer,
            messages_id(self.ot_id),
            block::blocks_to_bytes(&v),
            self.num_ots * Block::BITS,
        )
    }

    /// Awaits the receiver's corrections and derives the sender outputs.
    pub(crate) async fn compute_outputs(&mut self) -> Result<(), Error> {
        let corrections = self
            .corrections
            .take()
            .ok_or_else(|| Error::ConfigInvalid("outputs already computed".into()))?;
        let u = corrections.recv().await?;
        let (m0, m1) = self.base()?;
        self.outputs = Some(
            m0.into_iter()
                .zip(m1)
                .zip(u.iter().by_vals())
                .map(|((m0, m1), u)| if u { m1 } else { m0 })
                .collect(),
        );
        Ok(())
    }

    /// The sender outputs `q`.
    pub(crate) fn outputs(&self) -> &[Block] {
        self.outputs.as_deref().expect("outputs computed")
    }
}

/// The receiver side of a κ-bit (block) correlated OT.
pub(crate) struct XcotBlockReceiver {
    core: Arc<Core>,
    peer: usize,
    ot_id: u64,
    num_ots: usize,
    choices: Option<BitVec>,
    messages: Option<MsgFuture>,
    outputs: Option<Vec<Block>>,
}

impl XcotBlockReceiver {
    /// Registers a block receiver instance towards `peer`.
    pub(crate) fn register(core: &Arc<Core>, peer: usize, num_ots: usize) -> Result<Self, Error> {
        let ot_id = core.next_ot_id(peer, core.my_id());
        let messages = core.registry().register(
            MsgKind::Ot,
            peer,
            messages_id(ot_id),
            Some(num_ots * Block::BITS),
        )?;
        Ok(Self {
            core: core.clone(),
            peer,
            ot_id,
            num_ots,
            choices: None,
            messages: Some(messages),
            outputs: None,
        })
    }

    fn base(&self) -> Result<(BitVec, Vec<Block>), Error> {
        let tape = self.core.pair_tape(self.peer, self.core.my_id())?;
        let m0 = tape.blocks(StreamKind::Ot, self.ot_id * 4 + SUB_M0, self.num_ots);
        let m1 = tape.blocks(StreamKind::Ot, self.ot_id * 4 + SUB_M1, self.num_ots);
        let r = tape.bits(StreamKind::Ot, self.ot_id * 4 + SUB_CHOICE, self.num_ots);
        let chosen = m0
            .into_iter()
            .zip(m1)
            .zip(r.iter().by_vals())
            .map(|((m0, m1), r)| if r { m1 } else { m0 })
            .collect();
        Ok((r, chosen))
    }

    /// Sets the per-position choice bits.
    pub(crate) fn set_choices(&mut self, choices: BitVec) -> Result<(), Error> {
        if choices.len() != self.num_ots {
            return Err(Error::ConfigInvalid(format!(
                "{} choice bits for {} transfers",
                choices.len(),
                self.num_ots
            )));
        }
        self.choices = Some(choices);
        Ok(())
    }

    /// Sends the corrections derandomizing the base choices.
    pub(crate) fn send_corrections(&mut self) -> Result<(), Error> {
        let choices = self
            .choices
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("choices not set".into()))?;
        let (r, _) = self.base()?;
        let u = xor(r, choices);
        self.core
            .registry()
            .send_bits(self.peer, corrections_id(self.ot_id), &u)
    }

    /// Awaits the sender's message blocks and derives the receiver outputs.
    pub(crate) async fn compute_outputs(&mut self) -> Result<(), Error> {
        let messages = self
            .messages
            .take()
            .ok_or_else(|| Error::ConfigInvalid("outputs already computed".into()))?;
        let bytes = messages.recv_raw().await?;
        let v = block::bytes_to_blocks(&bytes, self.num_ots)?;
        let choices = self
            .choices
            .as_ref()
            .ok_or_else(|| Error::ConfigInvalid("choices not set".into()))?;
        let (_, chosen) = self.base()?;
        self.outputs = Some(
            chosen
                .into_iter()
                .zip(v)
                .zip(choices.iter().by_vals())
                .map(|((m, v), c)| m ^ v.select(c))
                .collect(),
        );
        Ok(())
    }

    /// The receiver outputs `t = q ⊕ choice · correlation`.
    pub(crate) fn outputs(&self) -> &[Block] {
        self.outputs.as_deref().expect("outputs computed")
    }
}
