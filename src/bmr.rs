//! N-party garbled circuits in the style of Beaver, Micali and Rogaway.
//!
//! Every wire carries, per SIMD lane, a local share `λ^i` of the wire's
//! permutation bit and a pair of κ-bit keys; the one-key is the zero-key
//! XORed with a party-wide offset, so XOR gates are free. The setup phase
//! garbles all AND gates using correlated OTs between every party pair; the
//! online phase is a single pass in which input owners reveal masked public
//! values and the matching keys, and every AND gate is evaluated locally by
//! decrypting one of its four garbled rows.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::oneshot;

use crate::backend::{AnyGate, Core, InputSetter, OutputHandle, Recipient};
use crate::bits::BitVec;
use crate::block::{self, Block};
use crate::comm::{MsgFuture, MsgKind};
use crate::error::Error;
use crate::garble;
use crate::ot::{XcotBitReceiver, XcotBitSender, XcotBlockReceiver, XcotBlockSender};
use crate::rng::StreamKind;
use crate::sync::ReadyCell;
use crate::utils::xor_inplace;

/// The setup-phase state of a garbled wire.
pub struct WireSetup {
    /// This party's share of the wire's permutation bit, per lane.
    pub permutation_share: BitVec,
    /// This party's zero-keys, per lane. The one-key is the zero-key XORed
    /// with the party-wide offset.
    pub keys0: Vec<Block>,
}

/// The online-phase state of a garbled wire.
pub struct WireOnline {
    /// The revealed public value `x ⊕ λ`, per lane.
    pub public_value: BitVec,
    /// Every party's key for the public value, indexed `party * num_simd +
    /// lane`.
    pub active_keys: Vec<Block>,
}

/// A garbled wire.
pub struct BmrWire {
    num_simd: usize,
    setup: ReadyCell<WireSetup>,
    online: ReadyCell<WireOnline>,
}

/// A vector of garbled wires, the unit gates operate on.
pub type BmrWireVec = Vec<Arc<BmrWire>>;

impl BmrWire {
    fn new(num_simd: usize, core: &Core) -> Arc<Self> {
        Arc::new(Self {
            num_simd,
            setup: ReadyCell::new(core.abort_rx()),
            online: ReadyCell::new(core.abort_rx()),
        })
    }

    /// The number of SIMD lanes on this wire.
    pub fn num_simd(&self) -> usize {
        self.num_simd
    }

    /// Waits until setup is ready and returns the permutation share and
    /// keys.
    pub async fn wait_setup(&self) -> Result<&WireSetup, Error> {
        self.setup.wait().await
    }

    /// Waits until the online phase is ready and returns the public value
    /// and active keys.
    pub async fn wait_online(&self) -> Result<&WireOnline, Error> {
        self.online.wait().await
    }

    /// The setup state, if setup has completed.
    pub fn setup_state(&self) -> Option<&WireSetup> {
        self.setup.get()
    }

    /// The online state, if the online phase has completed.
    pub fn online_state(&self) -> Option<&WireOnline> {
        self.online.get()
    }

    fn set_setup_ready(&self, state: WireSetup) -> Result<(), Error> {
        debug_assert_eq!(state.permutation_share.len(), self.num_simd);
        debug_assert_eq!(state.keys0.len(), self.num_simd);
        self.setup.set(state)
    }

    fn set_online_ready(&self, state: WireOnline) -> Result<(), Error> {
        debug_assert_eq!(state.public_value.len(), self.num_simd);
        self.online.set(state)
    }

    fn poison(&self) {
        self.setup.poison();
        self.online.poison();
    }
}

fn poison_all(wires: &BmrWireVec) {
    for wire in wires {
        wire.poison();
    }
}

fn check_wires(wires: &BmrWireVec) -> Result<(usize, usize), Error> {
    let Some(first) = wires.first() else {
        return Err(Error::ConfigInvalid("number of wires must be positive".into()));
    };
    let num_simd = first.num_simd();
    if wires.iter().any(|w| w.num_simd() != num_simd) {
        return Err(Error::ConfigInvalid(
            "number of SIMD values must be the same for all wires".into(),
        ));
    }
    Ok((wires.len(), num_simd))
}

/// The gate factory of the garbled-circuit protocol.
#[derive(Clone)]
pub struct BmrProvider {
    core: Arc<Core>,
}

impl BmrProvider {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    fn new_wires(&self, num_wires: usize, num_simd: usize) -> BmrWireVec {
        (0..num_wires)
            .map(|_| BmrWire::new(num_simd, &self.core))
            .collect()
    }

    /// Registers an input gate owned by `input_owner`. The owner receives a
    /// setter for the clear value; every other party receives `None`.
    pub fn input(
        &self,
        input_owner: usize,
        num_wires: usize,
        num_simd: usize,
    ) -> Result<(Option<InputSetter>, BmrWireVec), Error> {
        if num_wires == 0 || num_simd == 0 {
            return Err(Error::ConfigInvalid(
                "input gates need at least one wire and one SIMD lane".into(),
            ));
        }
        if input_owner >= self.core.num_parties() {
            return Err(Error::ConfigInvalid(format!(
                "no party with id {input_owner}"
            )));
        }
        let my_id = self.core.my_id();
        let gate_id = self.core.next_gate_id();
        let keys_id = self.core.next_gate_id();
        let input_id = self.core.next_input_id(num_wires);
        let num_bits = num_wires * num_simd;

        let (setter, source) = if input_owner == my_id {
            let (setter, source) = InputSetter::new(num_wires, num_simd);
            (Some(setter), Some(source))
        } else {
            (None, None)
        };
        let public_value_future = if input_owner == my_id {
            None
        } else {
            Some(self.core.registry().register(
                MsgKind::Bits,
                input_owner,
                gate_id,
                Some(num_bits),
            )?)
        };
        let mut key_futures: Vec<Option<MsgFuture>> =
            (0..self.core.num_parties()).map(|_| None).collect();
        for p in self.core.peers() {
            key_futures[p] = Some(self.core.registry().register(
                MsgKind::Bits,
                p,
                keys_id,
                Some(num_bits * Block::BITS),
            )?);
        }

        let outputs = self.new_wires(num_wires, num_simd);
        self.core.push_gate(AnyGate::BmrInput(InputGate {
            core: self.core.clone(),
            gate_id,
            keys_id,
            input_owner,
            num_wires,
            num_simd,
            input_id,
            source,
            public_value_future,
            key_futures,
            full_permutation: Vec::new(),
            my_keys0: Vec::new(),
            outputs: outputs.clone(),
        }));
        Ok((setter, outputs))
    }

    /// Registers an output gate revealing `inputs` to `recipient`, by
    /// reconstructing the permutation bits from their shares and XORing with
    /// the public values.
    pub fn output(&self, inputs: BmrWireVec, recipient: Recipient) -> Result<OutputHandle, Error> {
        if inputs.is_empty() {
            return Err(Error::ConfigInvalid("number of wires must be positive".into()));
        }
        if let Recipient::Party(p) = recipient {
            if p >= self.core.num_parties() {
                return Err(Error::ConfigInvalid(format!("no party with id {p}")));
            }
        }
        let gate_id = self.core.next_gate_id();
        let eligible = match recipient {
            Recipient::All => true,
            Recipient::Party(p) => p == self.core.my_id(),
        };
        let num_bits: usize = inputs.iter().map(|w| w.num_simd()).sum();
        let mut share_futures: Vec<Option<MsgFuture>> =
            (0..self.core.num_parties()).map(|_| None).collect();
        if eligible {
            for p in self.core.peers() {
                share_futures[p] =
                    Some(
                        self.core
                            .registry()
                            .register(MsgKind::Bits, p, gate_id, Some(num_bits))?,
                    );
            }
        }
        let (handle, promise) = OutputHandle::new(eligible);
        self.core.push_gate(AnyGate::BmrOutput(OutputGate {
            core: self.core.clone(),
            gate_id,
            recipient,
            inputs,
            share_futures,
            promise,
        }));
        Ok(handle)
    }

    fn check_binary(&self, a: &BmrWireVec, b: &BmrWireVec) -> Result<(usize, usize), Error> {
        let (num_wires, num_simd) = check_wires(a)?;
        if b.len() != num_wires {
            return Err(Error::ConfigInvalid(
                "number of wires must be the same for both inputs".into(),
            ));
        }
        if b.iter().any(|w| w.num_simd() != num_simd) {
            return Err(Error::ConfigInvalid(
                "number of SIMD values must be the same for all wires".into(),
            ));
        }
        Ok((num_wires, num_simd))
    }

    /// Registers a free-XOR gate.
    pub fn xor(&self, a: &BmrWireVec, b: &BmrWireVec) -> Result<BmrWireVec, Error> {
        let (num_wires, num_simd) = self.check_binary(a, b)?;
        let gate_id = self.core.next_gate_id();
        let outputs = self.new_wires(num_wires, num_simd);
        self.core.push_gate(AnyGate::BmrXor(XorGate {
            gate_id,
            inputs_a: a.clone(),
            inputs_b: b.clone(),
            outputs: outputs.clone(),
        }));
        Ok(outputs)
    }

    /// Registers an inversion gate: the key roles are swapped in setup and
    /// the public value is complemented once it is revealed. Free.
    pub fn inv(&self, a: &BmrWireVec) -> Result<BmrWireVec, Error> {
        let (num_wires, num_simd) = check_wires(a)?;
        let gate_id = self.core.next_gate_id();
        let outputs = self.new_wires(num_wires, num_simd);
        self.core.push_gate(AnyGate::BmrInv(InvGate {
            core: self.core.clone(),
            gate_id,
            inputs: a.clone(),
            outputs: outputs.clone(),
        }));
        Ok(outputs)
    }

    /// Registers a garbled AND gate.
    pub fn and(&self, a: &BmrWireVec, b: &BmrWireVec) -> Result<BmrWireVec, Error> {
        let (num_wires, num_simd) = self.check_binary(a, b)?;
        let n = self.core.num_parties();
        let gate_id = self.core.next_gate_id();
        let num_bits = num_wires * num_simd;

        let mut bit_senders: Vec<Option<XcotBitSender>> = (0..n).map(|_| None).collect();
        let mut bit_receivers: Vec<Option<XcotBitReceiver>> = (0..n).map(|_| None).collect();
        let mut block_senders: Vec<Option<XcotBlockSender>> = (0..n).map(|_| None).collect();
        let mut block_receivers: Vec<Option<XcotBlockReceiver>> = (0..n).map(|_| None).collect();
        let mut row_futures: Vec<Option<MsgFuture>> = (0..n).map(|_| None).collect();
        for p in self.core.peers() {
            bit_senders[p] = Some(XcotBitSender::register(&self.core, p, num_bits)?);
            bit_receivers[p] = Some(XcotBitReceiver::register(&self.core, p, num_bits)?);
            block_senders[p] = Some(XcotBlockSender::register(&self.core, p, 4 * num_bits)?);
            block_receivers[p] = Some(XcotBlockReceiver::register(&self.core, p, 4 * num_bits)?);
            row_futures[p] = Some(self.core.registry().register(
                MsgKind::Bits,
                p,
                gate_id,
                Some(4 * num_bits * n * Block::BITS),
            )?);
        }

        let outputs = self.new_wires(num_wires, num_simd);
        self.core.push_gate(AnyGate::BmrAnd(AndGate {
            core: self.core.clone(),
            gate_id,
            num_wires,
            num_simd,
            inputs_a: a.clone(),
            inputs_b: b.clone(),
            outputs: outputs.clone(),
            bit_senders,
            bit_receivers,
            block_senders,
            block_receivers,
            row_futures,
            my_keys0: Vec::new(),
            table: Vec::new(),
        }));
        Ok(outputs)
    }
}

/// An input gate. The owner samples the permutation bit and reveals the
/// masked value online; all parties contribute keys for their slot.
pub(crate) struct InputGate {
    core: Arc<Core>,
    gate_id: u64,
    keys_id: u64,
    input_owner: usize,
    num_wires: usize,
    num_simd: usize,
    input_id: u64,
    source: Option<oneshot::Receiver<Vec<BitVec>>>,
    public_value_future: Option<MsgFuture>,
    key_futures: Vec<Option<MsgFuture>>,
    full_permutation: Vec<BitVec>,
    my_keys0: Vec<Vec<Block>>,
    outputs: BmrWireVec,
}

impl InputGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        let my_id = self.core.my_id();
        let fresh_shares = self
            .core
            .gate_bits(self.gate_id, self.num_wires * self.num_simd);
        let fresh_keys = self
            .core
            .gate_blocks(self.gate_id, self.num_wires * self.num_simd);
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let stream_id = self.input_id + wire_i as u64;
            let permutation_share = if my_id == self.input_owner {
                // The owner knows every party's share: the peers derive
                // theirs from the tape seeded by the owner.
                let share = fresh_shares
                    [wire_i * self.num_simd..(wire_i + 1) * self.num_simd]
                    .to_bitvec();
                let mut full = share.clone();
                for p in self.core.peers() {
                    let tape = self.core.pair_tape(my_id, p)?;
                    full ^= tape
                        .bits(StreamKind::Input, stream_id, self.num_simd)
                        .as_bitslice();
                }
                self.full_permutation.push(full);
                share
            } else {
                self.core
                    .pair_tape(self.input_owner, my_id)?
                    .bits(StreamKind::Input, stream_id, self.num_simd)
            };
            let keys0 =
                fresh_keys[wire_i * self.num_simd..(wire_i + 1) * self.num_simd].to_vec();
            self.my_keys0.push(keys0.clone());
            wire.set_setup_ready(WireSetup {
                permutation_share,
                keys0,
            })?;
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        let my_id = self.core.my_id();
        let n = self.core.num_parties();
        let offset = self.core.garble_offset();

        // Public values: revealed by the owner, received by everyone else.
        let public_values: Vec<BitVec> = if my_id == self.input_owner {
            let source = self.source.take().expect("online phase runs once");
            let inputs = source.await.map_err(|_| Error::Aborted)?;
            if inputs.len() != self.num_wires || inputs.iter().any(|i| i.len() != self.num_simd) {
                return Err(Error::ConfigInvalid(
                    "input does not match the gate's wire and SIMD layout".into(),
                ));
            }
            let mut all = BitVec::with_capacity(self.num_wires * self.num_simd);
            let values: Vec<BitVec> = inputs
                .iter()
                .zip(&self.full_permutation)
                .map(|(input, lambda)| {
                    let mut value = input.clone();
                    value ^= lambda.as_bitslice();
                    all.extend_from_bitslice(value.as_bitslice());
                    value
                })
                .collect();
            self.core.registry().broadcast_bits(self.gate_id, &all)?;
            values
        } else {
            let future = self
                .public_value_future
                .take()
                .expect("online phase runs once");
            let all = future.recv().await?;
            (0..self.num_wires)
                .map(|w| all[w * self.num_simd..(w + 1) * self.num_simd].to_bitvec())
                .collect()
        };

        // Everyone forwards its keys for the revealed values.
        let mut my_active = Vec::with_capacity(self.num_wires * self.num_simd);
        for (wire_i, value) in public_values.iter().enumerate() {
            for (lane, bit) in value.iter().by_vals().enumerate() {
                my_active.push(self.my_keys0[wire_i][lane] ^ offset.select(bit));
            }
        }
        let blob = block::blocks_to_bytes(&my_active);
        let num_bits = my_active.len() * Block::BITS;
        for p in self.core.peers() {
            self.core
                .registry()
                .send(MsgKind::Bits, p, self.keys_id, blob.clone(), num_bits)?;
        }

        let mut per_party: Vec<Vec<Block>> = vec![Vec::new(); n];
        per_party[my_id] = my_active;
        let mut parties = Vec::with_capacity(n - 1);
        let mut futures = Vec::with_capacity(n - 1);
        for (p, future) in self.key_futures.iter_mut().enumerate() {
            if let Some(future) = future.take() {
                parties.push(p);
                futures.push(future);
            }
        }
        let blobs = try_join_all(futures.into_iter().map(MsgFuture::recv_raw)).await?;
        for (p, bytes) in parties.into_iter().zip(blobs) {
            per_party[p] = block::bytes_to_blocks(&bytes, self.num_wires * self.num_simd)?;
        }

        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let mut active_keys = Vec::with_capacity(n * self.num_simd);
            for party_keys in &per_party {
                active_keys.extend_from_slice(
                    &party_keys[wire_i * self.num_simd..(wire_i + 1) * self.num_simd],
                );
            }
            wire.set_online_ready(WireOnline {
                public_value: public_values[wire_i].clone(),
                active_keys,
            })?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}

/// An output gate: a plain share-reveal over the permutation bits, XORed
/// with the public values to recover the clear outputs.
pub(crate) struct OutputGate {
    core: Arc<Core>,
    gate_id: u64,
    recipient: Recipient,
    inputs: BmrWireVec,
    share_futures: Vec<Option<MsgFuture>>,
    promise: Option<oneshot::Sender<Vec<BitVec>>>,
}

impl OutputGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        let my_id = self.core.my_id();
        let num_bits: usize = self.inputs.iter().map(|w| w.num_simd()).sum();
        let mut my_share = BitVec::with_capacity(num_bits);
        for wire in &self.inputs {
            my_share
                .extend_from_bitslice(wire.wait_setup().await?.permutation_share.as_bitslice());
        }
        match self.recipient {
            Recipient::All => self.core.registry().broadcast_bits(self.gate_id, &my_share)?,
            Recipient::Party(p) if p != my_id => {
                self.core.registry().send_bits(p, self.gate_id, &my_share)?
            }
            Recipient::Party(_) => {}
        }
        let eligible = matches!(self.recipient, Recipient::All)
            || self.recipient == Recipient::Party(my_id);
        if eligible {
            let futures: Vec<MsgFuture> = self
                .share_futures
                .iter_mut()
                .filter_map(|f| f.take())
                .collect();
            for other_share in try_join_all(futures.into_iter().map(MsgFuture::recv)).await? {
                my_share ^= other_share.as_bitslice();
            }
            let mut outputs = Vec::with_capacity(self.inputs.len());
            let mut bit_offset = 0;
            for wire in &self.inputs {
                let num_simd = wire.num_simd();
                let mut output = my_share[bit_offset..bit_offset + num_simd].to_bitvec();
                output ^= wire.wait_online().await?.public_value.as_bitslice();
                outputs.push(output);
                bit_offset += num_simd;
            }
            if let Some(promise) = self.promise.take() {
                let _ = promise.send(outputs);
            }
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {}
}

/// A free-XOR gate: permutation shares, keys and public values all XOR
/// component-wise.
pub(crate) struct XorGate {
    gate_id: u64,
    inputs_a: BmrWireVec,
    inputs_b: BmrWireVec,
    outputs: BmrWireVec,
}

impl XorGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let a = self.inputs_a[wire_i].wait_setup().await?;
            let b = self.inputs_b[wire_i].wait_setup().await?;
            let mut permutation_share = a.permutation_share.clone();
            permutation_share ^= b.permutation_share.as_bitslice();
            let keys0 = a
                .keys0
                .iter()
                .zip(&b.keys0)
                .map(|(ka, kb)| *ka ^ *kb)
                .collect();
            wire.set_setup_ready(WireSetup {
                permutation_share,
                keys0,
            })?;
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let a = self.inputs_a[wire_i].wait_online().await?;
            let b = self.inputs_b[wire_i].wait_online().await?;
            let mut public_value = a.public_value.clone();
            public_value ^= b.public_value.as_bitslice();
            let active_keys = a
                .active_keys
                .iter()
                .zip(&b.active_keys)
                .map(|(ka, kb)| *ka ^ *kb)
                .collect();
            wire.set_online_ready(WireOnline {
                public_value,
                active_keys,
            })?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}

/// An inversion gate: key roles swap in setup, the public value is
/// complemented online, the active keys pass through.
pub(crate) struct InvGate {
    core: Arc<Core>,
    gate_id: u64,
    inputs: BmrWireVec,
    outputs: BmrWireVec,
}

impl InvGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        let offset = self.core.garble_offset();
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let a = self.inputs[wire_i].wait_setup().await?;
            wire.set_setup_ready(WireSetup {
                permutation_share: a.permutation_share.clone(),
                keys0: a.keys0.iter().map(|k| *k ^ offset).collect(),
            })?;
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let a = self.inputs[wire_i].wait_online().await?;
            wire.set_online_ready(WireOnline {
                public_value: !a.public_value.clone(),
                active_keys: a.active_keys.clone(),
            })?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}

/// A garbled AND gate.
///
/// In setup the parties derive shares of the products of the input
/// permutation bits (bit OTs), turn them into shares of the row-selector
/// bits `ρ(α,β) = αβ ⊕ αλ_b ⊕ βλ_a ⊕ λ_aλ_b ⊕ λ_o`, and garble the four
/// rows: the row entry of slot `j` decrypts to `k⁰_j ⊕ ρ·offset_j`, party
/// j's key for the row's output value, with the cross terms `ρ^i · offset_j`
/// shared through κ-bit OTs. Each party masks its additive contribution
/// under its own input keys and broadcasts it; the XOR of all contributions
/// is the garbled table.
///
/// Online, everyone selects the row indexed by the two public values,
/// removes the masks with all parties' active input keys and recovers every
/// party's active output key; comparing the own slot against the own key
/// pair yields the output's public value and detects corrupted rows.
pub(crate) struct AndGate {
    core: Arc<Core>,
    gate_id: u64,
    num_wires: usize,
    num_simd: usize,
    inputs_a: BmrWireVec,
    inputs_b: BmrWireVec,
    outputs: BmrWireVec,
    bit_senders: Vec<Option<XcotBitSender>>,
    bit_receivers: Vec<Option<XcotBitReceiver>>,
    block_senders: Vec<Option<XcotBlockSender>>,
    block_receivers: Vec<Option<XcotBlockReceiver>>,
    row_futures: Vec<Option<MsgFuture>>,
    my_keys0: Vec<Block>,
    table: Vec<Block>,
}

impl AndGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        let n = self.core.num_parties();
        let me = self.core.my_id();
        let count = self.num_wires * self.num_simd;
        let offset = self.core.garble_offset();
        let idx = |pos: usize, row: usize, slot: usize| (pos * 4 + row) * n + slot;

        // Fresh output randomness first, so dependent setup phases can
        // proceed while the OTs run.
        let lambda_o = self.core.gate_bits(self.gate_id, count);
        self.my_keys0 = self.core.gate_blocks(self.gate_id, count);
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let share =
                lambda_o[wire_i * self.num_simd..(wire_i + 1) * self.num_simd].to_bitvec();
            let keys0 =
                self.my_keys0[wire_i * self.num_simd..(wire_i + 1) * self.num_simd].to_vec();
            wire.set_setup_ready(WireSetup {
                permutation_share: share,
                keys0,
            })?;
        }

        let mut lambda_a = BitVec::with_capacity(count);
        let mut lambda_b = BitVec::with_capacity(count);
        let mut keys_a = Vec::with_capacity(count);
        let mut keys_b = Vec::with_capacity(count);
        for wire_i in 0..self.num_wires {
            let a = self.inputs_a[wire_i].wait_setup().await?;
            let b = self.inputs_b[wire_i].wait_setup().await?;
            lambda_a.extend_from_bitslice(a.permutation_share.as_bitslice());
            lambda_b.extend_from_bitslice(b.permutation_share.as_bitslice());
            keys_a.extend_from_slice(&a.keys0);
            keys_b.extend_from_slice(&b.keys0);
        }

        // Shares of λ_a·λ_b: the local product plus one bit-OT pair per
        // peer for the cross terms. All sends are queued before the first
        // await.
        let mut product_share = lambda_a.clone();
        product_share &= lambda_b.as_bitslice();
        for p in self.core.peers().collect::<Vec<_>>() {
            let receiver = self.bit_receivers[p].as_mut().expect("receiver for peer");
            receiver.set_choices(lambda_a.clone())?;
            receiver.send_corrections()?;
            let sender = self.bit_senders[p].as_mut().expect("sender for peer");
            sender.set_correlations(lambda_b.clone())?;
            sender.send_messages()?;
        }
        for p in self.core.peers().collect::<Vec<_>>() {
            let receiver = self.bit_receivers[p].as_mut().expect("receiver for peer");
            receiver.compute_outputs().await?;
            product_share ^= receiver.outputs().as_bitslice();
            let sender = self.bit_senders[p].as_mut().expect("sender for peer");
            sender.compute_outputs().await?;
            product_share ^= sender.outputs().as_bitslice();
        }

        // Row-selector shares, rows indexed 2α + β.
        let mut rho = BitVec::with_capacity(4 * count);
        for row in 0..4 {
            let alpha = row & 2 != 0;
            let beta = row & 1 != 0;
            let mut share = product_share.clone();
            share ^= lambda_o.as_bitslice();
            if alpha {
                share ^= lambda_b.as_bitslice();
            }
            if beta {
                share ^= lambda_a.as_bitslice();
            }
            // The constant αβ term appears exactly once across all parties.
            if alpha && beta && self.core.is_my_job(self.gate_id) {
                share = !share;
            }
            rho.extend_from_bitslice(share.as_bitslice());
        }

        // Shares of ρ·offset_j for every slot j through κ-bit OTs.
        for p in self.core.peers().collect::<Vec<_>>() {
            let receiver = self.block_receivers[p].as_mut().expect("receiver for peer");
            receiver.set_choices(rho.clone())?;
            receiver.send_corrections()?;
            let sender = self.block_senders[p].as_mut().expect("sender for peer");
            sender.set_correlations(vec![offset; 4 * count])?;
            sender.send_messages()?;
        }

        let mut contribution = vec![Block::ZERO; 4 * count * n];
        for row in 0..4 {
            for pos in 0..count {
                contribution[idx(pos, row, me)] ^=
                    self.my_keys0[pos] ^ offset.select(rho[row * count + pos]);
            }
        }
        for p in self.core.peers().collect::<Vec<_>>() {
            let receiver = self.block_receivers[p].as_mut().expect("receiver for peer");
            receiver.compute_outputs().await?;
            let sender = self.block_senders[p].as_mut().expect("sender for peer");
            sender.compute_outputs().await?;
            let to_peer_slot = receiver.outputs();
            let to_my_slot = sender.outputs();
            for row in 0..4 {
                for pos in 0..count {
                    let i = row * count + pos;
                    contribution[idx(pos, row, p)] ^= to_peer_slot[i];
                    contribution[idx(pos, row, me)] ^= to_my_slot[i];
                }
            }
        }

        // Mask the contribution under this party's input keys.
        for pos in 0..count {
            for row in 0..4 {
                let alpha = row & 2 != 0;
                let beta = row & 1 != 0;
                let key_a = keys_a[pos] ^ offset.select(alpha);
                let key_b = keys_b[pos] ^ offset.select(beta);
                for slot in 0..n {
                    contribution[idx(pos, row, slot)] ^= garble::row_mask(
                        key_a,
                        key_b,
                        garble::row_tweak(self.gate_id, row, slot, pos),
                    );
                }
            }
        }

        // Exchange the garbled rows: every party ends up with the full
        // table.
        let blob = block::blocks_to_bytes(&contribution);
        let num_bits = contribution.len() * Block::BITS;
        for p in self.core.peers().collect::<Vec<_>>() {
            self.core
                .registry()
                .send(MsgKind::Bits, p, self.gate_id, blob.clone(), num_bits)?;
        }
        let mut table = contribution;
        let futures: Vec<MsgFuture> = self.row_futures.iter_mut().filter_map(|f| f.take()).collect();
        for bytes in try_join_all(futures.into_iter().map(MsgFuture::recv_raw)).await? {
            let rows = block::bytes_to_blocks(&bytes, 4 * count * n)?;
            xor_inplace(&mut table, &rows);
        }
        self.table = table;
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        let n = self.core.num_parties();
        let me = self.core.my_id();
        let offset = self.core.garble_offset();
        let idx = |pos: usize, row: usize, slot: usize| (pos * 4 + row) * n + slot;

        let mut online_a = Vec::with_capacity(self.num_wires);
        let mut online_b = Vec::with_capacity(self.num_wires);
        for wire_i in 0..self.num_wires {
            online_a.push(self.inputs_a[wire_i].wait_online().await?);
            online_b.push(self.inputs_b[wire_i].wait_online().await?);
        }

        let mut slots = vec![Block::ZERO; n];
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let mut public_value = BitVec::with_capacity(self.num_simd);
            let mut active_keys = vec![Block::ZERO; n * self.num_simd];
            for lane in 0..self.num_simd {
                let pos = wire_i * self.num_simd + lane;
                let alpha = online_a[wire_i].public_value[lane];
                let beta = online_b[wire_i].public_value[lane];
                let row = usize::from(alpha) * 2 + usize::from(beta);
                for (slot, value) in slots.iter_mut().enumerate() {
                    let mut v = self.table[idx(pos, row, slot)];
                    for party in 0..n {
                        v ^= garble::row_mask(
                            online_a[wire_i].active_keys[party * self.num_simd + lane],
                            online_b[wire_i].active_keys[party * self.num_simd + lane],
                            garble::row_tweak(self.gate_id, row, slot, pos),
                        );
                    }
                    *value = v;
                }
                let mine = slots[me];
                let bit = if mine == self.my_keys0[pos] {
                    false
                } else if mine == self.my_keys0[pos] ^ offset {
                    true
                } else {
                    return Err(Error::CryptoFailure(
                        "garbled row did not decrypt to a valid key".into(),
                    ));
                };
                public_value.push(bit);
                for party in 0..n {
                    active_keys[party * self.num_simd + lane] = slots[party];
                }
            }
            wire.set_online_ready(WireOnline {
                public_value,
                active_keys,
            })?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}
