//! Two-party Boolean secret sharing with a public and a secret share per
//! wire.
//!
//! A wire carries `num_simd` parallel values. Each value is represented as
//! `(Δ, δ)`, where the public share `Δ` is known to both parties after the
//! online phase and the secret share `δ` is known only to its holder after
//! setup, with the invariant `clear = Δ ⊕ δ₀ ⊕ δ₁`. XOR and INV are free;
//! AND is the only interactive binary gate and consumes one bit-level
//! correlated-OT pair per evaluation.

use std::sync::Arc;

use futures::future::try_join_all;
use tokio::sync::oneshot;

use crate::backend::{AnyGate, Core, InputSetter, OutputHandle, Recipient};
use crate::bits::BitVec;
use crate::comm::{MsgFuture, MsgKind};
use crate::error::Error;
use crate::ot::{XcotBitReceiver, XcotBitSender};
use crate::rng::StreamKind;
use crate::sync::ReadyCell;

/// A Boolean secret-shared wire.
///
/// The secret share is finalized by the producing gate's setup phase, the
/// public share by its online phase; each is written exactly once and
/// immutable after its readiness event fires.
pub struct BooleanWire {
    num_simd: usize,
    secret_share: ReadyCell<BitVec>,
    public_share: ReadyCell<BitVec>,
}

/// A vector of Boolean secret-shared wires, the unit gates operate on.
pub type BooleanWireVec = Vec<Arc<BooleanWire>>;

impl BooleanWire {
    fn new(num_simd: usize, core: &Core) -> Arc<Self> {
        Arc::new(Self {
            num_simd,
            secret_share: ReadyCell::new(core.abort_rx()),
            public_share: ReadyCell::new(core.abort_rx()),
        })
    }

    /// The number of SIMD lanes on this wire.
    pub fn num_simd(&self) -> usize {
        self.num_simd
    }

    /// Waits until setup is ready and returns the secret share `δ`.
    pub async fn wait_setup(&self) -> Result<&BitVec, Error> {
        self.secret_share.wait().await
    }

    /// Waits until the online phase is ready and returns the public share
    /// `Δ`.
    pub async fn wait_online(&self) -> Result<&BitVec, Error> {
        self.public_share.wait().await
    }

    /// The secret share, if setup has completed.
    pub fn secret_share(&self) -> Option<&BitVec> {
        self.secret_share.get()
    }

    /// The public share, if the online phase has completed.
    pub fn public_share(&self) -> Option<&BitVec> {
        self.public_share.get()
    }

    fn set_setup_ready(&self, secret_share: BitVec) -> Result<(), Error> {
        debug_assert_eq!(secret_share.len(), self.num_simd);
        self.secret_share.set(secret_share)
    }

    fn set_online_ready(&self, public_share: BitVec) -> Result<(), Error> {
        debug_assert_eq!(public_share.len(), self.num_simd);
        self.public_share.set(public_share)
    }

    fn poison(&self) {
        self.secret_share.poison();
        self.public_share.poison();
    }
}

fn poison_all(wires: &BooleanWireVec) {
    for wire in wires {
        wire.poison();
    }
}

/// Total number of bits across all wires of a vector.
fn count_bits(wires: &BooleanWireVec) -> usize {
    wires.iter().map(|w| w.num_simd()).sum()
}

/// Checks that a wire vector is non-empty and uniform in lane count.
fn check_wires(wires: &BooleanWireVec) -> Result<(usize, usize), Error> {
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

/// The gate factory of the Boolean secret-sharing protocol.
#[derive(Clone)]
pub struct BeavyProvider {
    core: Arc<Core>,
}

impl BeavyProvider {
    pub(crate) fn new(core: Arc<Core>) -> Self {
        Self { core }
    }

    fn new_wires(&self, num_wires: usize, num_simd: usize) -> BooleanWireVec {
        (0..num_wires)
            .map(|_| BooleanWire::new(num_simd, &self.core))
            .collect()
    }

    /// Registers an input gate owned by this party. The clear value is
    /// supplied later through the returned [`InputSetter`].
    pub fn input_sender(
        &self,
        num_wires: usize,
        num_simd: usize,
    ) -> Result<(InputSetter, BooleanWireVec), Error> {
        if num_wires == 0 || num_simd == 0 {
            return Err(Error::ConfigInvalid(
                "input gates need at least one wire and one SIMD lane".into(),
            ));
        }
        let gate_id = self.core.next_gate_id();
        let input_id = self.core.next_input_id(num_wires);
        let outputs = self.new_wires(num_wires, num_simd);
        let (setter, source) = InputSetter::new(num_wires, num_simd);
        self.core.push_gate(AnyGate::BeavyInputSend(InputSenderGate {
            core: self.core.clone(),
            gate_id,
            num_wires,
            num_simd,
            input_id,
            source: Some(source),
            partial_public: Vec::new(),
            outputs: outputs.clone(),
        }));
        Ok((setter, outputs))
    }

    /// Registers the receiving side of an input gate owned by `input_owner`.
    pub fn input_receiver(
        &self,
        input_owner: usize,
        num_wires: usize,
        num_simd: usize,
    ) -> Result<BooleanWireVec, Error> {
        if num_wires == 0 || num_simd == 0 {
            return Err(Error::ConfigInvalid(
                "input gates need at least one wire and one SIMD lane".into(),
            ));
        }
        if input_owner == self.core.my_id() || input_owner >= self.core.num_parties() {
            return Err(Error::ConfigInvalid(format!(
                "party {input_owner} cannot own this input"
            )));
        }
        let gate_id = self.core.next_gate_id();
        let input_id = self.core.next_input_id(num_wires);
        let public_share_future = self.core.registry().register(
            MsgKind::Bits,
            input_owner,
            gate_id,
            Some(num_wires * num_simd),
        )?;
        let outputs = self.new_wires(num_wires, num_simd);
        self.core
            .push_gate(AnyGate::BeavyInputRecv(InputReceiverGate {
                core: self.core.clone(),
                gate_id,
                num_simd,
                input_id,
                input_owner,
                public_share_future: Some(public_share_future),
                outputs: outputs.clone(),
            }));
        Ok(outputs)
    }

    /// Registers an output gate revealing `inputs` to `recipient`.
    pub fn output(
        &self,
        inputs: BooleanWireVec,
        recipient: Recipient,
    ) -> Result<OutputHandle, Error> {
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
        let mut share_futures: Vec<Option<MsgFuture>> =
            (0..self.core.num_parties()).map(|_| None).collect();
        if eligible {
            let num_bits = count_bits(&inputs);
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
        self.core.push_gate(AnyGate::BeavyOutput(OutputGate {
            core: self.core.clone(),
            gate_id,
            recipient,
            inputs,
            share_futures,
            promise,
        }));
        Ok(handle)
    }

    fn check_binary(
        &self,
        a: &BooleanWireVec,
        b: &BooleanWireVec,
    ) -> Result<(usize, usize), Error> {
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

    /// Registers a free XOR gate.
    pub fn xor(&self, a: &BooleanWireVec, b: &BooleanWireVec) -> Result<BooleanWireVec, Error> {
        let (num_wires, num_simd) = self.check_binary(a, b)?;
        let gate_id = self.core.next_gate_id();
        let outputs = self.new_wires(num_wires, num_simd);
        self.core.push_gate(AnyGate::BeavyXor(XorGate {
            gate_id,
            inputs_a: a.clone(),
            inputs_b: b.clone(),
            outputs: outputs.clone(),
        }));
        Ok(outputs)
    }

    /// Registers an inversion gate. The designated party complements its
    /// secret share; on the other side the wires are forwarded unchanged.
    pub fn inv(&self, a: &BooleanWireVec) -> Result<BooleanWireVec, Error> {
        let (num_wires, num_simd) = check_wires(a)?;
        let gate_id = self.core.next_gate_id();
        let is_my_job = self.core.is_my_job(gate_id);
        let outputs = if is_my_job {
            self.new_wires(num_wires, num_simd)
        } else {
            a.clone()
        };
        self.core.push_gate(AnyGate::BeavyInv(InvGate {
            gate_id,
            is_my_job,
            inputs: a.clone(),
            outputs: outputs.clone(),
        }));
        Ok(outputs)
    }

    /// Registers an AND gate, the only interactive binary gate.
    pub fn and(&self, a: &BooleanWireVec, b: &BooleanWireVec) -> Result<BooleanWireVec, Error> {
        if self.core.num_parties() != 2 {
            return Err(Error::ConfigInvalid(
                "the secret-sharing AND gate is two-party only".into(),
            ));
        }
        let (num_wires, num_simd) = self.check_binary(a, b)?;
        let gate_id = self.core.next_gate_id();
        let peer = 1 - self.core.my_id();
        let num_bits = num_wires * num_simd;
        let share_future =
            self.core
                .registry()
                .register(MsgKind::Bits, peer, gate_id, Some(num_bits))?;
        let ot_sender = XcotBitSender::register(&self.core, peer, num_bits)?;
        let ot_receiver = XcotBitReceiver::register(&self.core, peer, num_bits)?;
        let outputs = self.new_wires(num_wires, num_simd);
        self.core.push_gate(AnyGate::BeavyAnd(AndGate {
            core: self.core.clone(),
            gate_id,
            num_wires,
            num_simd,
            inputs_a: a.clone(),
            inputs_b: b.clone(),
            outputs: outputs.clone(),
            share_future: Some(share_future),
            ot_sender,
            ot_receiver,
            delta_a_share: BitVec::new(),
            delta_b_share: BitVec::new(),
            delta_y_share: BitVec::new(),
        }));
        Ok(outputs)
    }
}

/// The sending side of an input gate.
pub(crate) struct InputSenderGate {
    core: Arc<Core>,
    gate_id: u64,
    num_wires: usize,
    num_simd: usize,
    input_id: u64,
    source: Option<oneshot::Receiver<Vec<BitVec>>>,
    partial_public: Vec<BitVec>,
    outputs: BooleanWireVec,
}

impl InputSenderGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        let my_id = self.core.my_id();
        let fresh = self
            .core
            .gate_bits(self.gate_id, self.num_wires * self.num_simd);
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let secret_share =
                fresh[wire_i * self.num_simd..(wire_i + 1) * self.num_simd].to_bitvec();
            let mut public_share = secret_share.clone();
            for p in self.core.peers() {
                let tape = self.core.pair_tape(my_id, p)?;
                public_share ^= tape
                    .bits(
                        StreamKind::Input,
                        self.input_id + wire_i as u64,
                        self.num_simd,
                    )
                    .as_bitslice();
            }
            wire.set_setup_ready(secret_share)?;
            self.partial_public.push(public_share);
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        let source = self.source.take().expect("online phase runs once");
        let inputs = source.await.map_err(|_| Error::Aborted)?;
        if inputs.len() != self.num_wires || inputs.iter().any(|i| i.len() != self.num_simd) {
            return Err(Error::ConfigInvalid(
                "input does not match the gate's wire and SIMD layout".into(),
            ));
        }
        let mut public_shares = BitVec::with_capacity(self.num_wires * self.num_simd);
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let mut public_share = self.partial_public[wire_i].clone();
            public_share ^= inputs[wire_i].as_bitslice();
            public_shares.extend_from_bitslice(public_share.as_bitslice());
            wire.set_online_ready(public_share)?;
        }
        self.core
            .registry()
            .broadcast_bits(self.gate_id, &public_shares)
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}

/// The receiving side of an input gate.
pub(crate) struct InputReceiverGate {
    core: Arc<Core>,
    gate_id: u64,
    num_simd: usize,
    input_id: u64,
    input_owner: usize,
    public_share_future: Option<MsgFuture>,
    outputs: BooleanWireVec,
}

impl InputReceiverGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        let tape = self.core.pair_tape(self.input_owner, self.core.my_id())?;
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let secret_share = tape.bits(
                StreamKind::Input,
                self.input_id + wire_i as u64,
                self.num_simd,
            );
            wire.set_setup_ready(secret_share)?;
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        let future = self
            .public_share_future
            .take()
            .expect("online phase runs once");
        let public_shares = future.recv().await?;
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let public_share = public_shares
                [wire_i * self.num_simd..(wire_i + 1) * self.num_simd]
                .to_bitvec();
            wire.set_online_ready(public_share)?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}

/// An output gate revealing the clear value to its recipient.
pub(crate) struct OutputGate {
    core: Arc<Core>,
    gate_id: u64,
    recipient: Recipient,
    inputs: BooleanWireVec,
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
        let mut my_secret_share = BitVec::with_capacity(count_bits(&self.inputs));
        for wire in &self.inputs {
            my_secret_share.extend_from_bitslice(wire.wait_setup().await?.as_bitslice());
        }
        match self.recipient {
            Recipient::All => self
                .core
                .registry()
                .broadcast_bits(self.gate_id, &my_secret_share)?,
            Recipient::Party(p) if p != my_id => {
                self.core
                    .registry()
                    .send_bits(p, self.gate_id, &my_secret_share)?
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
                my_secret_share ^= other_share.as_bitslice();
            }
            let mut outputs = Vec::with_capacity(self.inputs.len());
            let mut bit_offset = 0;
            for wire in &self.inputs {
                let num_simd = wire.num_simd();
                let mut output = my_secret_share[bit_offset..bit_offset + num_simd].to_bitvec();
                output ^= wire.wait_online().await?.as_bitslice();
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

/// A free XOR gate: component-wise XOR of both shares.
pub(crate) struct XorGate {
    gate_id: u64,
    inputs_a: BooleanWireVec,
    inputs_b: BooleanWireVec,
    outputs: BooleanWireVec,
}

impl XorGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let mut share = self.inputs_a[wire_i].wait_setup().await?.clone();
            share ^= self.inputs_b[wire_i].wait_setup().await?.as_bitslice();
            wire.set_setup_ready(share)?;
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let mut share = self.inputs_a[wire_i].wait_online().await?.clone();
            share ^= self.inputs_b[wire_i].wait_online().await?.as_bitslice();
            wire.set_online_ready(share)?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}

/// An inversion gate. Exactly one party complements its secret share; the
/// other forwards the wires untouched, so the gate is free.
pub(crate) struct InvGate {
    gate_id: u64,
    is_my_job: bool,
    inputs: BooleanWireVec,
    outputs: BooleanWireVec,
}

impl InvGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        if !self.is_my_job {
            return Ok(());
        }
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let share = self.inputs[wire_i].wait_setup().await?.clone();
            wire.set_setup_ready(!share)?;
        }
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        if !self.is_my_job {
            return Ok(());
        }
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let share = self.inputs[wire_i].wait_online().await?.clone();
            wire.set_online_ready(share)?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        if self.is_my_job {
            poison_all(&self.outputs);
        }
    }
}

/// The interactive AND gate.
///
/// With inputs `a = Δ_a ⊕ δ_a` and `b = Δ_b ⊕ δ_b`, the parties produce a
/// fresh sharing of `a·b`. Only the cross term `δ_a·δ_b` needs interaction
/// and is derived in setup from one correlated-OT pair: each party acts as
/// OT sender with correlation `δ_b` and as OT receiver with choices `δ_a`.
pub(crate) struct AndGate {
    core: Arc<Core>,
    gate_id: u64,
    num_wires: usize,
    num_simd: usize,
    inputs_a: BooleanWireVec,
    inputs_b: BooleanWireVec,
    outputs: BooleanWireVec,
    share_future: Option<MsgFuture>,
    ot_sender: XcotBitSender,
    ot_receiver: XcotBitReceiver,
    delta_a_share: BitVec,
    delta_b_share: BitVec,
    delta_y_share: BitVec,
}

impl AndGate {
    pub(crate) fn gate_id(&self) -> u64 {
        self.gate_id
    }

    pub(crate) async fn evaluate_setup(&mut self) -> Result<(), Error> {
        let num_bits = self.num_wires * self.num_simd;

        // Fresh output sharing first, so dependent setup phases can proceed
        // while the OTs run.
        let mut delta_y_share = self.core.gate_bits(self.gate_id, num_bits);
        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let secret_share =
                delta_y_share[wire_i * self.num_simd..(wire_i + 1) * self.num_simd].to_bitvec();
            wire.set_setup_ready(secret_share)?;
        }

        let mut delta_a_share = BitVec::with_capacity(num_bits);
        let mut delta_b_share = BitVec::with_capacity(num_bits);
        for wire_i in 0..self.num_wires {
            delta_a_share
                .extend_from_bitslice(self.inputs_a[wire_i].wait_setup().await?.as_bitslice());
            delta_b_share
                .extend_from_bitslice(self.inputs_b[wire_i].wait_setup().await?.as_bitslice());
        }

        let mut delta_ab_share = delta_a_share.clone();
        delta_ab_share &= delta_b_share.as_bitslice();

        self.ot_receiver.set_choices(delta_a_share.clone())?;
        self.ot_receiver.send_corrections()?;
        self.ot_sender.set_correlations(delta_b_share.clone())?;
        self.ot_sender.send_messages()?;
        self.ot_receiver.compute_outputs().await?;
        self.ot_sender.compute_outputs().await?;
        delta_ab_share ^= self.ot_sender.outputs().as_bitslice();
        delta_ab_share ^= self.ot_receiver.outputs().as_bitslice();
        delta_y_share ^= delta_ab_share.as_bitslice();

        self.delta_a_share = delta_a_share;
        self.delta_b_share = delta_b_share;
        self.delta_y_share = delta_y_share;
        Ok(())
    }

    pub(crate) async fn evaluate_online(&mut self) -> Result<(), Error> {
        let num_bits = self.num_wires * self.num_simd;
        let mut delta_a = BitVec::with_capacity(num_bits);
        let mut delta_b = BitVec::with_capacity(num_bits);
        for wire_i in 0..self.num_wires {
            delta_a.extend_from_bitslice(self.inputs_a[wire_i].wait_online().await?.as_bitslice());
            delta_b.extend_from_bitslice(self.inputs_b[wire_i].wait_online().await?.as_bitslice());
        }

        let mut term = delta_a.clone();
        term &= self.delta_b_share.as_bitslice();
        self.delta_y_share ^= term.as_bitslice();
        let mut term = delta_b.clone();
        term &= self.delta_a_share.as_bitslice();
        self.delta_y_share ^= term.as_bitslice();
        // The clear product term appears exactly once across the two
        // parties.
        if self.core.is_my_job(self.gate_id) {
            let mut term = delta_a;
            term &= delta_b.as_bitslice();
            self.delta_y_share ^= term.as_bitslice();
        }

        self.core
            .registry()
            .broadcast_bits(self.gate_id, &self.delta_y_share)?;
        let other_share = self
            .share_future
            .take()
            .expect("online phase runs once")
            .recv()
            .await?;
        self.delta_y_share ^= other_share.as_bitslice();

        for (wire_i, wire) in self.outputs.iter().enumerate() {
            let public_share = self.delta_y_share
                [wire_i * self.num_simd..(wire_i + 1) * self.num_simd]
                .to_bitvec();
            wire.set_online_ready(public_share)?;
        }
        Ok(())
    }

    pub(crate) fn poison(&self) {
        poison_all(&self.outputs);
    }
}
