//! The evaluation backend: party context, gate registration and the
//! two-phase task engine.
//!
//! Every gate is evaluated by two tasks on the shared runtime: a *setup* task
//! running the preprocessing phase (shared randomness, OT, garbling) and an
//! *online* task running the input-dependent phase. The online task receives
//! the gate from its setup task through a one-shot hand-off, so a gate's
//! online phase can start as soon as its own setup is done, long before
//! unrelated gates finish theirs. Setting
//! [`Config::online_after_setup`] instead holds every online task until all
//! setup tasks completed, which hides the cryptographic latency of the whole
//! circuit behind the moment the first input arrives.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::bits::BitVec;
use crate::block::Block;
use crate::channel::Channel;
use crate::comm::{self, AbortSignal, Hello, MsgKind, Registry};
use crate::error::Error;
use crate::rng::{SharedRng, StreamKind};
use crate::{beavy, bmr};

/// The topology and toggles of one party's backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// The id of this party, in `0..num_parties`.
    pub my_id: usize,
    /// The total number of parties.
    pub num_parties: usize,
    /// Hold every online task until all setup tasks have completed.
    pub online_after_setup: bool,
    /// Emit per-gate trace logs in setup and online phases.
    pub verbose_debug: bool,
    /// Derive all local randomness and tape seeds from this seed. Runs with
    /// the same seeds, inputs and circuit are byte-identical; leave `None`
    /// outside of tests.
    pub seed: Option<[u8; 32]>,
}

impl Config {
    /// A default configuration for the given party.
    pub fn new(my_id: usize, num_parties: usize) -> Self {
        Self {
            my_id,
            num_parties,
            online_after_setup: false,
            verbose_debug: false,
            seed: None,
        }
    }
}

/// Which party an output gate reveals its value to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Every party learns the value.
    All,
    /// Only the given party learns the value.
    Party(usize),
}

/// The handle through which an input owner supplies the clear input of an
/// input gate. The gate's online task blocks until the value is set, so
/// evaluation may begin before inputs are known.
pub struct InputSetter {
    tx: oneshot::Sender<Vec<BitVec>>,
    num_wires: usize,
    num_simd: usize,
}

impl InputSetter {
    pub(crate) fn new(num_wires: usize, num_simd: usize) -> (Self, oneshot::Receiver<Vec<BitVec>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                tx,
                num_wires,
                num_simd,
            },
            rx,
        )
    }

    /// Supplies the clear input, one bit vector of `num_simd` bits per wire.
    pub fn set(self, inputs: Vec<BitVec>) -> Result<(), Error> {
        if inputs.len() != self.num_wires {
            return Err(Error::ConfigInvalid(format!(
                "{} input vectors for {} wires",
                inputs.len(),
                self.num_wires
            )));
        }
        if inputs.iter().any(|bits| bits.len() != self.num_simd) {
            return Err(Error::ConfigInvalid(format!(
                "input vectors must hold {} bits each",
                self.num_simd
            )));
        }
        self.tx.send(inputs).map_err(|_| Error::Aborted)
    }
}

/// The future resolving to the clear output of an output gate, one bit
/// vector per wire.
pub struct OutputFuture(oneshot::Receiver<Vec<BitVec>>);

impl OutputFuture {
    /// Awaits the clear output value.
    pub async fn recv(self) -> Result<Vec<BitVec>, Error> {
        self.0.await.map_err(|_| Error::Aborted)
    }
}

/// The handle returned when registering an output gate.
pub struct OutputHandle {
    eligible: bool,
    rx: Mutex<Option<oneshot::Receiver<Vec<BitVec>>>>,
}

impl OutputHandle {
    pub(crate) fn new(eligible: bool) -> (Self, Option<oneshot::Sender<Vec<BitVec>>>) {
        if eligible {
            let (tx, rx) = oneshot::channel();
            (
                Self {
                    eligible,
                    rx: Mutex::new(Some(rx)),
                },
                Some(tx),
            )
        } else {
            (
                Self {
                    eligible,
                    rx: Mutex::new(None),
                },
                None,
            )
        }
    }

    /// The future resolving to the clear output.
    ///
    /// Fails if the output is addressed to a different party, or if the
    /// future has already been taken.
    pub fn future(&self) -> Result<OutputFuture, Error> {
        if !self.eligible {
            return Err(Error::ConfigInvalid("not this party's output".into()));
        }
        self.rx
            .lock()
            .expect("output future lock")
            .take()
            .map(OutputFuture)
            .ok_or_else(|| Error::ConfigInvalid("output future already taken".into()))
    }
}

/// The per-party context shared by providers, gates and OT instances.
pub(crate) struct Core {
    cfg: Config,
    registry: Arc<Registry>,
    abort: Arc<AbortSignal>,
    fatal: Arc<Mutex<Option<Error>>>,
    my_tapes: Vec<Option<SharedRng>>,
    my_seeds: Vec<Option<[u8; 32]>>,
    their_tapes: Vec<OnceLock<SharedRng>>,
    local_tape: SharedRng,
    next_gate_id: AtomicU64,
    next_input_id: AtomicU64,
    ot_counters: Vec<AtomicU64>,
    garble_offset: OnceLock<Block>,
    gates: Mutex<Vec<AnyGate>>,
}

impl Core {
    pub(crate) fn my_id(&self) -> usize {
        self.cfg.my_id
    }

    pub(crate) fn num_parties(&self) -> usize {
        self.cfg.num_parties
    }

    pub(crate) fn verbose(&self) -> bool {
        self.cfg.verbose_debug
    }

    /// Deterministically designates one party per gate for work that must be
    /// performed by exactly one side.
    pub(crate) fn is_my_job(&self, gate_id: u64) -> bool {
        gate_id % self.cfg.num_parties as u64 == self.cfg.my_id as u64
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// An iterator over all parties except this one.
    pub(crate) fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.cfg.num_parties).filter(move |p| *p != self.cfg.my_id)
    }

    /// The shared tape of the ordered pair `(sender, receiver)`, of which
    /// this party must be one endpoint.
    pub(crate) fn pair_tape(&self, sender: usize, receiver: usize) -> Result<&SharedRng, Error> {
        if sender == self.cfg.my_id {
            self.my_tapes
                .get(receiver)
                .and_then(|t| t.as_ref())
                .ok_or_else(|| Error::ConfigInvalid(format!("no tape towards party {receiver}")))
        } else if receiver == self.cfg.my_id {
            self.their_tapes
                .get(sender)
                .and_then(|t| t.get())
                .ok_or_else(|| {
                    Error::HandshakeFailed(format!("party {sender} supplied no randomness seed"))
                })
        } else {
            Err(Error::ConfigInvalid(format!(
                "party {} is not an endpoint of pair ({sender}, {receiver})",
                self.cfg.my_id
            )))
        }
    }

    pub(crate) fn install_their_tape(&self, party: usize, seed: [u8; 32]) {
        let _ = self.their_tapes[party].set(SharedRng::from_seed(seed));
    }

    pub(crate) fn my_seed(&self, party: usize) -> Option<[u8; 32]> {
        self.my_seeds[party]
    }

    /// Fresh local random bits for the given gate, reproducible for a fixed
    /// backend seed regardless of task scheduling.
    pub(crate) fn gate_bits(&self, gate_id: u64, num_bits: usize) -> BitVec {
        self.local_tape.bits(StreamKind::Gate, gate_id * 2, num_bits)
    }

    /// Fresh local random blocks for the given gate.
    pub(crate) fn gate_blocks(&self, gate_id: u64, count: usize) -> Vec<Block> {
        self.local_tape.blocks(StreamKind::Gate, gate_id * 2 + 1, count)
    }

    /// The party-wide free-XOR key offset, sampled on first use.
    pub(crate) fn garble_offset(&self) -> Block {
        *self
            .garble_offset
            .get_or_init(|| self.local_tape.blocks(StreamKind::Gate, u64::MAX, 1)[0])
    }

    pub(crate) fn next_gate_id(&self) -> u64 {
        self.next_gate_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_input_id(&self, num_wires: usize) -> u64 {
        self.next_input_id
            .fetch_add(num_wires as u64, Ordering::Relaxed)
    }

    /// The next OT instance id of the ordered direction `(sender, receiver)`.
    pub(crate) fn next_ot_id(&self, sender: usize, receiver: usize) -> u64 {
        self.ot_counters[sender * self.cfg.num_parties + receiver].fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn abort_rx(&self) -> watch::Receiver<bool> {
        self.abort.subscribe()
    }

    pub(crate) fn abort_now(&self) {
        self.abort.trigger();
        self.registry.drain_abort();
    }

    pub(crate) fn push_gate(&self, gate: AnyGate) {
        self.gates.lock().expect("gate list lock").push(gate);
    }

    fn take_gates(&self) -> Vec<AnyGate> {
        std::mem::take(&mut *self.gates.lock().expect("gate list lock"))
    }

    fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock().expect("fatal error lock").take()
    }
}

/// All gate kinds known to the engine, dispatched as a tagged variant.
pub(crate) enum AnyGate {
    BeavyInputSend(beavy::InputSenderGate),
    BeavyInputRecv(beavy::InputReceiverGate),
    BeavyOutput(beavy::OutputGate),
    BeavyXor(beavy::XorGate),
    BeavyInv(beavy::InvGate),
    BeavyAnd(beavy::AndGate),
    BmrInput(bmr::InputGate),
    BmrOutput(bmr::OutputGate),
    BmrXor(bmr::XorGate),
    BmrInv(bmr::InvGate),
    BmrAnd(bmr::AndGate),
}

macro_rules! for_each_gate {
    ($self:expr, $g:ident => $body:expr) => {
        match $self {
            AnyGate::BeavyInputSend($g) => $body,
            AnyGate::BeavyInputRecv($g) => $body,
            AnyGate::BeavyOutput($g) => $body,
            AnyGate::BeavyXor($g) => $body,
            AnyGate::BeavyInv($g) => $body,
            AnyGate::BeavyAnd($g) => $body,
            AnyGate::BmrInput($g) => $body,
            AnyGate::BmrOutput($g) => $body,
            AnyGate::BmrXor($g) => $body,
            AnyGate::BmrInv($g) => $body,
            AnyGate::BmrAnd($g) => $body,
        }
    };
}

impl AnyGate {
    fn gate_id(&self) -> u64 {
        for_each_gate!(self, g => g.gate_id())
    }

    async fn evaluate_setup(&mut self) -> Result<(), Error> {
        for_each_gate!(self, g => g.evaluate_setup().await)
    }

    async fn evaluate_online(&mut self) -> Result<(), Error> {
        for_each_gate!(self, g => g.evaluate_online().await)
    }

    fn poison(&self) {
        for_each_gate!(self, g => g.poison())
    }
}

/// One party's evaluation backend.
///
/// Gates are registered through the protocol providers ([`Backend::beavy`],
/// [`Backend::bmr`]) in the same order on every party, then evaluated with
/// [`Backend::evaluate`]. The backend keeps no state across evaluations.
pub struct Backend {
    core: Arc<Core>,
    io_handles: Vec<JoinHandle<()>>,
    handshaked: tokio::sync::OnceCell<()>,
}

impl Backend {
    /// Creates the backend for this party on top of the given channel and
    /// spawns its reader/writer tasks.
    pub fn new<C>(cfg: Config, channel: C) -> Result<Self, Error>
    where
        C: Channel + Send + Sync + 'static,
    {
        if cfg.num_parties < 2 {
            return Err(Error::ConfigInvalid(
                "at least two parties are required".into(),
            ));
        }
        if cfg.my_id >= cfg.num_parties {
            return Err(Error::ConfigInvalid(format!(
                "party id {} out of range for {} parties",
                cfg.my_id, cfg.num_parties
            )));
        }

        let n = cfg.num_parties;
        let mut seed_rng = cfg
            .seed
            .map(ChaCha20Rng::from_seed)
            .unwrap_or_else(ChaCha20Rng::from_os_rng);
        let local_tape = SharedRng::from_seed(seed_rng.random());
        let mut my_tapes = Vec::with_capacity(n);
        let mut my_seeds = Vec::with_capacity(n);
        for p in 0..n {
            if p == cfg.my_id {
                my_tapes.push(None);
                my_seeds.push(None);
            } else {
                let seed: [u8; 32] = seed_rng.random();
                my_tapes.push(Some(SharedRng::from_seed(seed)));
                my_seeds.push(Some(seed));
            }
        }

        let mut outbound_txs = Vec::with_capacity(n);
        let mut outbound_rxs = Vec::with_capacity(n);
        for p in 0..n {
            if p == cfg.my_id {
                outbound_txs.push(None);
                outbound_rxs.push(None);
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                outbound_txs.push(Some(tx));
                outbound_rxs.push(Some(rx));
            }
        }

        let registry = Arc::new(Registry::new(cfg.my_id, n, outbound_txs));
        let abort = Arc::new(AbortSignal::new());
        let fatal = Arc::new(Mutex::new(None));
        let io_handles = comm::spawn_io(
            channel,
            cfg.my_id,
            n,
            registry.clone(),
            abort.clone(),
            fatal.clone(),
            outbound_rxs,
        );

        let core = Arc::new(Core {
            my_tapes,
            my_seeds,
            their_tapes: (0..n).map(|_| OnceLock::new()).collect(),
            local_tape,
            next_gate_id: AtomicU64::new(0),
            next_input_id: AtomicU64::new(0),
            ot_counters: (0..n * n).map(|_| AtomicU64::new(0)).collect(),
            garble_offset: OnceLock::new(),
            gates: Mutex::new(Vec::new()),
            registry,
            abort,
            fatal,
            cfg,
        });
        Ok(Self {
            core,
            io_handles,
            handshaked: tokio::sync::OnceCell::new(),
        })
    }

    /// The Boolean secret-sharing gate provider.
    pub fn beavy(&self) -> beavy::BeavyProvider {
        beavy::BeavyProvider::new(self.core.clone())
    }

    /// The garbled-circuit gate provider.
    pub fn bmr(&self) -> bmr::BmrProvider {
        bmr::BmrProvider::new(self.core.clone())
    }

    /// Exchanges and verifies hello messages with every peer and installs
    /// their randomness seeds. Runs at most once; [`Backend::evaluate`]
    /// performs it implicitly.
    pub async fn handshake(&self) -> Result<(), Error> {
        let core = &self.core;
        self.handshaked
            .get_or_try_init(|| async {
                let version = env!("CARGO_PKG_VERSION");
                let mut futures = Vec::new();
                for p in core.peers() {
                    futures.push((p, core.registry().register(MsgKind::Hello, p, 0, None)?));
                }
                for p in core.peers() {
                    let hello = Hello {
                        sender: core.my_id(),
                        recipient: p,
                        num_parties: core.num_parties(),
                        seed: core.my_seed(p),
                        online_after_setup: core.cfg.online_after_setup,
                        version: version.into(),
                    };
                    let payload = hello.to_payload()?;
                    let num_bits = payload.len() * 8;
                    core.registry()
                        .send(MsgKind::Hello, p, 0, payload, num_bits)?;
                }
                for (p, future) in futures {
                    let hello = Hello::from_payload(&future.recv_raw().await?)?;
                    if hello.sender != p || hello.recipient != core.my_id() {
                        return Err(Error::HandshakeFailed(format!(
                            "party {p} announced itself as ({} -> {})",
                            hello.sender, hello.recipient
                        )));
                    }
                    if hello.num_parties != core.num_parties() {
                        return Err(Error::HandshakeFailed(format!(
                            "party {p} expects {} parties, we expect {}",
                            hello.num_parties,
                            core.num_parties()
                        )));
                    }
                    if hello.version != version {
                        return Err(Error::HandshakeFailed(format!(
                            "party {p} runs version {}, we run {version}",
                            hello.version
                        )));
                    }
                    if let Some(seed) = hello.seed {
                        core.install_their_tape(p, seed);
                    }
                }
                debug!(parties = core.num_parties(), "handshake verified");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    /// Evaluates all registered gates.
    ///
    /// Spawns the setup and online task of every gate, waits for all of them
    /// and surfaces the first non-aborted error.
    pub async fn evaluate(&self) -> Result<(), Error> {
        if let Err(e) = self.handshake().await {
            self.core.abort_now();
            return Err(e);
        }

        let gates = self.core.take_gates();
        let total = gates.len();
        debug!(gates = total, "starting evaluation");
        let setup_left = Arc::new(AtomicUsize::new(total));
        let (all_setup_tx, all_setup_rx) = watch::channel(total == 0);
        let all_setup_tx = Arc::new(all_setup_tx);

        let mut tasks = Vec::with_capacity(2 * total);
        for mut gate in gates {
            let (handoff_tx, handoff_rx) = oneshot::channel::<(AnyGate, Option<Error>)>();

            let core = self.core.clone();
            let setup_left = setup_left.clone();
            let all_setup_tx = all_setup_tx.clone();
            tasks.push(tokio::spawn(async move {
                let gate_id = gate.gate_id();
                if core.verbose() {
                    trace!(gate_id, "setup start");
                }
                let res = gate.evaluate_setup().await;
                if core.verbose() {
                    trace!(gate_id, ok = res.is_ok(), "setup end");
                }
                if let Err(e) = &res {
                    gate.poison();
                    if e.is_fatal() {
                        core.abort_now();
                    }
                }
                if setup_left.fetch_sub(1, Ordering::AcqRel) == 1 {
                    let _ = all_setup_tx.send(true);
                }
                let _ = handoff_tx.send((gate, res.as_ref().err().cloned()));
                res
            }));

            let core = self.core.clone();
            let online_after_setup = self.core.cfg.online_after_setup;
            let mut all_setup_rx = all_setup_rx.clone();
            tasks.push(tokio::spawn(async move {
                let Ok((mut gate, setup_err)) = handoff_rx.await else {
                    return Err(Error::Aborted);
                };
                if setup_err.is_some() {
                    return Err(Error::Aborted);
                }
                if online_after_setup && all_setup_rx.wait_for(|done| *done).await.is_err() {
                    return Err(Error::Aborted);
                }
                let gate_id = gate.gate_id();
                if core.verbose() {
                    trace!(gate_id, "online start");
                }
                let res = gate.evaluate_online().await;
                if core.verbose() {
                    trace!(gate_id, ok = res.is_ok(), "online end");
                }
                if let Err(e) = &res {
                    gate.poison();
                    if e.is_fatal() {
                        core.abort_now();
                    }
                }
                res
            }));
        }

        let mut first: Option<Error> = None;
        let mut aborted = false;
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(Error::Aborted)) => aborted = true,
                Ok(Err(e)) => {
                    if first.is_none() {
                        first = Some(e);
                    }
                }
                Err(_) => {
                    if first.is_none() {
                        first = Some(Error::ProtocolViolation("gate task panicked".into()));
                    }
                }
            }
        }
        if first.is_none() {
            first = self.core.take_fatal();
        }
        match first {
            Some(e) => {
                self.core.abort_now();
                Err(e)
            }
            None if aborted => Err(Error::Aborted),
            None => Ok(()),
        }
    }

    /// Aborts the evaluation: pending futures drain with [`Error::Aborted`]
    /// and gate tasks exit from their next suspension point.
    pub fn abort(&self) {
        self.core.abort_now();
    }

    /// Tears the backend down, verifying that no inbox entry is left behind.
    pub async fn shutdown(self) -> Result<(), Error> {
        let leftover = self.core.registry().outstanding();
        self.core.abort_now();
        for handle in self.io_handles {
            handle.abort();
        }
        if leftover > 0 {
            return Err(Error::ProtocolViolation(format!(
                "{leftover} inbox entries remain at session end"
            )));
        }
        Ok(())
    }
}
