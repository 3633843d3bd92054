//! Gate-id-keyed message routing between parties.
//!
//! Every inter-party message belongs to exactly one inbox entry identified by
//! `(kind, sender, id)`. Consumers reserve an entry up front with
//! [`Registry::register`] and receive the matching inbound frame through a
//! one-shot future; frames that arrive before their registration are parked
//! until the consumer shows up. Each entry is matched exactly once: duplicate
//! registrations and duplicate frames are protocol violations.
//!
//! Frames are framed as `tag | id (u64 LE) | bit length (u32 LE) | payload`,
//! with the payload packed MSB-first within each byte. Distinct tags separate
//! the hello handshake, gate bit messages and OT traffic, so the three id
//! spaces cannot collide.
//!
//! Sockets are never touched on the hot path: a dedicated reader task and a
//! dedicated writer task per peer drive the underlying [`Channel`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::bits::{self, BitVec};
use crate::channel::Channel;
use crate::error::Error;

/// Frame tag of the hello handshake ("HELO" when read as ASCII LE).
const TAG_HELLO: u32 = 0x4F4C4548;
/// Frame tag of gate bit messages ("BITS").
const TAG_BITS: u32 = 0x53544942;
/// Frame tag of correlated-OT messages ("XOT_").
const TAG_OT: u32 = 0x5F544F58;

const HEADER_LEN: usize = 16;

/// The message classes routed by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum MsgKind {
    /// Hello handshake payloads.
    Hello,
    /// Gate-id-keyed bit payloads.
    Bits,
    /// Correlated-OT corrections and messages.
    Ot,
}

impl MsgKind {
    fn tag(self) -> u32 {
        match self {
            MsgKind::Hello => TAG_HELLO,
            MsgKind::Bits => TAG_BITS,
            MsgKind::Ot => TAG_OT,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            TAG_HELLO => Some(MsgKind::Hello),
            TAG_BITS => Some(MsgKind::Bits),
            TAG_OT => Some(MsgKind::Ot),
            _ => None,
        }
    }
}

/// The hello message exchanged by every ordered party pair before any gate
/// traffic. Carries the seed of the sender's randomness generator towards the
/// recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub(crate) sender: usize,
    pub(crate) recipient: usize,
    pub(crate) num_parties: usize,
    pub(crate) seed: Option<[u8; 32]>,
    pub(crate) online_after_setup: bool,
    pub(crate) version: String,
}

impl Hello {
    pub(crate) fn to_payload(&self) -> Result<Vec<u8>, Error> {
        bincode::serialize(self)
            .map_err(|e| Error::HandshakeFailed(format!("cannot encode hello: {e}")))
    }

    pub(crate) fn from_payload(payload: &[u8]) -> Result<Self, Error> {
        bincode::deserialize(payload)
            .map_err(|e| Error::HandshakeFailed(format!("cannot decode hello: {e}")))
    }
}

/// The backend-wide abort signal. Triggering it drains every pending future
/// and makes gate tasks exit from their next suspension point.
pub(crate) struct AbortSignal {
    tx: watch::Sender<bool>,
}

impl AbortSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

struct Payload {
    bytes: Vec<u8>,
    bits: usize,
}

enum Slot {
    Waiting {
        tx: oneshot::Sender<Result<Payload, Error>>,
        expected_bits: Option<usize>,
    },
    Arrived(Payload),
}

struct State {
    pending: HashMap<(MsgKind, usize, u64), Slot>,
    gone: Vec<bool>,
    aborted: bool,
}

/// The future side of a registered inbox entry.
pub(crate) struct MsgFuture {
    rx: oneshot::Receiver<Result<Payload, Error>>,
}

impl MsgFuture {
    fn resolved(result: Result<Payload, Error>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }

    /// Awaits the payload as a bit vector.
    pub(crate) async fn recv(self) -> Result<BitVec, Error> {
        let payload = self.rx.await.map_err(|_| Error::Aborted)??;
        bits::from_bytes(payload.bytes, payload.bits)
    }

    /// Awaits the raw payload bytes (used for hello and key blobs).
    pub(crate) async fn recv_raw(self) -> Result<Vec<u8>, Error> {
        let payload = self.rx.await.map_err(|_| Error::Aborted)??;
        Ok(payload.bytes)
    }
}

/// The gate-id-keyed message registry of one backend.
pub(crate) struct Registry {
    my_id: usize,
    num_parties: usize,
    outbound: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    state: Mutex<State>,
}

impl Registry {
    pub(crate) fn new(
        my_id: usize,
        num_parties: usize,
        outbound: Vec<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    ) -> Self {
        Self {
            my_id,
            num_parties,
            outbound,
            state: Mutex::new(State {
                pending: HashMap::new(),
                gone: vec![false; num_parties],
                aborted: false,
            }),
        }
    }

    /// Reserves the inbox entry `(kind, sender, id)` and returns the future
    /// that the matching inbound frame resolves.
    ///
    /// `expected_bits` is checked against the announced payload length of the
    /// frame; a mismatch resolves the future with a protocol violation.
    pub(crate) fn register(
        &self,
        kind: MsgKind,
        sender: usize,
        id: u64,
        expected_bits: Option<usize>,
    ) -> Result<MsgFuture, Error> {
        if sender == self.my_id || sender >= self.num_parties {
            return Err(Error::ConfigInvalid(format!(
                "cannot register for messages from party {sender}"
            )));
        }
        let mut state = self.state.lock().expect("registry state lock");
        if state.aborted {
            return Ok(MsgFuture::resolved(Err(Error::Aborted)));
        }
        let gone = state.gone[sender];
        match state.pending.entry((kind, sender, id)) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Waiting { .. } => Err(Error::ProtocolViolation(format!(
                    "duplicate registration for message {id} from party {sender}"
                ))),
                Slot::Arrived(_) => {
                    let Slot::Arrived(payload) = entry.remove() else {
                        unreachable!("matched Arrived above");
                    };
                    if let Some(expected) = expected_bits {
                        if payload.bits != expected {
                            return Ok(MsgFuture::resolved(Err(Error::ProtocolViolation(
                                format!(
                                    "message {id} from party {sender} has {} bits, expected {expected}",
                                    payload.bits
                                ),
                            ))));
                        }
                    }
                    Ok(MsgFuture::resolved(Ok(payload)))
                }
            },
            Entry::Vacant(entry) => {
                if gone {
                    return Ok(MsgFuture::resolved(Err(Error::PeerGone { party: sender })));
                }
                let (tx, rx) = oneshot::channel();
                entry.insert(Slot::Waiting { tx, expected_bits });
                Ok(MsgFuture { rx })
            }
        }
    }

    /// Sends a frame to a single peer.
    pub(crate) fn send(
        &self,
        kind: MsgKind,
        peer: usize,
        id: u64,
        bytes: Vec<u8>,
        num_bits: usize,
    ) -> Result<(), Error> {
        if peer == self.my_id {
            return Err(Error::ConfigInvalid("message addressed to self".into()));
        }
        if peer >= self.num_parties {
            return Err(Error::ConfigInvalid(format!("no party with id {peer}")));
        }
        {
            let state = self.state.lock().expect("registry state lock");
            if state.aborted {
                return Err(Error::Aborted);
            }
            if state.gone[peer] {
                return Err(Error::PeerGone { party: peer });
            }
        }
        let mut frame = Vec::with_capacity(HEADER_LEN + bytes.len());
        frame.extend_from_slice(&kind.tag().to_le_bytes());
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&(num_bits as u32).to_le_bytes());
        frame.extend_from_slice(&bytes);
        self.outbound[peer]
            .as_ref()
            .expect("outbound queue exists for every peer")
            .send(frame)
            .map_err(|_| Error::PeerGone { party: peer })
    }

    /// Sends a bit payload to a single peer.
    pub(crate) fn send_bits(&self, peer: usize, id: u64, payload: &BitVec) -> Result<(), Error> {
        self.send(MsgKind::Bits, peer, id, bits::to_bytes(payload), payload.len())
    }

    /// Sends a bit payload to every other party (N-1 unicasts).
    pub(crate) fn broadcast_bits(&self, id: u64, payload: &BitVec) -> Result<(), Error> {
        for peer in 0..self.num_parties {
            if peer != self.my_id {
                self.send_bits(peer, id, payload)?;
            }
        }
        Ok(())
    }

    /// Routes one inbound frame. Called by the reader task of `sender`.
    pub(crate) fn on_frame(&self, sender: usize, frame: Vec<u8>) -> Result<(), Error> {
        if frame.len() < HEADER_LEN {
            return Err(Error::ProtocolViolation(format!(
                "truncated frame of {} bytes from party {sender}",
                frame.len()
            )));
        }
        let tag = u32::from_le_bytes(frame[0..4].try_into().expect("sliced 4 bytes"));
        let kind = MsgKind::from_tag(tag).ok_or_else(|| {
            Error::ProtocolViolation(format!("unknown frame tag {tag:#x} from party {sender}"))
        })?;
        let id = u64::from_le_bytes(frame[4..12].try_into().expect("sliced 8 bytes"));
        let num_bits = u32::from_le_bytes(frame[12..16].try_into().expect("sliced 4 bytes")) as usize;
        let bytes = frame[HEADER_LEN..].to_vec();
        if bytes.len() != num_bits.div_ceil(8) {
            return Err(Error::ProtocolViolation(format!(
                "message {id} from party {sender} announces {num_bits} bits but carries {} bytes",
                bytes.len()
            )));
        }
        let payload = Payload { bytes, bits: num_bits };

        let mut state = self.state.lock().expect("registry state lock");
        if state.aborted {
            return Ok(());
        }
        match state.pending.entry((kind, sender, id)) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Arrived(_) => Err(Error::ProtocolViolation(format!(
                    "duplicate message {id} from party {sender}"
                ))),
                Slot::Waiting { .. } => {
                    let Slot::Waiting { tx, expected_bits } = entry.remove() else {
                        unreachable!("matched Waiting above");
                    };
                    if let Some(expected) = expected_bits {
                        if payload.bits != expected {
                            let err = Error::ProtocolViolation(format!(
                                "message {id} from party {sender} has {} bits, expected {expected}",
                                payload.bits
                            ));
                            let _ = tx.send(Err(err.clone()));
                            return Err(err);
                        }
                    }
                    let _ = tx.send(Ok(payload));
                    Ok(())
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(Slot::Arrived(payload));
                Ok(())
            }
        }
    }

    /// Fails every outstanding future from `peer` with [`Error::PeerGone`]
    /// and rejects all further traffic to and from it.
    pub(crate) fn peer_gone(&self, peer: usize) {
        let mut state = self.state.lock().expect("registry state lock");
        if state.gone[peer] {
            return;
        }
        state.gone[peer] = true;
        let keys: Vec<_> = state
            .pending
            .keys()
            .filter(|(_, sender, _)| *sender == peer)
            .copied()
            .collect();
        for key in keys {
            if let Some(Slot::Waiting { tx, .. }) = state.pending.remove(&key) {
                let _ = tx.send(Err(Error::PeerGone { party: peer }));
            }
        }
    }

    /// Drains every pending future with [`Error::Aborted`] and purges the
    /// inbox.
    pub(crate) fn drain_abort(&self) {
        let mut state = self.state.lock().expect("registry state lock");
        state.aborted = true;
        for (_, slot) in state.pending.drain() {
            if let Slot::Waiting { tx, .. } = slot {
                let _ = tx.send(Err(Error::Aborted));
            }
        }
    }

    /// The number of inbox entries that have not been matched yet.
    pub(crate) fn outstanding(&self) -> usize {
        self.state.lock().expect("registry state lock").pending.len()
    }
}

/// Spawns the per-peer reader and writer tasks driving `channel`.
pub(crate) fn spawn_io<C>(
    channel: C,
    my_id: usize,
    num_parties: usize,
    registry: Arc<Registry>,
    abort: Arc<AbortSignal>,
    fatal: Arc<Mutex<Option<Error>>>,
    mut outbound: Vec<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
) -> Vec<JoinHandle<()>>
where
    C: Channel + Send + Sync + 'static,
{
    let channel = Arc::new(channel);
    let mut handles = Vec::with_capacity(2 * (num_parties - 1));
    for peer in 0..num_parties {
        if peer == my_id {
            continue;
        }
        let reader_channel = channel.clone();
        let reader_registry = registry.clone();
        let reader_abort = abort.clone();
        let reader_fatal = fatal.clone();
        let mut abort_rx = abort.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = reader_channel.recv_bytes_from(peer) => match frame {
                        Ok(frame) => {
                            if let Err(e) = reader_registry.on_frame(peer, frame) {
                                warn!(peer, error = %e, "inbound frame rejected");
                                reader_fatal
                                    .lock()
                                    .expect("fatal error lock")
                                    .get_or_insert(e);
                                reader_abort.trigger();
                                reader_registry.drain_abort();
                                break;
                            }
                        }
                        Err(_) => {
                            reader_registry.peer_gone(peer);
                            break;
                        }
                    },
                    _ = wait_for_abort(&mut abort_rx) => break,
                }
            }
        }));

        let mut queue = outbound[peer].take().expect("outbound queue for peer");
        let writer_channel = channel.clone();
        let writer_registry = registry.clone();
        let mut abort_rx = abort.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = queue.recv() => match frame {
                        Some(frame) => {
                            if writer_channel.send_bytes_to(peer, frame).await.is_err() {
                                writer_registry.peer_gone(peer);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = wait_for_abort(&mut abort_rx) => break,
                }
            }
        }));
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: MsgKind, id: u64, payload: &BitVec) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&kind.tag().to_le_bytes());
        frame.extend_from_slice(&id.to_le_bytes());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&bits::to_bytes(payload));
        frame
    }

    #[tokio::test]
    async fn frame_resolves_registration_in_either_order() {
        let registry = Registry::new(0, 2, vec![None, None]);
        let payload = bits::from_bools(&[true, false, true]);

        let fut = registry.register(MsgKind::Bits, 1, 7, Some(3)).unwrap();
        registry.on_frame(1, frame(MsgKind::Bits, 7, &payload)).unwrap();
        assert_eq!(fut.recv().await.unwrap(), payload);

        registry.on_frame(1, frame(MsgKind::Bits, 8, &payload)).unwrap();
        let fut = registry.register(MsgKind::Bits, 1, 8, Some(3)).unwrap();
        assert_eq!(fut.recv().await.unwrap(), payload);
        assert_eq!(registry.outstanding(), 0);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let registry = Registry::new(0, 2, vec![None, None]);
        let _fut = registry.register(MsgKind::Bits, 1, 7, Some(3)).unwrap();
        assert!(matches!(
            registry.register(MsgKind::Bits, 1, 7, Some(3)),
            Err(Error::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn size_mismatch_is_a_protocol_violation() {
        let registry = Registry::new(0, 2, vec![None, None]);
        let payload = bits::from_bools(&[true, false, true]);
        let fut = registry.register(MsgKind::Bits, 1, 7, Some(5)).unwrap();
        assert!(registry.on_frame(1, frame(MsgKind::Bits, 7, &payload)).is_err());
        assert!(matches!(fut.recv().await, Err(Error::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn gone_peer_fails_outstanding_and_later_registrations() {
        let registry = Registry::new(0, 2, vec![None, None]);
        let fut = registry.register(MsgKind::Bits, 1, 7, Some(3)).unwrap();
        registry.peer_gone(1);
        assert!(matches!(fut.recv().await, Err(Error::PeerGone { party: 1 })));
        let fut = registry.register(MsgKind::Bits, 1, 8, Some(3)).unwrap();
        assert!(matches!(fut.recv().await, Err(Error::PeerGone { party: 1 })));
    }
}
