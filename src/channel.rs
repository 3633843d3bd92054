//! Communication channels for exchanging frames between parties.
//!
//! The protocol core never touches sockets directly: it talks to the
//! [`Channel`] trait, and dedicated per-peer reader and writer tasks drive
//! the implementation. This keeps the gate engine independent of the
//! transport, so in-memory channels (for tests and simulation) and real
//! network transports are interchangeable.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{
    mpsc::{channel, Receiver, Sender},
    Mutex,
};
use tracing::trace;

/// A communication channel used to send/receive frames to/from another party.
///
/// Implementations determine how frames are physically transmitted. Frames
/// are opaque to the channel; the framing itself (message tags, gate ids,
/// payload lengths) is applied by the messaging layer on top.
pub trait Channel {
    /// The error that can occur sending frames over the channel.
    type SendError: fmt::Debug + Send;
    /// The error that can occur receiving frames over the channel.
    type RecvError: fmt::Debug + Send;

    /// Sends a frame to the party with the given index.
    fn send_bytes_to(
        &self,
        party: usize,
        frame: Vec<u8>,
    ) -> impl Future<Output = Result<(), Self::SendError>> + Send;

    /// Awaits the next frame from the party with the given index.
    fn recv_bytes_from(
        &self,
        party: usize,
    ) -> impl Future<Output = Result<Vec<u8>, Self::RecvError>> + Send;
}

/// A cloneable view on the number of bytes sent over a [`SimpleChannel`].
#[derive(Debug, Clone)]
pub struct ByteCounter(Arc<AtomicU64>);

impl ByteCounter {
    /// The total number of bytes sent so far.
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A simple in-memory channel using tokio [`Sender`]s and [`Receiver`]s,
/// mainly useful to simulate all parties within a single process.
#[derive(Debug)]
pub struct SimpleChannel {
    s: Vec<Option<Sender<Vec<u8>>>>,
    r: Vec<Option<Mutex<Receiver<Vec<u8>>>>>,
    bytes_sent: Arc<AtomicU64>,
}

impl SimpleChannel {
    /// Creates channels for N parties to communicate with each other.
    pub fn channels(parties: usize) -> Vec<Self> {
        let buffer_capacity = 1024;
        let mut channels = Vec::with_capacity(parties);
        for _ in 0..parties {
            channels.push(SimpleChannel {
                s: (0..parties).map(|_| None).collect(),
                r: (0..parties).map(|_| None).collect(),
                bytes_sent: Arc::new(AtomicU64::new(0)),
            });
        }
        for a in 0..parties {
            for b in 0..parties {
                if a == b {
                    continue;
                }
                let (send_a_to_b, recv_a_to_b) = channel(buffer_capacity);
                channels[a].s[b] = Some(send_a_to_b);
                channels[b].r[a] = Some(Mutex::new(recv_a_to_b));
            }
        }
        channels
    }

    /// A handle on the total number of bytes sent on this channel, usable
    /// after the channel has been moved into a backend.
    pub fn byte_counter(&self) -> ByteCounter {
        ByteCounter(self.bytes_sent.clone())
    }
}

/// The error raised by `recv` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum RecvError {
    /// The channel has been closed.
    Closed,
}

/// The error raised by `send` calls of a [`SimpleChannel`].
#[derive(Debug)]
pub enum SendError {
    /// The channel has been closed.
    Closed,
}

impl Channel for SimpleChannel {
    type SendError = SendError;
    type RecvError = RecvError;

    async fn send_bytes_to(&self, p: usize, frame: Vec<u8>) -> Result<(), SendError> {
        self.bytes_sent
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        trace!(to = p, len = frame.len(), "sending frame");
        self.s[p]
            .as_ref()
            .unwrap_or_else(|| panic!("no sender for party {p}"))
            .send(frame)
            .await
            .map_err(|_| SendError::Closed)
    }

    async fn recv_bytes_from(&self, p: usize) -> Result<Vec<u8>, RecvError> {
        let mut r = self.r[p]
            .as_ref()
            .unwrap_or_else(|| panic!("no receiver for party {p}"))
            .lock()
            .await;
        match r.recv().await {
            Some(frame) => {
                trace!(from = p, len = frame.len(), "received frame");
                Ok(frame)
            }
            None => Err(RecvError::Closed),
        }
    }
}
