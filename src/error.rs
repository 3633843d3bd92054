//! The error type shared by all protocol layers.

use thiserror::Error;

/// Errors raised during circuit evaluation.
///
/// [`Error::ConfigInvalid`], [`Error::ProtocolViolation`] and
/// [`Error::CryptoFailure`] are fatal: the whole evaluation is poisoned and
/// the backend aborts. [`Error::PeerGone`] poisons every outstanding message
/// future from that peer and propagates through the gates awaiting them.
/// [`Error::Aborted`] is soft: gates unwind without logging an error, and the
/// backend reports the first non-aborted error instead.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A gate or message was constructed with inconsistent parameters.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// The hello exchange with a peer did not verify.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    /// A peer closed its channel while messages were still outstanding.
    #[error("party {party} disconnected with outstanding work")]
    PeerGone {
        /// The id of the disconnected party.
        party: usize,
    },
    /// A message or registration broke the exactly-once delivery contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// Cryptographic material failed verification where detection is possible.
    #[error("cryptographic failure: {0}")]
    CryptoFailure(String),
    /// The evaluation was cancelled locally.
    #[error("evaluation aborted")]
    Aborted,
}

impl Error {
    /// Whether this error must immediately poison the whole evaluation.
    pub(crate) fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConfigInvalid(_)
                | Error::HandshakeFailed(_)
                | Error::ProtocolViolation(_)
                | Error::CryptoFailure(_)
        )
    }
}
