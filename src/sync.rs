//! Write-once cells with one-shot readiness events.
//!
//! A [`ReadyCell`] is how a producer gate hands a finalized wire value to an
//! arbitrary number of consumer gates running on other tasks: the value is
//! written exactly once, the event fires exactly once, and waiters that
//! arrive after the fact resolve immediately. A failed producer poisons the
//! cell instead, and waiters unwind with [`Error::Aborted`].

use std::sync::OnceLock;

use tokio::sync::watch;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CellState {
    Pending,
    Ready,
    Poisoned,
}

/// A single-writer, multi-reader slot guarded by a one-shot event.
pub(crate) struct ReadyCell<T> {
    slot: OnceLock<T>,
    state: watch::Sender<CellState>,
    abort: watch::Receiver<bool>,
}

impl<T> ReadyCell<T> {
    /// Creates an empty cell whose waiters additionally unwind when the
    /// backend-wide abort signal fires.
    pub(crate) fn new(abort: watch::Receiver<bool>) -> Self {
        let (state, _) = watch::channel(CellState::Pending);
        Self {
            slot: OnceLock::new(),
            state,
            abort,
        }
    }

    /// Publishes the value and fires the readiness event.
    ///
    /// Calling this twice is a programming error and fails loudly.
    pub(crate) fn set(&self, value: T) -> Result<(), Error> {
        if self.slot.set(value).is_err() {
            return Err(Error::ProtocolViolation(
                "wire value set twice in the same phase".into(),
            ));
        }
        self.state.send_replace(CellState::Ready);
        Ok(())
    }

    /// Marks the cell as never going to be written. Idempotent; a no-op once
    /// the value is published.
    pub(crate) fn poison(&self) {
        self.state.send_if_modified(|state| {
            if *state == CellState::Pending {
                *state = CellState::Poisoned;
                true
            } else {
                false
            }
        });
    }

    /// Waits for the readiness event and returns the published value.
    ///
    /// Resolves with [`Error::Aborted`] if the producer poisoned the cell or
    /// the backend aborted.
    pub(crate) async fn wait(&self) -> Result<&T, Error> {
        let mut state = self.state.subscribe();
        let mut abort = self.abort.clone();
        tokio::select! {
            changed = state.wait_for(|s| *s != CellState::Pending) => {
                match changed.map(|s| *s) {
                    Ok(CellState::Ready) => {}
                    _ => return Err(Error::Aborted),
                }
            }
            _ = abort.wait_for(|aborted| *aborted) => return Err(Error::Aborted),
        }
        self.slot.get().ok_or(Error::Aborted)
    }

    /// The published value, if the cell is ready.
    pub(crate) fn get(&self) -> Option<&T> {
        self.slot.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_abort() -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        rx
    }

    #[tokio::test]
    async fn waiters_resolve_before_and_after_set() {
        let cell = std::sync::Arc::new(ReadyCell::new(no_abort()));
        let early = {
            let cell = cell.clone();
            tokio::spawn(async move { *cell.wait().await.unwrap() })
        };
        tokio::task::yield_now().await;
        cell.set(42).unwrap();
        assert_eq!(early.await.unwrap(), 42);
        assert_eq!(*cell.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn second_set_fails_loudly() {
        let cell = ReadyCell::new(no_abort());
        cell.set(1).unwrap();
        assert!(matches!(cell.set(2), Err(Error::ProtocolViolation(_))));
        assert_eq!(*cell.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn poison_aborts_waiters() {
        let cell = ReadyCell::<u32>::new(no_abort());
        cell.poison();
        assert!(matches!(cell.wait().await, Err(Error::Aborted)));
    }

    #[tokio::test]
    async fn abort_signal_unblocks_waiters() {
        let (tx, rx) = watch::channel(false);
        let cell = std::sync::Arc::new(ReadyCell::<u32>::new(rx));
        let waiter = {
            let cell = cell.clone();
            tokio::spawn(async move { cell.wait().await.map(|v| *v) })
        };
        tokio::task::yield_now().await;
        tx.send_replace(true);
        assert!(matches!(waiter.await.unwrap(), Err(Error::Aborted)));
    }
}
