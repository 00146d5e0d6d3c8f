//! Lifecycle state cell with epoch-guarded commits.

use std::sync::{Mutex, PoisonError};

use lodestone_core::State;
use tokio::sync::watch;

/// A transition that actually changed the state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Transition {
    pub from: State,
    pub to: State,
}

/// Holds one instance's [`State`].
///
/// Every operation that spans an await records the epoch returned by
/// [`StateCell::begin`] and settles through [`StateCell::commit`]. A kill
/// calls [`StateCell::force`], which bumps the epoch, so a late commit from
/// the interrupted operation is refused.
#[derive(Debug)]
pub(crate) struct StateCell {
    tx: watch::Sender<State>,
    epoch: Mutex<u64>,
}

impl StateCell {
    pub fn new(initial: State) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx,
            epoch: Mutex::new(0),
        }
    }

    pub fn get(&self) -> State {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<State> {
        self.tx.subscribe()
    }

    /// Move to a transitional state and return the epoch to commit against.
    pub fn begin(&self, to: State) -> (u64, Option<Transition>) {
        let epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        (*epoch, self.set(to))
    }

    /// Settle an operation. `None` when a kill intervened.
    pub fn commit(&self, epoch: u64, to: State) -> Option<Option<Transition>> {
        let current = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != epoch {
            return None;
        }
        Some(self.set(to))
    }

    /// Unconditional move that invalidates every outstanding epoch.
    pub fn force(&self, to: State) -> Option<Transition> {
        let mut epoch = self.epoch.lock().unwrap_or_else(PoisonError::into_inner);
        *epoch += 1;
        self.set(to)
    }

    fn set(&self, to: State) -> Option<Transition> {
        let from = self.tx.send_replace(to);
        (from != to).then_some(Transition { from, to })
    }
}
