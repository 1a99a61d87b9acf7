//! Shutdown signalling shared by the server actor and every task it spawns.
//!
//! A cheap, cloneable handle that every cooperating task selects on,
//! backed by a [`tokio::sync::watch`] channel rather than a broadcast
//! channel since there is exactly one shutdown event, not a stream of
//! them.

use tokio::sync::watch;

/// The sending half; held by whatever decides the process should stop
/// (typically a `ctrl_c` listener in `main`).
#[derive(Debug, Clone)]
pub struct Trigger {
    tx: watch::Sender<bool>,
}

/// The receiving half; cloned into every task that should stop when the
/// trigger fires.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Build a fresh trigger/shutdown pair.
#[must_use]
pub fn pair() -> (Trigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (Trigger { tx }, Shutdown { rx })
}

impl Trigger {
    /// Fire the shutdown signal. Idempotent.
    pub fn fire(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// Resolve once the shutdown signal has fired. Safe to call from a
    /// `tokio::select!` branch repeatedly; resolves immediately on every
    /// call after the first fire.
    pub async fn recv(&mut self) {
        if *self.rx.borrow() {
            return;
        }
        // An error here means the Trigger was dropped without firing,
        // which we treat the same as a fire: nothing will un-stick us.
        let _ = self.rx.changed().await;
    }

    /// Non-blocking check of current state.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_resolves_after_fire() {
        let (trigger, mut shutdown) = pair();
        assert!(!shutdown.is_shutdown());
        trigger.fire();
        shutdown.recv().await;
        assert!(shutdown.is_shutdown());
    }

    #[tokio::test]
    async fn recv_resolves_immediately_once_already_fired() {
        let (trigger, mut shutdown) = pair();
        trigger.fire();
        shutdown.recv().await;
        shutdown.recv().await; // must not hang
    }
}
