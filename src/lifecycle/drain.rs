//! In-flight work tracking for graceful shutdown.
//!
//! Every accepted connection and every CONNECT tunnel holds a [`DrainGuard`].
//! [`Drain::wait`] resolves once all guards are dropped or the deadline
//! passes; in the latter case every guard observes [`DrainGuard::terminated`]
//! and its owner closes its sockets.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Coordinator owned by a listener
pub struct Drain {
    /// Cloned into every guard; the channel closes when the last clone drops
    tracker: mpsc::Sender<()>,
    idle: mpsc::Receiver<()>,
    terminate: watch::Sender<bool>,
}

/// Held by one unit of in-flight work
#[derive(Clone)]
pub struct DrainGuard {
    _tracker: mpsc::Sender<()>,
    terminate: watch::Receiver<bool>,
}

impl Drain {
    pub fn new() -> Self {
        let (tracker, idle) = mpsc::channel(1);
        let (terminate, _) = watch::channel(false);
        Self {
            tracker,
            idle,
            terminate,
        }
    }

    /// Register a new unit of in-flight work
    pub fn guard(&self) -> DrainGuard {
        DrainGuard {
            _tracker: self.tracker.clone(),
            terminate: self.terminate.subscribe(),
        }
    }

    /// Wait for all guards to be released, at most `deadline`.
    ///
    /// Returns `true` when everything finished in time. On expiry, forced
    /// termination is broadcast and `false` is returned.
    pub async fn wait(self, deadline: Duration) -> bool {
        let Drain {
            tracker,
            mut idle,
            terminate,
        } = self;
        drop(tracker);

        match timeout(deadline, idle.recv()).await {
            Ok(_) => {
                debug!("All in-flight work finished");
                true
            }
            Err(_) => {
                warn!(
                    remaining = terminate.receiver_count(),
                    "Drain deadline expired, terminating in-flight work"
                );
                let _ = terminate.send(true);
                false
            }
        }
    }
}

impl Default for Drain {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainGuard {
    /// Resolves once forced termination has been broadcast or the owning
    /// [`Drain`] is gone.
    pub async fn terminated(&mut self) {
        let _ = self.terminate.wait_for(|terminate| *terminate).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_without_guards_is_immediate() {
        let drain = Drain::new();
        let clean = timeout(Duration::from_secs(1), drain.wait(Duration::from_secs(30)))
            .await
            .expect("drain with no guards should not block");
        assert!(clean);
    }

    #[tokio::test]
    async fn test_wait_until_guards_released() {
        let drain = Drain::new();
        let guard = drain.guard();
        let second = guard.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
            drop(second);
        });

        assert!(drain.wait(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_deadline_broadcasts_termination() {
        let drain = Drain::new();
        let mut guard = drain.guard();

        let worker = tokio::spawn(async move {
            guard.terminated().await;
        });

        assert!(!drain.wait(Duration::from_millis(50)).await);
        timeout(Duration::from_secs(1), worker)
            .await
            .expect("guard should observe termination")
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_not_terminated_while_draining() {
        let drain = Drain::new();
        let mut guard = drain.guard();

        let observed = timeout(Duration::from_millis(50), guard.terminated()).await;
        assert!(observed.is_err());
        drop(drain);
    }
}
