//! Connectivity tracking.
//!
//! A thin wrapper over a `tokio::sync::watch` channel. Anything may flip
//! the flag (platform hooks, a failing health probe, tests); the sync
//! worker subscribes and reacts to transitions.

use tokio::sync::watch;
use tracing::info;

/// Shared online/offline flag.
#[derive(Clone)]
pub struct ConnectivityMonitor {
    tx: watch::Sender<bool>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    /// Flip the flag. No-op (no wakeups) when the value is unchanged.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(subsystem = "sync", online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Receiver that wakes on every transition.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_transitions_wake_subscribers() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        assert!(monitor.is_online());

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());

        monitor.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn test_redundant_set_does_not_wake() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());
    }
}
