//! # Connectivity Monitor
//!
//! Online/offline flag as a `watch` stream. Platform glue calls
//! [`ConnectivityMonitor::set_online`]; headless hosts can run
//! [`ConnectivityMonitor::spawn_probe`] instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Broadcasts connectivity transitions.
#[derive(Debug, Clone)]
pub struct ConnectivityMonitor {
    tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _rx) = watch::channel(initially_online);
        ConnectivityMonitor { tx: Arc::new(tx) }
    }

    /// Records the current state; observers hear only real transitions.
    pub fn set_online(&self, online: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            if online {
                info!("Connectivity restored");
            } else {
                warn!("Connectivity lost");
            }
        }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Polls `url` every `interval`; any HTTP answer counts as online.
    pub fn spawn_probe(&self, url: url::Url, interval: Duration) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let client = match reqwest::Client::builder().timeout(interval).build() {
                Ok(client) => client,
                Err(e) => {
                    warn!(?e, "Connectivity probe disabled");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = match client.head(url.clone()).send().await {
                    Ok(_) => true,
                    Err(e) => {
                        debug!(error = %e, "Connectivity probe failed");
                        false
                    }
                };
                monitor.set_online(online);
            }
        })
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        ConnectivityMonitor::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_only_transitions_are_broadcast() {
        let monitor = ConnectivityMonitor::new(true);
        let mut rx = monitor.subscribe();
        rx.borrow_and_update();

        monitor.set_online(true);
        assert!(!rx.has_changed().unwrap());

        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        assert!(!monitor.is_online());

        let clone = monitor.clone();
        clone.set_online(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
