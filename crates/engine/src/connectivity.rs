use std::sync::Arc;

use tokio::sync::watch;

/// Online/offline signal shared between the host environment and editors.
///
/// The host flips it from whatever network notifications it has; every
/// subscribed [`AutosaveController`](crate::AutosaveController) reacts to the
/// transitions.
#[derive(Debug, Clone)]
pub struct Connectivity {
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(online: bool) -> Self {
        let (tx, _) = watch::channel(online);
        Self { tx: Arc::new(tx) }
    }

    /// Publish a connectivity change. Repeating the current state is a no-op.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repeated_state_does_not_notify() {
        let signal = Connectivity::new(true);
        let mut rx = signal.subscribe();
        let _ = rx.borrow_and_update();

        signal.set_online(true);
        assert!(!rx.has_changed().unwrap());

        signal.set_online(false);
        assert!(rx.has_changed().unwrap());
        assert!(!*rx.borrow_and_update());
        assert!(!signal.is_online());
    }
}
