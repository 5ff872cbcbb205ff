//! Manual-reset pause gate for the transmit loop.

use tokio::sync::watch;

/// Open gate lets the transmit loop run; closing it parks the loop at its
/// next iteration. Opening releases every waiter at once.
#[derive(Debug)]
pub struct PauseGate {
    // ---
    open: watch::Sender<bool>,
}

impl PauseGate {
    // ---
    pub fn new(open: bool) -> Self {
        // ---
        let (tx, _rx) = watch::channel(open);
        Self { open: tx }
    }

    pub fn pause(&self) {
        self.open.send_replace(false);
    }

    pub fn resume(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Returns once the gate is open.
    pub async fn wait(&self) {
        // ---
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|open| *open).await;
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new(true)
    }
}
