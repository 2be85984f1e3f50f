//! Shutdown signalling
//!
//! One [`ShutdownSignal`] is owned by each watcher run; every background task,
//! thread and resolver loop holds a [`ShutdownListener`]. Listeners can be
//! checked synchronously from blocking threads or awaited from async tasks.

use tokio::sync::watch;

/// Cancellation source
#[derive(Debug)]
pub struct ShutdownSignal {
    tx: watch::Sender<bool>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Request shutdown. Calling this more than once has no further effect.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn listener(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cancellation observer handed to background work
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Non-blocking check, safe from any thread
    ///
    /// A dropped signal counts as triggered.
    pub fn is_triggered(&self) -> bool {
        let stop = *self.rx.borrow();
        stop || self.rx.has_changed().is_err()
    }

    /// Resolve once shutdown has been requested
    pub async fn triggered(&mut self) {
        // Err means the signal was dropped, which also ends the wait.
        let _ = self.rx.wait_for(|stop| *stop).await;
    }
}
