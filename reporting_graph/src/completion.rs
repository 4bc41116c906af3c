use std::sync::Arc;

use tokio::sync::watch;

/// Single-fire notification that a run has fully resolved.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    tx: Arc<watch::Sender<bool>>,
}

/// Receiving side of a [`CompletionSignal`]; any number may exist.
#[derive(Debug, Clone)]
pub struct CompletionWaiter {
    rx: watch::Receiver<bool>,
}

impl CompletionSignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fires the signal. Returns `false` if it had already fired.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn waiter(&self) -> CompletionWaiter {
        CompletionWaiter {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionWaiter {
    pub async fn wait(&mut self) {
        // the sender lives as long as the executor; a dropped sender also
        // means nothing will ever complete, so stop waiting either way
        let _ = self.rx.wait_for(|done| *done).await;
    }

    pub fn is_complete(&self) -> bool {
        *self.rx.borrow()
    }
}
