//! Debounced hook that fires whenever a session produces output, so an
//! interactive shell's ordinary activity keeps its breakpoint alive without
//! the operator needing to call `breakpoint extend` explicitly.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

const DEBOUNCE: Duration = Duration::from_millis(1000);

/// A cheap, non-blocking signal a write happened. `signal()` can be called
/// from any hot path (channel data relay, SFTP write) without awaiting
/// anything; the debounce task decides how often to actually call back into
/// the lifetime manager.
pub struct WriteNotify {
    tx: mpsc::Sender<()>,
}

impl WriteNotify {
    pub fn new(on_write: impl Fn() + Send + 'static) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel(1);

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                on_write();
                tokio::time::sleep(DEBOUNCE).await;
                // Drain anything that piled up during the debounce window
                // so a steady stream of writes doesn't queue callbacks.
                while rx.try_recv().is_ok() {}
            }
        });

        Arc::new(Self { tx })
    }

    pub fn signal(&self) {
        let _ = self.tx.try_send(());
    }
}
