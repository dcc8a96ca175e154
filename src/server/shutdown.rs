use tokio::sync::broadcast;

/// Listens for the server-wide shutdown signal.
///
/// Only one value is ever broadcast; once received, the connection is
/// winding down and `recv` never blocks again.
pub(crate) struct Shutdown {
    /// `true` once the signal has been received.
    is_shutdown: bool,
    notify: broadcast::Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: broadcast::Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }
        // A RecvError means the sender dropped, which also signals shutdown.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
