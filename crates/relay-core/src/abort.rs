use tokio::sync::watch;

/// Handle used to request cancellation of a stream session.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Creates a handle together with the signal observed by the session.
    pub fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, AbortSignal { rx })
    }

    /// Requests cancellation. Repeated calls are no-ops.
    pub fn abort(&self) {
        self.tx.send_if_modified(|aborted| !std::mem::replace(aborted, true));
    }

    /// Returns a new signal observing this handle.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cancellation token passed through every async boundary of a session.
///
/// Checked before each side-effecting step; `aborted()` can be awaited inside
/// `tokio::select!`.
#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation was requested. Pends forever if the handle
    /// was dropped without aborting.
    pub async fn aborted(&mut self) {
        if self.rx.wait_for(|aborted| *aborted).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
