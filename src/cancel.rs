//! Cancellation signal for units of work.

use tokio::sync::watch;

/// Read side of a cancellation signal.
///
/// The default value is never cancelled.
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    rx: Option<watch::Receiver<bool>>,
}

impl Cancellation {
    /// A signal that never fires.
    pub fn none() -> Self {
        Self::default()
    }

    /// `true` once [`CancelHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

/// Write side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Create a handle and the signal it controls.
    ///
    /// # Examples
    ///
    /// ```
    /// use eventfold_uow::CancelHandle;
    ///
    /// let (handle, signal) = CancelHandle::new();
    /// assert!(!signal.is_cancelled());
    /// handle.cancel();
    /// assert!(signal.is_cancelled());
    /// ```
    pub fn new() -> (Self, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, Cancellation { rx: Some(rx) })
    }

    /// Fire the signal. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Another signal controlled by this handle.
    pub fn signal(&self) -> Cancellation {
        Cancellation {
            rx: Some(self.tx.subscribe()),
        }
    }
}
