use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// The pipeline was told to stop. Treated as a normal exit, not a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

/// Cooperative cancellation token shared by all pipeline roles.
///
/// Blocking operations select on [`channel`](Self::channel), which becomes
/// ready (with a disconnect) once [`cancel`](Self::cancel) is called; hot
/// loops poll [`is_canceled`](Self::is_canceled).
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    flag: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl CancelToken {
    /// Create a token in the not-canceled state.
    pub fn new() -> Self {
        let (sender, receiver) = bounded(0);
        Self {
            inner: Arc::new(Inner {
                flag: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// Signal cancellation. Idempotent; wakes every blocked selector.
    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.sender.lock().take();
    }

    /// Whether cancellation was signalled.
    pub fn is_canceled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// A channel that becomes ready once the token is canceled, for use in
    /// `select!` arms.
    pub fn channel(&self) -> &Receiver<()> {
        &self.inner.receiver
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
