use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

type Callback = Box<dyn FnOnce(usize) + Send>;

struct Inner {
    pending: AtomicUsize,
    bytes: AtomicUsize,
    callback: Mutex<Option<Callback>>,
}

/// Caller-supplied completion handle for an asynchronous operation.
///
/// A completion starts with one pending retirement. Each signal descriptor
/// carrying it retires one; when the count reaches zero the callback runs
/// once with the number of bytes the operation moved. Clones share state.
#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A completion that calls `f(bytes)` when it fires.
    pub fn with_callback(f: impl FnOnce(usize) + Send + 'static) -> Self {
        Self::build(Some(Box::new(f)))
    }

    fn build(callback: Option<Callback>) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: AtomicUsize::new(1),
                bytes: AtomicUsize::new(0),
                callback: Mutex::new(callback),
            }),
        }
    }

    /// Retirements still outstanding.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.pending() == 0
    }

    /// Bytes recorded by the issuer.
    pub fn bytes(&self) -> usize {
        self.inner.bytes.load(Ordering::Acquire)
    }

    pub(crate) fn add_bytes(&self, n: usize) {
        self.inner.bytes.fetch_add(n, Ordering::AcqRel);
    }

    /// Expect `n` more retirements before firing.
    pub(crate) fn add_pending(&self, n: usize) {
        self.inner.pending.fetch_add(n, Ordering::AcqRel);
    }

    /// Forget `n` retirements that will never happen. Fires the completion if
    /// nothing else is outstanding.
    pub(crate) fn cancel_pending(&self, n: usize) -> bool {
        let mut fired = false;
        for _ in 0..n {
            fired |= self.retire();
        }
        fired
    }

    /// Record one retirement. Returns true if this call fired the
    /// completion.
    pub(crate) fn retire(&self) -> bool {
        let prev = self
            .inner
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        match prev {
            Ok(1) => {
                let callback = self
                    .inner
                    .callback
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                if let Some(f) = callback {
                    f(self.bytes());
                }
                true
            }
            Ok(_) => false,
            Err(_) => {
                tracing::warn!("completion retired more times than issued");
                false
            }
        }
    }
}

impl Default for Completion {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("pending", &self.pending())
            .field("bytes", &self.bytes())
            .finish()
    }
}
