use crate::completion::Completion;
use crate::signal::pool::{DescId, SignalPool};
use std::collections::VecDeque;

/// FIFO of issued descriptors, oldest first.
///
/// Issuers push; only [`progress`](Self::progress) pops. Descriptors leave
/// in issue order even when a later copy finished first.
#[derive(Debug, Default)]
pub struct SignalQueue {
    entries: VecDeque<DescId>,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, id: DescId) {
        self.entries.push_back(id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = DescId> + '_ {
        self.entries.iter().copied()
    }

    /// Retire fired descriptors from the head of the queue.
    ///
    /// Stops at the first descriptor whose signal has not reached zero.
    /// Retired descriptors go back to `pool`; their completions are appended
    /// to `fired` so the caller can run them once it holds no borrows.
    /// Returns the number of descriptors retired.
    pub fn progress(&mut self, pool: &mut SignalPool, fired: &mut Vec<Completion>) -> usize {
        let mut count = 0;
        while let Some(&head) = self.entries.front() {
            let desc = pool.desc(head);
            if pool.driver().signal_load(desc.signal) != 0 {
                break;
            }
            self.entries.pop_front();
            let desc = pool.desc_mut(head);
            tracing::trace!(
                mapped_addr = format_args!("0x{:x}", desc.mapped_addr),
                length = desc.length,
                "copy retired"
            );
            if let Some(comp) = desc.completion.take() {
                fired.push(comp);
            }
            pool.put(head);
            count += 1;
        }
        count
    }
}

/// Run the completions collected by [`SignalQueue::progress`].
pub fn dispatch_fired(fired: Vec<Completion>) {
    for comp in fired {
        comp.retire();
    }
}
