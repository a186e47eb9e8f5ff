//! Run cancellation.
//!
//! A [`CancelFlag`] is a shared stop request. Batches check it before they
//! are dispatched and the retry loop checks it between attempts; nothing
//! interrupts a call already in flight.
//!
//! [`CancelFlag::child`] gives a run its own flag that also observes the
//! caller's: the run can stop itself (on an authentication failure) without
//! cancelling anything else the caller shares the flag with.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CancelFlag {
    /// This flag's own stop request is the last element; earlier ones
    /// belong to its ancestors.
    chain: Vec<Arc<AtomicBool>>,
}

impl Default for CancelFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelFlag {
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    /// A flag cancelled by `self` or by its own [`cancel`](Self::cancel).
    pub fn child(&self) -> Self {
        let mut chain = self.chain.clone();
        chain.push(Arc::new(AtomicBool::new(false)));
        Self { chain }
    }

    /// Request a stop. Clones share the request; ancestors don't see it.
    pub fn cancel(&self) {
        if let Some(own) = self.chain.last() {
            own.store(true, Ordering::Release);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|f| f.load(Ordering::Acquire))
    }
}
