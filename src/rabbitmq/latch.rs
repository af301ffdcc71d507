use std::cell::RefCell;
use std::rc::Rc;

use tracing::warn;

use super::backend::Completion;

/// Single-slot flag filled once by a completion callback and observed by
/// the polling loop. Clones share the slot.
pub struct PendingLatch<T> {
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> PendingLatch<T> {
    pub fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(None)),
        }
    }

    /// Fill the latch. A latch that is already filled keeps its value and the
    /// new one is handed back.
    pub fn fill(&self, value: T) -> Result<(), T> {
        let mut slot = self.slot.borrow_mut();
        if slot.is_some() {
            warn!("Pending latch filled twice, keeping the first value");
            return Err(value);
        }
        *slot = Some(value);
        Ok(())
    }

    pub fn is_filled(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Move the value out once filled.
    pub fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

impl<T: 'static> PendingLatch<T> {
    /// Callback that fills this latch when invoked.
    pub fn completion(&self) -> Completion<T> {
        let filler = self.clone();
        Box::new(move |value| {
            if filler.fill(value).is_err() {
                warn!("Completion fired for an operation that already completed");
            }
        })
    }
}

impl<T> Clone for PendingLatch<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Rc::clone(&self.slot),
        }
    }
}

impl<T> Default for PendingLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}
