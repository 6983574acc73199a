//! Deferred action queue used to make stack mutations look atomic to
//! reentrant callers.
//!
//! While a [`DeferScope`] is alive its gate is locked: requests routed through
//! [`DeferGate::run_or_defer`] are queued instead of executed. Finishing the
//! outermost scope replays the queue in submission order and then unlocks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::error::{Result, StackError};

pub type DeferredAction = Box<dyn FnOnce() -> Result<()>>;

#[derive(Default)]
pub struct DeferGate {
    depth: Cell<usize>,
    queue: RefCell<VecDeque<DeferredAction>>,
}

impl DeferGate {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn is_locked(&self) -> bool {
        self.depth.get() > 0
    }

    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Lock the gate until the returned scope is finished or dropped.
    pub fn lock(self: &Rc<Self>) -> DeferScope {
        self.depth.set(self.depth.get() + 1);
        DeferScope {
            gate: Some(Rc::clone(self)),
        }
    }

    /// Run `action` now, or queue it if the gate is locked.
    pub fn run_or_defer(&self, action: DeferredAction) -> Result<()> {
        if self.is_locked() {
            self.queue.borrow_mut().push_back(action);
            Ok(())
        } else {
            action()
        }
    }

    fn release(&self) -> FlushOutcome {
        let depth = self.depth.get();
        if depth > 1 {
            self.depth.set(depth - 1);
            return FlushOutcome::default();
        }

        // Stay locked while draining so late submissions append to the queue.
        let mut outcome = FlushOutcome::default();
        loop {
            let next = self.queue.borrow_mut().pop_front();
            let Some(action) = next else { break };
            outcome.ran += 1;
            if let Err(err) = action() {
                outcome.errors.push(err);
            }
        }
        self.depth.set(0);
        outcome
    }

    fn discard(&self) -> usize {
        let depth = self.depth.get();
        if depth > 1 {
            self.depth.set(depth - 1);
            return 0;
        }
        let dropped = std::mem::take(&mut *self.queue.borrow_mut());
        self.depth.set(0);
        dropped.len()
    }
}

/// Result of replaying a gate's queue.
#[derive(Debug, Default)]
pub struct FlushOutcome {
    pub ran: usize,
    pub errors: Vec<StackError>,
}

impl FlushOutcome {
    /// First failure wins; the number of actions run otherwise.
    pub fn into_result(self) -> Result<usize> {
        match self.errors.into_iter().next() {
            Some(err) => Err(err),
            None => Ok(self.ran),
        }
    }
}

/// Lock held over a critical section. Dropping without [`finish`](Self::finish)
/// discards whatever was queued.
pub struct DeferScope {
    gate: Option<Rc<DeferGate>>,
}

impl DeferScope {
    /// Replay queued actions in FIFO order. Every action runs even if an
    /// earlier one fails.
    pub fn finish(mut self) -> FlushOutcome {
        match self.gate.take() {
            Some(gate) => gate.release(),
            None => FlushOutcome::default(),
        }
    }

    /// Unlock without running anything; returns how many actions were dropped.
    pub fn abandon(mut self) -> usize {
        self.gate.take().map(|gate| gate.discard()).unwrap_or(0)
    }
}

impl Drop for DeferScope {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.discard();
        }
    }
}
