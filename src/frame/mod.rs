//! Frame tick plumbing.
//!
//! The stack never owns a render loop. Hosts either call
//! `update_view_model_properties` themselves ([`UpdateMode::Manual`]) or hand
//! the stack a [`FrameSource`] it subscribes to ([`UpdateMode::PerFrame`]).

use std::cell::Cell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::events::{EventSource, SubscriptionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    #[default]
    Manual,
    PerFrame,
}

/// Something that fires once per rendered frame.
pub trait FrameSource {
    fn subscribe(&self, callback: Box<dyn Fn()>) -> FrameSubscription;
}

/// Live registration with a frame source; dropping it unsubscribes.
pub struct FrameSubscription {
    cancel: Option<Box<dyn FnOnce()>>,
}

impl FrameSubscription {
    pub fn new(cancel: impl FnOnce() + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn inactive() -> Self {
        Self { cancel: None }
    }

    pub fn is_active(&self) -> bool {
        self.cancel.is_some()
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for FrameSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// In-process frame source a host drives from its render loop.
#[derive(Default)]
pub struct FrameTicker {
    callbacks: Rc<EventSource<u64>>,
    frame: Cell<u64>,
}

impl FrameTicker {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Advance one frame; returns the number of callbacks invoked.
    pub fn tick(&self) -> usize {
        let frame = self.frame.get() + 1;
        self.frame.set(frame);
        self.callbacks.emit(&frame)
    }

    pub fn frames(&self) -> u64 {
        self.frame.get()
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.listener_count()
    }
}

impl FrameSource for FrameTicker {
    fn subscribe(&self, callback: Box<dyn Fn()>) -> FrameSubscription {
        let id: SubscriptionId = self.callbacks.subscribe(move |_| callback());
        let callbacks: Weak<EventSource<u64>> = Rc::downgrade(&self.callbacks);
        FrameSubscription::new(move || {
            if let Some(callbacks) = callbacks.upgrade() {
                callbacks.unsubscribe(id);
            }
        })
    }
}
