use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;

use crate::defer::DeferGate;
use crate::error::{Result, StackError};
use crate::registry::ErasedFactory;
use crate::view_model::ViewModel;

use super::{EntryId, StackInner};

/// Invoked once, after the entry has been removed, to notify whoever opened it.
pub type ClosedCallback = Box<dyn FnOnce()>;

type SyncVeto = Rc<dyn Fn() -> Result<bool>>;
type AsyncVeto = Rc<dyn Fn() -> LocalBoxFuture<'static, Result<bool>>>;

#[derive(Clone)]
enum CloseVeto {
    Sync(SyncVeto),
    Async(AsyncVeto),
}

struct ServiceInner {
    id: EntryId,
    stack: Weak<StackInner>,
    gate: Rc<DeferGate>,
    close_vetoes: RefCell<Vec<CloseVeto>>,
    update_callbacks: RefCell<Vec<Rc<dyn Fn()>>>,
    closed: RefCell<Option<ClosedCallback>>,
    removing: Cell<bool>,
}

/// A view-model's only channel back to the stack that owns it.
///
/// Requests made while the entry is being constructed or removed are queued
/// and replayed, in order, once that critical section ends.
#[derive(Clone)]
pub struct ServiceHandle {
    inner: Rc<ServiceInner>,
}

impl ServiceHandle {
    pub(crate) fn new(id: EntryId, stack: Weak<StackInner>) -> Self {
        Self {
            inner: Rc::new(ServiceInner {
                id,
                stack,
                gate: DeferGate::new(),
                close_vetoes: RefCell::new(Vec::new()),
                update_callbacks: RefCell::new(Vec::new()),
                closed: RefCell::new(None),
                removing: Cell::new(false),
            }),
        }
    }

    pub fn entry_id(&self) -> EntryId {
        self.inner.id
    }

    /// Add a veto callback; returning `false` keeps the entry open.
    pub fn register_close_callback(&self, callback: impl Fn() -> bool + 'static) {
        let veto: SyncVeto = Rc::new(move || Ok(callback()));
        self.inner.close_vetoes.borrow_mut().push(CloseVeto::Sync(veto));
    }

    /// Like [`register_close_callback`](Self::register_close_callback), but an
    /// error aborts the close attempt and propagates to whoever requested it.
    pub fn register_fallible_close_callback(
        &self,
        callback: impl Fn() -> Result<bool> + 'static,
    ) {
        self.inner
            .close_vetoes
            .borrow_mut()
            .push(CloseVeto::Sync(Rc::new(callback)));
    }

    /// Add a veto callback that may suspend, e.g. to ask the user.
    pub fn register_async_close_callback<F, Fut>(&self, callback: F)
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<bool>> + 'static,
    {
        let veto: AsyncVeto = Rc::new(move || callback().boxed_local());
        self.inner.close_vetoes.borrow_mut().push(CloseVeto::Async(veto));
    }

    /// Run `callback` on every update pass of the stack.
    pub fn register_update_callback(&self, callback: impl Fn() + 'static) {
        self.inner
            .update_callbacks
            .borrow_mut()
            .push(Rc::new(callback));
    }

    /// Ask the stack to remove this entry, honouring veto callbacks.
    ///
    /// Errors from vetoes that resolve synchronously are returned here; if a
    /// veto suspends, the attempt finishes on the stack's spawner and any
    /// failure is reported through [`ViewModelStack::faults`](super::ViewModelStack::faults).
    /// Requests made while a removal of this entry is already running join
    /// that attempt instead of starting another one.
    pub fn close(&self) -> Result<()> {
        if self.is_removing() {
            return Ok(());
        }
        let stack = self.inner.stack.clone();
        let service = self.clone();
        self.inner.gate.run_or_defer(Box::new(move || {
            let inner = stack.upgrade().ok_or(StackError::Detached)?;
            inner.request_removal(service)
        }))
    }

    /// Open a child entry for `params`; `on_closed` runs once it has closed.
    pub fn open_view_model<P: 'static>(
        &self,
        params: P,
        on_closed: Option<ClosedCallback>,
    ) -> Result<()> {
        let stack = self.inner.stack.clone();
        self.inner.gate.run_or_defer(Box::new(move || {
            let inner = stack.upgrade().ok_or(StackError::Detached)?;
            inner.open_entry(params, on_closed).map(|_| ())
        }))
    }

    /// Open a child entry and resolve once it has closed.
    pub fn open_view_model_async<P: 'static>(
        &self,
        params: P,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        let requested = self.open_view_model(
            params,
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        );
        async move {
            requested?;
            rx.await.map_err(|_| StackError::Cancelled)
        }
        .boxed_local()
    }

    /// True while this entry is the topmost one.
    pub fn is_active_view_model(&self) -> bool {
        self.inner
            .stack
            .upgrade()
            .map(|stack| stack.top_id() == Some(self.inner.id))
            .unwrap_or(false)
    }

    pub(crate) fn gate(&self) -> &Rc<DeferGate> {
        &self.inner.gate
    }

    pub(crate) fn is_removing(&self) -> bool {
        self.inner.removing.get()
    }

    /// Mark a removal attempt as running until the guard is dropped.
    /// `None` if one is already running.
    pub(crate) fn begin_removal(&self) -> Option<RemovalGuard> {
        if self.inner.removing.replace(true) {
            return None;
        }
        Some(RemovalGuard {
            service: self.clone(),
        })
    }

    pub(crate) fn activate(
        &self,
        factory: &ErasedFactory,
        params: Box<dyn Any>,
    ) -> Result<Rc<dyn ViewModel>> {
        factory(self.clone(), params)
    }

    pub(crate) fn set_closed_callback(&self, callback: ClosedCallback) {
        *self.inner.closed.borrow_mut() = Some(callback);
    }

    pub(crate) fn take_closed_callback(&self) -> Option<ClosedCallback> {
        self.inner.closed.borrow_mut().take()
    }

    /// Ask every veto in registration order; the first refusal wins.
    pub(crate) async fn evaluate_close_vetoes(&self) -> Result<bool> {
        let vetoes = self.inner.close_vetoes.borrow().clone();
        for veto in vetoes {
            let approved = match veto {
                CloseVeto::Sync(callback) => callback()?,
                CloseVeto::Async(callback) => callback().await?,
            };
            if !approved {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub(crate) fn run_update_callbacks(&self) -> usize {
        let callbacks = self.inner.update_callbacks.borrow().clone();
        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    pub(crate) fn close_callback_count(&self) -> usize {
        self.inner.close_vetoes.borrow().len()
    }

    /// Drop every registered callback. Captured view-model state often points
    /// back at this handle, so this is what lets a removed entry be freed.
    pub(crate) fn release(&self) {
        self.inner.close_vetoes.borrow_mut().clear();
        self.inner.update_callbacks.borrow_mut().clear();
        self.inner.closed.borrow_mut().take();
    }
}

pub(crate) struct RemovalGuard {
    service: ServiceHandle,
}

impl Drop for RemovalGuard {
    fn drop(&mut self) {
        self.service.inner.removing.set(false);
    }
}

impl fmt::Debug for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("entry", &self.inner.id)
            .field("close_callbacks", &self.close_callback_count())
            .field("deferring", &self.inner.gate.is_locked())
            .field("removing", &self.is_removing())
            .finish()
    }
}
