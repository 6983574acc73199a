//! The view-model stack: an ordered collection of view-models, each paired
//! with a [`ServiceHandle`], supporting open, vetoable close and forced
//! teardown.
//!
//! # Invariants
//!
//! - Index 0 is the bottom entry; the last entry is the active one.
//! - Every entry in the collection has exactly one handle.
//! - A new entry becomes visible to observers only after its factory returned.
//! - Veto callbacks complete, approving, before an entry is removed.
//! - `emptied` fires once per transition into the empty state.
//! - An entry's gate is locked for the whole of a removal attempt, veto
//!   callbacks included, and at most one attempt per entry runs at a time.
//!
//! Failures of deferred follow-up requests do not belong to the call that
//! triggered the flush; they are reported through [`ViewModelStack::faults`].
//!
//! All state is single-threaded (`Rc`/`RefCell`); the stack is meant to live
//! on the UI thread alongside the executor whose spawner it was given.

use std::any::TypeId;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use futures::FutureExt;
use futures::channel::oneshot;
use futures::future::LocalBoxFuture;
use futures::task::LocalSpawn;
use serde_json::Value;

use crate::defer::DeferScope;
use crate::error::{Result, StackError};
use crate::events::EventSource;
use crate::frame::{FrameSource, FrameSubscription, UpdateMode};
use crate::logging::{LogLevel, event_with_fields, json_kv, json_str};
use crate::metrics::{MetricSnapshot, StackMetrics};
use crate::registry::{TypeDescriptor, TypeMappingRegistry, ViewType};
use crate::view_model::ViewModel;

pub mod audit;
mod command;
mod config;
mod dispatch;
mod service;

pub use audit::{
    NullStackAudit, RecordingStackAudit, StackAudit, StackAuditEvent, StackAuditEventBuilder,
    StackAuditStage,
};
pub use command::RemoveTopViewModelCommand;
pub use config::{DEFAULT_LOG_TARGET, StackConfig};
pub use service::{ClosedCallback, ServiceHandle};

use audit::StackAuditStage as Stage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u64);

impl EntryId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Mutation of the ordered collection, reported to observers.
#[derive(Clone)]
pub enum CollectionChange {
    Added {
        index: usize,
        view_model: Rc<dyn ViewModel>,
    },
    Removed {
        index: usize,
        view_model: Rc<dyn ViewModel>,
    },
}

impl CollectionChange {
    pub fn index(&self) -> usize {
        match self {
            Self::Added { index, .. } | Self::Removed { index, .. } => *index,
        }
    }

    pub fn view_model(&self) -> &Rc<dyn ViewModel> {
        match self {
            Self::Added { view_model, .. } | Self::Removed { view_model, .. } => view_model,
        }
    }

    pub fn is_added(&self) -> bool {
        matches!(self, Self::Added { .. })
    }
}

impl fmt::Debug for CollectionChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_added() { "Added" } else { "Removed" };
        f.debug_struct(kind)
            .field("index", &self.index())
            .field("view_model", &self.view_model().view_model_name())
            .finish()
    }
}

#[derive(Clone)]
struct StackEntry {
    view_model: Rc<dyn ViewModel>,
    service: ServiceHandle,
}

/// What a single removal attempt ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Removal {
    Removed,
    Vetoed,
    Missing,
    /// Another attempt on the same entry is still running.
    InProgress,
}

pub(crate) struct StackInner {
    config: StackConfig,
    registry: RefCell<TypeMappingRegistry>,
    entries: RefCell<Vec<StackEntry>>,
    spawner: Rc<dyn LocalSpawn>,
    next_entry: Cell<u64>,
    collection_changed: EventSource<CollectionChange>,
    emptied: EventSource<()>,
    faults: EventSource<StackError>,
    remove_top_in_flight: Cell<bool>,
    last_can_execute: Cell<bool>,
    can_execute_changed: EventSource<bool>,
    frame_subscription: RefCell<Option<FrameSubscription>>,
    disposed: Cell<bool>,
    started_at: Instant,
}

/// Ordered stack of view-models. Cloning yields another handle to the same stack.
#[derive(Clone)]
pub struct ViewModelStack {
    inner: Rc<StackInner>,
}

impl ViewModelStack {
    pub fn new(config: StackConfig, spawner: impl LocalSpawn + 'static) -> Self {
        let inner = Rc::new(StackInner {
            config,
            registry: RefCell::new(TypeMappingRegistry::new()),
            entries: RefCell::new(Vec::new()),
            spawner: Rc::new(spawner),
            next_entry: Cell::new(1),
            collection_changed: EventSource::new(),
            emptied: EventSource::new(),
            faults: EventSource::new(),
            remove_top_in_flight: Cell::new(false),
            last_can_execute: Cell::new(false),
            can_execute_changed: EventSource::new(),
            frame_subscription: RefCell::new(None),
            disposed: Cell::new(false),
            started_at: Instant::now(),
        });

        let stack = Self { inner };
        if stack.inner.config.update_mode == UpdateMode::PerFrame {
            match stack.inner.config.frame_source.clone() {
                Some(source) => stack.attach_frame_source(source.as_ref()),
                None => stack.inner.log(
                    LogLevel::Warn,
                    "frame_source_missing",
                    [json_str("update_mode", "perframe")],
                ),
            }
        }
        stack
    }

    /// Map parameters type `P` to a view-model factory and the view type `V`
    /// that renders `VM`. Re-mapping `P` replaces the previous entry.
    pub fn map_view_model<P, VM, V, F>(&self, factory: F)
    where
        P: 'static,
        VM: ViewModel,
        V: 'static,
        F: Fn(ServiceHandle, P) -> Result<VM> + 'static,
    {
        self.inner.registry.borrow_mut().map::<P, VM, V, F>(factory);
        self.inner.audit(
            Stage::MappingRegistered,
            [
                json_str("parameters", std::any::type_name::<P>()),
                json_str("view_model", std::any::type_name::<VM>()),
                json_str("view", std::any::type_name::<V>()),
            ],
        );
    }

    pub fn is_mapped<P: 'static>(&self) -> bool {
        self.inner.registry.borrow().is_mapped::<P>()
    }

    /// Construct and push the view-model mapped for `P`.
    ///
    /// Requests the factory makes through its handle (opening children,
    /// closing itself) run after the new entry has been appended.
    pub fn open_view_model<P: 'static>(
        &self,
        params: P,
        on_closed: Option<ClosedCallback>,
    ) -> Result<Rc<dyn ViewModel>> {
        self.inner.open_entry(params, on_closed)
    }

    /// Open `params` and resolve once the new entry has closed.
    pub fn open_view_model_async<P: 'static>(
        &self,
        params: P,
    ) -> LocalBoxFuture<'static, Result<()>> {
        let (tx, rx) = oneshot::channel();
        let opened = self.inner.open_entry(
            params,
            Some(Box::new(move || {
                let _ = tx.send(());
            })),
        );
        async move {
            opened?;
            rx.await.map_err(|_| StackError::Cancelled)
        }
        .boxed_local()
    }

    /// Close every entry, top-down, stopping at the first veto.
    ///
    /// Works on the entries present when called. Resolves to `true` only if
    /// the stack is empty afterwards; entries opened meanwhile are left alone
    /// and make the result `false`. A failing disposer does not stop the walk:
    /// its entry is gone, the remaining ones are still tried, and the first
    /// such error is returned at the end.
    pub fn try_close_all_view_models(&self) -> LocalBoxFuture<'static, Result<bool>> {
        let stack = Rc::downgrade(&self.inner);
        let snapshot: Vec<ServiceHandle> = self
            .inner
            .entries
            .borrow()
            .iter()
            .rev()
            .map(|entry| entry.service.clone())
            .collect();

        async move {
            let mut first_error = None;
            for service in snapshot {
                let id = service.entry_id();
                match try_remove(stack.clone(), service).await {
                    Ok(Removal::Vetoed | Removal::InProgress) => {
                        return first_error.map_or(Ok(false), Err);
                    }
                    Ok(Removal::Removed | Removal::Missing) => {}
                    Err(err) => {
                        let still_open = stack
                            .upgrade()
                            .map(|inner| inner.contains(id))
                            .unwrap_or(false);
                        if still_open {
                            return Err(first_error.unwrap_or(err));
                        }
                        first_error.get_or_insert(err);
                    }
                }
            }
            if let Some(err) = first_error {
                return Err(err);
            }
            Ok(stack
                .upgrade()
                .map(|inner| inner.entries.borrow().is_empty())
                .unwrap_or(true))
        }
        .boxed_local()
    }

    pub fn remove_top_view_model_command(&self) -> RemoveTopViewModelCommand {
        RemoveTopViewModelCommand::new(Rc::downgrade(&self.inner))
    }

    /// Run every entry's update callbacks once, bottom to top.
    ///
    /// A no-op in [`UpdateMode::PerFrame`], where frame ticks already do this.
    pub fn update_view_model_properties(&self) -> usize {
        if self.inner.config.update_mode == UpdateMode::PerFrame {
            return 0;
        }
        self.inner.run_update_pass()
    }

    /// Subscribe to `source` so each tick runs an update pass. Replaces any
    /// previous subscription.
    pub fn attach_frame_source(&self, source: &dyn FrameSource) {
        let stack = Rc::downgrade(&self.inner);
        let subscription = source.subscribe(Box::new(move || {
            if let Some(inner) = stack.upgrade() {
                inner.run_update_pass();
            }
        }));
        *self.inner.frame_subscription.borrow_mut() = Some(subscription);
    }

    pub fn view_type_for(&self, view_model: &dyn ViewModel) -> Option<ViewType> {
        let descriptor = TypeDescriptor::parse(view_model.view_model_name());
        self.inner
            .locate_view(view_model.view_model_type_id(), &descriptor)
    }

    pub fn view_type_for_type<VM: ViewModel>(&self) -> Option<ViewType> {
        self.inner
            .locate_view(TypeId::of::<VM>(), &TypeDescriptor::of::<VM>())
    }

    /// Ordered snapshot, bottom first.
    pub fn view_models(&self) -> Vec<Rc<dyn ViewModel>> {
        self.inner
            .entries
            .borrow()
            .iter()
            .map(|entry| Rc::clone(&entry.view_model))
            .collect()
    }

    pub fn active_view_model(&self) -> Option<Rc<dyn ViewModel>> {
        self.inner
            .entries
            .borrow()
            .last()
            .map(|entry| Rc::clone(&entry.view_model))
    }

    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.borrow().is_empty()
    }

    pub fn collection_changed(&self) -> &EventSource<CollectionChange> {
        &self.inner.collection_changed
    }

    pub fn emptied(&self) -> &EventSource<()> {
        &self.inner.emptied
    }

    /// Errors from removals that finished on the spawner after suspending.
    pub fn faults(&self) -> &EventSource<StackError> {
        &self.inner.faults
    }

    pub fn metrics_snapshot(&self) -> Option<MetricSnapshot> {
        let metrics = self.inner.config.metrics.as_ref()?;
        let guard = metrics.lock().ok()?;
        Some(guard.snapshot(self.inner.started_at.elapsed()))
    }

    /// Log a metrics snapshot through the configured logger.
    pub fn emit_metrics(&self) -> Result<()> {
        let Some(logger) = self.inner.config.logger.as_ref() else {
            return Ok(());
        };
        let Some(snapshot) = self.metrics_snapshot() else {
            return Ok(());
        };
        let target = format!("{}.metrics", self.inner.config.log_target);
        logger.log_event(snapshot.to_log_event(&target))?;
        Ok(())
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.get()
    }

    /// Forced teardown: dispose every entry top-down, ignoring veto callbacks.
    ///
    /// Closed callbacks are dropped rather than invoked, so pending
    /// `open_view_model_async` futures resolve to [`StackError::Cancelled`].
    /// Every entry is removed even if some disposers fail; the first failure
    /// is returned.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.disposed.replace(true) {
            return Ok(());
        }
        self.inner.frame_subscription.borrow_mut().take();

        let mut first_error = None;
        let mut removed = 0usize;
        loop {
            let popped = {
                let mut entries = self.inner.entries.borrow_mut();
                entries.pop().map(|entry| (entries.len(), entry))
            };
            let Some((index, entry)) = popped else { break };
            removed += 1;

            let scope = entry.service.gate().lock();
            if let Err(err) = entry.view_model.dispose() {
                self.inner.log(
                    LogLevel::Error,
                    "dispose_failed",
                    [
                        json_kv("entry", entry.service.entry_id().get()),
                        json_str("error", err.to_string()),
                    ],
                );
                first_error.get_or_insert(err);
            }
            self.inner.collection_changed.emit(&CollectionChange::Removed {
                index,
                view_model: Rc::clone(&entry.view_model),
            });
            entry.service.release();
            let discarded = scope.abandon();
            if discarded > 0 {
                self.inner.log(
                    LogLevel::Debug,
                    "deferred_discarded",
                    [
                        json_kv("entry", entry.service.entry_id().get()),
                        json_kv("actions", discarded),
                    ],
                );
            }
        }

        self.inner.notify_command_state();
        self.inner
            .log(LogLevel::Info, "disposed", [json_kv("entries", removed)]);
        self.inner
            .audit(Stage::StackDisposed, [json_kv("entries", removed)]);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for ViewModelStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewModelStack")
            .field("entries", &self.len())
            .field("update_mode", &self.inner.config.update_mode)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl StackInner {
    pub(crate) fn open_entry<P: 'static>(
        self: &Rc<Self>,
        params: P,
        on_closed: Option<ClosedCallback>,
    ) -> Result<Rc<dyn ViewModel>> {
        let parameters = std::any::type_name::<P>();
        if self.disposed.get() {
            return Err(StackError::Disposed);
        }

        let factory = self.registry.borrow().factory_for(TypeId::of::<P>());
        let Some(factory) = factory else {
            let err = StackError::Unmapped {
                type_name: parameters,
            };
            self.record_open_failure(parameters, &err);
            return Err(err);
        };

        let id = EntryId::new(self.next_entry.get());
        self.next_entry.set(id.get() + 1);
        let service = ServiceHandle::new(id, Rc::downgrade(self));
        if let Some(callback) = on_closed {
            service.set_closed_callback(callback);
        }

        let scope = service.gate().lock();
        let view_model = match service.activate(&factory, Box::new(params)) {
            Ok(view_model) => view_model,
            Err(err) => {
                let discarded = scope.abandon();
                service.release();
                self.record_open_failure(parameters, &err);
                if discarded > 0 {
                    self.log(
                        LogLevel::Debug,
                        "deferred_discarded",
                        [json_kv("entry", id.get()), json_kv("actions", discarded)],
                    );
                }
                return Err(err);
            }
        };

        let index = {
            let mut entries = self.entries.borrow_mut();
            entries.push(StackEntry {
                view_model: Rc::clone(&view_model),
                service: service.clone(),
            });
            entries.len() - 1
        };

        self.with_metrics(|metrics| metrics.record_open(index + 1));
        let details = [
            json_kv("entry", id.get()),
            json_str("view_model", view_model.view_model_name()),
            json_kv("depth", index + 1),
        ];
        self.log(LogLevel::Info, "opened", details.clone());
        self.audit(Stage::EntryOpened, details);

        self.collection_changed.emit(&CollectionChange::Added {
            index,
            view_model: Rc::clone(&view_model),
        });
        self.notify_command_state();
        self.flush(id, scope);
        Ok(view_model)
    }

    /// Fire-and-forget removal used by [`ServiceHandle::close`].
    pub(crate) fn request_removal(self: &Rc<Self>, service: ServiceHandle) -> Result<()> {
        let future = try_remove(Rc::downgrade(self), service)
            .map(|result| result.map(|_| ()))
            .boxed_local();
        self.drive(future).map(|_| ())
    }

    pub(crate) fn drive<T: 'static>(
        self: &Rc<Self>,
        future: LocalBoxFuture<'static, Result<T>>,
    ) -> Result<Option<T>> {
        let stack = Rc::downgrade(self);
        dispatch::drive(self.spawner.as_ref(), future, move |err| {
            if let Some(inner) = stack.upgrade() {
                inner.report_fault("fault", err);
            }
        })
    }

    /// Remove an approved entry. The caller holds the entry's gate.
    fn commit_removal(&self, service: &ServiceHandle) -> Result<Removal> {
        let id = service.entry_id();
        let removed = {
            let mut entries = self.entries.borrow_mut();
            entries
                .iter()
                .position(|entry| entry.service.entry_id() == id)
                .map(|index| (index, entries.remove(index)))
        };
        let Some((index, entry)) = removed else {
            return Ok(Removal::Missing);
        };

        let disposed = entry.view_model.dispose();
        if let Err(err) = &disposed {
            self.log(
                LogLevel::Error,
                "dispose_failed",
                [json_kv("entry", id.get()), json_str("error", err.to_string())],
            );
        }

        self.with_metrics(StackMetrics::record_close);
        let details = [
            json_kv("entry", id.get()),
            json_str("view_model", entry.view_model.view_model_name()),
            json_kv("index", index),
        ];
        self.log(LogLevel::Info, "closed", details.clone());
        self.audit(Stage::EntryClosed, details);

        self.collection_changed.emit(&CollectionChange::Removed {
            index,
            view_model: Rc::clone(&entry.view_model),
        });
        if let Some(callback) = service.take_closed_callback() {
            callback();
        }
        if self.entries.borrow().is_empty() {
            self.log(LogLevel::Info, "emptied", std::iter::empty());
            self.audit(Stage::StackEmptied, std::iter::empty());
            self.emptied.emit(&());
        }
        self.notify_command_state();
        service.release();
        disposed.map(|()| Removal::Removed)
    }

    /// Replay what was deferred on `id`'s gate. Failures go to `faults`.
    fn flush(&self, id: EntryId, scope: DeferScope) {
        let outcome = scope.finish();
        if outcome.ran == 0 {
            return;
        }
        self.with_metrics(|metrics| metrics.record_deferred(outcome.ran));
        let details = [
            json_kv("entry", id.get()),
            json_kv("actions", outcome.ran),
            json_kv("failures", outcome.errors.len()),
        ];
        self.audit(Stage::DeferredFlushed, details.clone());
        self.log(LogLevel::Debug, "deferred_flushed", details);
        for err in outcome.errors {
            self.report_fault("deferred_action_failed", err);
        }
    }

    fn run_update_pass(&self) -> usize {
        let services: Vec<ServiceHandle> = self
            .entries
            .borrow()
            .iter()
            .map(|entry| entry.service.clone())
            .collect();
        let invoked: usize = services
            .iter()
            .map(ServiceHandle::run_update_callbacks)
            .sum();
        self.with_metrics(StackMetrics::record_update_pass);
        self.log(
            LogLevel::Trace,
            "update_pass",
            [
                json_kv("entries", services.len()),
                json_kv("callbacks", invoked),
            ],
        );
        invoked
    }

    fn locate_view(&self, view_model: TypeId, descriptor: &TypeDescriptor) -> Option<ViewType> {
        if let Some(view) = self.registry.borrow().view_type_for(view_model) {
            return Some(view);
        }
        self.config
            .view_locator
            .as_ref()
            .and_then(|locator| locator.locate(view_model, descriptor))
    }

    pub(crate) fn top_id(&self) -> Option<EntryId> {
        self.entries
            .borrow()
            .last()
            .map(|entry| entry.service.entry_id())
    }

    fn contains(&self, id: EntryId) -> bool {
        self.entries
            .borrow()
            .iter()
            .any(|entry| entry.service.entry_id() == id)
    }

    pub(crate) fn top_service(&self) -> Option<ServiceHandle> {
        self.entries
            .borrow()
            .last()
            .map(|entry| entry.service.clone())
    }

    pub(crate) fn command_can_execute(&self) -> bool {
        !self.disposed.get()
            && !self.remove_top_in_flight.get()
            && !self.entries.borrow().is_empty()
    }

    pub(crate) fn command_in_flight(&self) -> bool {
        self.remove_top_in_flight.get()
    }

    pub(crate) fn set_command_in_flight(&self, in_flight: bool) {
        self.remove_top_in_flight.set(in_flight);
        self.notify_command_state();
    }

    pub(crate) fn can_execute_changed(&self) -> &EventSource<bool> {
        &self.can_execute_changed
    }

    fn notify_command_state(&self) {
        let can_execute = self.command_can_execute();
        if self.last_can_execute.replace(can_execute) != can_execute {
            self.can_execute_changed.emit(&can_execute);
        }
    }

    fn record_open_failure(&self, parameters: &'static str, err: &StackError) {
        self.with_metrics(StackMetrics::record_open_failure);
        let details = [
            json_str("parameters", parameters),
            json_str("error", err.to_string()),
        ];
        self.log(LogLevel::Warn, "open_failed", details.clone());
        self.audit(Stage::OpenFailed, details);
    }

    fn record_veto(&self, id: EntryId) {
        self.with_metrics(StackMetrics::record_veto);
        self.log(LogLevel::Debug, "close_vetoed", [json_kv("entry", id.get())]);
        self.audit(Stage::CloseVetoed, [json_kv("entry", id.get())]);
    }

    fn report_fault(&self, message: &str, err: StackError) {
        let details = [json_str("error", err.to_string())];
        self.log(LogLevel::Error, message, details.clone());
        self.audit(Stage::Fault, details);
        self.faults.emit(&err);
    }

    fn with_metrics(&self, record: impl FnOnce(&mut StackMetrics)) {
        if let Some(metrics) = self.config.metrics.as_ref() {
            if let Ok(mut guard) = metrics.lock() {
                record(&mut *guard);
            }
        }
    }

    fn log<I>(&self, level: LogLevel, message: &str, fields: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        if let Some(logger) = self.config.logger.as_ref() {
            if !logger.enabled(level) {
                return;
            }
            let event = event_with_fields(level, &self.config.log_target, message, fields);
            let _ = logger.log_event(event);
        }
    }

    fn audit<I>(&self, stage: StackAuditStage, details: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let event = details
            .into_iter()
            .fold(StackAuditEventBuilder::new(stage), |builder, (key, value)| {
                builder.detail(key, value)
            })
            .finish();
        self.config.audit.record(event);
    }
}

/// The single path every close goes through. The entry's gate stays locked
/// from the veto phase through the commit, so opens requested by veto
/// callbacks or the disposer are replayed once the attempt is over; closes
/// requested meanwhile join this attempt.
/// Presence is checked again after the vetoes, since the entry may have been
/// torn down while an async veto was pending.
pub(crate) async fn try_remove(stack: Weak<StackInner>, service: ServiceHandle) -> Result<Removal> {
    let id = service.entry_id();
    {
        let inner = stack.upgrade().ok_or(StackError::Detached)?;
        if !inner.contains(id) {
            return Ok(Removal::Missing);
        }
    }
    let Some(attempt) = service.begin_removal() else {
        return Ok(Removal::InProgress);
    };
    let scope = service.gate().lock();

    let approved = service.evaluate_close_vetoes().await;
    let inner = stack.upgrade().ok_or(StackError::Detached)?;
    let outcome = match approved {
        Ok(true) => inner.commit_removal(&service),
        Ok(false) => {
            inner.record_veto(id);
            Ok(Removal::Vetoed)
        }
        Err(err) => {
            inner.log(
                LogLevel::Warn,
                "close_failed",
                [json_kv("entry", id.get()), json_str("error", err.to_string())],
            );
            Err(err)
        }
    };

    drop(attempt);
    inner.flush(id, scope);
    outcome
}

#[cfg(test)]
mod tests;
