use super::*;
use crate::frame::FrameTicker;
use crate::logging::{Logger, MemorySink};
use crate::registry::ConventionLocator;
use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;
use std::sync::Arc;

type Journal = Rc<RefCell<Vec<String>>>;

struct PageParams(&'static str);

struct Page {
    name: &'static str,
    service: ServiceHandle,
    journal: Journal,
}

impl ViewModel for Page {
    fn dispose(&self) -> Result<()> {
        self.journal
            .borrow_mut()
            .push(format!("dispose:{}", self.name));
        Ok(())
    }
}

struct PageView;

struct Harness {
    pool: LocalPool,
    stack: ViewModelStack,
    journal: Journal,
    sink: MemorySink,
    audit: Arc<RecordingStackAudit>,
    emptied: Rc<Cell<usize>>,
}

impl Harness {
    fn open(&self, name: &'static str) -> Rc<dyn ViewModel> {
        self.stack
            .open_view_model(PageParams(name), None)
            .expect("open page")
    }

    fn names(&self) -> Vec<&'static str> {
        self.stack
            .view_models()
            .iter()
            .map(|vm| page(vm).name)
            .collect()
    }

    fn changes(&self) -> Rc<RefCell<Vec<(bool, usize, &'static str)>>> {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        self.stack.collection_changed().subscribe(move |change| {
            let name = change
                .view_model()
                .downcast_ref::<Page>()
                .map(|page| page.name)
                .unwrap_or("?");
            sink.borrow_mut()
                .push((change.is_added(), change.index(), name));
        });
        log
    }
}

fn harness() -> Harness {
    harness_with(StackConfig::new())
}

fn harness_with(config: StackConfig) -> Harness {
    let pool = LocalPool::new();
    let sink = MemorySink::new();
    let audit = Arc::new(RecordingStackAudit::new());
    let mut config = config
        .with_logger(Logger::new(sink.clone()))
        .with_audit(audit.clone());
    config.enable_metrics();
    let stack = ViewModelStack::new(config, pool.spawner());

    let journal: Journal = Rc::default();
    let factory_journal = Rc::clone(&journal);
    stack.map_view_model::<PageParams, Page, PageView, _>(move |service, PageParams(name)| {
        factory_journal.borrow_mut().push(format!("open:{name}"));
        Ok(Page {
            name,
            service,
            journal: Rc::clone(&factory_journal),
        })
    });

    let emptied = Rc::new(Cell::new(0));
    let counter = Rc::clone(&emptied);
    stack
        .emptied()
        .subscribe(move |_| counter.set(counter.get() + 1));

    Harness {
        pool,
        stack,
        journal,
        sink,
        audit,
        emptied,
    }
}

fn page(vm: &Rc<dyn ViewModel>) -> &Page {
    vm.downcast_ref::<Page>().expect("page view-model")
}

/// Register an async veto that waits for the returned sender on its first call.
fn gate_close(service: &ServiceHandle) -> oneshot::Sender<bool> {
    let (tx, rx) = oneshot::channel::<bool>();
    let pending = RefCell::new(Some(rx));
    service.register_async_close_callback(move || {
        let rx = pending.borrow_mut().take();
        async move {
            match rx {
                Some(rx) => rx.await.map_err(|_| StackError::Cancelled),
                None => Ok(true),
            }
        }
    });
    tx
}

#[test]
fn basic_round_trip() {
    let h = harness();
    let vm = h.open("home");
    assert_eq!(h.stack.len(), 1);

    page(&vm).service.close().unwrap();
    assert_eq!(h.stack.len(), 0);
    assert!(h.stack.is_empty());
    assert_eq!(h.emptied.get(), 1);
    assert_eq!(*h.journal.borrow(), vec!["open:home", "dispose:home"]);
}

#[test]
fn order_follows_insertion_and_last_is_active() {
    let h = harness();
    let opened: Vec<_> = ["a", "b", "c", "d"]
        .into_iter()
        .map(|name| h.open(name))
        .collect();

    assert_eq!(h.names(), vec!["a", "b", "c", "d"]);
    let active: Vec<bool> = opened
        .iter()
        .map(|vm| page(vm).service.is_active_view_model())
        .collect();
    assert_eq!(active, vec![false, false, false, true]);
    assert!(Rc::ptr_eq(
        &h.stack.active_view_model().unwrap(),
        opened.last().unwrap()
    ));
}

#[test]
fn closing_middle_entry_reports_its_index() {
    let h = harness();
    let changes = h.changes();
    let _a = h.open("a");
    let b = h.open("b");
    let c = h.open("c");

    page(&b).service.close().unwrap();
    assert_eq!(h.names(), vec!["a", "c"]);
    assert!(page(&c).service.is_active_view_model());
    assert_eq!(changes.borrow().last(), Some(&(false, 1, "b")));
    assert_eq!(h.emptied.get(), 0);
}

#[test]
fn veto_refusal_short_circuits() {
    let h = harness();
    let vm = h.open("editor");
    let service = &page(&vm).service;
    service.register_close_callback(|| false);
    service.register_fallible_close_callback(|| panic!("second veto must not run"));

    service.close().unwrap();
    assert_eq!(h.stack.len(), 1);
    assert_eq!(h.audit.count(StackAuditStage::CloseVetoed), 1);
    assert_eq!(h.emptied.get(), 0);
}

#[test]
fn veto_error_aborts_close_and_propagates() {
    let h = harness();
    let vm = h.open("editor");
    page(&vm)
        .service
        .register_fallible_close_callback(|| Err(StackError::view_model("prompt failed")));

    assert!(matches!(
        page(&vm).service.close(),
        Err(StackError::ViewModel(_))
    ));
    assert_eq!(h.stack.len(), 1);

    let command = h.stack.remove_top_view_model_command();
    assert!(matches!(command.execute(), Err(StackError::ViewModel(_))));
    assert!(!command.is_in_flight());
    assert!(command.can_execute());
    assert!(h.sink.messages().iter().any(|m| m == "close_failed"));
}

#[test]
fn async_close_negotiation_through_command() {
    let mut h = harness();
    let vm = h.open("editor");
    let approve = gate_close(&page(&vm).service);
    let command = h.stack.remove_top_view_model_command();
    assert!(command.can_execute());

    command.execute().unwrap();
    assert_eq!(h.stack.len(), 1);
    assert!(!command.can_execute());
    assert!(command.is_in_flight());

    h.pool.run_until_stalled();
    assert_eq!(h.stack.len(), 1);

    approve.send(true).unwrap();
    h.pool.run_until_stalled();
    assert_eq!(h.stack.len(), 0);
    assert!(!command.is_in_flight());
    assert_eq!(h.emptied.get(), 1);

    h.open("next");
    assert!(command.can_execute());
}

#[test]
fn command_allows_one_removal_in_flight() {
    let mut h = harness();
    let _base = h.open("base");
    let top = h.open("top");
    let answer = gate_close(&page(&top).service);
    let command = h.stack.remove_top_view_model_command();
    let other = command.clone();

    command.execute().unwrap();
    other.execute().unwrap();
    command.execute().unwrap();
    h.pool.run_until_stalled();
    assert_eq!(h.names(), vec!["base", "top"]);
    assert!(!other.can_execute());

    answer.send(false).unwrap();
    h.pool.run_until_stalled();
    assert_eq!(h.names(), vec!["base", "top"]);
    assert!(other.can_execute());

    // The veto only waits once; the next attempt goes through.
    command.execute().unwrap();
    assert_eq!(h.names(), vec!["base"]);
}

#[test]
fn command_reports_can_execute_changes() {
    let mut h = harness();
    let command = h.stack.remove_top_view_model_command();
    assert!(!command.can_execute());
    command.execute().unwrap();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&seen);
    command
        .on_can_execute_changed(move |value| sink.borrow_mut().push(*value))
        .unwrap();

    let vm = h.open("dialog");
    let approve = gate_close(&page(&vm).service);
    command.execute().unwrap();
    approve.send(true).unwrap();
    h.pool.run_until_stalled();
    h.open("again");

    assert_eq!(*seen.borrow(), vec![true, false, true]);
}

#[test]
fn reentrant_open_during_construction_is_deferred() {
    struct OuterParams;
    let h = harness();
    let changes = h.changes();
    let active_while_building = Rc::new(Cell::new(None));
    let probe = Rc::clone(&active_while_building);
    h.stack
        .map_view_model::<OuterParams, Page, PageView, _>(move |service, _| {
            service.open_view_model(PageParams("inner"), None)?;
            probe.set(Some(service.is_active_view_model()));
            Ok(Page {
                name: "outer",
                service,
                journal: Rc::default(),
            })
        });

    h.stack.open_view_model(OuterParams, None).unwrap();
    assert_eq!(h.names(), vec!["outer", "inner"]);
    assert_eq!(
        *changes.borrow(),
        vec![(true, 0, "outer"), (true, 1, "inner")]
    );
    assert_eq!(active_while_building.get(), Some(false));
    assert_eq!(h.audit.count(StackAuditStage::DeferredFlushed), 1);
}

#[test]
fn close_requested_by_constructor_runs_after_append() {
    struct SplashParams;
    let h = harness();
    let changes = h.changes();
    h.stack
        .map_view_model::<SplashParams, Page, PageView, _>(|service, _| {
            service.close()?;
            Ok(Page {
                name: "splash",
                service,
                journal: Rc::default(),
            })
        });

    h.stack.open_view_model(SplashParams, None).unwrap();
    assert!(h.stack.is_empty());
    assert_eq!(h.emptied.get(), 1);
    assert_eq!(
        *changes.borrow(),
        vec![(true, 0, "splash"), (false, 0, "splash")]
    );
}

#[test]
fn failing_factory_leaves_no_entry_and_drops_queued_requests() {
    struct BrokenParams;
    let h = harness();
    h.stack
        .map_view_model::<BrokenParams, Page, PageView, _>(|service, _| {
            service.open_view_model(PageParams("orphan"), None)?;
            Err(StackError::view_model("constructor failed"))
        });

    assert!(matches!(
        h.stack.open_view_model(BrokenParams, None),
        Err(StackError::ViewModel(_))
    ));
    assert!(h.stack.is_empty());
    assert!(h.journal.borrow().is_empty());
    assert_eq!(h.audit.count(StackAuditStage::OpenFailed), 1);
    assert_eq!(h.stack.metrics_snapshot().unwrap().open_failures, 1);
}

#[test]
fn failed_follow_up_does_not_fail_the_open() {
    struct MissingParams;
    struct LauncherParams;
    let mut h = harness();
    h.stack
        .map_view_model::<LauncherParams, Page, PageView, _>(|service, _| {
            service.open_view_model(MissingParams, None)?;
            Ok(Page {
                name: "launcher",
                service,
                journal: Rc::default(),
            })
        });
    let faults = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&faults);
    h.stack
        .faults()
        .subscribe(move |err| sink.borrow_mut().push(err.to_string()));

    let vm = h.stack.open_view_model(LauncherParams, None).unwrap();
    assert_eq!(h.names(), vec!["launcher"]);
    assert_eq!(faults.borrow().len(), 1);
    assert!(faults.borrow()[0].contains("MissingParams"));
    assert!(
        h.sink
            .messages()
            .iter()
            .any(|m| m == "deferred_action_failed")
    );
    page(&vm).service.close().unwrap();

    let done = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&done);
    let waiting = h.stack.open_view_model_async(LauncherParams);
    h.pool
        .spawner()
        .spawn_local(async move {
            *slot.borrow_mut() = Some(waiting.await.is_ok());
        })
        .unwrap();
    h.pool.run_until_stalled();
    assert!(done.borrow().is_none());
    assert_eq!(h.stack.len(), 1);

    let top = h.stack.active_view_model().unwrap();
    page(&top).service.close().unwrap();
    h.pool.run_until_stalled();
    assert_eq!(*done.borrow(), Some(true));
    assert_eq!(faults.borrow().len(), 2);
}

#[test]
fn emptied_fires_once_per_transition() {
    let h = harness();
    let a = h.open("a");
    let b = h.open("b");

    page(&b).service.close().unwrap();
    assert_eq!(h.emptied.get(), 0);
    page(&a).service.close().unwrap();
    assert_eq!(h.emptied.get(), 1);

    let c = h.open("c");
    page(&c).service.close().unwrap();
    page(&c).service.close().unwrap();
    assert_eq!(h.emptied.get(), 2);
}

#[test]
fn unmapped_parameters_fail_without_mutation() {
    struct Unknown;
    let h = harness();
    h.open("a");

    match h.stack.open_view_model(Unknown, None) {
        Err(StackError::Unmapped { type_name }) => assert!(type_name.ends_with("Unknown")),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("unmapped parameters opened"),
    }
    assert_eq!(h.names(), vec!["a"]);
    assert!(!h.stack.is_mapped::<Unknown>());
    assert!(h.stack.is_mapped::<PageParams>());
}

#[test]
fn closed_callback_runs_after_removal() {
    let h = harness();
    let seen = Rc::new(Cell::new(None));
    let slot = Rc::clone(&seen);
    let observer = h.stack.clone();
    let vm = h
        .stack
        .open_view_model(
            PageParams("picker"),
            Some(Box::new(move || slot.set(Some(observer.len())))),
        )
        .unwrap();

    page(&vm).service.close().unwrap();
    assert_eq!(seen.get(), Some(0));
}

#[test]
fn open_async_resolves_when_entry_closes() {
    let mut h = harness();
    let done = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&done);
    let waiting = h.stack.open_view_model_async(PageParams("dialog"));
    h.pool
        .spawner()
        .spawn_local(async move {
            *slot.borrow_mut() = Some(waiting.await.is_ok());
        })
        .unwrap();

    h.pool.run_until_stalled();
    assert!(done.borrow().is_none());
    assert_eq!(h.names(), vec!["dialog"]);

    let top = h.stack.active_view_model().unwrap();
    page(&top).service.close().unwrap();
    h.pool.run_until_stalled();
    assert_eq!(*done.borrow(), Some(true));
}

#[test]
fn handle_open_async_waits_for_child() {
    let mut h = harness();
    let parent = h.open("parent");
    let done = Rc::new(Cell::new(false));
    let flag = Rc::clone(&done);
    let waiting = page(&parent)
        .service
        .open_view_model_async(PageParams("child"));
    h.pool
        .spawner()
        .spawn_local(async move {
            waiting.await.unwrap();
            flag.set(true);
        })
        .unwrap();

    assert_eq!(h.names(), vec!["parent", "child"]);
    h.pool.run_until_stalled();
    assert!(!done.get());

    let child = h.stack.active_view_model().unwrap();
    page(&child).service.close().unwrap();
    h.pool.run_until_stalled();
    assert!(done.get());
    assert_eq!(h.names(), vec!["parent"]);
}

#[test]
fn async_veto_failure_is_reported_as_fault() {
    let mut h = harness();
    let vm = h.open("editor");
    let answer = gate_close(&page(&vm).service);
    let faults = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&faults);
    h.stack
        .faults()
        .subscribe(move |err| sink.borrow_mut().push(err.to_string()));

    page(&vm).service.close().unwrap();
    drop(answer);
    h.pool.run_until_stalled();

    assert_eq!(h.stack.len(), 1);
    assert_eq!(*faults.borrow(), vec![StackError::Cancelled.to_string()]);
    assert_eq!(h.audit.count(StackAuditStage::Fault), 1);
}

#[test]
fn close_while_veto_pending_joins_running_attempt() {
    let mut h = harness();
    let vm = h.open("editor");
    let answer = gate_close(&page(&vm).service);

    page(&vm).service.close().unwrap();
    page(&vm).service.close().unwrap();
    assert_eq!(h.stack.len(), 1);

    let command = h.stack.remove_top_view_model_command();
    command.execute().unwrap();
    assert!(!command.is_in_flight());
    assert_eq!(h.stack.len(), 1);

    answer.send(true).unwrap();
    h.pool.run_until_stalled();
    assert!(h.stack.is_empty());
    assert_eq!(h.emptied.get(), 1);
    assert_eq!(h.audit.count(StackAuditStage::EntryClosed), 1);
}

#[test]
fn veto_closing_its_own_entry_is_not_reentered() {
    let h = harness();
    let vm = h.open("editor");
    let asked = Rc::new(Cell::new(0));
    let counter = Rc::clone(&asked);
    let service = page(&vm).service.clone();
    page(&vm).service.register_close_callback(move || {
        counter.set(counter.get() + 1);
        service.close().expect("close from veto");
        counter.get() > 1
    });

    page(&vm).service.close().unwrap();
    assert_eq!(asked.get(), 1);
    assert_eq!(h.stack.len(), 1);

    page(&vm).service.close().unwrap();
    assert_eq!(asked.get(), 2);
    assert!(h.stack.is_empty());
}

#[test]
fn requests_from_vetoes_wait_for_the_attempt() {
    let h = harness();
    let vm = h.open("editor");
    let depth_seen = Rc::new(Cell::new(None));
    let probe = Rc::clone(&depth_seen);
    let service = page(&vm).service.clone();
    let observer = h.stack.clone();
    page(&vm).service.register_close_callback(move || {
        service
            .open_view_model(PageParams("confirm"), None)
            .expect("open from veto");
        probe.set(Some(observer.len()));
        false
    });

    page(&vm).service.close().unwrap();
    assert_eq!(depth_seen.get(), Some(1));
    assert_eq!(h.names(), vec!["editor", "confirm"]);
}

#[test]
fn dispose_may_request_follow_up_work() {
    struct RelayParams;
    struct Relay {
        service: ServiceHandle,
    }
    impl ViewModel for Relay {
        fn dispose(&self) -> Result<()> {
            self.service.open_view_model(PageParams("successor"), None)
        }
    }

    let h = harness();
    h.stack
        .map_view_model::<RelayParams, Relay, PageView, _>(|service, _| Ok(Relay { service }));
    let relay = h.stack.open_view_model(RelayParams, None).unwrap();
    let service = relay.downcast_ref::<Relay>().unwrap().service.clone();

    service.close().unwrap();
    assert_eq!(h.names(), vec!["successor"]);
    assert_eq!(h.emptied.get(), 1);
}

#[test]
fn disposer_failure_still_removes_entry() {
    struct FaultyParams;
    struct Faulty {
        service: ServiceHandle,
    }
    impl ViewModel for Faulty {
        fn dispose(&self) -> Result<()> {
            Err(StackError::view_model("leaked handle"))
        }
    }

    let h = harness();
    h.stack
        .map_view_model::<FaultyParams, Faulty, PageView, _>(|service, _| Ok(Faulty { service }));
    let vm = h.stack.open_view_model(FaultyParams, None).unwrap();
    let service = vm.downcast_ref::<Faulty>().unwrap().service.clone();

    assert!(matches!(service.close(), Err(StackError::ViewModel(_))));
    assert!(h.stack.is_empty());
    assert_eq!(h.emptied.get(), 1);
}

#[test]
fn try_close_all_walks_top_down() {
    let mut h = harness();
    let order = Rc::new(RefCell::new(Vec::new()));
    for name in ["a", "b", "c"] {
        let vm = h.open(name);
        let order = Rc::clone(&order);
        page(&vm).service.register_close_callback(move || {
            order.borrow_mut().push(name);
            true
        });
    }

    let closed = h.pool.run_until(h.stack.try_close_all_view_models());
    assert!(closed.unwrap());
    assert_eq!(*order.borrow(), vec!["c", "b", "a"]);
    assert!(h.stack.is_empty());
    assert_eq!(h.emptied.get(), 1);
}

#[test]
fn try_close_all_stops_at_first_veto() {
    let mut h = harness();
    let _a = h.open("a");
    let b = h.open("b");
    let _c = h.open("c");
    page(&b).service.register_close_callback(|| false);

    let closed = h.pool.run_until(h.stack.try_close_all_view_models());
    assert!(!closed.unwrap());
    assert_eq!(h.names(), vec!["a", "b"]);
    assert_eq!(*h.journal.borrow().last().unwrap(), "dispose:c");
}

#[test]
fn try_close_all_waits_for_async_veto() {
    let mut h = harness();
    let _a = h.open("a");
    let b = h.open("b");
    let answer = gate_close(&page(&b).service);

    let result = Rc::new(RefCell::new(None));
    let slot = Rc::clone(&result);
    let closing = h.stack.try_close_all_view_models();
    h.pool
        .spawner()
        .spawn_local(async move {
            *slot.borrow_mut() = Some(closing.await.unwrap());
        })
        .unwrap();

    h.pool.run_until_stalled();
    assert!(result.borrow().is_none());
    answer.send(true).unwrap();
    h.pool.run_until_stalled();
    assert_eq!(*result.borrow(), Some(true));
    assert!(h.stack.is_empty());
}

#[test]
fn try_close_all_leaves_entries_opened_by_vetoes() {
    let mut h = harness();
    let a = h.open("a");
    let service = page(&a).service.clone();
    page(&a).service.register_close_callback(move || {
        service
            .open_view_model(PageParams("late"), None)
            .expect("open from veto");
        true
    });

    let closed = h.pool.run_until(h.stack.try_close_all_view_models());
    assert!(!closed.unwrap());
    assert_eq!(h.names(), vec!["late"]);
    // The open waits for the removal, so the stack was briefly empty.
    assert_eq!(h.emptied.get(), 1);
}

#[test]
fn try_close_all_continues_past_disposer_failure() {
    struct BrittleParams;
    struct Brittle;
    impl ViewModel for Brittle {
        fn dispose(&self) -> Result<()> {
            Err(StackError::view_model("brittle"))
        }
    }

    let mut h = harness();
    h.stack
        .map_view_model::<BrittleParams, Brittle, PageView, _>(|_, _| Ok(Brittle));
    h.open("a");
    h.open("b");
    h.stack.open_view_model(BrittleParams, None).unwrap();

    let closed = h.pool.run_until(h.stack.try_close_all_view_models());
    assert!(matches!(closed, Err(StackError::ViewModel(_))));
    assert!(h.stack.is_empty());
    assert_eq!(h.emptied.get(), 1);
    let disposals: Vec<String> = h
        .journal
        .borrow()
        .iter()
        .filter(|line| line.starts_with("dispose:"))
        .cloned()
        .collect();
    assert_eq!(disposals, vec!["dispose:b", "dispose:a"]);
}

#[test]
fn manual_updates_run_bottom_to_top() {
    let h = harness();
    let calls = Rc::new(RefCell::new(Vec::new()));
    let mut opened = Vec::new();
    for name in ["a", "b"] {
        let vm = h.open(name);
        let calls = Rc::clone(&calls);
        page(&vm)
            .service
            .register_update_callback(move || calls.borrow_mut().push(name));
        opened.push(vm);
    }

    assert_eq!(h.stack.update_view_model_properties(), 2);
    assert_eq!(*calls.borrow(), vec!["a", "b"]);

    page(&opened[1]).service.close().unwrap();
    assert_eq!(h.stack.update_view_model_properties(), 1);
    assert_eq!(*calls.borrow(), vec!["a", "b", "a"]);
    assert_eq!(h.stack.metrics_snapshot().unwrap().update_passes, 2);
}

#[test]
fn per_frame_updates_follow_ticks() {
    let ticker = FrameTicker::new();
    let h = harness_with(StackConfig::new().per_frame(ticker.clone()));
    let hits = Rc::new(Cell::new(0));
    let counter = Rc::clone(&hits);
    let vm = h.open("clock");
    page(&vm)
        .service
        .register_update_callback(move || counter.set(counter.get() + 1));

    assert_eq!(h.stack.update_view_model_properties(), 0);
    assert_eq!(hits.get(), 0);
    ticker.tick();
    ticker.tick();
    assert_eq!(hits.get(), 2);

    h.stack.dispose().unwrap();
    assert_eq!(ticker.subscriber_count(), 0);
}

#[test]
fn view_type_lookup_uses_mapping_then_locator() {
    struct ReportViewModel;
    impl ViewModel for ReportViewModel {}
    struct ReportView;

    let mut locator = ConventionLocator::suffix("ViewModel", "View");
    locator.register_view::<ReportView>();
    let h = harness_with(StackConfig::new().with_view_locator(Rc::new(locator)));
    let vm = h.open("home");

    assert_eq!(h.stack.view_type_for(&*vm), Some(ViewType::of::<PageView>()));
    assert_eq!(
        h.stack.view_type_for_type::<ReportViewModel>(),
        Some(ViewType::of::<ReportView>())
    );
    assert_eq!(h.stack.view_type_for_type::<Page>(), Some(ViewType::of::<PageView>()));
}

#[test]
fn dispose_tears_down_top_down_ignoring_vetoes() {
    let mut h = harness();
    let changes = h.changes();
    for name in ["a", "b", "c"] {
        let vm = h.open(name);
        page(&vm).service.register_close_callback(|| false);
    }
    let cancelled = Rc::new(Cell::new(false));
    let flag = Rc::clone(&cancelled);
    let waiting = h.stack.open_view_model_async(PageParams("d"));
    h.pool
        .spawner()
        .spawn_local(async move {
            flag.set(matches!(waiting.await, Err(StackError::Cancelled)));
        })
        .unwrap();

    h.stack.dispose().unwrap();
    h.pool.run_until_stalled();

    assert!(h.stack.is_empty());
    assert!(h.stack.is_disposed());
    assert!(cancelled.get());
    assert_eq!(h.emptied.get(), 0);
    let disposals: Vec<String> = h
        .journal
        .borrow()
        .iter()
        .filter(|line| line.starts_with("dispose:"))
        .cloned()
        .collect();
    assert_eq!(disposals, vec!["dispose:d", "dispose:c", "dispose:b", "dispose:a"]);
    let removed: Vec<usize> = changes
        .borrow()
        .iter()
        .filter(|(added, _, _)| !added)
        .map(|(_, index, _)| *index)
        .collect();
    assert_eq!(removed, vec![3, 2, 1, 0]);

    assert!(matches!(
        h.stack.open_view_model(PageParams("late"), None),
        Err(StackError::Disposed)
    ));
    assert!(!h.stack.remove_top_view_model_command().can_execute());
    assert!(h.stack.dispose().is_ok());
}

#[test]
fn dispose_returns_first_disposer_error() {
    struct FragileParams;
    struct Fragile;
    impl ViewModel for Fragile {
        fn dispose(&self) -> Result<()> {
            Err(StackError::view_model("fragile"))
        }
    }

    let h = harness();
    h.stack
        .map_view_model::<FragileParams, Fragile, PageView, _>(|_, _| Ok(Fragile));
    h.open("a");
    h.stack.open_view_model(FragileParams, None).unwrap();

    assert!(matches!(h.stack.dispose(), Err(StackError::ViewModel(_))));
    assert!(h.stack.is_empty());
    assert_eq!(*h.journal.borrow().last().unwrap(), "dispose:a");
}

#[test]
fn logs_metrics_and_audit_trail() {
    let h = harness();
    let vm = h.open("a");
    page(&vm).service.close().unwrap();
    h.stack.emit_metrics().unwrap();

    let snapshot = h.stack.metrics_snapshot().unwrap();
    assert_eq!(snapshot.opens, 1);
    assert_eq!(snapshot.closes, 1);
    assert_eq!(snapshot.peak_depth, 1);

    let messages = h.sink.messages();
    for expected in ["opened", "closed", "emptied", "stack_metrics"] {
        assert!(messages.iter().any(|m| m == expected), "missing {expected}");
    }
    let metrics_event = h
        .sink
        .events()
        .into_iter()
        .find(|event| event.message == "stack_metrics")
        .unwrap();
    assert_eq!(metrics_event.target, "view_stack::stack.metrics");

    let lifecycle: Vec<StackAuditStage> = h
        .audit
        .stages()
        .into_iter()
        .filter(|stage| *stage != StackAuditStage::MappingRegistered)
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            StackAuditStage::EntryOpened,
            StackAuditStage::EntryClosed,
            StackAuditStage::StackEmptied,
        ]
    );
}
