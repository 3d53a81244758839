use crate::*;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_rng::{Rand, Rng};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

/// A queue whose serials are moved by hand.
struct ManualQueue {
    device: DeviceId,
    completed: AtomicU64,
    last_submitted: AtomicU64,
    ticks: AtomicUsize,
    waits: AtomicUsize,
    fail: AtomicBool,
    // When set, a blocking wait completes everything submitted.
    complete_on_wait: AtomicBool,
}

impl ManualQueue {
    fn new(completed: u64, last_submitted: u64) -> Arc<ManualQueue> {
        Arc::new(ManualQueue {
            device: DeviceId::next(),
            completed: AtomicU64::new(completed),
            last_submitted: AtomicU64::new(last_submitted),
            ticks: AtomicUsize::new(0),
            waits: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            complete_on_wait: AtomicBool::new(false),
        })
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.fail.load(Ordering::SeqCst) {
            Err(DeviceError::Internal("injected".into()))
        } else {
            Ok(())
        }
    }
}

impl Queue for ManualQueue {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn completed_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.completed.load(Ordering::SeqCst))
    }

    fn last_submitted_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.last_submitted.load(Ordering::SeqCst))
    }

    fn tick(&self) -> Result<(), DeviceError> {
        self.ticks.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    fn check_passed_serials(&self) -> Result<(), DeviceError> {
        self.check()
    }

    fn wait_for_serial(
        &self,
        serial: ExecutionSerial,
        timeout: Duration,
    ) -> Result<bool, DeviceError> {
        self.waits.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        if self.complete_on_wait.load(Ordering::SeqCst) {
            let submitted = self.last_submitted.load(Ordering::SeqCst);
            self.completed.fetch_max(submitted, Ordering::SeqCst);
        } else {
            thread::sleep(timeout);
        }
        Ok(self.completed_serial() >= serial)
    }
}

/// Records the order callbacks run in.
#[derive(Clone, Default)]
struct CallbackLog(Arc<Mutex<Vec<(u32, EventCompletionType)>>>);

impl CallbackLog {
    fn callback(&self, tag: u32) -> impl FnOnce(EventCompletionType) + Send + 'static {
        let log = self.0.clone();
        move |kind| log.lock().push((tag, kind))
    }

    fn tags(&self) -> Vec<u32> {
        self.0.lock().iter().map(|(tag, _)| *tag).collect()
    }

    fn kinds(&self) -> Vec<EventCompletionType> {
        self.0.lock().iter().map(|(_, kind)| *kind).collect()
    }
}

fn timed_manager() -> EventManager {
    let mut manager = EventManager::new();
    manager
        .initialize(Some(&EventManagerDescriptor {
            timed_wait_any_enable: true,
            timed_wait_any_max_count: 0,
        }))
        .unwrap();
    manager
}

fn track_queue(
    manager: &EventManager,
    queue: &Arc<ManualQueue>,
    mode: CallbackMode,
    serial: u64,
    callback: impl FnOnce(EventCompletionType) + Send + 'static,
) -> FutureId {
    manager.track_event(TrackedEvent::from_queue_serial(
        mode,
        queue,
        ExecutionSerial(serial),
        callback,
    ))
}

fn track_signal(
    manager: &EventManager,
    signal: &Arc<SystemEvent>,
    mode: CallbackMode,
    callback: impl FnOnce(EventCompletionType) + Send + 'static,
) -> FutureId {
    manager.track_event(TrackedEvent::from_system_event(mode, Arc::clone(signal), callback))
}

#[test]
fn future_ids_strictly_increase() {
    let manager = EventManager::new();
    let queue = ManualQueue::new(0, 0);
    let mut rng = Rng::from_seed(0x5eed);

    let mut previous = 0;
    for _ in 0..200 {
        let mode = match rng.rand_u32() % 3 {
            0 => CallbackMode::WaitAnyOnly,
            1 => CallbackMode::PollOnly,
            _ => CallbackMode::AllowSpontaneous,
        };
        let event = match rng.rand_u32() % 3 {
            0 => TrackedEvent::completed(mode, |_| {}),
            1 => TrackedEvent::from_system_event(mode, Arc::new(SystemEvent::default()), |_| {}),
            _ => {
                let serial = ExecutionSerial(rng.rand_u32() as u64);
                TrackedEvent::from_queue_serial(mode, &queue, serial, |_| {})
            }
        };
        let id = manager.track_event(event).get();
        assert!(id > previous, "{} issued after {}", id, previous);
        previous = id;
    }

    manager.shut_down();
    let after_shutdown =
        manager.track_event(TrackedEvent::completed(CallbackMode::PollOnly, |_| {}));
    assert!(after_shutdown.get() > previous);
}

#[test]
fn same_queue_callbacks_fire_in_registration_order() {
    init_tracing();
    let manager = EventManager::new();
    let queue = ManualQueue::new(0, 20);
    let log = CallbackLog::default();

    // Later registrations finish on the GPU first.
    let mut ids = Vec::new();
    for tag in 0..10 {
        let serial = 20 - tag as u64;
        ids.push(track_queue(&manager, &queue, CallbackMode::PollOnly, serial, log.callback(tag)));
    }
    assert_eq!(FutureId::from_raw(5), ids[4]);
    assert_eq!(FutureId::from_raw(9), ids[8]);

    queue.completed.store(20, Ordering::SeqCst);
    manager.process_poll_events();
    assert_eq!((0..10).collect::<Vec<u32>>(), log.tags());
    assert_eq!(0, manager.outstanding());
}

#[test]
fn wait_any_orders_ready_subset() {
    let manager = EventManager::new();
    let signals: Vec<Arc<SystemEvent>> = (0..6).map(|_| Arc::new(SystemEvent::default())).collect();
    let log = CallbackLog::default();
    let mut infos: Vec<FutureWaitInfo> = signals
        .iter()
        .enumerate()
        .map(|(tag, signal)| {
            let callback = log.callback(tag as u32);
            FutureWaitInfo::new(track_signal(&manager, signal, CallbackMode::WaitAnyOnly, callback))
        })
        .collect();

    for &index in &[4, 1, 3] {
        signals[index].signal();
    }
    infos.reverse();

    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(vec![1, 3, 4], log.tags());
    let completed: Vec<bool> = infos.iter().map(|info| info.completed).collect();
    assert_eq!(vec![false, true, true, false, true, false], completed);
    assert_eq!(3, manager.outstanding());

    for signal in &signals {
        signal.signal();
    }
    manager.process_poll_events();
    assert_eq!(3, manager.outstanding(), "wait-any-only futures are not polled");
}

#[test]
fn zero_timeout_wait_any_is_a_poll() {
    let manager = timed_manager();
    let queue = ManualQueue::new(0, 5);
    let log = CallbackLog::default();
    let future = track_queue(&manager, &queue, CallbackMode::WaitAnyOnly, 5, log.callback(0));
    let mut infos = [FutureWaitInfo::new(future)];

    let start = Instant::now();
    assert_eq!(WaitStatus::TimedOut, manager.wait_any(&mut infos, Duration::ZERO));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(0, queue.waits.load(Ordering::SeqCst));
    assert_eq!(false, infos[0].completed);
    assert!(log.tags().is_empty());

    queue.completed.store(5, Ordering::SeqCst);
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(true, infos[0].completed);
    assert_eq!(vec![0], log.tags());
}

#[test]
fn mixed_sources_only_rejected_when_blocking() {
    let manager = timed_manager();
    let queue = ManualQueue::new(0, 3);
    let signal = SystemEvent::create_signaled();
    let log = CallbackLog::default();

    let system_future = track_signal(&manager, &signal, CallbackMode::WaitAnyOnly, log.callback(0));
    let queue_future = track_queue(&manager, &queue, CallbackMode::WaitAnyOnly, 3, log.callback(1));
    let mut infos = [FutureWaitInfo::new(system_future), FutureWaitInfo::new(queue_future)];

    assert_eq!(
        WaitStatus::UnsupportedMixedSources,
        manager.wait_any(&mut infos, Duration::from_millis(100))
    );
    assert!(log.tags().is_empty());
    assert_eq!(0, queue.waits.load(Ordering::SeqCst));
    assert_eq!(2, manager.outstanding());

    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(vec![0], log.tags());
    assert_eq!([true, false], [infos[0].completed, infos[1].completed]);
    assert_eq!(1, manager.outstanding());
}

#[test]
fn queues_on_different_devices_are_mixed_sources() {
    let manager = timed_manager();
    let first = ManualQueue::new(1, 1);
    let second = ManualQueue::new(1, 1);
    let mut infos = [
        FutureWaitInfo::new(track_queue(&manager, &first, CallbackMode::PollOnly, 1, |_| {})),
        FutureWaitInfo::new(track_queue(&manager, &second, CallbackMode::PollOnly, 1, |_| {})),
    ];

    assert_eq!(
        WaitStatus::UnsupportedMixedSources,
        manager.wait_any(&mut infos, Duration::from_millis(10))
    );
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!([true, true], [infos[0].completed, infos[1].completed]);
}

#[test]
fn completed_future_is_reported_without_waiting() {
    let manager = timed_manager();
    let queue = ManualQueue::new(0, 1);
    let count = Arc::new(AtomicUsize::new(0));
    let done = {
        let count = Arc::clone(&count);
        manager.track_event(TrackedEvent::completed(CallbackMode::PollOnly, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        }))
    };
    manager.process_poll_events();
    assert_eq!(1, count.load(Ordering::SeqCst));

    let pending = track_queue(&manager, &queue, CallbackMode::WaitAnyOnly, 1, |_| {});
    let mut infos = [FutureWaitInfo::new(pending), FutureWaitInfo::new(done)];
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::from_secs(30)));
    assert_eq!([false, true], [infos[0].completed, infos[1].completed]);
    assert_eq!(0, queue.waits.load(Ordering::SeqCst));
    assert_eq!(1, count.load(Ordering::SeqCst));
}

#[test]
fn partial_serial_completion() {
    let manager = EventManager::new();
    let queue = ManualQueue::new(12, 15);
    let log = CallbackLog::default();
    let mut infos: Vec<FutureWaitInfo> = [10, 12, 15]
        .iter()
        .map(|&serial| {
            let callback = log.callback(serial as u32);
            let mode = CallbackMode::WaitAnyOnly;
            FutureWaitInfo::new(track_queue(&manager, &queue, mode, serial, callback))
        })
        .collect();

    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    let completed: Vec<bool> = infos.iter().map(|info| info.completed).collect();
    assert_eq!(vec![true, true, false], completed);
    assert_eq!(vec![10, 12], log.tags());
    assert_eq!(1, manager.outstanding());
    assert_eq!(0, queue.ticks.load(Ordering::SeqCst));
}

#[test]
fn unsubmitted_serial_is_flushed() {
    let manager = EventManager::new();
    let queue = ManualQueue::new(0, 0);
    let future = track_queue(&manager, &queue, CallbackMode::PollOnly, 1, |_| {});

    manager.process_poll_events();
    assert_eq!(1, queue.ticks.load(Ordering::SeqCst));
    assert_eq!(1, manager.outstanding());

    queue.last_submitted.store(1, Ordering::SeqCst);
    queue.completed.store(1, Ordering::SeqCst);
    let mut infos = [FutureWaitInfo::new(future)];
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(1, queue.ticks.load(Ordering::SeqCst));
}

#[test]
fn timed_wait_disabled_by_default() {
    let mut manager = EventManager::new();
    manager
        .initialize(Some(&EventManagerDescriptor {
            timed_wait_any_enable: false,
            timed_wait_any_max_count: 0,
        }))
        .unwrap();
    let log = CallbackLog::default();
    let future =
        manager.track_event(TrackedEvent::completed(CallbackMode::WaitAnyOnly, log.callback(0)));
    let mut infos = [FutureWaitInfo::new(future)];

    let timeout = Duration::from_millis(1);
    assert_eq!(WaitStatus::UnsupportedTimeout, manager.wait_any(&mut infos, timeout));
    assert_eq!(WaitStatus::UnsupportedTimeout, manager.wait_any(&mut [], timeout));
    assert_eq!(false, infos[0].completed);
    assert!(log.tags().is_empty());
    assert_eq!(1, manager.outstanding());

    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(vec![0], log.tags());
}

#[test]
fn timed_wait_count_is_limited() {
    let mut manager = EventManager::new();
    manager
        .initialize(Some(&EventManagerDescriptor {
            timed_wait_any_enable: true,
            timed_wait_any_max_count: 2,
        }))
        .unwrap();
    let mut infos: Vec<FutureWaitInfo> = (0..3)
        .map(|_| {
            let event = TrackedEvent::completed(CallbackMode::WaitAnyOnly, |_| {});
            FutureWaitInfo::new(manager.track_event(event))
        })
        .collect();

    let timeout = Duration::from_millis(1);
    assert_eq!(WaitStatus::UnsupportedCount, manager.wait_any(&mut infos, timeout));
    assert!(infos.iter().all(|info| !info.completed));
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos[..2], timeout));
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
}

#[test]
fn initialize_validates_descriptor() {
    let mut manager = EventManager::new();
    assert_eq!(ManagerState::Uninitialized, manager.state());

    let oversized = EventManagerDescriptor {
        timed_wait_any_enable: true,
        timed_wait_any_max_count: TIMED_WAIT_ANY_MAX_COUNT_DEFAULT + 1,
    };
    assert_eq!(
        Err(EventManagerError::UnsupportedTimedWaitAnyMaxCount {
            requested: TIMED_WAIT_ANY_MAX_COUNT_DEFAULT + 1,
            max: TIMED_WAIT_ANY_MAX_COUNT_DEFAULT,
        }),
        manager.initialize(Some(&oversized))
    );
    assert_eq!(ManagerState::Uninitialized, manager.state());

    manager.initialize(None).unwrap();
    assert_eq!(ManagerState::Initialized, manager.state());
    assert_eq!(Err(EventManagerError::AlreadyInitialized), manager.initialize(None));

    manager.shut_down();
    assert_eq!(ManagerState::ShutDown, manager.state());
    assert_eq!(Err(EventManagerError::ShutDown), manager.initialize(None));
}

#[test]
fn shutdown_aborts_outstanding_futures() {
    let manager = EventManager::new();
    let signal = Arc::new(SystemEvent::default());
    let log = CallbackLog::default();
    let first = track_signal(&manager, &signal, CallbackMode::PollOnly, log.callback(0));
    track_signal(&manager, &signal, CallbackMode::WaitAnyOnly, log.callback(1));

    manager.shut_down();
    assert_eq!(vec![0, 1], log.tags());
    assert_eq!(vec![EventCompletionType::Shutdown; 2], log.kinds());

    // Nothing is tracked any more, so everything counts as completed.
    let mut infos = [FutureWaitInfo::new(first)];
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(true, infos[0].completed);

    track_signal(&manager, &signal, CallbackMode::PollOnly, log.callback(2));
    assert_eq!(vec![0, 1, 2], log.tags());
    assert_eq!(EventCompletionType::Shutdown, log.kinds()[2]);
    manager.process_poll_events();
}

#[test]
fn dropping_manager_aborts_outstanding_futures() {
    let log = CallbackLog::default();
    {
        let manager = EventManager::new();
        manager.track_event(TrackedEvent::from_system_event(
            CallbackMode::PollOnly,
            Arc::new(SystemEvent::default()),
            log.callback(7),
        ));
    }
    assert_eq!(vec![7], log.tags());
    assert_eq!(vec![EventCompletionType::Shutdown], log.kinds());
}

#[test]
fn device_error_forces_completion() {
    init_tracing();
    let manager = timed_manager();
    let queue = ManualQueue::new(0, 10);
    queue.fail.store(true, Ordering::SeqCst);
    let log = CallbackLog::default();
    let mut infos: Vec<FutureWaitInfo> = (1..=3)
        .map(|serial| {
            let callback = log.callback(serial as u32);
            let mode = CallbackMode::PollOnly;
            FutureWaitInfo::new(track_queue(&manager, &queue, mode, serial, callback))
        })
        .collect();

    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::from_millis(50)));
    assert!(infos.iter().all(|info| info.completed));
    assert_eq!(vec![1, 2, 3], log.tags());
    assert_eq!(vec![EventCompletionType::Ready; 3], log.kinds());
}

#[test]
fn dropped_queue_forces_completion() {
    let manager = EventManager::new();
    let log = CallbackLog::default();
    {
        let queue = ManualQueue::new(0, 100);
        track_queue(&manager, &queue, CallbackMode::PollOnly, 100, log.callback(0));
    }
    manager.process_poll_events();
    assert_eq!(vec![0], log.tags());
    assert_eq!(0, manager.outstanding());
}

#[test]
fn blocking_wait_on_queue_serial() {
    let manager = timed_manager();
    let queue = ManualQueue::new(0, 4);
    let future = track_queue(&manager, &queue, CallbackMode::WaitAnyOnly, 4, |_| {});
    let mut infos = [FutureWaitInfo::new(future)];

    let start = Instant::now();
    assert_eq!(WaitStatus::TimedOut, manager.wait_any(&mut infos, Duration::from_millis(20)));
    assert!(start.elapsed() >= Duration::from_millis(20));
    assert_eq!(1, queue.waits.load(Ordering::SeqCst));

    queue.complete_on_wait.store(true, Ordering::SeqCst);
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::from_secs(5)));
    assert_eq!(true, infos[0].completed);
}

#[test]
fn blocking_wait_on_remote_signal() {
    let manager = Arc::new(timed_manager());
    let signals: Vec<Arc<SystemEvent>> = (0..3).map(|_| Arc::new(SystemEvent::default())).collect();
    let log = CallbackLog::default();
    let mut infos: Vec<FutureWaitInfo> = signals
        .iter()
        .enumerate()
        .map(|(tag, signal)| {
            let callback = log.callback(tag as u32);
            FutureWaitInfo::new(track_signal(&manager, signal, CallbackMode::WaitAnyOnly, callback))
        })
        .collect();

    let waiter = {
        let manager = Arc::clone(&manager);
        thread::spawn(move || {
            let status = manager.wait_any(&mut infos, Duration::from_secs(10));
            (status, infos)
        })
    };
    thread::sleep(Duration::from_millis(50));

    // The waiter is parked holding the process lock; registering must not queue behind it.
    let start = Instant::now();
    let future = manager.track_event(TrackedEvent::completed(CallbackMode::PollOnly, |_| {}));
    let elapsed = start.elapsed();
    assert_eq!(FutureId::from_raw(4), future);
    assert!(elapsed < Duration::from_secs(1), "track_event took {:?}", elapsed);
    assert_eq!(false, waiter.is_finished());

    signals[1].signal();
    let (status, infos) = waiter.join().unwrap();
    assert_eq!(WaitStatus::Success, status);
    assert_eq!(vec![1], log.tags());
    assert_eq!(vec![false, true, false], infos.iter().map(|i| i.completed).collect::<Vec<_>>());
    for signal in &signals {
        signal.signal();
    }
}

#[test]
fn callbacks_can_reenter_manager() {
    let manager = Arc::new(EventManager::new());
    let log = CallbackLog::default();

    let callback = {
        let manager = Arc::clone(&manager);
        let log = log.clone();
        move |_| {
            let event = TrackedEvent::completed(CallbackMode::PollOnly, log.callback(1));
            let future = manager.track_event(event);
            let mut infos = [FutureWaitInfo::new(future)];
            assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
            manager.process_poll_events();
        }
    };
    manager.track_event(TrackedEvent::completed(CallbackMode::PollOnly, callback));

    manager.process_poll_events();
    assert_eq!(vec![1], log.tags());
    assert_eq!(0, manager.outstanding());
}

#[test]
fn future_is_untracked_before_its_callback_runs() {
    let manager = Arc::new(timed_manager());
    let observed: Arc<Mutex<Vec<(WaitStatus, bool, usize)>>> = Arc::default();
    let own_ids: Arc<Mutex<Vec<FutureId>>> = Arc::default();

    let make_callback = |slot: usize| {
        let manager = Arc::clone(&manager);
        let observed = Arc::clone(&observed);
        let own_ids = Arc::clone(&own_ids);
        move |_: EventCompletionType| {
            let own = own_ids.lock()[slot];
            let mut infos = [FutureWaitInfo::new(own)];
            let status = manager.wait_any(&mut infos, Duration::ZERO);
            observed.lock().push((status, infos[0].completed, manager.outstanding()));
        }
    };

    let polled = TrackedEvent::completed(CallbackMode::PollOnly, make_callback(0));
    let waited = TrackedEvent::completed(CallbackMode::WaitAnyOnly, make_callback(1));
    let polled = manager.track_event(polled);
    let waited = manager.track_event(waited);
    own_ids.lock().extend([polled, waited]);

    manager.process_poll_events();
    assert_eq!(vec![(WaitStatus::Success, true, 1)], *observed.lock());

    let mut infos = [FutureWaitInfo::new(waited)];
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(
        vec![(WaitStatus::Success, true, 1), (WaitStatus::Success, true, 0)],
        *observed.lock()
    );
}

#[test]
fn queues_sharing_a_device_complete_together() {
    let manager = EventManager::new();
    let device = DeviceId::next();
    let first = null::NullQueue::with_device(device);
    let second = null::NullQueue::with_device(device);
    let log = CallbackLog::default();

    first.on_submitted_work_done(&manager, CallbackMode::PollOnly, log.callback(0));
    second.on_submitted_work_done(&manager, CallbackMode::PollOnly, log.callback(1));
    drop(first);

    // Whichever queue the group polls, both futures resolve in one pass.
    manager.process_poll_events();
    assert_eq!(vec![0, 1], log.tags());
    assert_eq!(0, manager.outstanding());
}

#[test]
fn spontaneous_future_is_not_completed_twice() {
    let manager = EventManager::new();
    let count = Arc::new(AtomicUsize::new(0));
    let event = {
        let count = Arc::clone(&count);
        TrackedEvent::completed(CallbackMode::AllowSpontaneous, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    let future = manager.track_event(Arc::clone(&event));

    event.complete_if_spontaneous();
    assert_eq!(1, count.load(Ordering::SeqCst));

    manager.process_poll_events();
    assert_eq!(1, count.load(Ordering::SeqCst));
    let mut infos = [FutureWaitInfo::new(future)];
    assert_eq!(WaitStatus::Success, manager.wait_any(&mut infos, Duration::ZERO));
    assert_eq!(true, infos[0].completed);
}

#[test]
fn concurrent_polls_complete_each_future_once() {
    const THREAD_COUNT: usize = 8;
    const FUTURE_COUNT: usize = 500;

    let manager = Arc::new(EventManager::new());
    let counts: Arc<Vec<AtomicUsize>> =
        Arc::new((0..FUTURE_COUNT).map(|_| AtomicUsize::new(0)).collect());
    let signals: Vec<Arc<SystemEvent>> =
        (0..FUTURE_COUNT).map(|_| Arc::new(SystemEvent::default())).collect();

    for (index, signal) in signals.iter().enumerate() {
        let counts = Arc::clone(&counts);
        track_signal(&manager, signal, CallbackMode::AllowSpontaneous, move |_| {
            counts[index].fetch_add(1, Ordering::SeqCst);
        });
    }

    let stop = Arc::new(AtomicBool::new(false));
    let pollers: Vec<_> = (0..THREAD_COUNT)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    manager.process_poll_events();
                    thread::yield_now();
                }
            })
        })
        .collect();

    for signal in &signals {
        signal.signal();
    }
    let deadline = Instant::now() + Duration::from_secs(30);
    while manager.outstanding() > 0 && Instant::now() < deadline {
        thread::yield_now();
    }
    stop.store(true, Ordering::SeqCst);
    for poller in pollers {
        poller.join().unwrap();
    }

    assert_eq!(0, manager.outstanding());
    assert!(counts.iter().all(|count| count.load(Ordering::SeqCst) == 1));
}

#[test]
fn instance_drives_null_queue() {
    let descriptor = EventManagerDescriptor {
        timed_wait_any_enable: true,
        timed_wait_any_max_count: 4,
    };
    let instance = Instance::new(Some(&descriptor)).unwrap();
    let queue = null::NullQueue::new();
    instance.add_queue(&queue);
    let log = CallbackLog::default();

    let manager = instance.event_manager();
    let polled = queue.on_submitted_work_done(manager, CallbackMode::PollOnly, log.callback(0));
    let waited = queue.on_submitted_work_done(manager, CallbackMode::WaitAnyOnly, log.callback(1));
    assert!(polled < waited);

    instance.process_events();
    assert_eq!(vec![0], log.tags());

    let mut infos = [FutureWaitInfo::new(waited)];
    assert_eq!(WaitStatus::Success, instance.wait_any(&mut infos, Duration::from_millis(100)));
    assert_eq!(vec![0, 1], log.tags());
}
