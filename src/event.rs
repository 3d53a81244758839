//! Tracked events: the completion records behind every future id.

use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::queue::{DeviceId, ExecutionSerial, Queue};
use crate::signal::SystemEvent;

/// Opaque handle for a pending asynchronous operation, unique within one
/// [`EventManager`](crate::EventManager). Ids are issued in strictly increasing order starting
/// at 1; lower ids were registered first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FutureId(pub(crate) u64);

impl FutureId {
    /// Rebuild an id from its raw value, e.g. one received over an API boundary.
    pub const fn from_raw(raw: u64) -> FutureId {
        FutureId(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FutureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "future#{}", self.0)
    }
}

/// Decides which calls are allowed to complete an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallbackMode {
    /// Completed only by [`EventManager::wait_any()`](crate::EventManager::wait_any).
    WaitAnyOnly,
    /// Completed by `wait_any()` or
    /// [`EventManager::process_poll_events()`](crate::EventManager::process_poll_events).
    PollOnly,
    /// Like `PollOnly`, but the producer may also complete the event on its own through
    /// [`TrackedEvent::complete_if_spontaneous()`].
    AllowSpontaneous,
}

/// Why a callback is running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventCompletionType {
    /// The underlying operation finished (possibly with a device error, which is reported by
    /// the device itself).
    Ready,
    /// The event manager shut down before the operation finished.
    Shutdown,
}

/// A queue and the serial after which a queue-serial event is complete.
///
/// Waits group queue-serial events by `device` and poll only the queue of the first event in a
/// group, so each device is expected to own a single queue. If two queues share a device and
/// the one polled has been dropped, every event of the group is forced complete.
#[derive(Clone)]
pub struct QueueAndSerial {
    pub queue: Weak<dyn Queue>,
    pub device: DeviceId,
    pub completion_serial: ExecutionSerial,
}

impl fmt::Debug for QueueAndSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueAndSerial")
            .field("device", &self.device)
            .field("completion_serial", &self.completion_serial)
            .finish()
    }
}

/// What a tracked event waits on. The wait algorithm branches exhaustively on these two kinds.
#[derive(Clone, Debug)]
pub enum CompletionData {
    System(Arc<SystemEvent>),
    QueueSerial(QueueAndSerial),
}

type Callback = Box<dyn FnOnce(EventCompletionType) + Send>;

/// A pending operation registered with an [`EventManager`](crate::EventManager).
///
/// A `TrackedEvent` runs its callback exactly once, the first time it is completed. Dropping an
/// event that never completed is a contract violation and panics in debug builds.
pub struct TrackedEvent {
    callback_mode: CallbackMode,
    completion_data: CompletionData,
    completed: AtomicBool,
    callback: Mutex<Option<Callback>>,
    #[cfg(debug_assertions)]
    being_waited: AtomicBool,
}

impl TrackedEvent {
    fn new<F>(
        callback_mode: CallbackMode,
        completion_data: CompletionData,
        callback: F,
    ) -> Arc<Self>
    where
        F: FnOnce(EventCompletionType) + Send + 'static,
    {
        Arc::new(TrackedEvent {
            callback_mode,
            completion_data,
            completed: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
            #[cfg(debug_assertions)]
            being_waited: AtomicBool::new(false),
        })
    }

    /// An event completed by `signal` becoming signalled.
    pub fn from_system_event<F>(
        callback_mode: CallbackMode,
        signal: Arc<SystemEvent>,
        callback: F,
    ) -> Arc<Self>
    where
        F: FnOnce(EventCompletionType) + Send + 'static,
    {
        TrackedEvent::new(callback_mode, CompletionData::System(signal), callback)
    }

    /// An event completed once `queue` passes `completion_serial`. Only a weak reference to
    /// the queue is kept.
    pub fn from_queue_serial<Q, F>(
        callback_mode: CallbackMode,
        queue: &Arc<Q>,
        completion_serial: ExecutionSerial,
        callback: F,
    ) -> Arc<Self>
    where
        Q: Queue + 'static,
        F: FnOnce(EventCompletionType) + Send + 'static,
    {
        let device = queue.device_id();
        let queue: Weak<dyn Queue> = Arc::downgrade(queue) as Weak<Q>;
        TrackedEvent::new(
            callback_mode,
            CompletionData::QueueSerial(QueueAndSerial {
                queue,
                device,
                completion_serial,
            }),
            callback,
        )
    }

    /// An event that is already complete, for operations that resolve synchronously. The
    /// callback still only runs when the event is polled or waited on.
    pub fn completed<F>(callback_mode: CallbackMode, callback: F) -> Arc<Self>
    where
        F: FnOnce(EventCompletionType) + Send + 'static,
    {
        TrackedEvent::from_system_event(callback_mode, SystemEvent::create_signaled(), callback)
    }

    pub fn callback_mode(&self) -> CallbackMode {
        self.callback_mode
    }

    pub fn completion_data(&self) -> &CompletionData {
        &self.completion_data
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Complete the event if nobody has yet. Only the first call runs the callback; later
    /// calls do nothing.
    pub fn ensure_complete(&self, completion_type: EventCompletionType) {
        let already_complete = self.completed.swap(true, Ordering::AcqRel);
        if !already_complete {
            self.complete(completion_type);
        }
    }

    /// Complete an [`CallbackMode::AllowSpontaneous`] event outside of any poll or wait. Does
    /// nothing for other modes.
    ///
    /// # Panics
    ///
    /// If the event was already complete: a spontaneous event may only be completed this way
    /// once, and only by its producer.
    pub fn complete_if_spontaneous(&self) {
        if self.callback_mode == CallbackMode::AllowSpontaneous {
            let already_complete = self.completed.swap(true, Ordering::AcqRel);
            assert!(!already_complete, "spontaneous event completed twice");
            self.complete(EventCompletionType::Ready);
        }
    }

    fn complete(&self, completion_type: EventCompletionType) {
        // Taken out of the lock first so the callback may re-enter this event.
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(completion_type);
        }
    }
}

impl fmt::Debug for TrackedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedEvent")
            .field("callback_mode", &self.callback_mode)
            .field("completion_data", &self.completion_data)
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl Drop for TrackedEvent {
    fn drop(&mut self) {
        debug_assert!(
            *self.completed.get_mut() || std::thread::panicking(),
            "TrackedEvent dropped before it completed"
        );
    }
}

/// Exclusive wait access to a [`TrackedEvent`], held for the duration of one poll or wait.
///
/// In debug builds acquiring a second `WaitRef` on the same event panics, which catches two
/// concurrent waits on one future. In release builds this is just a strong reference.
pub struct WaitRef(Arc<TrackedEvent>);

impl WaitRef {
    pub fn acquire(event: Arc<TrackedEvent>) -> WaitRef {
        #[cfg(debug_assertions)]
        {
            let was_already_waited = event.being_waited.swap(true, Ordering::AcqRel);
            assert!(!was_already_waited, "future is already being waited on");
        }
        WaitRef(event)
    }
}

impl Deref for WaitRef {
    type Target = TrackedEvent;

    fn deref(&self) -> &TrackedEvent {
        &self.0
    }
}

impl Drop for WaitRef {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let was_already_waited = self.0.being_waited.swap(false, Ordering::AcqRel);
            debug_assert!(was_already_waited || std::thread::panicking());
        }
    }
}

#[cfg(test)]
use std::sync::atomic::AtomicUsize;

#[cfg(test)]
fn counting_callback(
    count: &Arc<AtomicUsize>,
) -> impl FnOnce(EventCompletionType) + Send + 'static {
    let count = Arc::clone(count);
    move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn ensure_complete_runs_callback_once() {
    let count = Arc::new(AtomicUsize::new(0));
    let event = TrackedEvent::completed(CallbackMode::PollOnly, counting_callback(&count));
    assert_eq!(false, event.is_completed());

    for _ in 0..5 {
        event.ensure_complete(EventCompletionType::Ready);
    }
    assert_eq!(true, event.is_completed());
    assert_eq!(1, count.load(Ordering::SeqCst));
}

#[test]
fn first_completion_type_wins() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let event = {
        let seen = Arc::clone(&seen);
        TrackedEvent::completed(CallbackMode::WaitAnyOnly, move |kind| seen.lock().push(kind))
    };
    event.ensure_complete(EventCompletionType::Shutdown);
    event.ensure_complete(EventCompletionType::Ready);
    assert_eq!(vec![EventCompletionType::Shutdown], *seen.lock());
}

#[test]
fn spontaneous_completion_respects_mode() {
    let count = Arc::new(AtomicUsize::new(0));

    let poll_only = TrackedEvent::completed(CallbackMode::PollOnly, counting_callback(&count));
    poll_only.complete_if_spontaneous();
    assert_eq!(false, poll_only.is_completed());
    poll_only.ensure_complete(EventCompletionType::Ready);

    let spontaneous =
        TrackedEvent::completed(CallbackMode::AllowSpontaneous, counting_callback(&count));
    spontaneous.complete_if_spontaneous();
    assert_eq!(true, spontaneous.is_completed());
    // Later poll or wait paths see it as already done.
    spontaneous.ensure_complete(EventCompletionType::Ready);

    assert_eq!(2, count.load(Ordering::SeqCst));
}

#[test]
#[should_panic(expected = "spontaneous event completed twice")]
fn spontaneous_completion_after_completion_panics() {
    let event = TrackedEvent::completed(CallbackMode::AllowSpontaneous, |_| {});
    event.ensure_complete(EventCompletionType::Ready);
    event.complete_if_spontaneous();
}

#[test]
fn callback_can_reenter_event() {
    let event_slot: Arc<Mutex<Option<Arc<TrackedEvent>>>> = Arc::new(Mutex::new(None));
    let event = {
        let event_slot = Arc::clone(&event_slot);
        TrackedEvent::completed(CallbackMode::PollOnly, move |_| {
            let event = event_slot.lock().take().unwrap();
            assert_eq!(true, event.is_completed());
            event.ensure_complete(EventCompletionType::Ready);
        })
    };
    *event_slot.lock() = Some(Arc::clone(&event));
    event.ensure_complete(EventCompletionType::Ready);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "already being waited on")]
fn double_wait_ref_panics() {
    let event = TrackedEvent::completed(CallbackMode::PollOnly, |_| {});
    event.ensure_complete(EventCompletionType::Ready);
    let _first = WaitRef::acquire(Arc::clone(&event));
    let _second = WaitRef::acquire(Arc::clone(&event));
}

#[test]
fn wait_ref_is_released_on_drop() {
    let event = TrackedEvent::completed(CallbackMode::PollOnly, |_| {});
    drop(WaitRef::acquire(Arc::clone(&event)));
    let wait_ref = WaitRef::acquire(Arc::clone(&event));
    assert!(matches!(
        wait_ref.completion_data(),
        CompletionData::System(signal) if signal.is_signaled()
    ));
    wait_ref.ensure_complete(EventCompletionType::Ready);
}

#[test]
fn queue_serial_event_holds_queue_weakly() {
    let queue = crate::null::NullQueue::new();
    let event = TrackedEvent::from_queue_serial(
        CallbackMode::PollOnly,
        &queue,
        ExecutionSerial(3),
        |_| {},
    );

    let CompletionData::QueueSerial(target) = event.completion_data() else {
        panic!("expected a queue serial event");
    };
    assert_eq!(queue.device_id(), target.device);
    assert_eq!(ExecutionSerial(3), target.completion_serial);
    assert!(target.queue.upgrade().is_some());

    drop(queue);
    assert!(target.queue.upgrade().is_none());
    event.ensure_complete(EventCompletionType::Ready);
}
