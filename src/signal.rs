//! The OS-level signal primitive backing system-event futures.
//!
//! A [`SystemEvent`] is a manual-reset "waitable boolean": once signalled it stays signalled
//! and every past and future waiter is let through. Threads waiting on a single event are parked
//! with `parking_lot_core` on the event's own address, while [`wait_any_system_event()`] parks
//! the calling thread on a one-shot listener that every participating event notifies when it
//! becomes signalled.

use parking_lot::Mutex;
use parking_lot_core as plc;
use parking_lot_core::ParkResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A one-shot wakeup shared between the events taking part in a single multi-wait.
struct Listener(AtomicBool); // true once any participating event has been signalled

impl Listener {
    fn new() -> Listener {
        Listener(AtomicBool::new(false))
    }

    fn key(&self) -> usize {
        self as *const Listener as usize
    }

    fn notify(&self) {
        self.0.store(true, Ordering::Release);
        unsafe { plc::unpark_all(self.key(), plc::DEFAULT_UNPARK_TOKEN) };
    }

    /// Parks the calling thread until notified or until `deadline` passes. Returns `false` only
    /// if the deadline elapsed without a notification.
    fn park_until(&self, deadline: Option<Instant>) -> bool {
        let park_result = unsafe {
            plc::park(
                self.key(),
                || !self.0.load(Ordering::Acquire),
                || {},
                |_, _| {},
                plc::DEFAULT_PARK_TOKEN,
                deadline,
            )
        };

        park_result != ParkResult::TimedOut
    }
}

/// A manual-reset signal that completes a future when set.
///
/// `SystemEvent`s are shared behind an [`Arc`] between the producer that will eventually call
/// [`SystemEvent::signal()`] and the tracked event that waits on it. There is no way to reset a
/// `SystemEvent`: a future only ever resolves once.
pub struct SystemEvent {
    signaled: AtomicBool,
    listeners: Mutex<Vec<Arc<Listener>>>,
}

impl SystemEvent {
    /// Create a new `SystemEvent`, optionally already in the signalled state.
    pub fn new(signaled: bool) -> SystemEvent {
        SystemEvent {
            signaled: AtomicBool::new(signaled),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Create a shared event that is already signalled, for futures that resolve synchronously.
    pub fn create_signaled() -> Arc<SystemEvent> {
        Arc::new(SystemEvent::new(true))
    }

    fn key(&self) -> usize {
        self as *const SystemEvent as usize
    }

    /// Put the event in the signalled state, releasing every parked waiter, including threads
    /// blocked in a multi-wait that includes this event.
    pub fn signal(&self) {
        self.signaled.store(true, Ordering::Release);
        unsafe { plc::unpark_all(self.key(), plc::DEFAULT_UNPARK_TOKEN) };

        // The store above happens before this lock is taken, so a listener registered after
        // the drain is guaranteed to observe the signalled state on its own re-check.
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.notify();
        }
    }

    /// Test whether the event has been signalled, without blocking or yielding.
    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Block until the event is signalled.
    pub fn wait(&self) {
        while !self.is_signaled() {
            unsafe {
                plc::park(
                    self.key(),
                    || !self.is_signaled(),
                    || {},
                    |_, _| {},
                    plc::DEFAULT_PARK_TOKEN,
                    None,
                );
            }
        }
    }

    /// Check if the event is signalled (and return immediately) or wait for it to become
    /// signalled, up to the limit specified by the `Duration` parameter.
    ///
    /// Returns `true` if the event was initially signalled or if it became signalled within the
    /// time limit, and `false` if the timeout elapsed first.
    pub fn wait_for(&self, limit: Duration) -> bool {
        if self.is_signaled() {
            return true;
        }

        let deadline = deadline_after(limit);
        while !self.is_signaled() {
            let park_result = unsafe {
                plc::park(
                    self.key(),
                    || !self.is_signaled(),
                    || {},
                    |_, _| {},
                    plc::DEFAULT_PARK_TOKEN,
                    deadline,
                )
            };
            if park_result == ParkResult::TimedOut {
                break;
            }
        }

        self.is_signaled()
    }

    fn add_listener(&self, listener: &Arc<Listener>) {
        self.listeners.lock().push(Arc::clone(listener));
    }

    fn remove_listener(&self, listener: &Arc<Listener>) {
        self.listeners
            .lock()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }
}

impl Default for SystemEvent {
    fn default() -> SystemEvent {
        SystemEvent::new(false)
    }
}

impl std::fmt::Debug for SystemEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemEvent")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}

/// `None` stands for a wait with no deadline, used when `limit` overflows `Instant`.
fn deadline_after(limit: Duration) -> Option<Instant> {
    Instant::now().checked_add(limit)
}

/// Marks every signalled event's ready flag. Returns true if at least one was signalled.
fn mark_signaled(events: &mut [(&SystemEvent, &mut bool)]) -> bool {
    let mut any_signaled = false;
    for (event, ready) in events.iter_mut() {
        if event.is_signaled() {
            **ready = true;
            any_signaled = true;
        }
    }
    any_signaled
}

/// Wait for any of several events to become signalled, for up to `timeout`.
///
/// Each item pairs an event with the caller's ready flag; the flag of every event found
/// signalled when the wait ends is set to `true` (flags of unsignalled events are left
/// untouched). Returns `true` if at least one event was signalled, or `false` if the timeout
/// elapsed first. A zero `timeout` polls the events without parking.
pub fn wait_any_system_event<'a, I>(events: I, timeout: Duration) -> bool
where
    I: IntoIterator<Item = (&'a SystemEvent, &'a mut bool)>,
{
    let mut events: Vec<(&SystemEvent, &mut bool)> = events.into_iter().collect();
    if events.is_empty() {
        return false;
    }
    let signaled = mark_signaled(&mut events);
    if signaled || timeout.is_zero() {
        return signaled;
    }

    let listener = Arc::new(Listener::new());
    for (event, _) in &events {
        event.add_listener(&listener);
    }

    let deadline = deadline_after(timeout);
    let any_signaled = loop {
        // Re-check after registering: an event signalled before its listener was added
        // never notifies it.
        if mark_signaled(&mut events) {
            break true;
        }
        if !listener.park_until(deadline) {
            break mark_signaled(&mut events);
        }
    };

    for (event, _) in &events {
        event.remove_listener(&listener);
    }
    any_signaled
}

#[cfg(test)]
use std::thread;

#[test]
fn sanity_check() {
    let event = SystemEvent::new(true);
    assert_eq!(true, event.is_signaled());

    let event = SystemEvent::new(false);
    assert_eq!(false, event.is_signaled());
}

#[test]
fn signal_is_sticky() {
    let event = SystemEvent::default();
    event.signal();
    assert_eq!(true, event.is_signaled());
    assert_eq!(true, event.wait_for(Duration::from_millis(0)));
    assert_eq!(true, event.is_signaled());
}

#[test]
fn wait_for_times_out() {
    let event = SystemEvent::default();
    let start = Instant::now();
    assert_eq!(false, event.wait_for(Duration::from_millis(20)));
    assert!(start.elapsed() >= Duration::from_millis(20));
}

#[test]
fn suspend_and_resume() {
    let event = Arc::new(SystemEvent::default());
    let thread = {
        let event = Arc::clone(&event);
        thread::spawn(move || {
            event.wait();
        })
    };
    for _ in 0..100 {
        thread::yield_now();
    }
    event.signal();
    thread.join().unwrap();
}

#[test]
fn wait_any_polls_without_blocking() {
    let set = SystemEvent::create_signaled();
    let unset = SystemEvent::default();
    let (mut ready_set, mut ready_unset) = (false, false);

    let any = wait_any_system_event(
        vec![(&*set, &mut ready_set), (&unset, &mut ready_unset)],
        Duration::ZERO,
    );
    assert_eq!(true, any);
    assert_eq!(true, ready_set);
    assert_eq!(false, ready_unset);
}

#[test]
fn wait_any_empty_is_never_ready() {
    assert_eq!(false, wait_any_system_event(Vec::new(), Duration::from_millis(5)));
}

#[test]
fn wait_any_times_out_and_unregisters() {
    let first = SystemEvent::default();
    let second = SystemEvent::default();
    let (mut a, mut b) = (false, false);

    let any = wait_any_system_event(
        vec![(&first, &mut a), (&second, &mut b)],
        Duration::from_millis(10),
    );
    assert_eq!(false, any);
    assert_eq!((false, false), (a, b));
    assert!(first.listeners.lock().is_empty());
    assert!(second.listeners.lock().is_empty());
}

#[test]
fn wait_any_wakes_on_remote_signal() {
    let events: Vec<Arc<SystemEvent>> = (0..4).map(|_| Arc::new(SystemEvent::default())).collect();
    let signaller = {
        let third = Arc::clone(&events[2]);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            third.signal();
        })
    };

    let mut ready = vec![false; events.len()];
    let any = wait_any_system_event(
        events.iter().map(|event| &**event).zip(ready.iter_mut()),
        Duration::from_secs(10),
    );
    signaller.join().unwrap();

    assert_eq!(true, any);
    assert_eq!(vec![false, false, true, false], ready);
    assert!(events.iter().all(|event| event.listeners.lock().is_empty()));
}

#[test]
fn wait_for_outlasts_stray_unpark() {
    let event = Arc::new(SystemEvent::default());
    let waker = {
        let event = Arc::clone(&event);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            unsafe { plc::unpark_all(event.key(), plc::DEFAULT_UNPARK_TOKEN) };
        })
    };

    let start = Instant::now();
    assert_eq!(false, event.wait_for(Duration::from_millis(200)));
    assert!(start.elapsed() >= Duration::from_millis(200));
    waker.join().unwrap();
}
