//! The event manager: the registry of outstanding futures and the poll and wait entry points.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::event::{CallbackMode, EventCompletionType, FutureId, TrackedEvent, WaitRef};
use crate::wait::{prepare_ready_callbacks, wait_impl, TrackedFutureWaitInfo};

/// The largest number of futures a single timed [`EventManager::wait_any()`] may wait on, and
/// the default limit when none is configured.
pub const TIMED_WAIT_ANY_MAX_COUNT_DEFAULT: usize = 64;

/// Result of [`EventManager::wait_any()`].
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitStatus {
    /// At least one future completed. Check [`FutureWaitInfo::completed`] to see which.
    Success,
    /// The timeout elapsed without any future completing.
    TimedOut,
    /// A non-zero timeout was requested but timed waits are not enabled.
    UnsupportedTimeout,
    /// More futures were passed to a timed wait than the configured maximum.
    UnsupportedCount,
    /// A timed wait was requested on futures with different completion sources.
    UnsupportedMixedSources,
}

/// One entry of a [`EventManager::wait_any()`] list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FutureWaitInfo {
    pub future: FutureId,
    /// Set by `wait_any` once the future has completed.
    pub completed: bool,
}

impl FutureWaitInfo {
    pub fn new(future: FutureId) -> FutureWaitInfo {
        FutureWaitInfo {
            future,
            completed: false,
        }
    }
}

/// Instance-level wait configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EventManagerDescriptor {
    /// Whether `wait_any` accepts a non-zero timeout.
    pub timed_wait_any_enable: bool,
    /// Maximum number of futures per timed `wait_any`. Zero selects
    /// [`TIMED_WAIT_ANY_MAX_COUNT_DEFAULT`], which is also the highest accepted value.
    pub timed_wait_any_max_count: usize,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EventManagerError {
    #[error("timed_wait_any_max_count {requested} exceeds the supported maximum of {max}")]
    UnsupportedTimedWaitAnyMaxCount { requested: usize, max: usize },
    #[error("event manager was already initialized")]
    AlreadyInitialized,
    #[error("event manager was already shut down")]
    ShutDown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ManagerState {
    Uninitialized,
    Initialized,
    ShutDown,
}

struct Registry {
    next_future_id: u64,
    /// `None` once the manager has shut down.
    events: Option<HashMap<FutureId, Arc<TrackedEvent>>>,
}

/// Tracks every outstanding future of one instance and completes them, in order, from
/// [`EventManager::process_poll_events()`] and [`EventManager::wait_any()`].
///
/// Two locks are involved. The registry lock only guards map operations, so
/// [`EventManager::track_event()`] never waits behind a blocking wait. The process lock makes
/// polls and waits single-flight: one thread at a time snapshots, waits on, and untracks
/// futures. Callbacks run with neither lock held and may re-enter the manager.
pub struct EventManager {
    registry: Mutex<Registry>,
    process_event_lock: Mutex<()>,
    initialized: bool,
    timed_wait_any_enable: bool,
    timed_wait_any_max_count: usize,
}

impl EventManager {
    pub fn new() -> EventManager {
        EventManager {
            registry: Mutex::new(Registry {
                next_future_id: 1,
                events: Some(HashMap::new()),
            }),
            process_event_lock: Mutex::new(()),
            initialized: false,
            timed_wait_any_enable: false,
            timed_wait_any_max_count: TIMED_WAIT_ANY_MAX_COUNT_DEFAULT,
        }
    }

    /// Apply the instance's wait configuration. Without a descriptor timed waits stay disabled.
    pub fn initialize(
        &mut self,
        descriptor: Option<&EventManagerDescriptor>,
    ) -> Result<(), EventManagerError> {
        match self.state() {
            ManagerState::Uninitialized => {}
            ManagerState::Initialized => return Err(EventManagerError::AlreadyInitialized),
            ManagerState::ShutDown => return Err(EventManagerError::ShutDown),
        }

        if let Some(descriptor) = descriptor {
            if descriptor.timed_wait_any_max_count > TIMED_WAIT_ANY_MAX_COUNT_DEFAULT {
                return Err(EventManagerError::UnsupportedTimedWaitAnyMaxCount {
                    requested: descriptor.timed_wait_any_max_count,
                    max: TIMED_WAIT_ANY_MAX_COUNT_DEFAULT,
                });
            }
            self.timed_wait_any_enable = descriptor.timed_wait_any_enable;
            self.timed_wait_any_max_count = match descriptor.timed_wait_any_max_count {
                0 => TIMED_WAIT_ANY_MAX_COUNT_DEFAULT,
                count => count,
            };
        }

        self.initialized = true;
        debug!(
            timed_wait_any_enable = self.timed_wait_any_enable,
            timed_wait_any_max_count = self.timed_wait_any_max_count,
            "event manager initialized"
        );
        Ok(())
    }

    pub fn state(&self) -> ManagerState {
        if self.registry.lock().events.is_none() {
            ManagerState::ShutDown
        } else if self.initialized {
            ManagerState::Initialized
        } else {
            ManagerState::Uninitialized
        }
    }

    /// Number of futures still tracked.
    pub fn outstanding(&self) -> usize {
        self.registry
            .lock()
            .events
            .as_ref()
            .map_or(0, |events| events.len())
    }

    /// Tear down the registry. Owning devices are expected to have completed their futures
    /// already; anything still outstanding is completed here with
    /// [`EventCompletionType::Shutdown`], in registration order.
    pub fn shut_down(&self) {
        let events = self.registry.lock().events.take();
        let Some(events) = events else {
            return;
        };

        if !events.is_empty() {
            warn!(
                outstanding = events.len(),
                "event manager shut down with outstanding futures; aborting them"
            );
        }
        let mut events: Vec<(FutureId, Arc<TrackedEvent>)> = events.into_iter().collect();
        events.sort_unstable_by_key(|(future_id, _)| *future_id);
        for (_, event) in events {
            event.ensure_complete(EventCompletionType::Shutdown);
        }
        debug!("event manager shut down");
    }

    /// Register `event` and return its future id.
    ///
    /// After shutdown an id is still issued, but nothing is tracked: the event is completed
    /// immediately with [`EventCompletionType::Shutdown`].
    pub fn track_event(&self, event: Arc<TrackedEvent>) -> FutureId {
        let (future_id, untracked) = {
            let mut registry = self.registry.lock();
            let future_id = FutureId(registry.next_future_id);
            registry.next_future_id += 1;
            match registry.events.as_mut() {
                Some(events) => {
                    trace!(%future_id, mode = ?event.callback_mode(), "tracking future");
                    events.insert(future_id, event);
                    (future_id, None)
                }
                None => (future_id, Some(event)),
            }
        };

        if let Some(event) = untracked {
            debug!(%future_id, "future tracked after shutdown");
            event.ensure_complete(EventCompletionType::Shutdown);
        }
        future_id
    }

    /// Complete, in order, every poll-mode or spontaneous future whose completion source is
    /// ready. Never blocks on the GPU or on signals.
    pub fn process_poll_events(&self) {
        let ready = {
            let _process_guard = self.process_event_lock.lock();

            let mut futures: Vec<TrackedFutureWaitInfo> = {
                let registry = self.registry.lock();
                let Some(events) = registry.events.as_ref() else {
                    return;
                };
                events
                    .iter()
                    .filter(|(_, event)| event.callback_mode() != CallbackMode::WaitAnyOnly)
                    .map(|(&future_id, event)| {
                        let event = WaitRef::acquire(Arc::clone(event));
                        TrackedFutureWaitInfo::new(future_id, event, 0)
                    })
                    .collect()
            };

            let wait_status = wait_impl(&mut futures, Duration::ZERO);
            if wait_status == WaitStatus::TimedOut {
                return;
            }
            debug_assert_eq!(WaitStatus::Success, wait_status);

            self.take_ready(futures)
        };

        trace!(ready = ready.len(), "completing polled futures");
        for info in &ready {
            info.event.ensure_complete(EventCompletionType::Ready);
        }
    }

    /// Wait for up to `timeout` for at least one of `infos` to complete, then complete every
    /// ready one in order and flag it in `infos`.
    ///
    /// A zero timeout only polls. A future that is no longer tracked counts as already
    /// completed: it is flagged and the call returns [`WaitStatus::Success`] without waiting.
    ///
    /// Passing an id this manager never issued, or waiting on one future from two threads at
    /// once, is a contract violation and panics in debug builds.
    pub fn wait_any(&self, infos: &mut [FutureWaitInfo], timeout: Duration) -> WaitStatus {
        if !timeout.is_zero() {
            if !self.timed_wait_any_enable {
                return WaitStatus::UnsupportedTimeout;
            }
            if infos.len() > self.timed_wait_any_max_count {
                return WaitStatus::UnsupportedCount;
            }
            // Mixed sources are rejected by the wait itself.
        }

        if infos.is_empty() {
            return WaitStatus::Success;
        }

        let ready = {
            let _process_guard = self.process_event_lock.lock();

            let mut futures = Vec::with_capacity(infos.len());
            let mut any_completed = false;
            {
                let registry = self.registry.lock();
                let first_invalid_future_id = registry.next_future_id;
                for (index, info) in infos.iter_mut().enumerate() {
                    let future_id = info.future;
                    debug_assert!(future_id.0 != 0, "waited on the null future id");
                    debug_assert!(
                        future_id.0 < first_invalid_future_id,
                        "waited on {} which was never issued",
                        future_id
                    );

                    match registry.events.as_ref().and_then(|events| events.get(&future_id)) {
                        Some(event) => {
                            info.completed = false;
                            futures.push(TrackedFutureWaitInfo::new(
                                future_id,
                                WaitRef::acquire(Arc::clone(event)),
                                index,
                            ));
                        }
                        None => {
                            info.completed = true;
                            any_completed = true;
                        }
                    }
                }
            }
            if any_completed {
                return WaitStatus::Success;
            }
            debug_assert_eq!(infos.len(), futures.len());

            let wait_status = wait_impl(&mut futures, timeout);
            if wait_status != WaitStatus::Success {
                debug!(?wait_status, futures = futures.len(), ?timeout, "wait_any returned early");
                return wait_status;
            }

            self.take_ready(futures)
        };

        for info in &ready {
            // Flag the caller's slot before the callback runs.
            infos[info.index_in_infos].completed = true;
            info.event.ensure_complete(EventCompletionType::Ready);
        }
        WaitStatus::Success
    }

    /// Orders the ready futures for their callbacks and untracks them, releasing the wait
    /// references of the rest. Must be called with the process lock held.
    fn take_ready(&self, mut futures: Vec<TrackedFutureWaitInfo>) -> Vec<TrackedFutureWaitInfo> {
        let ready_end = prepare_ready_callbacks(&mut futures);
        futures.truncate(ready_end);

        // Untrack before any callback runs. An id may already be gone if shutdown raced us.
        let mut registry = self.registry.lock();
        if let Some(events) = registry.events.as_mut() {
            for info in &futures {
                events.remove(&info.future_id);
            }
        }
        futures
    }
}

impl Default for EventManager {
    fn default() -> EventManager {
        EventManager::new()
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        self.shut_down();
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .field("timed_wait_any_enable", &self.timed_wait_any_enable)
            .field("timed_wait_any_max_count", &self.timed_wait_any_max_count)
            .finish()
    }
}
