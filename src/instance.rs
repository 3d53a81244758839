//! An instance: the owner of an event manager and the queues it drives.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::warn;

use crate::manager::{
    EventManager, EventManagerDescriptor, EventManagerError, FutureWaitInfo, WaitStatus,
};
use crate::queue::Queue;

/// Groups the queues created under one instance with the [`EventManager`] their futures are
/// tracked by, so that an event loop can advance all of them with a single
/// [`Instance::process_events()`] call.
pub struct Instance {
    event_manager: EventManager,
    queues: Mutex<Vec<Weak<dyn Queue>>>,
}

impl Instance {
    pub fn new(descriptor: Option<&EventManagerDescriptor>) -> Result<Instance, EventManagerError> {
        let mut event_manager = EventManager::new();
        event_manager.initialize(descriptor)?;
        Ok(Instance {
            event_manager,
            queues: Mutex::new(Vec::new()),
        })
    }

    pub fn event_manager(&self) -> &EventManager {
        &self.event_manager
    }

    /// Have [`Instance::process_events()`] tick `queue` for as long as it is alive.
    pub fn add_queue<Q: Queue + 'static>(&self, queue: &Arc<Q>) {
        let queue: Weak<dyn Queue> = Arc::downgrade(queue) as Weak<Q>;
        self.queues.lock().push(queue);
    }

    /// Tick every live queue, then complete every ready poll-mode future.
    pub fn process_events(&self) {
        let queues: Vec<Arc<dyn Queue>> = {
            let mut queues = self.queues.lock();
            queues.retain(|queue| queue.strong_count() > 0);
            queues.iter().filter_map(|queue| queue.upgrade()).collect()
        };

        for queue in queues {
            if let Err(error) = queue.tick() {
                warn!(device = %queue.device_id(), %error, "tick failed while processing events");
                queue.consume_error(error);
            }
        }

        self.event_manager.process_poll_events();
    }

    pub fn wait_any(&self, infos: &mut [FutureWaitInfo], timeout: Duration) -> WaitStatus {
        self.event_manager.wait_any(infos, timeout)
    }
}

#[cfg(test)]
use crate::event::{CallbackMode, EventCompletionType};
#[cfg(test)]
use crate::null::NullQueue;
#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn process_events_ticks_queues() {
    let instance = Instance::new(None).unwrap();
    let queue = NullQueue::new();
    instance.add_queue(&queue);
    let count = Arc::new(AtomicUsize::new(0));

    {
        let count = Arc::clone(&count);
        queue.on_submitted_work_done(instance.event_manager(), CallbackMode::PollOnly, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        });
    }

    instance.process_events();
    assert_eq!(1, count.load(Ordering::SeqCst));
    assert_eq!(0, instance.event_manager().outstanding());
}

#[test]
fn dropped_queues_are_forgotten() {
    let instance = Instance::new(None).unwrap();
    let queue = NullQueue::new();
    instance.add_queue(&queue);
    drop(queue);

    instance.process_events();
    assert!(instance.queues.lock().is_empty());
}

#[test]
fn failing_tick_loses_device() {
    let instance = Instance::new(None).unwrap();
    let queue = NullQueue::new();
    instance.add_queue(&queue);
    queue.lose();

    let kinds = Arc::new(Mutex::new(Vec::new()));
    {
        let kinds = Arc::clone(&kinds);
        queue.on_submitted_work_done(
            instance.event_manager(),
            CallbackMode::AllowSpontaneous,
            move |kind| kinds.lock().push(kind),
        );
    }

    instance.process_events();
    assert_eq!(vec![EventCompletionType::Ready], *kinds.lock());
}

#[test]
fn rejects_oversized_descriptor() {
    let descriptor = EventManagerDescriptor {
        timed_wait_any_enable: true,
        timed_wait_any_max_count: 1000,
    };
    assert!(matches!(
        Instance::new(Some(&descriptor)),
        Err(EventManagerError::UnsupportedTimedWaitAnyMaxCount { requested: 1000, .. })
    ));
}
