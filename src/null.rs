//! A software queue that executes nothing and completes work on the next tick.
//!
//! `NullQueue` follows the serial bookkeeping of a real backend: recorded work is assigned
//! [`NullQueue::pending_serial()`], a tick first retires everything already submitted and then
//! submits the pending serial. It can also be put into a lost state to exercise the error path.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::event::{CallbackMode, EventCompletionType, FutureId, TrackedEvent};
use crate::manager::EventManager;
use crate::queue::{DeviceError, DeviceId, ExecutionSerial, Queue};

#[derive(Debug, Default)]
struct Serials {
    completed: u64,
    last_submitted: u64,
    lost: bool,
}

#[derive(Debug)]
pub struct NullQueue {
    device: DeviceId,
    serials: Mutex<Serials>,
}

impl NullQueue {
    /// A queue on a freshly allocated device.
    pub fn new() -> Arc<NullQueue> {
        NullQueue::with_device(DeviceId::next())
    }

    pub fn with_device(device: DeviceId) -> Arc<NullQueue> {
        Arc::new(NullQueue {
            device,
            serials: Mutex::new(Serials::default()),
        })
    }

    /// The serial that work recorded now completes at.
    pub fn pending_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.serials.lock().last_submitted + 1)
    }

    /// Lose the device. Every later tick or wait fails with [`DeviceError::Lost`].
    pub fn lose(&self) {
        let mut serials = self.serials.lock();
        if !serials.lost {
            warn!(device = %self.device, "null device lost");
            serials.lost = true;
        }
    }

    pub fn is_lost(&self) -> bool {
        self.serials.lock().lost
    }

    /// Register a future that completes once all work recorded so far has executed.
    pub fn on_submitted_work_done<F>(
        self: &Arc<Self>,
        manager: &EventManager,
        mode: CallbackMode,
        callback: F,
    ) -> FutureId
    where
        F: FnOnce(EventCompletionType) + Send + 'static,
    {
        let serial = self.pending_serial();
        let future_id =
            manager.track_event(TrackedEvent::from_queue_serial(mode, self, serial, callback));
        debug!(device = %self.device, %future_id, %serial, "work done future requested");
        future_id
    }

    fn check_not_lost(serials: &Serials) -> Result<(), DeviceError> {
        if serials.lost {
            Err(DeviceError::Lost)
        } else {
            Ok(())
        }
    }
}

impl Queue for NullQueue {
    fn device_id(&self) -> DeviceId {
        self.device
    }

    fn completed_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.serials.lock().completed)
    }

    fn last_submitted_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.serials.lock().last_submitted)
    }

    fn tick(&self) -> Result<(), DeviceError> {
        let mut serials = self.serials.lock();
        NullQueue::check_not_lost(&serials)?;
        serials.completed = serials.last_submitted;
        serials.last_submitted += 1;
        Ok(())
    }

    fn check_passed_serials(&self) -> Result<(), DeviceError> {
        let mut serials = self.serials.lock();
        NullQueue::check_not_lost(&serials)?;
        serials.completed = serials.last_submitted;
        Ok(())
    }

    fn wait_for_serial(
        &self,
        serial: ExecutionSerial,
        _timeout: Duration,
    ) -> Result<bool, DeviceError> {
        // Nothing executes asynchronously, so anything submitted is already done.
        let mut serials = self.serials.lock();
        NullQueue::check_not_lost(&serials)?;
        serials.completed = serials.last_submitted;
        Ok(serial.0 <= serials.completed)
    }

    fn consume_error(&self, error: DeviceError) {
        warn!(device = %self.device, %error, "null queue consumed error");
        self.lose();
    }
}

#[cfg(test)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn tick_retires_then_submits() {
    let queue = NullQueue::new();
    assert_eq!(ExecutionSerial(1), queue.pending_serial());

    queue.tick().unwrap();
    assert_eq!(ExecutionSerial(1), queue.last_submitted_serial());
    assert_eq!(ExecutionSerial(0), queue.completed_serial());

    queue.check_passed_serials().unwrap();
    assert_eq!(ExecutionSerial(1), queue.completed_serial());
    assert_eq!(ExecutionSerial(2), queue.pending_serial());
}

#[test]
fn lost_queue_fails_every_operation() {
    let queue = NullQueue::new();
    queue.lose();
    assert_eq!(true, queue.is_lost());
    assert_eq!(Err(DeviceError::Lost), queue.tick());
    assert_eq!(Err(DeviceError::Lost), queue.check_passed_serials());
    assert_eq!(
        Err(DeviceError::Lost),
        queue.wait_for_serial(ExecutionSerial(1), Duration::ZERO)
    );
}

#[test]
fn work_done_completes_on_poll() {
    let manager = EventManager::new();
    let queue = NullQueue::new();
    let count = Arc::new(AtomicUsize::new(0));

    let future = {
        let count = Arc::clone(&count);
        queue.on_submitted_work_done(&manager, CallbackMode::PollOnly, move |kind| {
            assert_eq!(EventCompletionType::Ready, kind);
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert_eq!(1, manager.outstanding());

    manager.process_poll_events();
    assert_eq!(1, count.load(Ordering::SeqCst));
    assert_eq!(0, manager.outstanding());
    assert_eq!(1, future.get());
}

#[test]
fn lost_device_forces_completion() {
    let manager = EventManager::new();
    let queue = NullQueue::new();
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..3 {
        let count = Arc::clone(&count);
        queue.on_submitted_work_done(&manager, CallbackMode::PollOnly, move |kind| {
            assert_eq!(EventCompletionType::Ready, kind);
            count.fetch_add(1, Ordering::SeqCst);
        });
    }
    queue.lose();

    manager.process_poll_events();
    assert_eq!(3, count.load(Ordering::SeqCst));
    assert_eq!(0, manager.outstanding());
}
