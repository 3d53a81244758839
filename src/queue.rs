//! The interface a GPU queue exposes to the event manager.
//!
//! The event manager never owns queues. Queue-serial futures hold a [`std::sync::Weak`]
//! reference, and a queue dropped while such futures are outstanding is treated the same as a
//! lost device: the futures are forced to complete.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A monotonically increasing serial assigned to queue submissions. A submission is complete
/// once the queue's completed serial reaches or exceeds it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutionSerial(pub u64);

impl fmt::Display for ExecutionSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifies the device a queue belongs to. Queue-serial futures are grouped by device when
/// waited on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u64);

impl DeviceId {
    /// Allocate a process-wide unique device id.
    pub fn next() -> DeviceId {
        static NEXT_DEVICE_ID: AtomicU64 = AtomicU64::new(1);
        DeviceId(NEXT_DEVICE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device#{}", self.0)
    }
}

/// Errors a queue can raise while flushing, ticking or waiting.
///
/// These never reach API callers through the wait path: futures affected by a device error are
/// completed anyway and the device's own lost state is how the failure becomes visible.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("device lost")]
    Lost,
    #[error("queue was dropped while futures on it were still pending")]
    QueueDropped,
    #[error("submit failed: {0}")]
    SubmitFailed(String),
    #[error("internal device error: {0}")]
    Internal(String),
}

/// A GPU queue as seen by the event manager.
///
/// Implementations must be internally synchronized: the wait algorithm calls into the queue
/// from whichever thread is polling or waiting.
pub trait Queue: Send + Sync {
    /// The device this queue belongs to.
    fn device_id(&self) -> DeviceId;

    /// The highest serial known to have completed on the GPU.
    fn completed_serial(&self) -> ExecutionSerial;

    /// The highest serial that has been submitted to the GPU.
    fn last_submitted_serial(&self) -> ExecutionSerial;

    /// Flush pending commands and tick the device, so that work recorded up to now is
    /// submitted and its serial becomes at most [`Queue::last_submitted_serial()`].
    fn tick(&self) -> Result<(), DeviceError>;

    /// Refresh [`Queue::completed_serial()`] from the GPU.
    fn check_passed_serials(&self) -> Result<(), DeviceError>;

    /// Block for up to `timeout` waiting for `serial` to complete. Returns whether it did.
    fn wait_for_serial(&self, serial: ExecutionSerial, timeout: Duration)
        -> Result<bool, DeviceError>;

    /// Take ownership of an error raised by this queue during a wait. Devices override this to
    /// transition into their lost state.
    fn consume_error(&self, error: DeviceError) {
        tracing::warn!(device = %self.device_id(), %error, "queue error during wait");
    }
}
