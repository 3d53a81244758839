//! `gpuevents` tracks the futures a GPU API hands out (queue work-done notifications, buffer
//! mappings, dispatch completion) and completes them with their callbacks in the order the API
//! requires.
//!
//! Every pending operation is a [`TrackedEvent`] registered with an [`EventManager`], which
//! returns an opaque [`FutureId`]. An event completes when its completion source does: either a
//! [`SystemEvent`] becoming signalled, or a [`Queue`] passing an [`ExecutionSerial`]. Callers
//! drive completion either by polling ([`EventManager::process_poll_events()`]) or by waiting
//! on a list of futures with an optional timeout ([`EventManager::wait_any()`]). In both cases,
//! callbacks of futures that become ready together run in registration order.
//!
//! The [`null`] module provides a software queue that completes work on its next tick, and
//! [`Instance`] bundles an event manager with the queues an event loop should tick.

mod event;
mod instance;
mod manager;
pub mod null;
mod queue;
mod signal;
mod wait;

pub use event::{
    CallbackMode, CompletionData, EventCompletionType, FutureId, QueueAndSerial, TrackedEvent,
    WaitRef,
};
pub use instance::Instance;
pub use manager::{
    EventManager, EventManagerDescriptor, EventManagerError, FutureWaitInfo, ManagerState,
    WaitStatus, TIMED_WAIT_ANY_MAX_COUNT_DEFAULT,
};
pub use queue::{DeviceError, DeviceId, ExecutionSerial, Queue};
pub use signal::{wait_any_system_event, SystemEvent};

#[cfg(test)]
mod tests;
