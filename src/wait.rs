//! The wait algorithm shared by polling and `wait_any`.
//!
//! A batch of futures is partitioned by completion source: all system events form one group and
//! queue-serial events form one group per device. Each group is then polled or waited on with
//! the primitive appropriate to it, and the entries found complete are flagged `ready`.

use std::sync::Weak;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::event::{CompletionData, FutureId, WaitRef};
use crate::manager::WaitStatus;
use crate::queue::{DeviceError, DeviceId, ExecutionSerial, Queue};
use crate::signal::wait_any_system_event;

/// One future taking part in a poll or wait.
pub(crate) struct TrackedFutureWaitInfo {
    pub(crate) future_id: FutureId,
    pub(crate) event: WaitRef,
    /// Position of this future in the caller's `wait_any` list.
    pub(crate) index_in_infos: usize,
    pub(crate) ready: bool,
}

impl TrackedFutureWaitInfo {
    pub(crate) fn new(future_id: FutureId, event: WaitRef, index_in_infos: usize) -> Self {
        TrackedFutureWaitInfo {
            future_id,
            event,
            index_in_infos,
            ready: false,
        }
    }
}

/// Moves every element matching `pred` to the front, keeping their relative order. Returns the
/// number of matching elements.
fn partition<T, P>(items: &mut [T], mut pred: P) -> usize
where
    P: FnMut(&T) -> bool,
{
    let mut mid = 0;
    for i in 0..items.len() {
        if pred(&items[i]) {
            items.swap(mid, i);
            mid += 1;
        }
    }
    mid
}

/// Polls (zero `timeout`) or waits for up to `timeout` on `futures`, flagging completed entries
/// as ready.
///
/// An empty batch succeeds trivially. Blocking across more than one completion source is not
/// supported and yields [`WaitStatus::UnsupportedMixedSources`] before anything is waited on.
/// Otherwise returns [`WaitStatus::Success`] if at least one entry is ready, and
/// [`WaitStatus::TimedOut`] if none is.
pub(crate) fn wait_impl(futures: &mut [TrackedFutureWaitInfo], timeout: Duration) -> WaitStatus {
    if futures.is_empty() {
        return WaitStatus::Success;
    }

    let mut any_success = false;
    let mut begin = 0;

    while begin < futures.len() {
        let (wait_queue, mut lowest_wait_serial) = match futures[begin].event.completion_data() {
            CompletionData::System(_) => (None, ExecutionSerial::default()),
            CompletionData::QueueSerial(queue_and_serial) => (
                Some((queue_and_serial.device, queue_and_serial.queue.clone())),
                queue_and_serial.completion_serial,
            ),
        };
        let wait_device: Option<DeviceId> = wait_queue.as_ref().map(|(device, _)| *device);

        let matched = partition(&mut futures[begin + 1..], |info| {
            match info.event.completion_data() {
                CompletionData::System(_) => wait_device.is_none(),
                CompletionData::QueueSerial(queue_and_serial) => {
                    if Some(queue_and_serial.device) == wait_device {
                        lowest_wait_serial =
                            lowest_wait_serial.min(queue_and_serial.completion_serial);
                        true
                    } else {
                        false
                    }
                }
            }
        });
        let end = begin + 1 + matched;

        if end != futures.len() && !timeout.is_zero() {
            debug!(
                futures = futures.len(),
                "blocking wait across mixed completion sources is unsupported"
            );
            return WaitStatus::UnsupportedMixedSources;
        }

        let group = &mut futures[begin..end];
        let success = match wait_queue {
            Some((device, queue)) => {
                wait_queue_serials(device, &queue, lowest_wait_serial, group, timeout)
            }
            None => wait_system_events(group, timeout),
        };
        any_success |= success;

        begin = end;
    }

    if any_success {
        WaitStatus::Success
    } else {
        WaitStatus::TimedOut
    }
}

fn wait_system_events(group: &mut [TrackedFutureWaitInfo], timeout: Duration) -> bool {
    if timeout.is_zero() {
        let mut success = false;
        for info in group.iter_mut() {
            if let CompletionData::System(signal) = info.event.completion_data() {
                if signal.is_signaled() {
                    info.ready = true;
                    success = true;
                }
            }
        }
        return success;
    }

    let signals = group.iter_mut().filter_map(|info| {
        let ready = &mut info.ready;
        match info.event.completion_data() {
            CompletionData::System(signal) => Some((&**signal, ready)),
            CompletionData::QueueSerial(_) => None,
        }
    });
    wait_any_system_event(signals, timeout)
}

/// Polls or waits on one device's queue for the futures in `group`. `wait_serial` is the
/// lowest serial in the group, i.e. the serial after which at least one future is complete.
///
/// A device error or a dropped queue marks the whole group ready: errored futures must still
/// resolve, and the device reports the failure through its own lost state.
fn wait_queue_serials(
    device: DeviceId,
    queue: &Weak<dyn Queue>,
    wait_serial: ExecutionSerial,
    group: &mut [TrackedFutureWaitInfo],
    timeout: Duration,
) -> bool {
    let Some(queue) = queue.upgrade() else {
        warn!(%device, error = %DeviceError::QueueDropped, "completing futures of a dropped queue");
        mark_all_ready(group);
        return true;
    };

    match completed_serial_after_wait(&*queue, wait_serial, timeout) {
        Ok(completed_serial) => {
            trace!(%device, %wait_serial, %completed_serial, "polled queue serials");
            let mut success = false;
            for info in group.iter_mut() {
                if let CompletionData::QueueSerial(target) = info.event.completion_data() {
                    if target.completion_serial <= completed_serial {
                        info.ready = true;
                        success = true;
                    }
                }
            }
            success
        }
        Err(error) => {
            warn!(
                %device,
                %error,
                futures = group.len(),
                "device error while waiting; forcing completion"
            );
            queue.consume_error(error);
            mark_all_ready(group);
            true
        }
    }
}

fn completed_serial_after_wait(
    queue: &dyn Queue,
    wait_serial: ExecutionSerial,
    timeout: Duration,
) -> Result<ExecutionSerial, DeviceError> {
    if wait_serial > queue.last_submitted_serial() {
        // Not submitted yet: flush it now or it will never complete.
        queue.tick()?;
    }

    let mut completed_serial = queue.completed_serial();
    if completed_serial < wait_serial {
        if !timeout.is_zero() {
            let reached = queue.wait_for_serial(wait_serial, timeout)?;
            trace!(%wait_serial, reached, "waited on queue serial");
        }
        queue.check_passed_serials()?;
        completed_serial = queue.completed_serial();
    }
    Ok(completed_serial)
}

fn mark_all_ready(group: &mut [TrackedFutureWaitInfo]) {
    for info in group.iter_mut() {
        info.ready = true;
    }
}

/// Moves the ready futures to the front, in the order their callbacks must run, and returns how
/// many there are.
///
/// Callbacks of futures created earlier must run first: for a queue `q`, a work-done future
/// requested before another settles before it, and a buffer mapping requested before a
/// work-done future on the same device settles before it. Future ids are issued in creation
/// order, so ordering by id satisfies both rules.
pub(crate) fn prepare_ready_callbacks(futures: &mut [TrackedFutureWaitInfo]) -> usize {
    let ready_end = partition(futures, |info| info.ready);
    futures[..ready_end].sort_unstable_by_key(|info| info.future_id);
    ready_end
}

#[cfg(test)]
use crate::event::{CallbackMode, EventCompletionType, TrackedEvent};
#[cfg(test)]
use crate::signal::SystemEvent;
#[cfg(test)]
use std::sync::Arc;

#[cfg(test)]
fn system_info(raw_id: u64, signal: &Arc<SystemEvent>) -> TrackedFutureWaitInfo {
    let event = TrackedEvent::from_system_event(CallbackMode::PollOnly, Arc::clone(signal), |_| {});
    // The tests only look at readiness; mark the record done so it can be dropped.
    event.ensure_complete(EventCompletionType::Ready);
    TrackedFutureWaitInfo::new(FutureId(raw_id), WaitRef::acquire(event), 0)
}

#[test]
fn partition_keeps_matching_order() {
    let mut items = [5, 2, 8, 1, 4, 7];
    let mid = partition(&mut items, |x| x % 2 == 0);
    assert_eq!(3, mid);
    assert_eq!([2, 8, 4], items[..mid]);
}

#[test]
fn empty_batch_succeeds() {
    assert_eq!(WaitStatus::Success, wait_impl(&mut [], Duration::ZERO));
    assert_eq!(WaitStatus::Success, wait_impl(&mut [], Duration::from_millis(5)));
}

#[test]
fn poll_only_flags_signaled_entries() {
    let set = SystemEvent::create_signaled();
    let unset = Arc::new(SystemEvent::default());
    let mut futures = vec![system_info(1, &unset), system_info(2, &set), system_info(3, &unset)];

    assert_eq!(WaitStatus::Success, wait_impl(&mut futures, Duration::ZERO));
    let ready: Vec<(u64, bool)> = futures.iter().map(|f| (f.future_id.0, f.ready)).collect();
    assert_eq!(vec![(1, false), (2, true), (3, false)], ready);
}

#[test]
fn nothing_ready_times_out() {
    let unset = Arc::new(SystemEvent::default());
    let mut futures = vec![system_info(1, &unset)];
    assert_eq!(WaitStatus::TimedOut, wait_impl(&mut futures, Duration::ZERO));
    assert_eq!(WaitStatus::TimedOut, wait_impl(&mut futures, Duration::from_millis(5)));
}

#[test]
fn ready_callbacks_are_sorted_by_id() {
    let unset = Arc::new(SystemEvent::default());
    let mut futures: Vec<TrackedFutureWaitInfo> =
        [9, 3, 7, 5, 1].iter().map(|&id| system_info(id, &unset)).collect();
    for info in futures.iter_mut() {
        info.ready = info.future_id.0 != 7;
    }

    let ready_end = prepare_ready_callbacks(&mut futures);
    let order: Vec<u64> = futures[..ready_end].iter().map(|f| f.future_id.0).collect();
    assert_eq!(vec![1, 3, 5, 9], order);
    assert_eq!(7, futures[ready_end].future_id.0);
}
