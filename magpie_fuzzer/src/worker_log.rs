//! Per-worker logging. Workers tag every line with their id so
//! interleaved output stays readable.

use std::cell::Cell;

thread_local! {
    static WORKER_ID: Cell<u64> = Cell::new(0);
}

#[inline]
pub fn set_worker_id(id: u64) {
    WORKER_ID.with(|r| r.set(id));
}

#[inline]
pub fn worker_id() -> u64 {
    WORKER_ID.with(|r| r.get())
}

#[macro_export]
macro_rules! worker_trace {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (
        log::trace!(std::concat!("worker-{}: ", $fmt), $crate::worker_log::worker_id() $(, $arg)*)
    )
}

#[macro_export]
macro_rules! worker_info {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (
        log::info!(std::concat!("worker-{}: ", $fmt), $crate::worker_log::worker_id() $(, $arg)*)
    )
}

#[macro_export]
macro_rules! worker_warn {
    ($fmt:literal $(, $arg:expr)* $(,)?) => (
        log::warn!(std::concat!("worker-{}: ", $fmt), $crate::worker_log::worker_id() $(, $arg)*)
    )
}
