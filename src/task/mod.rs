//! Task Protocol
//!
//! A [`Task`] is the client-side handle of one logical job. It forks
//! sub-tasks onto the queue service, observes them through the result store,
//! and removes them once their results have been consumed.
//!
//! ## Lifecycle of a sub-task
//! 1. **fork**: the next sub-task id is allocated locally, then a `waiting`
//!    record is stored and queued in one service call.
//! 2. **execution**: a worker moves it to `running`, then to `ready` or `error`.
//! 3. **join**: the handle polls the store until a terminal status appears.
//!    Joins never fail on timeout; they report the last status seen.
//! 4. **kill**: always joins first, then pops the record and deletes any
//!    file-transport payload. A running sub-task is never discarded.
//!
//! Dropping the last clone of a handle kills whatever it still owns.

mod handle;

pub use handle::Task;

#[cfg(test)]
mod tests;
