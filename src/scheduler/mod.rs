//! Task scheduling: the priority queue, the single worker, interval timers,
//! the schedule triggers and the drift watchdog.

pub mod queue;
pub mod runner;
pub mod tasks;
pub mod timer;
pub mod triggers;
pub mod watchdog;

pub use queue::TaskQueue;
pub use runner::{RunHistory, TaskContext, TaskRunOutcome, TaskRunRecord, Worker};
pub use tasks::{TaskKind, TaskRecord};
pub use timer::{JobOptions, TimerRegistry, TokioTimerRegistry};
pub use triggers::{TickOutcome, Triggers};
pub use watchdog::{Watchdog, WatchdogAction};
