//! Command supervision for the external issue-tracker CLI.
//!
//! ```text
//!  execute(cmd) ──> CircuitBreaker::admit ──x── CircuitOpen (never spawned)
//!                          │
//!                          v
//!                   CommandQueue::submit  (FIFO, max_concurrent slots)
//!                          │
//!                          v
//!                   spawn argv + timeout ──> record_success / record_failure
//!                          │
//!                          └──> SupervisorEvent + CommandMetrics
//! ```
//!
//! | Module     | Responsibility                                      |
//! |------------|-----------------------------------------------------|
//! | `types`    | `Command`, `CommandResult`, `CircuitState`, events  |
//! | `breaker`  | Closed / Open / HalfOpen state machine              |
//! | `queue`    | Bounded concurrency with FIFO hand-off              |
//! | `process`  | `ProcessSupervisor` composing the above             |
//! | `metrics`  | `commands.*` counters                               |

pub mod breaker;
pub mod metrics;
pub mod process;
pub mod queue;
pub mod types;

pub use breaker::{BreakerConfig, CircuitBreaker};
pub use metrics::{CommandMetrics, MetricsSnapshot};
pub use process::{ProcessSupervisor, SupervisorConfig};
pub use queue::{CommandQueue, QueueConfig};
pub use types::{CircuitState, Command, CommandOutcome, CommandResult, SupervisorEvent};
