//! Bounded-concurrency FIFO queue for external commands.
//!
//! At most `max_concurrent` commands hold a slot at once. Everything else
//! waits in submission order; a finishing command hands its slot directly
//! to the oldest waiter so no later submission can overtake it.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use super::types::{Command, CommandResult};
use crate::errors::SupervisorError;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub max_concurrent: usize,
    /// Waiting entries allowed before `submit` fails with `QueueFull`.
    /// `None` leaves the wait list unbounded.
    pub max_queue_depth: Option<usize>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_depth: None,
        }
    }
}

type Admission = Result<(Command, Slot), SupervisorError>;

struct QueueEntry {
    command: Command,
    enqueued_at: Instant,
    ready: oneshot::Sender<Admission>,
}

#[derive(Default)]
struct QueueState {
    active: usize,
    waiting: VecDeque<QueueEntry>,
}

struct Shared {
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A held concurrency slot. Dropping it passes the slot on to the next
/// waiter, or frees it when nobody is waiting.
pub(crate) struct Slot {
    shared: Arc<Shared>,
    armed: bool,
}

impl Slot {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if self.armed {
            release(&self.shared);
        }
    }
}

fn release(shared: &Arc<Shared>) {
    let mut state = shared.lock();
    while let Some(entry) = state.waiting.pop_front() {
        let slot = Slot {
            shared: Arc::clone(shared),
            armed: true,
        };
        tracing::debug!(
            binary = %entry.command.binary,
            waited_ms = entry.enqueued_at.elapsed().as_millis() as u64,
            "handing slot to queued command"
        );
        match entry.ready.send(Ok((entry.command, slot))) {
            Ok(()) => return,
            // Waiter went away; try the next one. Disarm so dropping the
            // returned slot does not re-enter this lock.
            Err(Ok((_, slot))) => slot.disarm(),
            Err(Err(_)) => {}
        }
    }
    state.active = state.active.saturating_sub(1);
}

pub struct CommandQueue {
    config: QueueConfig,
    shared: Arc<Shared>,
}

impl CommandQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Run `run` once a slot is available, returning its result.
    ///
    /// `run` receives the command and how long it waited in the queue.
    pub async fn submit<F, Fut>(
        &self,
        command: Command,
        run: F,
    ) -> Result<CommandResult, SupervisorError>
    where
        F: FnOnce(Command, Duration) -> Fut,
        Fut: Future<Output = Result<CommandResult, SupervisorError>>,
    {
        let submitted_at = Instant::now();
        let (command, _slot) = self.acquire(command).await?;
        run(command, submitted_at.elapsed()).await
    }

    async fn acquire(&self, command: Command) -> Admission {
        let ready = {
            let mut state = self.shared.lock();
            if state.active < self.config.max_concurrent {
                state.active += 1;
                return Ok((
                    command,
                    Slot {
                        shared: Arc::clone(&self.shared),
                        armed: true,
                    },
                ));
            }
            if let Some(max_depth) = self.config.max_queue_depth
                && state.waiting.len() >= max_depth
            {
                return Err(SupervisorError::QueueFull {
                    depth: state.waiting.len(),
                });
            }
            let (tx, rx) = oneshot::channel();
            state.waiting.push_back(QueueEntry {
                command,
                enqueued_at: Instant::now(),
                ready: tx,
            });
            rx
        };

        ready.await.unwrap_or_else(|_| {
            Err(SupervisorError::Cancelled {
                reason: "queue dropped".to_string(),
            })
        })
    }

    /// Reject every waiting entry with `Cancelled { reason }`. Commands that
    /// already hold a slot keep running. Returns the number cancelled.
    pub fn clear(&self, reason: &str) -> usize {
        let drained: Vec<QueueEntry> = self.shared.lock().waiting.drain(..).collect();
        let cancelled = drained.len();
        for entry in drained {
            let _ = entry.ready.send(Err(SupervisorError::Cancelled {
                reason: reason.to_string(),
            }));
        }
        if cancelled > 0 {
            tracing::info!(cancelled, reason, "cleared command queue");
        }
        cancelled
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    pub fn queued_count(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }
}
