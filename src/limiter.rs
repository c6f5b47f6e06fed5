//! A single admission-controlled queue.
//!
//! Jobs wait in FIFO order and the head job starts once all of these hold: a concurrency slot is
//! free, `min_time` has passed since the previous start, and one unit can be taken from the
//! reservoir. Admission is attempted when a job arrives, when a running job completes, and when
//! the background ticker reaches the next refill or spacing deadline.
//!
//! A started job goes to the next stage: the chained parent limiter if there is one, otherwise its
//! own work (the external send). Jobs reach the parent's queue in the order they were admitted
//! here. The limiter's slot is held until that stage reports back, so a chained job counts against
//! every limiter on the way for its whole flight. There is no timeout: a send that never
//! completes keeps its slot forever.
//!
//! Completions never run inside `submit`; a rejected job is completed from a spawned task.

use crate::clock::{Clock, TokioClock};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, ThrottlerError, ThrottlerResult};
use crate::job::{BoxFuture, Job, JobHandle, JobId, JobParts, JobResult};
use crate::reservoir::Reservoir;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};
use validator::Validate;

/// Notifications a limiter sends to its listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum LimiterEvent {
    /// A job was rejected at submit time because the backlog ceiling was reached.
    Dropped {
        limiter: String,
        job_id: JobId,
        key: String,
    },
    /// An internal fault, not tied to a caller's mistake.
    Error { limiter: String, error: LimiterError },
}

type Listener = Arc<dyn Fn(&LimiterEvent) + Send + Sync>;

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterCounts {
    pub queued: usize,
    pub running: usize,
    pub done: u64,
    pub remaining: u64,
}

/// Cheap to clone; all clones share one queue and reservoir.
#[derive(Clone)]
pub struct Limiter {
    shared: Arc<Shared>,
}

struct Shared {
    name: String,
    max_concurrent: Option<usize>,
    min_time: Duration,
    max_queued: Option<usize>,
    clock: Arc<dyn Clock>,
    runtime: Handle,
    state: Mutex<State>,
    /// Held from admission until every admitted job has been handed to its next stage.
    dispatching: Mutex<()>,
    parent: RwLock<Option<Weak<Shared>>>,
    listeners: RwLock<Vec<Listener>>,
    wake: Arc<Notify>,
}

struct State {
    reservoir: Reservoir,
    queue: VecDeque<Job>,
    running: usize,
    done: u64,
    last_start: Option<Instant>,
}

/// Where an admitted job goes next.
enum Stage {
    Execute,
    Forward(Limiter),
    Orphaned,
}

impl Limiter {
    /// Create a limiter on the Tokio clock. Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, config: &LimiterConfig) -> ThrottlerResult<Self> {
        Self::with_clock(name, config, Arc::new(TokioClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: &LimiterConfig,
        clock: Arc<dyn Clock>,
    ) -> ThrottlerResult<Self> {
        let name = name.into();
        config.validate()?;
        let runtime = Handle::try_current().map_err(|e| {
            ThrottlerError::Runtime(format!("limiter '{}' needs a Tokio runtime: {}", name, e))
        })?;

        let reservoir = Reservoir::new(
            config.calls_per_window,
            config.effective_refill_amount(),
            config.window,
            clock.now(),
        );

        let shared = Arc::new(Shared {
            name,
            max_concurrent: config.max_concurrent,
            min_time: config.min_time,
            max_queued: config.max_queued,
            clock: Arc::clone(&clock),
            runtime: runtime.clone(),
            state: Mutex::new(State {
                reservoir,
                queue: VecDeque::new(),
                running: 0,
                done: 0,
                last_start: None,
            }),
            dispatching: Mutex::new(()),
            parent: RwLock::new(None),
            listeners: RwLock::new(Vec::new()),
            wake: Arc::new(Notify::new()),
        });

        runtime.spawn(ticker(Arc::downgrade(&shared), Arc::clone(&shared.wake), clock));

        Ok(Self { shared })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Enqueue a job. Never blocks; the job's completion is called exactly once.
    ///
    /// If a drop ceiling is configured and the backlog has reached it, a [`LimiterEvent::Dropped`]
    /// is emitted before this returns and the job is then completed with
    /// [`ThrottlerError::Dropped`] from a spawned task.
    pub fn submit(&self, mut job: Job) {
        let shared = &self.shared;
        job.stamp(shared.clock.now());

        let mut state = match shared.lock_state() {
            Ok(state) => state,
            Err(error) => {
                shared.emit_error(error.clone());
                shared.reject_later(job, error.into());
                return;
            }
        };

        if let Some(ceiling) = shared.max_queued {
            if state.queue.len() + state.running >= ceiling {
                drop(state);
                warn!(
                    limiter = %shared.name,
                    job_id = %job.id(),
                    key = %job.key(),
                    ceiling,
                    "Backlog ceiling reached, dropping job"
                );
                shared.emit(&LimiterEvent::Dropped {
                    limiter: shared.name.clone(),
                    job_id: job.id(),
                    key: job.key().to_string(),
                });
                let error = ThrottlerError::Dropped {
                    job_id: job.id(),
                    limiter: shared.name.clone(),
                    ceiling,
                };
                shared.reject_later(job, error);
                return;
            }
        }

        debug!(
            limiter = %shared.name,
            job_id = %job.id(),
            key = %job.key(),
            queued = state.queue.len() + 1,
            running = state.running,
            "Job queued"
        );
        state.queue.push_back(job);
        drop(state);

        shared.pump();
        shared.wake.notify_one();
    }

    /// Enqueue `work` under `key` and get a handle to its result.
    pub fn schedule<W, F>(&self, key: impl Into<String>, work: W) -> JobHandle
    where
        W: FnOnce() -> F + Send + 'static,
        F: Future<Output = JobResult> + Send + 'static,
    {
        let (job, handle) = Job::with_handle(key, work);
        self.submit(job);
        handle
    }

    /// Send admitted jobs to `parent` instead of running them here.
    ///
    /// Only a weak reference is kept, so the parent's owner controls its lifetime. Chains must stay
    /// acyclic.
    pub fn chain(&self, parent: &Limiter) -> ThrottlerResult<()> {
        let mut ancestor = Some(Arc::clone(&parent.shared));
        while let Some(current) = ancestor {
            if Arc::ptr_eq(&current, &self.shared) {
                return Err(ThrottlerError::Validation(format!(
                    "chaining limiter '{}' to '{}' would create a cycle",
                    self.shared.name, parent.shared.name
                )));
            }
            ancestor = current.parent_shared();
        }

        *self
            .shared
            .parent
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::downgrade(&parent.shared));
        debug!(limiter = %self.shared.name, parent = %parent.shared.name, "Limiter chained");
        Ok(())
    }

    pub fn is_chained(&self) -> bool {
        self.shared
            .parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Register a listener for dropped jobs and internal errors.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&LimiterEvent) + Send + Sync + 'static,
    {
        self.shared
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    pub fn counts(&self) -> ThrottlerResult<LimiterCounts> {
        let now = self.shared.clock.now();
        let mut state = self.shared.lock_state()?;
        state.reservoir.tick(now);
        Ok(LimiterCounts {
            queued: state.queue.len(),
            running: state.running,
            done: state.done,
            remaining: state.reservoir.remaining(),
        })
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.shared.name)
            .field("max_concurrent", &self.shared.max_concurrent)
            .field("min_time", &self.shared.min_time)
            .field("max_queued", &self.shared.max_queued)
            .field("chained", &self.is_chained())
            .finish()
    }
}

impl Shared {
    fn lock_state(&self) -> Result<MutexGuard<'_, State>, LimiterError> {
        self.state
            .lock()
            .map_err(|_| LimiterError::Poisoned(self.name.clone()))
    }

    fn parent_shared(&self) -> Option<Arc<Shared>> {
        self.parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn next_stage(&self) -> Stage {
        match self
            .parent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            None => Stage::Execute,
            Some(weak) => match weak.upgrade() {
                Some(shared) => Stage::Forward(Limiter { shared }),
                None => Stage::Orphaned,
            },
        }
    }

    fn emit(&self, event: &LimiterEvent) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }

    fn emit_error(&self, error: LimiterError) {
        self.emit(&LimiterEvent::Error {
            limiter: self.name.clone(),
            error,
        });
    }

    fn reject_later(&self, job: Job, error: ThrottlerError) {
        self.runtime.spawn(async move { job.reject(error) });
    }

    /// Start every job that can start now. Returns when admission should be retried, if a timed
    /// condition (refill or spacing) is what holds the head job back.
    fn pump(self: &Arc<Self>) -> Option<Instant> {
        let _order = self
            .dispatching
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let now = self.clock.now();
        let (started, next_wake) = match self.lock_state() {
            Ok(mut state) => state.admit(now, self.max_concurrent, self.min_time),
            Err(error) => {
                self.emit_error(error);
                return None;
            }
        };

        for job in started {
            self.dispatch(job);
        }
        next_wake
    }

    fn dispatch(self: &Arc<Self>, job: Job) {
        debug!(
            limiter = %self.name,
            job_id = %job.id(),
            key = %job.key(),
            waited_ms = self.clock.now().saturating_duration_since(job.submitted_at()).as_millis() as u64,
            "Job admitted"
        );

        let (parts, done) = job.into_parts();
        let outcome: BoxFuture<JobResult> = match self.next_stage() {
            Stage::Execute => {
                let this = Arc::clone(self);
                Box::pin(async move { this.execute(parts).await })
            }
            Stage::Forward(parent) => {
                // Submitted here, not in the task, so the parent queues jobs in admission order.
                let (job, handle) = parts.into_handled_job();
                parent.submit(job);
                let this = Arc::clone(self);
                Box::pin(async move { this.await_parent(handle).await })
            }
            Stage::Orphaned => {
                let error = LimiterError::ParentGone(self.name.clone());
                self.emit_error(error.clone());
                let result: JobResult = Err(error.into());
                Box::pin(async move { result })
            }
        };

        let this = Arc::clone(self);
        self.runtime.spawn(async move {
            let result = outcome.await;
            this.finish();
            done(result);
        });
    }

    async fn execute(&self, parts: JobParts) -> JobResult {
        let job_id = parts.id;
        match self.runtime.spawn(parts.run()).await {
            Ok(result) => result,
            Err(e) => {
                let error = if e.is_panic() {
                    LimiterError::JobPanicked {
                        limiter: self.name.clone(),
                        job_id,
                    }
                } else {
                    LimiterError::Abandoned(job_id)
                };
                self.emit_error(error.clone());
                Err(error.into())
            }
        }
    }

    /// Completes only after the parent has completed the job.
    async fn await_parent(&self, handle: JobHandle) -> JobResult {
        let result = handle.await;

        if let Err(ThrottlerError::Limiter(error)) = &result {
            self.emit_error(error.clone());
        }
        result
    }

    fn finish(self: &Arc<Self>) {
        match self.lock_state() {
            Ok(mut state) => {
                debug_assert!(
                    state.running > 0,
                    "limiter '{}' finished more jobs than it started",
                    self.name
                );
                state.running = state.running.saturating_sub(1);
                state.done += 1;
            }
            Err(error) => self.emit_error(error),
        }
        self.pump();
        self.wake.notify_one();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Let the ticker observe that the limiter is gone.
        self.wake.notify_one();
    }
}

impl State {
    fn admit(
        &mut self,
        now: Instant,
        max_concurrent: Option<usize>,
        min_time: Duration,
    ) -> (Vec<Job>, Option<Instant>) {
        self.reservoir.tick(now);

        let mut started = Vec::new();
        let next_wake = loop {
            if self.queue.is_empty() {
                break None;
            }
            if max_concurrent.is_some_and(|max| self.running >= max) {
                // A completion will retry.
                break None;
            }
            if let Some(last) = self.last_start {
                let ready_at = last + min_time;
                if now < ready_at {
                    break Some(ready_at);
                }
            }
            if !self.reservoir.consume(1) {
                break Some(self.reservoir.next_refill_at());
            }
            if let Some(job) = self.queue.pop_front() {
                self.running += 1;
                self.last_start = Some(now);
                started.push(job);
            }
        };

        (started, next_wake)
    }
}

/// Retries admission at refill and spacing deadlines. Exits once the limiter is dropped.
async fn ticker(shared: Weak<Shared>, wake: Arc<Notify>, clock: Arc<dyn Clock>) {
    loop {
        let next_wake = match shared.upgrade() {
            Some(shared) => shared.pump(),
            None => return,
        };

        match next_wake {
            Some(deadline) => {
                tokio::select! {
                    _ = clock.sleep_until(deadline) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
}
