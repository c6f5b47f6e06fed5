use crate::error::{LimiterError, ThrottlerError, ThrottlerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

pub type JobId = Uuid;
pub type JobResult = ThrottlerResult<SendResponse>;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Work = Box<dyn FnOnce() -> BoxFuture<JobResult> + Send + 'static>;
type Completion = Box<dyn FnOnce(JobResult) + Send + 'static>;

/// An outbound message. The throttling core never looks inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmsMessage {
    pub from: String,
    pub to: String,
    pub text: String,
}

impl SmsMessage {
    pub fn new(from: impl Into<String>, to: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            text: text.into(),
        }
    }
}

/// What the provider returned for a successful send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    pub id: String,
    /// Raw provider payload for debugging / audit.
    pub raw: serde_json::Value,
}

/// A unit of work waiting in, or running on, a limiter.
///
/// `work` produces the job's result once every limiter has admitted it. `done` is called exactly
/// once with that result, or with the error that ended the job early.
pub struct Job {
    id: JobId,
    key: String,
    submitted_at: Instant,
    work: Work,
    done: Completion,
}

impl Job {
    pub fn new<W, F, C>(key: impl Into<String>, work: W, done: C) -> Self
    where
        W: FnOnce() -> F + Send + 'static,
        F: Future<Output = JobResult> + Send + 'static,
        C: FnOnce(JobResult) + Send + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            key: key.into(),
            submitted_at: Instant::now(),
            work: Box::new(move || Box::pin(work()) as BoxFuture<JobResult>),
            done: Box::new(done),
        }
    }

    /// Build a job whose result is delivered to the returned handle.
    pub fn with_handle<W, F>(key: impl Into<String>, work: W) -> (Self, JobHandle)
    where
        W: FnOnce() -> F + Send + 'static,
        F: Future<Output = JobResult> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job = Self::new(key, work, move |result| {
            // The caller may have stopped waiting; nothing to do then.
            let _ = tx.send(result);
        });
        let handle = JobHandle { id: job.id, rx };
        (job, handle)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub(crate) fn stamp(&mut self, at: Instant) {
        self.submitted_at = at;
    }

    pub(crate) fn into_parts(self) -> (JobParts, Completion) {
        (
            JobParts {
                id: self.id,
                key: self.key,
                work: self.work,
            },
            self.done,
        )
    }

    /// End the job without running it.
    pub(crate) fn reject(self, error: ThrottlerError) {
        (self.done)(Err(error));
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("submitted_at", &self.submitted_at)
            .finish_non_exhaustive()
    }
}

/// A job with its completion detached, as it travels to the next stage.
pub(crate) struct JobParts {
    pub(crate) id: JobId,
    pub(crate) key: String,
    work: Work,
}

impl JobParts {
    pub(crate) fn run(self) -> BoxFuture<JobResult> {
        (self.work)()
    }

    /// Rebuild a job, keeping its id, whose result is delivered to the returned handle.
    pub(crate) fn into_handled_job(self) -> (Job, JobHandle) {
        let (tx, rx) = oneshot::channel();
        let handle = JobHandle { id: self.id, rx };
        let job = Job {
            id: self.id,
            key: self.key,
            submitted_at: Instant::now(),
            work: self.work,
            done: Box::new(move |result| {
                let _ = tx.send(result);
            }),
        };
        (job, handle)
    }
}

/// Resolves to the job's result once the last limiter in its chain has completed it.
#[derive(Debug)]
pub struct JobHandle {
    id: JobId,
    rx: oneshot::Receiver<JobResult>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl Future for JobHandle {
    type Output = JobResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(LimiterError::Abandoned(id).into())))
    }
}
