use crate::clock::{Clock, TokioClock};
use crate::config::ThrottlerConfig;
use crate::error::{ThrottlerError, ThrottlerResult};
use crate::group::LimiterGroup;
use crate::job::{BoxFuture, Job, JobHandle, JobResult, SmsMessage};
use crate::limiter::{Limiter, LimiterCounts, LimiterEvent};
use crate::sender::SmsSender;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, warn};
use validator::Validate;

const ACCOUNT_LIMITER: &str = "account";

/// Throttles outbound SMS so neither the account quota nor any sending number's quota is exceeded.
///
/// Every message first waits on the limiter of its `from` number, then on the shared account
/// limiter, and is only sent once both have admitted it.
pub struct Throttler {
    account: Limiter,
    numbers: LimiterGroup,
    sender: Arc<dyn SmsSender>,
    dropped: Arc<AtomicU64>,
    runtime: Handle,
}

/// Snapshot of every limiter owned by a throttler.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottlerStats {
    pub account: LimiterCounts,
    pub numbers: BTreeMap<String, LimiterCounts>,
    pub dropped: u64,
}

impl Throttler {
    /// Create a new throttler instance. Must be called inside a Tokio runtime.
    pub fn new(sender: Arc<dyn SmsSender>, config: ThrottlerConfig) -> ThrottlerResult<Self> {
        Self::with_clock(sender, config, Arc::new(TokioClock))
    }

    pub fn with_clock(
        sender: Arc<dyn SmsSender>,
        config: ThrottlerConfig,
        clock: Arc<dyn Clock>,
    ) -> ThrottlerResult<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| ThrottlerError::Runtime(format!("throttler needs a Tokio runtime: {}", e)))?;

        let account = Limiter::with_clock(ACCOUNT_LIMITER, &config.account, Arc::clone(&clock))?;
        let numbers = LimiterGroup::with_clock(config.number, clock)?;
        let dropped = Arc::new(AtomicU64::new(0));

        account.on_event(event_logger(None, Arc::clone(&dropped)));

        let parent = account.clone();
        let number_dropped = Arc::clone(&dropped);
        numbers.on_created(move |limiter, key| {
            if let Err(e) = limiter.chain(&parent) {
                error!(number = %key, error = %e, "Failed to chain number limiter to account limiter");
            }
            limiter.on_event(event_logger(Some(key.to_string()), Arc::clone(&number_dropped)));
        });

        Ok(Self {
            account,
            numbers,
            sender,
            dropped,
            runtime,
        })
    }

    /// Queue a message. Returns immediately; `callback` is invoked exactly once, later and never
    /// before this returns, with the provider's response or the error that ended the job.
    pub fn queue<C>(&self, message: SmsMessage, callback: C)
    where
        C: FnOnce(JobResult) + Send + 'static,
    {
        self.log_queued(&message);
        let job = Job::new(message.from.clone(), self.work_for(message), callback);
        self.dispatch(job);
    }

    /// Like [`Throttler::queue`], but hands back an awaitable handle instead of taking a callback.
    pub fn send(&self, message: SmsMessage) -> JobHandle {
        self.log_queued(&message);
        let (job, handle) = Job::with_handle(message.from.clone(), self.work_for(message));
        self.dispatch(job);
        handle
    }

    /// Total jobs dropped by any of this throttler's limiters. Never reset.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Sending numbers that have a limiter.
    pub fn keys(&self) -> Vec<String> {
        self.numbers.keys()
    }

    pub fn account_counts(&self) -> ThrottlerResult<LimiterCounts> {
        self.account.counts()
    }

    pub fn number_counts(&self, from: &str) -> ThrottlerResult<Option<LimiterCounts>> {
        self.numbers.get(from).map(|limiter| limiter.counts()).transpose()
    }

    pub fn stats(&self) -> ThrottlerResult<ThrottlerStats> {
        let mut numbers = BTreeMap::new();
        for key in self.numbers.keys() {
            if let Some(counts) = self.number_counts(&key)? {
                numbers.insert(key, counts);
            }
        }

        Ok(ThrottlerStats {
            account: self.account.counts()?,
            numbers,
            dropped: self.dropped_count(),
        })
    }

    pub fn numbers(&self) -> &LimiterGroup {
        &self.numbers
    }

    fn work_for(&self, message: SmsMessage) -> impl FnOnce() -> BoxFuture<JobResult> + Send + 'static {
        let sender = Arc::clone(&self.sender);
        move || {
            Box::pin(async move { sender.send(&message).await.map_err(ThrottlerError::from) })
                as BoxFuture<JobResult>
        }
    }

    fn dispatch(&self, job: Job) {
        match self.numbers.key(job.key()) {
            Ok(limiter) => limiter.submit(job),
            Err(e) => {
                error!(number = %job.key(), error = %e, "Could not resolve number limiter");
                self.runtime.spawn(async move { job.reject(e) });
            }
        }
    }

    fn log_queued(&self, message: &SmsMessage) {
        debug!(
            from = %message.from,
            to = %message.to,
            text = %message.text,
            account = ?self.account.counts().ok(),
            "Queuing message"
        );
    }
}

/// Logs limiter events and counts drops. `number` is `None` for the account limiter.
fn event_logger(
    number: Option<String>,
    dropped: Arc<AtomicU64>,
) -> impl Fn(&LimiterEvent) + Send + Sync + 'static {
    move |event| match event {
        LimiterEvent::Dropped { limiter, job_id, key } => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(limiter = %limiter, job_id = %job_id, from = %key, dropped = total, "Message dropped");
        }
        LimiterEvent::Error { limiter, error } => match &number {
            Some(number) => error!(number = %number, error = %error, "Error with number limiter"),
            None => error!(limiter = %limiter, error = %error, "Error with account limiter"),
        },
    }
}
