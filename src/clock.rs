//! Time source used by limiters.
//!
//! Limiters never read the wall clock directly. [`TokioClock`] is the default and follows Tokio's
//! timer, so it also obeys a paused test runtime. [`ManualClock`] only moves when told to.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Clock trait to abstract time retrieval and waiting.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;

    /// Resolves once `now()` has reached `deadline`.
    async fn sleep_until(&self, deadline: Instant);
}

/// Clock backed by the Tokio timer.
#[derive(Debug, Clone, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await;
    }
}

/// Virtual clock that only advances through [`ManualClock::advance`].
#[derive(Clone)]
pub struct ManualClock {
    time: Arc<watch::Sender<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        let (time, _) = watch::channel(Instant::now());
        Self {
            time: Arc::new(time),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.time.send_modify(|now| *now += by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManualClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualClock")
            .field("now", &*self.time.borrow())
            .finish()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.time.borrow()
    }

    async fn sleep_until(&self, deadline: Instant) {
        let mut rx = self.time.subscribe();
        loop {
            let reached = *rx.borrow_and_update() >= deadline;
            if reached || rx.changed().await.is_err() {
                return;
            }
        }
    }
}
