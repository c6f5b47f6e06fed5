use crate::clock::{Clock, TokioClock};
use crate::config::LimiterConfig;
use crate::error::{LimiterError, ThrottlerResult};
use crate::limiter::Limiter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tracing::info;
use validator::Validate;

type CreatedListener = Arc<dyn Fn(&Limiter, &str) + Send + Sync>;

/// Lazily creates one limiter per key, all from the same template.
///
/// Each key keeps its limiter for the lifetime of the group, so every key has its own reservoir.
#[derive(Clone)]
pub struct LimiterGroup {
    template: LimiterConfig,
    clock: Arc<dyn Clock>,
    limiters: Arc<Mutex<HashMap<String, Limiter>>>,
    /// Serializes creation so each key gets exactly one limiter.
    creating: Arc<Mutex<()>>,
    created: Arc<RwLock<Vec<CreatedListener>>>,
}

impl LimiterGroup {
    pub fn new(template: LimiterConfig) -> ThrottlerResult<Self> {
        Self::with_clock(template, Arc::new(TokioClock))
    }

    pub fn with_clock(template: LimiterConfig, clock: Arc<dyn Clock>) -> ThrottlerResult<Self> {
        template.validate()?;
        Ok(Self {
            template,
            clock,
            limiters: Arc::new(Mutex::new(HashMap::new())),
            creating: Arc::new(Mutex::new(())),
            created: Arc::new(RwLock::new(Vec::new())),
        })
    }

    /// Called once for every newly created limiter, before it is handed out.
    ///
    /// The listener may read the group and fetch existing limiters. Creating another limiter from
    /// inside it deadlocks.
    pub fn on_created<F>(&self, listener: F)
    where
        F: Fn(&Limiter, &str) + Send + Sync + 'static,
    {
        self.created
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    /// Get the limiter for `key`, creating it on first use.
    pub fn key(&self, key: &str) -> ThrottlerResult<Limiter> {
        if let Some(limiter) = self.lookup(key)? {
            return Ok(limiter);
        }

        let _creating = self
            .creating
            .lock()
            .map_err(|_| LimiterError::Poisoned(format!("group of {}", self.template_name())))?;
        // Someone else may have created it while we waited.
        if let Some(limiter) = self.lookup(key)? {
            return Ok(limiter);
        }

        let limiter = Limiter::with_clock(key, &self.template, Arc::clone(&self.clock))?;

        let listeners = self
            .created
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(&limiter, key);
        }

        let total = {
            let mut limiters = self.lock_limiters()?;
            limiters.insert(key.to_string(), limiter.clone());
            limiters.len()
        };
        info!(key = %key, total, "Created limiter for key");
        Ok(limiter)
    }

    /// Limiter for `key` if one was already created.
    pub fn get(&self, key: &str) -> Option<Limiter> {
        self.limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.limiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, key: &str) -> ThrottlerResult<Option<Limiter>> {
        Ok(self.lock_limiters()?.get(key).cloned())
    }

    fn lock_limiters(&self) -> Result<MutexGuard<'_, HashMap<String, Limiter>>, LimiterError> {
        self.limiters
            .lock()
            .map_err(|_| LimiterError::Poisoned(format!("group of {}", self.template_name())))
    }

    fn template_name(&self) -> String {
        format!("{} per {:?}", self.template.calls_per_window, self.template.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobResult, SendResponse};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn group() -> LimiterGroup {
        LimiterGroup::new(LimiterConfig::new(2, Duration::from_secs(60))).unwrap()
    }

    fn response() -> JobResult {
        Ok(SendResponse {
            id: "m".to_string(),
            raw: serde_json::Value::Null,
        })
    }

    #[tokio::test]
    async fn test_one_limiter_per_distinct_key() {
        let group = group();
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        group.on_created(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for key in ["0000002", "0000000", "0000001", "0000000", "0000002", "0000000"] {
            group.key(key).unwrap();
        }

        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(group.keys(), vec!["0000000", "0000001", "0000002"]);
        assert_eq!(group.len(), 3);
    }

    #[tokio::test]
    async fn test_same_key_returns_same_reservoir() {
        let group = group();
        group.key("0000000").unwrap().schedule("0000000", || async { response() }).await.unwrap();

        let counts = group.key("0000000").unwrap().counts().unwrap();
        assert_eq!(counts.remaining, 1);
        assert_eq!(counts.done, 1);
    }

    #[tokio::test]
    async fn test_keys_have_independent_reservoirs() {
        let group = group();
        for _ in 0..2 {
            group.key("0000000").unwrap().schedule("0000000", || async { response() }).await.unwrap();
        }

        assert_eq!(group.key("0000000").unwrap().counts().unwrap().remaining, 0);
        assert_eq!(group.key("0000001").unwrap().counts().unwrap().remaining, 2);
    }

    #[tokio::test]
    async fn test_created_listener_sees_key_before_first_use() {
        let group = group();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        group.on_created(move |limiter, key| {
            assert_eq!(limiter.name(), key);
            sink.lock().unwrap().push(key.to_string());
        });

        assert!(group.get("0000009").is_none());
        group.key("0000009").unwrap();
        assert!(group.get("0000009").is_some());
        assert_eq!(*seen.lock().unwrap(), vec!["0000009".to_string()]);
    }

    #[tokio::test]
    async fn test_created_listener_can_read_the_group() {
        let group = group();
        group.key("0000000").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let reader = group.clone();
        let sink = Arc::clone(&seen);
        group.on_created(move |_, key| {
            let existing = reader.key("0000000").unwrap();
            sink.lock().unwrap().push((
                key.to_string(),
                reader.len(),
                reader.get(key).is_some(),
                existing.name().to_string(),
            ));
        });

        group.key("0000001").unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("0000001".to_string(), 1, false, "0000000".to_string())]
        );
        assert_eq!(group.keys(), vec!["0000000", "0000001"]);
    }

    #[test]
    fn test_invalid_template_is_rejected() {
        assert!(LimiterGroup::new(LimiterConfig::new(0, Duration::from_secs(1))).is_err());
    }
}
