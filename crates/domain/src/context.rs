use std::sync::Arc;

use crate::jobs::{Clock, SystemClock};
use crate::keys::KeySchema;
use crate::ports::kv::KeyValueStore;
use crate::retry::RetryPolicy;

/// What every repository and job shares: the store, its key layout, the
/// conflict retry policy and the clock.
#[derive(Clone)]
pub struct StoreContext {
    pub kv: Arc<dyn KeyValueStore>,
    pub keys: KeySchema,
    pub retry: RetryPolicy,
    pub clock: Arc<dyn Clock>,
}

impl StoreContext {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            keys: KeySchema::default(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_keys(mut self, keys: KeySchema) -> Self {
        self.keys = keys;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }
}
