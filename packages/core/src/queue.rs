//! Per-bucket job serialization.
//!
//! One `tokio::sync::Mutex<()>` per bucket, looked up (and lazily created)
//! behind a `std::sync::Mutex`-guarded table. Acquiring a bucket's async
//! mutex is the FIFO queue: the Rust mutex wakes waiters in roughly
//! submission order, which is all strict-FIFO-per-bucket requires here,
//! since there is no cross-bucket ordering to provide.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex as AsyncMutex;

/// Serializes tasks submitted against the same bucket key; distinct
/// buckets never block each other.
#[derive(Default)]
pub struct JobQueue {
    buckets: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket_lock(&self, bucket: &str) -> Arc<AsyncMutex<()>> {
        let mut buckets = self.buckets.lock().expect("job queue bucket table poisoned");
        buckets.entry(bucket.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Run `task` under `bucket`'s turn. Waits for every previously
    /// submitted task on the same bucket to finish first; a failing task
    /// still releases the bucket for the next one, failures never poison
    /// the bucket.
    pub async fn run<F, Fut, T>(&self, bucket: &str, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self.bucket_lock(bucket);
        let _guard = lock.lock().await;
        task().await
    }
}
