//! Per-key request deduplication
//!
//! A [`Flight`] group lets concurrent callers asking for the same key share
//! one execution of an expensive operation. The first caller starts the
//! work; everyone arriving before it completes awaits the same shared
//! future and receives a clone of its output. Once the work finishes the key
//! is released and the next caller starts a fresh execution.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

type Call<T> = Shared<BoxFuture<'static, T>>;

/// Dedup group keyed by string
pub struct Flight<T> {
    calls: Arc<Mutex<HashMap<String, Call<T>>>>,
}

impl<T> Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key` unless an execution for `key` is already in
    /// flight, in which case wait for that one instead.
    ///
    /// `work` is only invoked by the caller that starts the execution, and
    /// never while the table is locked.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let call = {
            let mut calls = lock(&self.calls);
            match calls.get(key) {
                Some(call) => call.clone(),
                None => {
                    let table = Arc::clone(&self.calls);
                    let owned_key = key.to_string();
                    let call = async move {
                        let output = work().await;
                        lock(&table).remove(&owned_key);
                        output
                    }
                    .boxed()
                    .shared();
                    calls.insert(key.to_string(), call.clone());
                    call
                }
            }
        };
        call.await
    }

    /// Number of keys with an execution in flight
    #[cfg(test)]
    pub fn in_flight(&self) -> usize {
        lock(&self.calls).len()
    }
}

impl<T> Default for Flight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(calls: &Mutex<T>) -> MutexGuard<'_, T> {
    // The table only holds futures; a panic elsewhere cannot leave it torn.
    calls.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
