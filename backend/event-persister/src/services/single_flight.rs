use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

type Call<V> = Shared<BoxFuture<'static, V>>;

struct Entry<V> {
    call: Call<V>,
    waiters: usize,
}

/// Coalesces concurrent calls that share a key into one execution
///
/// The first caller for a key starts the call; callers arriving while it is
/// in flight await the same result. Nothing is cached: once the call
/// completes, or every caller awaiting it has gone away, the key is forgotten
/// and the next caller starts a fresh one.
pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call` for `key`, or join the call already in flight for it
    ///
    /// `call` is dropped unpolled when joining. The shared call keeps running
    /// as long as one caller still awaits it.
    pub async fn run<F>(&self, key: K, call: F) -> V
    where
        F: Future<Output = V> + Send + 'static,
    {
        let shared = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = calls.entry(key.clone()).or_insert_with(|| Entry {
                call: call.boxed().shared(),
                waiters: 0,
            });
            entry.waiters += 1;
            entry.call.clone()
        };

        let mut waiter = Waiter {
            calls: &self.calls,
            key,
            call: shared.clone(),
            finished: false,
        };
        let value = shared.await;
        waiter.finished = true;
        value
    }

    /// Number of keys with a call in flight
    pub fn in_flight(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Registration of one caller; releases the key when the call finishes or
/// when the last caller is dropped before it does
struct Waiter<'a, K: Eq + Hash, V> {
    calls: &'a Mutex<HashMap<K, Entry<V>>>,
    key: K,
    call: Call<V>,
    finished: bool,
}

impl<K: Eq + Hash, V> Drop for Waiter<'_, K, V> {
    fn drop(&mut self) {
        let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = calls.get_mut(&self.key) else {
            return;
        };
        if !Shared::ptr_eq(&entry.call, &self.call) {
            return;
        }
        entry.waiters -= 1;
        if self.finished || entry.waiters == 0 {
            calls.remove(&self.key);
        }
    }
}
