use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

/// Deduplicates concurrent calls that share a key: the first caller's
/// closure runs on a detached task and every caller for that key receives a
/// clone of its result. The detached task means a caller that goes away does
/// not cancel work other waiters depend on.
pub struct Group<T> {
    inner: Arc<Mutex<HashMap<String, Arc<Flight<T>>>>>,
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn join<F, Fut>(&self, key: String, f: F) -> T
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut map = self.inner.lock().await;
            if let Some(flight) = map.get(&key) {
                flight.clone()
            } else {
                let flight = Arc::new(Flight::new());
                map.insert(key.clone(), flight.clone());
                tokio::spawn(run_flight(self.inner.clone(), key, flight.clone(), f));
                flight
            }
        };

        flight.wait().await
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Flight<T> {
    notify: Notify,
    result: Mutex<Option<T>>,
}

impl<T: Clone + Send + Sync + 'static> Flight<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    async fn wait(&self) -> T {
        loop {
            if let Some(val) = self.result.lock().await.clone() {
                return val;
            }
            self.notify.notified().await;
        }
    }

    async fn finish(&self, val: T) {
        let mut slot = self.result.lock().await;
        *slot = Some(val);
        self.notify.notify_waiters();
    }
}

async fn run_flight<T, F, Fut>(
    map: Arc<Mutex<HashMap<String, Arc<Flight<T>>>>>,
    key: String,
    flight: Arc<Flight<T>>,
    f: F,
) where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
{
    let result = f().await;
    flight.finish(result).await;
    let mut map = map.lock().await;
    map.remove(&key);
}
