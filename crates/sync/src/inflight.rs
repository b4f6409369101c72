use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

pub type SharedLoad<V> = Shared<BoxFuture<'static, V>>;

struct Registry<K, V: Clone> {
    next_generation: u64,
    loads: HashMap<K, (u64, SharedLoad<V>)>,
}

fn lock<K, V: Clone>(registry: &Mutex<Registry<K, V>>) -> MutexGuard<'_, Registry<K, V>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Collapses concurrent loads of the same key into one shared future.
///
/// A load unregisters itself when it settles. Entries carry a generation so a
/// settling load never removes a newer one registered under the same key.
pub struct InflightRequests<K, V: Clone> {
    registry: Arc<Mutex<Registry<K, V>>>,
}

impl<K, V: Clone> Default for InflightRequests<K, V> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_generation: 0,
                loads: HashMap::new(),
            })),
        }
    }
}

impl<K, V> InflightRequests<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, key: &K) -> Option<SharedLoad<V>> {
        lock(&self.registry)
            .loads
            .get(key)
            .map(|(_, load)| load.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.registry).loads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Joins the outstanding load for `key`, or registers the one `start` builds.
    pub fn run<F>(&self, key: K, start: impl FnOnce() -> F) -> SharedLoad<V>
    where
        F: Future<Output = V> + Send + 'static,
    {
        let mut registry = lock(&self.registry);
        if let Some((_, load)) = registry.loads.get(&key) {
            return load.clone();
        }

        registry.next_generation += 1;
        let generation = registry.next_generation;
        let handle: Weak<Mutex<Registry<K, V>>> = Arc::downgrade(&self.registry);
        let cleanup_key = key.clone();
        let load = start();
        let shared = async move {
            let value = load.await;
            if let Some(registry) = handle.upgrade() {
                let mut registry = lock(&registry);
                let current = registry
                    .loads
                    .get(&cleanup_key)
                    .is_some_and(|(entry_generation, _)| *entry_generation == generation);
                if current {
                    registry.loads.remove(&cleanup_key);
                }
            }
            value
        }
        .boxed()
        .shared();

        registry.loads.insert(key, (generation, shared.clone()));
        shared
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let requests = InflightRequests::<String, usize>::new();
        let executions = Arc::new(AtomicUsize::new(0));

        let start = |executions: Arc<AtomicUsize>| {
            move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                executions.fetch_add(1, Ordering::SeqCst) + 1
            }
        };
        let first = requests.run("chat".to_string(), start(Arc::clone(&executions)));
        let second = requests.run("chat".to_string(), start(Arc::clone(&executions)));
        assert!(requests.pending(&"chat".to_string()).is_some());

        let (left, right) = tokio::join!(first, second);

        assert_eq!((left, right), (1, 1));
        assert_eq!(executions.load(Ordering::SeqCst), 1);
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn settled_loads_make_way_for_fresh_ones() {
        let requests = InflightRequests::<u8, &'static str>::new();

        assert_eq!(requests.run(1, || async { "first" }).await, "first");
        assert!(requests.pending(&1).is_none());
        assert_eq!(requests.run(1, || async { "second" }).await, "second");
    }
}
