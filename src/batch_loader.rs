//! Request coalescing.
//!
//! Lookups arriving within a short window are collected into one batch and
//! resolved together. Every key is loaded at most once; later lookups are
//! answered from the cache, and concurrent lookups of the same key share
//! the same pending result.

use crate::config::LoaderSettings;
use crate::error::Error;
use crate::metrics;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[async_trait]
pub trait BatchLoad: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Returns one value per key, in key order.
    async fn load_batch(&self, keys: Vec<Self::Key>) -> Vec<Self::Value>;
}

type Waiters<V> = Vec<oneshot::Sender<V>>;

struct Shared<L: BatchLoad> {
    cache: DashMap<L::Key, L::Value>,
    pending: Mutex<HashMap<L::Key, Waiters<L::Value>>>,
}

pub struct BatchLoader<L: BatchLoad> {
    shared: Arc<Shared<L>>,
    requests: mpsc::UnboundedSender<L::Key>,
}

impl<L: BatchLoad> BatchLoader<L> {
    pub fn new(loader: L, settings: &LoaderSettings) -> Self {
        let shared = Arc::new(Shared {
            cache: DashMap::new(),
            pending: Mutex::new(HashMap::new()),
        });
        let (requests, rx) = mpsc::unbounded_channel();

        tokio::spawn(collect_batches(
            Arc::new(loader),
            shared.clone(),
            rx,
            settings.batch_window,
            settings.max_batch_size.max(1),
        ));

        Self { shared, requests }
    }

    pub async fn load(&self, key: L::Key) -> Result<L::Value, Error> {
        if let Some(value) = self.shared.cache.get(&key) {
            return Ok(value.clone());
        }

        let (tx, rx) = oneshot::channel();
        let first = {
            let mut pending = self.shared.pending.lock();
            match pending.entry(key.clone()) {
                Entry::Occupied(mut waiters) => {
                    waiters.get_mut().push(tx);
                    false
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![tx]);
                    true
                }
            }
        };

        if first && self.requests.send(key).is_err() {
            return Err(Error::internal("batch loader stopped"));
        }

        rx.await
            .map_err(|_| Error::internal("batch finished without a value for the key"))
    }

    pub async fn load_many(&self, keys: Vec<L::Key>) -> Vec<Result<L::Value, Error>> {
        futures::future::join_all(keys.into_iter().map(|key| self.load(key))).await
    }

    /// Seeds the cache, e.g. after publishing a newer version of a value.
    pub fn prime(&self, key: L::Key, value: L::Value) {
        self.shared.cache.insert(key, value);
    }

    pub fn clear(&self, key: &L::Key) {
        self.shared.cache.remove(key);
    }
}

async fn collect_batches<L: BatchLoad>(
    loader: Arc<L>,
    shared: Arc<Shared<L>>,
    mut rx: mpsc::UnboundedReceiver<L::Key>,
    window: Duration,
    max_batch_size: usize,
) {
    while let Some(first) = rx.recv().await {
        let mut keys = vec![first];
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);

        while keys.len() < max_batch_size {
            tokio::select! {
                _ = &mut deadline => break,
                key = rx.recv() => match key {
                    Some(key) => keys.push(key),
                    None => break,
                }
            }
        }

        debug!("Dispatching batch of {} keys", keys.len());
        tokio::spawn(dispatch(loader.clone(), shared.clone(), keys));
    }
}

async fn dispatch<L: BatchLoad>(loader: Arc<L>, shared: Arc<Shared<L>>, keys: Vec<L::Key>) {
    metrics::loader_batch_size().record(keys.len() as f64);
    let values = loader.load_batch(keys.clone()).await;

    for (index, key) in keys.into_iter().enumerate() {
        let waiters = shared.pending.lock().remove(&key).unwrap_or_default();
        // A short answer drops the waiters of the missing keys.
        let Some(value) = values.get(index) else {
            continue;
        };
        shared.cache.insert(key, value.clone());
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Doubler {
        batches: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl BatchLoad for Arc<Doubler> {
        type Key = u32;
        type Value = u32;

        async fn load_batch(&self, keys: Vec<u32>) -> Vec<u32> {
            self.batches.lock().push(keys.clone());
            keys.into_iter().map(|key| key * 2).collect()
        }
    }

    fn settings(window_ms: u64, max_batch_size: usize) -> LoaderSettings {
        LoaderSettings {
            batch_window: Duration::from_millis(window_ms),
            max_batch_size,
        }
    }

    #[tokio::test]
    async fn concurrent_loads_share_one_batch() {
        let doubler = Arc::new(Doubler::default());
        let loader = BatchLoader::new(doubler.clone(), &settings(30, 500));

        let (a, b, c, again) = tokio::join!(
            loader.load(1),
            loader.load(2),
            loader.load(3),
            loader.load(1)
        );
        assert_eq!(
            (a.unwrap(), b.unwrap(), c.unwrap(), again.unwrap()),
            (2, 4, 6, 2)
        );

        let batches = doubler.batches.lock().clone();
        assert_eq!(batches, vec![vec![1, 2, 3]]);
    }

    #[tokio::test]
    async fn cached_values_skip_the_loader() {
        let doubler = Arc::new(Doubler::default());
        let loader = BatchLoader::new(doubler.clone(), &settings(5, 500));

        assert_eq!(loader.load(7).await.unwrap(), 14);
        assert_eq!(loader.load(7).await.unwrap(), 14);
        assert_eq!(doubler.batches.lock().len(), 1);

        loader.prime(8, 100);
        assert_eq!(loader.load(8).await.unwrap(), 100);
        assert_eq!(doubler.batches.lock().len(), 1);

        loader.clear(&7);
        assert_eq!(loader.load(7).await.unwrap(), 14);
        assert_eq!(doubler.batches.lock().len(), 2);
    }

    #[tokio::test]
    async fn batches_are_capped() {
        let doubler = Arc::new(Doubler::default());
        let loader = BatchLoader::new(doubler.clone(), &settings(30, 2));

        let results = loader.load_many(vec![1, 2, 3, 4, 5]).await;
        let values: Vec<u32> = results.into_iter().map(Result::unwrap).collect();
        assert_eq!(values, vec![2, 4, 6, 8, 10]);

        let batches = doubler.batches.lock().clone();
        assert!(batches.iter().all(|batch| batch.len() <= 2));
        assert_eq!(batches.iter().map(Vec::len).sum::<usize>(), 5);
    }

    #[tokio::test]
    async fn keys_after_the_window_go_in_the_next_batch() {
        let doubler = Arc::new(Doubler::default());
        let loader = BatchLoader::new(doubler.clone(), &settings(20, 500));

        let late = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            loader.load(2).await
        };
        let (early, late) = tokio::join!(loader.load(1), late);
        assert_eq!((early.unwrap(), late.unwrap()), (2, 4));

        let batches = doubler.batches.lock().clone();
        assert_eq!(batches, vec![vec![1], vec![2]]);
    }

    struct ShortAnswer;

    #[async_trait]
    impl BatchLoad for ShortAnswer {
        type Key = u32;
        type Value = u32;

        async fn load_batch(&self, _keys: Vec<u32>) -> Vec<u32> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn missing_values_become_errors() {
        let loader = BatchLoader::new(ShortAnswer, &settings(5, 10));
        assert!(loader.load(1).await.is_err());
    }
}
