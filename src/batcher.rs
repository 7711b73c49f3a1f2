// src/batcher.rs
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::debug;

type FlushFn<T> = Arc<dyn Fn(String, Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;
type Groups<T> = Arc<Mutex<HashMap<String, Group<T>>>>;

struct Group<T> {
    id: u64,
    items: Vec<T>,
    timer: Option<JoinHandle<()>>,
}

/// Collects items per group key and hands each group to `on_flush` once it
/// holds `batch_size` items or its first item is `batch_timeout` old.
///
/// Items keep their arrival order. A flushed group is removed under the same
/// lock that appends to it, so a later item always starts a new group.
pub struct GroupBatcher<T> {
    batch_size: usize,
    batch_timeout: Duration,
    groups: Groups<T>,
    next_id: AtomicU64,
    on_flush: FlushFn<T>,
}

impl<T> GroupBatcher<T>
where
    T: Send + 'static,
{
    pub fn new<F, Fut>(batch_size: usize, batch_timeout: Duration, on_flush: F) -> Self
    where
        F: Fn(String, Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            batch_size: batch_size.max(1),
            batch_timeout,
            groups: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
            on_flush: Arc::new(move |key, items| Box::pin(on_flush(key, items)) as BoxFuture<'static, ()>),
        }
    }

    /// Must be called from within a tokio runtime; flushes run on spawned tasks.
    pub fn add(&self, group_key: impl Into<String>, item: T) {
        let key = group_key.into();

        let full = {
            let mut groups = lock(&self.groups);
            let group = groups.entry(key.clone()).or_insert_with(|| Group {
                id: self.next_id.fetch_add(1, Ordering::Relaxed),
                items: Vec::with_capacity(self.batch_size),
                timer: None,
            });
            group.items.push(item);

            if group.items.len() >= self.batch_size {
                groups.remove(&key)
            } else {
                if group.timer.is_none() {
                    group.timer = Some(self.spawn_timer(key.clone(), group.id));
                }
                None
            }
        };

        if let Some(group) = full {
            if let Some(timer) = group.timer {
                timer.abort();
            }
            debug!(group_by = %key, count = group.items.len(), "Batch full");
            tokio::spawn((self.on_flush)(key, group.items));
        }
    }

    /// Items waiting in groups that have not been flushed yet.
    pub fn pending(&self) -> usize {
        lock(&self.groups).values().map(|group| group.items.len()).sum()
    }

    fn spawn_timer(&self, key: String, id: u64) -> JoinHandle<()> {
        let groups = Arc::clone(&self.groups);
        let on_flush = Arc::clone(&self.on_flush);
        let timeout = self.batch_timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let mut groups = lock(&groups);
                match groups.get(&key) {
                    Some(group) if group.id == id => groups.remove(&key),
                    _ => None,
                }
            };
            if let Some(group) = expired {
                debug!(group_by = %key, count = group.items.len(), "Batch timeout");
                on_flush(key, group.items).await;
            }
        })
    }
}

impl<T> Drop for GroupBatcher<T> {
    fn drop(&mut self) {
        for group in lock(&self.groups).values_mut() {
            if let Some(timer) = group.timer.take() {
                timer.abort();
            }
        }
    }
}

fn lock<T>(groups: &Groups<T>) -> MutexGuard<'_, HashMap<String, Group<T>>> {
    groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flushed = Arc<Mutex<Vec<(String, Vec<u32>)>>>;

    fn batcher(batch_size: usize, timeout_ms: u64) -> (GroupBatcher<u32>, Flushed) {
        let flushed: Flushed = Arc::default();
        let sink = Arc::clone(&flushed);
        let batcher = GroupBatcher::new(batch_size, Duration::from_millis(timeout_ms), move |key, items| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push((key, items));
            }
        });
        (batcher, flushed)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_when_the_group_is_full() {
        let (batcher, flushed) = batcher(2, 1000);
        batcher.add("a", 1);
        batcher.add("a", 2);
        advance(1).await;

        assert_eq!(*flushed.lock().unwrap(), vec![("a".to_string(), vec![1, 2])]);
        assert_eq!(batcher.pending(), 0);

        // the full group's timer is gone
        advance(2000).await;
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_on_timeout_in_arrival_order() {
        let (batcher, flushed) = batcher(10, 1000);
        batcher.add("a", 1);
        advance(400).await;
        batcher.add("a", 2);
        advance(599).await;
        assert!(flushed.lock().unwrap().is_empty());
        assert_eq!(batcher.pending(), 2);

        advance(2).await;
        assert_eq!(*flushed.lock().unwrap(), vec![("a".to_string(), vec![1, 2])]);
    }

    #[tokio::test(start_paused = true)]
    async fn groups_are_independent() {
        let (batcher, flushed) = batcher(2, 1000);
        batcher.add("a", 1);
        batcher.add("b", 2);
        batcher.add("", 3);
        batcher.add("b", 4);
        advance(1).await;
        assert_eq!(*flushed.lock().unwrap(), vec![("b".to_string(), vec![2, 4])]);

        advance(1000).await;
        let mut flushed = flushed.lock().unwrap().clone();
        flushed.sort();
        assert_eq!(
            flushed,
            vec![
                (String::new(), vec![3]),
                ("a".to_string(), vec![1]),
                ("b".to_string(), vec![2, 4]),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_flushed_key_starts_a_new_group() {
        let (batcher, flushed) = batcher(2, 1000);
        batcher.add("a", 1);
        batcher.add("a", 2);
        advance(500).await;
        batcher.add("a", 3);

        // a stale timer must not flush the new group early
        advance(999).await;
        assert_eq!(flushed.lock().unwrap().len(), 1);

        advance(2).await;
        assert_eq!(flushed.lock().unwrap()[1], ("a".to_string(), vec![3]));
    }
}
