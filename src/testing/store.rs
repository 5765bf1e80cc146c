//! An in-memory segmented store with read hooks.

use crate::partitioning::KeyPartitioner;
use crate::source::SegmentSource;
use crate::types::{CacheEntry, CacheKey, CacheValue, SegmentId};
use futures::future::{self, BoxFuture};
use futures::stream::{self, BoxStream};
use futures::{FutureExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type ReadHook = Box<dyn FnOnce(SegmentId) + Send>;

/// When a read hook fires relative to the segment snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    /// Before the entries are read; the read sees the hook's changes.
    BeforeRead,
    /// After the entries are read but before any is handed out.
    AfterRead,
}

/// Entries of one node, grouped by segment and ordered by key.
///
/// A second map stands in for a backing store, consulted only by reads
/// that include the loader.
pub struct MemoryStore<K, V> {
    inner: Arc<StoreInner<K, V>>,
}

impl<K, V> Clone for MemoryStore<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct StoreInner<K, V> {
    memory: RwLock<BTreeMap<SegmentId, BTreeMap<K, V>>>,
    loader: RwLock<BTreeMap<SegmentId, BTreeMap<K, V>>>,
    partitioner: Arc<dyn KeyPartitioner<K>>,
    hooks: Mutex<HashMap<SegmentId, (HookPoint, ReadHook)>>,
    segmented: bool,
    segment_reads: AtomicU64,
}

impl<K, V> MemoryStore<K, V>
where
    K: CacheKey + Ord,
    V: CacheValue,
{
    pub fn new(partitioner: Arc<dyn KeyPartitioner<K>>) -> Self {
        Self::build(partitioner, true)
    }

    /// A store without per-segment indexes.
    pub fn non_segmented(partitioner: Arc<dyn KeyPartitioner<K>>) -> Self {
        Self::build(partitioner, false)
    }

    fn build(partitioner: Arc<dyn KeyPartitioner<K>>, segmented: bool) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                memory: RwLock::new(BTreeMap::new()),
                loader: RwLock::new(BTreeMap::new()),
                partitioner,
                hooks: Mutex::new(HashMap::new()),
                segmented,
                segment_reads: AtomicU64::new(0),
            }),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        let segment = self.inner.partitioner.segment_of(&key);
        self.inner.memory.write().entry(segment).or_default().insert(key, value);
    }

    /// Store an entry in the backing store only.
    pub fn insert_loadable(&self, key: K, value: V) {
        let segment = self.inner.partitioner.segment_of(&key);
        self.inner.loader.write().entry(segment).or_default().insert(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let segment = self.inner.partitioner.segment_of(key);
        self.inner.memory.write().get_mut(&segment)?.remove(key)
    }

    /// In-memory entries of `segment`.
    pub fn segment_entries(&self, segment: SegmentId) -> BTreeMap<K, V> {
        self.inner.memory.read().get(&segment).cloned().unwrap_or_default()
    }

    /// Add entries to `segment`, keeping existing ones.
    pub fn install_segment(&self, segment: SegmentId, entries: BTreeMap<K, V>) {
        self.inner.memory.write().entry(segment).or_default().extend(entries);
    }

    pub fn drop_segment(&self, segment: SegmentId) {
        self.inner.memory.write().remove(&segment);
    }

    /// Number of in-memory entries.
    pub fn len(&self) -> usize {
        self.inner.memory.read().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `hook` once, the next time `segment` is read.
    pub fn on_read<F>(&self, segment: SegmentId, point: HookPoint, hook: F)
    where
        F: FnOnce(SegmentId) + Send + 'static,
    {
        self.inner.hooks.lock().insert(segment, (point, Box::new(hook)));
    }

    /// Number of segment streams started.
    pub fn segment_reads(&self) -> u64 {
        self.inner.segment_reads.load(Ordering::SeqCst)
    }
}

impl<K, V> StoreInner<K, V>
where
    K: CacheKey + Ord,
    V: CacheValue,
{
    fn snapshot(&self, segment: SegmentId, include_loader: bool) -> Vec<CacheEntry<K, V>> {
        let mut entries = self.memory.read().get(&segment).cloned().unwrap_or_default();
        if include_loader {
            if let Some(loaded) = self.loader.read().get(&segment) {
                for (key, value) in loaded {
                    entries.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        entries
            .into_iter()
            .map(|(key, value)| CacheEntry::new(key, value))
            .collect()
    }

    fn take_hook(&self, segment: SegmentId, point: HookPoint) -> Option<ReadHook> {
        let mut hooks = self.hooks.lock();
        let due = matches!(hooks.get(&segment), Some((wanted, _)) if *wanted == point);
        if due {
            hooks.remove(&segment).map(|(_, hook)| hook)
        } else {
            None
        }
    }

    fn read(&self, segment: SegmentId, include_loader: bool) -> Vec<CacheEntry<K, V>> {
        self.segment_reads.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.take_hook(segment, HookPoint::BeforeRead) {
            hook(segment);
        }
        let entries = self.snapshot(segment, include_loader);
        if let Some(hook) = self.take_hook(segment, HookPoint::AfterRead) {
            hook(segment);
        }
        entries
    }
}

impl<K, V> SegmentSource<K, V> for MemoryStore<K, V>
where
    K: CacheKey + Ord,
    V: CacheValue,
{
    fn segment(&self, segment: SegmentId, include_loader: bool) -> BoxStream<'static, CacheEntry<K, V>> {
        let inner = self.inner.clone();
        stream::once(async move { stream::iter(inner.read(segment, include_loader)) })
            .flatten()
            .boxed()
    }

    fn get(&self, key: &K, include_loader: bool) -> BoxFuture<'static, Option<CacheEntry<K, V>>> {
        let segment = self.inner.partitioner.segment_of(key);
        let lookup = |entries: &BTreeMap<SegmentId, BTreeMap<K, V>>| {
            entries
                .get(&segment)
                .and_then(|segment| segment.get(key))
                .map(|value| CacheEntry::new(key.clone(), value.clone()))
        };

        let mut found = lookup(&*self.inner.memory.read());
        if found.is_none() && include_loader {
            found = lookup(&*self.inner.loader.read());
        }
        future::ready(found).boxed()
    }

    fn is_segmented(&self) -> bool {
        self.inner.segmented
    }
}
