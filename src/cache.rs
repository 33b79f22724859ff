use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

use crate::models::{Id, Thread};

/// Fixed-capacity, least-recently-used cache for single-row fetches.
///
/// There is no invalidation protocol beyond capacity eviction and the
/// explicit `invalidate` hook called on every write path; rows changed by an
/// external writer may be served stale until evicted.
pub struct LruCache<K, V> {
    inner: Mutex<LruInner<K, V>>,
    capacity: usize,
}

struct LruInner<K, V> {
    map: HashMap<K, V>,
    order: VecDeque<K>,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.map.get(key).cloned();
        if hit.is_some() {
            Self::touch(&mut inner, key);
        }
        hit
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        if inner.map.insert(key.clone(), value).is_none() {
            inner.order.push_back(key);
            if inner.order.len() > self.capacity {
                if let Some(evicted) = inner.order.pop_front() {
                    inner.map.remove(&evicted);
                }
            }
        } else {
            Self::touch(&mut inner, &key);
        }
    }

    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        inner.map.remove(key);
        inner.order.retain(|k| k != key);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn touch(inner: &mut LruInner<K, V>, key: &K) {
        inner.order.retain(|k| k != key);
        inner.order.push_back(key.clone());
    }
}

/// Thread rows cached by primary key.
pub type ThreadCache = LruCache<Id, Thread>;

pub const THREAD_CACHE_CAPACITY: usize = 500;
