use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cell::NodeCell;
use crate::config::NodeCacheConfig;
use crate::node::NodeId;

/// A cell displaced by an insertion into a full cache.
pub struct Evicted {
    pub id: NodeId,
    pub cell: Arc<NodeCell>,
}

/// Fixed-capacity LRU of node cells.
///
/// The index and the recency list share one mutex; every operation,
/// including the insert-and-evict transition of [`NodeCache::get_or_set`],
/// is a single critical section.
pub struct NodeCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
}

const NIL: usize = usize::MAX;

struct Slot {
    id: NodeId,
    cell: Arc<NodeCell>,
    prev: usize,
    next: usize,
}

struct CacheInner {
    index: FxHashMap<NodeId, usize>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(NodeCacheConfig::MIN_CAPACITY);
        NodeCache {
            inner: Mutex::new(CacheInner {
                index: FxHashMap::default(),
                slots: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
            }),
            capacity,
        }
    }

    /// Looks up a cell and promotes it to most-recently-used.
    pub fn get(&self, id: NodeId) -> Option<Arc<NodeCell>> {
        let mut inner = self.inner.lock();
        let slot = *inner.index.get(&id)?;
        inner.unlink(slot);
        inner.push_front(slot);
        Some(inner.slots[slot].cell.clone())
    }

    /// Inserts the cell unless the id is already present. Returns the cell
    /// now in the cache, whether it existed before, and the entry evicted to
    /// make room, all as one atomic transition.
    pub fn get_or_set(
        &self,
        id: NodeId,
        cell: Arc<NodeCell>,
    ) -> (Arc<NodeCell>, bool, Option<Evicted>) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.index.get(&id) {
            inner.unlink(slot);
            inner.push_front(slot);
            return (inner.slots[slot].cell.clone(), true, None);
        }

        let mut evicted = None;
        let slot = if let Some(slot) = inner.free.pop() {
            inner.slots[slot] = Slot {
                id,
                cell: cell.clone(),
                prev: NIL,
                next: NIL,
            };
            slot
        } else if inner.slots.len() < self.capacity {
            inner.slots.push(Slot {
                id,
                cell: cell.clone(),
                prev: NIL,
                next: NIL,
            });
            inner.slots.len() - 1
        } else {
            // reuse the least-recently-used slot
            let slot = inner.tail;
            inner.unlink(slot);
            let old = &mut inner.slots[slot];
            let old_id = old.id;
            let old_cell = std::mem::replace(&mut old.cell, cell.clone());
            old.id = id;
            inner.index.remove(&old_id);
            evicted = Some(Evicted {
                id: old_id,
                cell: old_cell,
            });
            slot
        };
        inner.index.insert(id, slot);
        inner.push_front(slot);
        cell.set_current(true);
        (cell, false, evicted)
    }

    /// Promotes an entry to most-recently-used; absent ids are ignored.
    pub fn touch(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.index.get(&id) {
            inner.unlink(slot);
            inner.push_front(slot);
        }
    }

    /// Demotes an entry to least-recently-used, making it the next eviction
    /// candidate; absent ids are ignored.
    pub fn release(&self, id: NodeId) {
        let mut inner = self.inner.lock();
        if let Some(&slot) = inner.index.get(&id) {
            inner.unlink(slot);
            inner.push_back(slot);
        }
    }

    /// Removes an entry, returning its cell.
    pub fn remove(&self, id: NodeId) -> Option<Arc<NodeCell>> {
        let mut inner = self.inner.lock();
        let slot = inner.index.remove(&id)?;
        inner.unlink(slot);
        let cell = std::mem::replace(
            &mut inner.slots[slot].cell,
            Arc::new(NodeCell::new(crate::node::Node::Empty)),
        );
        inner.slots[slot].id = NodeId::EMPTY;
        inner.free.push(slot);
        Some(cell)
    }

    /// Iterates over a snapshot of the current entries.
    pub fn for_each(&self, mut f: impl FnMut(NodeId, &Arc<NodeCell>)) {
        let snapshot: Vec<(NodeId, Arc<NodeCell>)> = {
            let inner = self.inner.lock();
            inner
                .index
                .iter()
                .map(|(&id, &slot)| (id, inner.slots[slot].cell.clone()))
                .collect()
        };
        for (id, cell) in snapshot {
            f(id, &cell);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheInner {
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let s = &self.slots[slot];
            (s.prev, s.next)
        };
        if prev != NIL {
            self.slots[prev].next = next;
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else if self.tail == slot {
            self.tail = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn push_back(&mut self, slot: usize) {
        self.slots[slot].next = NIL;
        self.slots[slot].prev = self.tail;
        if self.tail != NIL {
            self.slots[self.tail].next = slot;
        }
        self.tail = slot;
        if self.head == NIL {
            self.head = slot;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{Node, NodeKind};

    fn cell() -> Arc<NodeCell> {
        Arc::new(NodeCell::new(Node::Empty))
    }

    fn id(index: u64) -> NodeId {
        NodeId::new(NodeKind::Value, index)
    }

    // the cache clamps to the configured minimum; tests address ids beyond
    // the working range to force evictions
    fn tiny_cache() -> (NodeCache, usize) {
        let cache = NodeCache::new(0);
        let capacity = NodeCacheConfig::MIN_CAPACITY;
        (cache, capacity)
    }

    #[test]
    fn get_or_set_inserts_once() {
        let (cache, _) = tiny_cache();
        let first = cell();
        let (current, existed, evicted) = cache.get_or_set(id(1), first.clone());
        assert!(!existed);
        assert!(evicted.is_none());
        assert!(Arc::ptr_eq(&current, &first));

        let second = cell();
        let (current, existed, _) = cache.get_or_set(id(1), second);
        assert!(existed);
        assert!(Arc::ptr_eq(&current, &first), "first insert must win");
    }

    #[test]
    fn eviction_targets_least_recently_used() {
        let (cache, capacity) = tiny_cache();
        for i in 0..capacity as u64 {
            cache.get_or_set(id(i), cell());
        }
        // promote id 0, making id 1 the LRU entry
        assert!(cache.get(id(0)).is_some());

        let (_, _, evicted) = cache.get_or_set(id(capacity as u64), cell());
        let evicted = evicted.expect("full cache must evict");
        assert_eq!(evicted.id, id(1));
        assert!(cache.get(id(1)).is_none());
        assert!(cache.get(id(0)).is_some());
    }

    #[test]
    fn release_demotes_to_next_eviction() {
        let (cache, capacity) = tiny_cache();
        for i in 0..capacity as u64 {
            cache.get_or_set(id(i), cell());
        }
        cache.release(id(7));
        let (_, _, evicted) = cache.get_or_set(id(capacity as u64), cell());
        assert_eq!(evicted.expect("must evict").id, id(7));
    }

    #[test]
    fn remove_drops_the_entry() {
        let (cache, _) = tiny_cache();
        cache.get_or_set(id(1), cell());
        assert!(cache.remove(id(1)).is_some());
        assert!(cache.get(id(1)).is_none());
        assert!(cache.remove(id(1)).is_none());
    }

    #[test]
    fn for_each_sees_all_entries() {
        let (cache, _) = tiny_cache();
        for i in 0..10 {
            cache.get_or_set(id(i), cell());
        }
        let mut seen = Vec::new();
        cache.for_each(|id, _| seen.push(id));
        seen.sort();
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[0], id(0));
        assert_eq!(seen[9], id(9));
    }
}
