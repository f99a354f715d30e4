use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex};

use crate::node::Node;

/// Ownership wrapper for a single node, shared between the cache, the write
/// buffer and in-flight operations.
///
/// The latch distinguishes four access modes:
///
/// - `view` / `read`: shared, exclude `write`
/// - `hash`: unique among hash holders, excludes `write`, may overlap with
///   `view`/`read` (hash computation mutates hash bookkeeping only)
/// - `write`: unique, excludes everything
///
/// Holders of a hash handle must restrict their mutations to the hash
/// fields; readers never inspect hash fields without a hash handle of their
/// own. That discipline is what makes the overlap sound.
pub struct NodeCell {
    state: Mutex<LatchState>,
    released: Condvar,
    /// Whether this cell is the authoritative instance for its id, i.e. it
    /// is owned by the cache or the write buffer.
    current: AtomicBool,
    node: UnsafeCell<Node>,
}

unsafe impl Send for NodeCell {}
unsafe impl Sync for NodeCell {}

#[derive(Default)]
struct LatchState {
    readers: usize,
    hashing: bool,
    writing: bool,
}

impl NodeCell {
    pub fn new(node: Node) -> Self {
        NodeCell {
            state: Mutex::new(LatchState::default()),
            released: Condvar::new(),
            current: AtomicBool::new(false),
            node: UnsafeCell::new(node),
        }
    }

    pub fn is_current(&self) -> bool {
        self.current.load(Ordering::Acquire)
    }

    pub(crate) fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::Release);
    }

    /// Shared access for traversal.
    pub fn view(&self) -> ViewHandle<'_> {
        self.acquire_shared();
        ViewHandle { cell: self }
    }

    /// Shared access for reading payloads.
    pub fn read(&self) -> ReadHandle<'_> {
        self.acquire_shared();
        ReadHandle { cell: self }
    }

    /// Shared access that doesn't wait; `None` while a writer holds the cell.
    pub fn try_read(&self) -> Option<ReadHandle<'_>> {
        let mut state = self.state.lock();
        if state.writing {
            return None;
        }
        state.readers += 1;
        Some(ReadHandle { cell: self })
    }

    /// Unique access to the hash bookkeeping of the node.
    pub fn hash_access(&self) -> HashHandle<'_> {
        let mut state = self.state.lock();
        while state.writing || state.hashing {
            self.released.wait(&mut state);
        }
        state.hashing = true;
        HashHandle { cell: self }
    }

    /// Exclusive access.
    pub fn write(&self) -> WriteHandle<'_> {
        let mut state = self.state.lock();
        while state.writing || state.hashing || state.readers > 0 {
            self.released.wait(&mut state);
        }
        state.writing = true;
        WriteHandle { cell: self }
    }

    fn acquire_shared(&self) {
        let mut state = self.state.lock();
        while state.writing {
            self.released.wait(&mut state);
        }
        state.readers += 1;
    }

    fn release_shared(&self) {
        let mut state = self.state.lock();
        state.readers -= 1;
        if state.readers == 0 {
            self.released.notify_all();
        }
    }

    fn node_ref(&self) -> &Node {
        unsafe { &*self.node.get() }
    }

    #[allow(clippy::mut_from_ref)]
    fn node_mut(&self) -> &mut Node {
        unsafe { &mut *self.node.get() }
    }
}

pub struct ViewHandle<'a> {
    cell: &'a NodeCell,
}

impl Deref for ViewHandle<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.cell.node_ref()
    }
}

impl Drop for ViewHandle<'_> {
    fn drop(&mut self) {
        self.cell.release_shared();
    }
}

pub struct ReadHandle<'a> {
    cell: &'a NodeCell,
}

impl Deref for ReadHandle<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.cell.node_ref()
    }
}

impl Drop for ReadHandle<'_> {
    fn drop(&mut self) {
        self.cell.release_shared();
    }
}

pub struct HashHandle<'a> {
    cell: &'a NodeCell,
}

impl Deref for HashHandle<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.cell.node_ref()
    }
}

impl DerefMut for HashHandle<'_> {
    fn deref_mut(&mut self) -> &mut Node {
        self.cell.node_mut()
    }
}

impl Drop for HashHandle<'_> {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock();
        state.hashing = false;
        drop(state);
        self.cell.released.notify_all();
    }
}

pub struct WriteHandle<'a> {
    cell: &'a NodeCell,
}

impl Deref for WriteHandle<'_> {
    type Target = Node;

    fn deref(&self) -> &Node {
        self.cell.node_ref()
    }
}

impl DerefMut for WriteHandle<'_> {
    fn deref_mut(&mut self) -> &mut Node {
        self.cell.node_mut()
    }
}

impl Drop for WriteHandle<'_> {
    fn drop(&mut self) {
        let mut state = self.cell.state.lock();
        state.writing = false;
        drop(state);
        self.cell.released.notify_all();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{Node, ValueNode};
    use crate::types::{Key, Value};
    use ethereum_types::H256;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn value_cell() -> NodeCell {
        NodeCell::new(Node::from(ValueNode::new(Key::zero(), Value::zero(), 0)))
    }

    #[test]
    fn readers_are_concurrent() {
        let cell = value_cell();
        let a = cell.read();
        let b = cell.view();
        assert!(matches!(&*a, Node::Value(_)));
        assert!(matches!(&*b, Node::Value(_)));
    }

    #[test]
    fn hash_overlaps_readers_but_not_hash() {
        let cell = value_cell();
        let _read = cell.read();
        let mut hash = cell.hash_access();
        hash.set_hash(H256::repeat_byte(1));
        drop(hash);
        let _hash_again = cell.hash_access();
    }

    #[test]
    fn write_waits_for_readers() {
        let cell = Arc::new(value_cell());
        let read = cell.read();

        let writer = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                let mut handle = cell.write();
                if let Node::Value(v) = &mut *handle {
                    v.value = Value::repeat_byte(0xaa);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!writer.is_finished(), "writer must block behind the reader");
        drop(read);
        writer.join().unwrap();

        let read = cell.read();
        match &*read {
            Node::Value(v) => assert_eq!(v.value, Value::repeat_byte(0xaa)),
            _ => panic!("unexpected node kind"),
        }
    }

    #[test]
    fn try_read_fails_under_writer() {
        let cell = value_cell();
        let write = cell.write();
        assert!(cell.try_read().is_none());
        drop(write);
        assert!(cell.try_read().is_some());
    }
}
