use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{error, trace};

use crate::cell::NodeCell;
use crate::error::MptError;
use crate::node::{Node, NodeId};

/// Destination of drained nodes, implemented by the stocks.
pub trait WriteSink: Send + Sync + 'static {
    fn write(&self, id: NodeId, node: &Node) -> Result<(), MptError>;
}

enum Command {
    /// Best-effort drain request; coalesced while one is pending.
    Drain,
    /// Drain everything queued so far, then acknowledge.
    Flush(Sender<()>),
    /// Final drain before the worker exits.
    Close(Sender<()>),
}

/// Asynchronous staging area for dirty cells displaced from the node cache.
///
/// Entries stay findable (and cancellable) until the drainer has written
/// them; a cancelled entry transfers cell ownership back to the caller.
pub struct WriteBuffer {
    shared: Arc<BufferShared>,
    commands: Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

struct BufferShared {
    queue: Mutex<FxHashMap<NodeId, Arc<NodeCell>>>,
    sink: Arc<dyn WriteSink>,
    capacity: usize,
    errors: Mutex<Vec<MptError>>,
}

impl WriteBuffer {
    pub fn new(sink: Arc<dyn WriteSink>, capacity: usize) -> Self {
        let shared = Arc::new(BufferShared {
            queue: Mutex::new(FxHashMap::default()),
            sink,
            capacity: capacity.max(1),
            errors: Mutex::new(Vec::new()),
        });

        // capacity 1 coalesces concurrent drain signals into one
        let (tx, rx) = bounded::<Command>(1);
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("mpt-write-buffer".into())
            .spawn(move || worker_loop(worker_shared, rx))
            .expect("failed to spawn write buffer worker");

        WriteBuffer {
            shared,
            commands: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueues a dirty cell. Never blocks; crossing the capacity threshold
    /// signals the drainer.
    pub fn add(&self, id: NodeId, cell: Arc<NodeCell>) {
        let above_capacity = {
            let mut queue = self.shared.queue.lock();
            queue.insert(id, cell);
            queue.len() >= self.shared.capacity
        };
        if above_capacity {
            self.request_drain();
        }
    }

    /// Removes an enqueued cell; the caller becomes responsible for it.
    pub fn cancel(&self, id: NodeId) -> Option<Arc<NodeCell>> {
        self.shared.queue.lock().remove(&id)
    }

    /// Signals the drainer without waiting for it.
    pub fn request_drain(&self) {
        let _ = self.commands.try_send(Command::Drain);
    }

    /// Blocks until everything queued at the time of the call is written.
    pub fn flush(&self) -> Result<(), MptError> {
        let (ack_tx, ack_rx) = bounded(0);
        if self.commands.send(Command::Flush(ack_tx)).is_err() {
            return Err(MptError::corrupt("write buffer is closed"));
        }
        let _ = ack_rx.recv();
        self.first_error()
    }

    /// Drains and stops the worker. Further operations fail.
    pub fn close(&self) -> Result<(), MptError> {
        let Some(worker) = self.worker.lock().take() else {
            return self.first_error();
        };
        let (ack_tx, ack_rx) = bounded(0);
        if self.commands.send(Command::Close(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        let _ = worker.join();
        self.first_error()
    }

    pub fn take_errors(&self) -> Vec<MptError> {
        std::mem::take(&mut *self.shared.errors.lock())
    }

    fn first_error(&self) -> Result<(), MptError> {
        match self.shared.errors.lock().first() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

fn worker_loop(shared: Arc<BufferShared>, commands: Receiver<Command>) {
    while let Ok(command) = commands.recv() {
        match command {
            Command::Drain => drain(&shared),
            Command::Flush(ack) => {
                drain(&shared);
                let _ = ack.send(());
            }
            Command::Close(ack) => {
                drain(&shared);
                let _ = ack.send(());
                return;
            }
        }
    }
    // channel dropped without an explicit close; drain what is left
    drain(&shared);
}

fn drain(shared: &BufferShared) {
    // sorted ids improve locality of the stock writes
    let mut ids: Vec<NodeId> = shared.queue.lock().keys().copied().collect();
    ids.sort_unstable();
    trace!(count = ids.len(), "draining write buffer");

    for id in ids {
        // a concurrent cancel may have taken the entry; skip it then
        let Some(cell) = shared.queue.lock().get(&id).cloned() else {
            continue;
        };

        {
            let mut node = cell.write();
            if node.is_dirty() {
                match shared.sink.write(id, &node) {
                    Ok(()) => node.set_dirty(false),
                    Err(err) => {
                        error!(?id, %err, "failed to write node");
                        shared.errors.lock().push(err);
                        continue;
                    }
                }
            }
        }

        let mut queue = shared.queue.lock();
        if let Some(current) = queue.get(&id) {
            if Arc::ptr_eq(current, &cell) {
                cell.set_current(false);
                queue.remove(&id);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::{NodeKind, ValueNode};
    use crate::types::{Key, Value};
    use parking_lot::Mutex as PlMutex;
    use std::thread;

    #[derive(Default)]
    struct CountingSink {
        written: PlMutex<Vec<NodeId>>,
    }

    impl WriteSink for CountingSink {
        fn write(&self, id: NodeId, _node: &Node) -> Result<(), MptError> {
            self.written.lock().push(id);
            Ok(())
        }
    }

    fn dirty_cell() -> Arc<NodeCell> {
        Arc::new(NodeCell::new(Node::from(ValueNode::new(
            Key::zero(),
            Value::repeat_byte(1),
            0,
        ))))
    }

    fn id(index: u64) -> NodeId {
        NodeId::new(NodeKind::Value, index)
    }

    #[test]
    fn flushed_entries_reach_the_sink_once() {
        let sink = Arc::new(CountingSink::default());
        let buffer = WriteBuffer::new(sink.clone(), 1024);

        for i in 0..10 {
            buffer.add(id(i), dirty_cell());
        }
        buffer.flush().unwrap();
        buffer.flush().unwrap();

        let written = sink.written.lock();
        assert_eq!(written.len(), 10);
        let mut sorted = written.clone();
        sorted.sort();
        assert_eq!(*written, sorted, "drain must write in id order");
    }

    #[test]
    fn cancelled_entries_are_not_written() {
        let sink = Arc::new(CountingSink::default());
        let buffer = WriteBuffer::new(sink.clone(), 1024);

        let cell = dirty_cell();
        buffer.add(id(1), cell.clone());
        let cancelled = buffer.cancel(id(1)).expect("entry must be cancellable");
        assert!(Arc::ptr_eq(&cancelled, &cell));
        assert!(buffer.cancel(id(1)).is_none());

        buffer.flush().unwrap();
        assert!(sink.written.lock().is_empty());
    }

    #[test]
    fn clean_nodes_are_skipped() {
        let sink = Arc::new(CountingSink::default());
        let buffer = WriteBuffer::new(sink.clone(), 1024);

        let cell = dirty_cell();
        cell.write().set_dirty(false);
        buffer.add(id(1), cell);
        buffer.flush().unwrap();
        assert!(sink.written.lock().is_empty());
    }

    #[test]
    fn draining_marks_nodes_clean() {
        let sink = Arc::new(CountingSink::default());
        let buffer = WriteBuffer::new(sink, 1024);

        let cell = dirty_cell();
        buffer.add(id(1), cell.clone());
        buffer.flush().unwrap();
        assert!(!cell.read().is_dirty());
    }

    #[test]
    fn concurrent_add_and_cancel_write_each_entry_at_most_once() {
        let sink = Arc::new(CountingSink::default());
        let buffer = Arc::new(WriteBuffer::new(sink.clone(), 4));

        let mut handles = Vec::new();
        for worker in 0..4u64 {
            let buffer = Arc::clone(&buffer);
            handles.push(thread::spawn(move || {
                let mut cancelled = Vec::new();
                for i in 0..100 {
                    let node_id = id(worker * 1000 + i);
                    buffer.add(node_id, dirty_cell());
                    if i % 3 == 0 && buffer.cancel(node_id).is_some() {
                        cancelled.push(node_id);
                    }
                }
                cancelled
            }));
        }
        let cancelled: Vec<NodeId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        buffer.flush().unwrap();
        buffer.close().unwrap();

        // a cancel may race a drain that already wrote the entry, so only
        // the uncancelled side is exact: written once each, never twice
        let written = sink.written.lock();
        let mut deduped = written.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), written.len(), "no entry written twice");
        for worker in 0..4u64 {
            for i in 0..100 {
                let node_id = id(worker * 1000 + i);
                if !cancelled.contains(&node_id) {
                    assert!(
                        written.contains(&node_id),
                        "uncancelled {node_id:?} must be written"
                    );
                }
            }
        }
    }

    #[test]
    fn operations_after_close_fail() {
        let buffer = WriteBuffer::new(Arc::new(CountingSink::default()), 16);
        buffer.close().unwrap();
        assert!(buffer.flush().is_err());
    }
}
