//! Bounded pipe connecting two nodes.
//!
//! A pipe is a named, bounded FIFO with one logical sender and one logical
//! receiver. The sender end lives with the upstream node's fan-out
//! distributor, the receiver end with the downstream node's fan-in
//! aggregator. Writing a tuple stamps the pipe's name into the tuple's
//! `input_name` so the downstream node can tell its inputs apart.
//!
//! When the FIFO is full the sender's [`DropMode`] decides what happens:
//!
//! - `Block`: wait for capacity (or for the pipe to close)
//! - `DropLatest`: silently discard the incoming tuple
//! - `DropOldest`: evict the head of the queue and enqueue the new tuple
//!
//! Either end may close the pipe. Closing is idempotent, wakes every blocked
//! writer, and guarantees that no later write succeeds; tuples already in
//! the FIFO remain drainable until the consumer empties it.
//!
//! Blocking uses a monitor (mutex + condvars), never a spin loop. Writes
//! from one producer preserve their order; writes racing across producers
//! interleave atomically per tuple.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::context::Context;
use crate::tuple::{EventType, Tuple};

use super::error::TopologyError;

/// Policy applied when a write finds the FIFO full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropMode {
    /// Wait until capacity is available or the pipe closes.
    #[default]
    Block,

    /// Discard the incoming tuple; the write still reports success.
    DropLatest,

    /// Evict the oldest queued tuple to make room for the new one.
    DropOldest,
}

/// Counters maintained by a pipe, snapshot via [`PipeSender::stats`] or
/// [`PipeReceiver::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeStats {
    /// Tuples accepted into the FIFO.
    pub pushed: u64,
    /// Tuples dequeued by the receiver.
    pub popped: u64,
    /// Tuples discarded by a drop policy.
    pub dropped: u64,
}

/// Wakeup channel between pipes and a fan-in aggregator.
///
/// The aggregator parks on this monitor when none of its inputs are ready;
/// every enqueue and every close on a registered pipe bumps the generation
/// and wakes it. Waiters pass the generation they last observed so a signal
/// between observation and wait is never lost.
#[derive(Debug, Default)]
pub(crate) struct ReadyMonitor {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl ReadyMonitor {
    /// Returns the current generation.
    pub(crate) fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Bumps the generation and wakes all waiters.
    pub(crate) fn notify(&self) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.cond.notify_all();
    }

    /// Blocks until the generation moves past `seen`.
    pub(crate) fn wait_past(&self, seen: u64) {
        let mut generation = self.generation.lock();
        while *generation == seen {
            self.cond.wait(&mut generation);
        }
    }
}

struct PipeInner {
    queue: VecDeque<Tuple>,
    drop_mode: DropMode,
    sender_closed: bool,
    receiver_closed: bool,
    /// Readiness monitor of the fan-in aggregator this pipe feeds, installed
    /// when the receiver is registered.
    monitor: Option<Arc<ReadyMonitor>>,
    stats: PipeStats,
}

impl PipeInner {
    #[inline]
    fn closed(&self) -> bool {
        self.sender_closed || self.receiver_closed
    }
}

struct PipeShared {
    name: String,
    capacity: usize,
    inner: Mutex<PipeInner>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl PipeShared {
    /// Marks one side closed and wakes everything that could be waiting.
    fn close(&self, by_receiver: bool) {
        let monitor = {
            let mut inner = self.inner.lock();
            if by_receiver {
                inner.receiver_closed = true;
            } else {
                inner.sender_closed = true;
            }
            inner.monitor.clone()
        };
        self.not_full.notify_all();
        self.not_empty.notify_all();
        if let Some(monitor) = monitor {
            monitor.notify();
        }
    }
}

/// The producing end of a pipe.
pub struct PipeSender {
    shared: Arc<PipeShared>,
}

impl PipeSender {
    /// Writes a tuple into the pipe.
    ///
    /// Stamps the pipe's name into the tuple's `input_name`, then enqueues
    /// according to the configured [`DropMode`]. Safe to call concurrently
    /// from multiple producers.
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::PipeClosed`] once either end has closed the
    /// pipe. A drop-policy discard is not an error.
    pub fn write(&self, ctx: &Context, mut tuple: Tuple) -> Result<(), TopologyError> {
        tuple.input_name.clear();
        tuple.input_name.push_str(&self.shared.name);
        if ctx.flags().tuple_trace() {
            tuple.add_trace_event(EventType::Output, self.shared.name.clone());
        }

        let monitor = {
            let mut inner = self.shared.inner.lock();
            loop {
                if inner.closed() {
                    return Err(TopologyError::PipeClosed);
                }
                if inner.queue.len() < self.shared.capacity {
                    break;
                }
                match inner.drop_mode {
                    DropMode::Block => self.shared.not_full.wait(&mut inner),
                    DropMode::DropLatest => {
                        inner.stats.dropped += 1;
                        drop(inner);
                        ctx.report_dropped_tuple(&self.shared.name, "queue full, dropped latest");
                        return Ok(());
                    }
                    DropMode::DropOldest => {
                        inner.queue.pop_front();
                        inner.stats.dropped += 1;
                        ctx.report_dropped_tuple(&self.shared.name, "queue full, dropped oldest");
                        break;
                    }
                }
            }
            inner.queue.push_back(tuple);
            inner.stats.pushed += 1;
            inner.monitor.clone()
        };

        self.shared.not_empty.notify_one();
        if let Some(monitor) = monitor {
            monitor.notify();
        }
        Ok(())
    }

    /// Closes the pipe from the sender side.
    ///
    /// Idempotent. Subsequent writes fail; queued tuples remain drainable.
    pub fn close(&self) {
        self.shared.close(false);
    }

    /// Returns true once either end has closed the pipe.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.inner.lock().closed()
    }

    /// Replaces the drop policy. Takes effect on the next write.
    pub fn set_drop_mode(&self, mode: DropMode) {
        self.shared.inner.lock().drop_mode = mode;
    }

    /// Returns the pipe's edge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns a snapshot of the pipe's counters.
    #[must_use]
    pub fn stats(&self) -> PipeStats {
        self.shared.inner.lock().stats
    }
}

impl std::fmt::Debug for PipeSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("PipeSender")
            .field("name", &self.shared.name)
            .field("len", &inner.queue.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &inner.closed())
            .finish()
    }
}

/// The consuming end of a pipe.
pub struct PipeReceiver {
    shared: Arc<PipeShared>,
}

impl PipeReceiver {
    /// Dequeues the next tuple, blocking while the pipe is open and empty.
    ///
    /// Returns `None` once the pipe is closed **and** the queue has drained,
    /// so a consumer that keeps calling `recv` observes every tuple accepted
    /// before the close.
    #[must_use]
    pub fn recv(&self) -> Option<Tuple> {
        let mut inner = self.shared.inner.lock();
        loop {
            if let Some(tuple) = inner.queue.pop_front() {
                inner.stats.popped += 1;
                drop(inner);
                self.shared.not_full.notify_one();
                return Some(tuple);
            }
            if inner.closed() {
                return None;
            }
            self.shared.not_empty.wait(&mut inner);
        }
    }

    /// Dequeues the next tuple without blocking.
    #[must_use]
    pub fn try_recv(&self) -> Option<Tuple> {
        let mut inner = self.shared.inner.lock();
        let tuple = inner.queue.pop_front()?;
        inner.stats.popped += 1;
        drop(inner);
        self.shared.not_full.notify_one();
        Some(tuple)
    }

    /// Closes the pipe from the receiver side.
    ///
    /// Idempotent. Blocked writers wake with [`TopologyError::PipeClosed`];
    /// the queue stays drainable so an owning aggregator can deliver what
    /// was already accepted.
    pub fn close(&self) {
        self.shared.close(true);
    }

    /// Returns true once the pipe is closed and the queue is empty, i.e.
    /// nothing more will ever arrive.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.closed() && inner.queue.is_empty()
    }

    /// Returns the number of queued tuples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.inner.lock().queue.len()
    }

    /// Returns true if the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.shared.inner.lock().queue.is_empty()
    }

    /// Returns the pipe's edge name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Returns a snapshot of the pipe's counters.
    #[must_use]
    pub fn stats(&self) -> PipeStats {
        self.shared.inner.lock().stats
    }

    /// Discards all queued tuples, recording them as dropped.
    pub(crate) fn discard_queue(&self, ctx: &Context) {
        let discarded = {
            let mut inner = self.shared.inner.lock();
            let n = inner.queue.len();
            inner.queue.clear();
            inner.stats.dropped += n as u64;
            n
        };
        for _ in 0..discarded {
            ctx.report_dropped_tuple(&self.shared.name, "discarded on non-graceful stop");
        }
        self.shared.not_full.notify_all();
    }

    /// Installs the fan-in readiness monitor this pipe should signal.
    pub(crate) fn attach_monitor(&self, monitor: Arc<ReadyMonitor>) {
        let pending = {
            let mut inner = self.shared.inner.lock();
            inner.monitor = Some(Arc::clone(&monitor));
            !inner.queue.is_empty() || inner.closed()
        };
        if pending {
            monitor.notify();
        }
    }
}

impl std::fmt::Debug for PipeReceiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("PipeReceiver")
            .field("name", &self.shared.name)
            .field("len", &inner.queue.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &inner.closed())
            .finish()
    }
}

/// Creates a pipe with the given edge name and capacity.
///
/// Capacity is clamped to at least 1. The default drop policy is
/// [`DropMode::Block`]; use [`PipeSender::set_drop_mode`] to change it.
#[must_use]
pub fn pipe(name: impl Into<String>, capacity: usize) -> (PipeSender, PipeReceiver) {
    let shared = Arc::new(PipeShared {
        name: name.into(),
        capacity: capacity.max(1),
        inner: Mutex::new(PipeInner {
            queue: VecDeque::new(),
            drop_mode: DropMode::default(),
            sender_closed: false,
            receiver_closed: false,
            monitor: None,
            stats: PipeStats::default(),
        }),
        not_full: Condvar::new(),
        not_empty: Condvar::new(),
    });

    (
        PipeSender {
            shared: Arc::clone(&shared),
        },
        PipeReceiver { shared },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Map, Value};
    use std::thread;

    fn tuple_with(v: i64) -> Tuple {
        let mut data = Map::default();
        data.insert("v".into(), Value::Int(v));
        Tuple::new(data).with_input_name("hoge")
    }

    #[test]
    fn test_single_pipe_delivery_overwrites_input_name() {
        let ctx = Context::new();
        let (s, r) = pipe("p", 1);

        s.write(&ctx, tuple_with(1)).unwrap();
        let received = r.recv().unwrap();

        assert_eq!(received.input_name, "p");
        assert_eq!(received.data["v"], Value::Int(1));
    }

    #[test]
    fn test_drop_latest_keeps_first() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 1);
        s.set_drop_mode(DropMode::DropLatest);

        s.write(&ctx, tuple_with(1)).unwrap();
        s.write(&ctx, tuple_with(2)).unwrap();

        assert_eq!(r.recv().unwrap().data["v"], Value::Int(1));
        assert_eq!(r.len(), 0);
        assert_eq!(s.stats().dropped, 1);
    }

    #[test]
    fn test_drop_oldest_keeps_second() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 1);
        s.set_drop_mode(DropMode::DropOldest);

        s.write(&ctx, tuple_with(1)).unwrap();
        s.write(&ctx, tuple_with(2)).unwrap();

        assert_eq!(r.recv().unwrap().data["v"], Value::Int(2));
        assert_eq!(r.len(), 0);
    }

    #[test]
    fn test_write_after_sender_close_fails() {
        let ctx = Context::new();
        let (s, _r) = pipe("test", 1);

        s.close();
        s.close(); // idempotent

        assert_eq!(
            s.write(&ctx, tuple_with(1)),
            Err(TopologyError::PipeClosed)
        );
    }

    #[test]
    fn test_receiver_close_unblocks_and_fails_writer() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 1);

        s.write(&ctx, tuple_with(1)).unwrap();

        let writer = thread::spawn(move || {
            // Queue is full; this write blocks until the receiver closes.
            s.write(&ctx, tuple_with(2))
        });

        r.close();
        assert_eq!(writer.join().unwrap(), Err(TopologyError::PipeClosed));
    }

    #[test]
    fn test_queue_drains_after_sender_close() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 4);

        s.write(&ctx, tuple_with(1)).unwrap();
        s.write(&ctx, tuple_with(2)).unwrap();
        s.close();

        assert_eq!(r.recv().unwrap().data["v"], Value::Int(1));
        assert_eq!(r.recv().unwrap().data["v"], Value::Int(2));
        assert!(r.recv().is_none());
        assert!(r.is_drained());
    }

    #[test]
    fn test_block_mode_waits_for_capacity() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 1);

        s.write(&ctx, tuple_with(1)).unwrap();

        let writer = thread::spawn(move || {
            s.write(&ctx, tuple_with(2)).unwrap();
        });

        assert_eq!(r.recv().unwrap().data["v"], Value::Int(1));
        writer.join().unwrap();
        assert_eq!(r.recv().unwrap().data["v"], Value::Int(2));
    }

    #[test]
    fn test_stats_balance() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 2);
        s.set_drop_mode(DropMode::DropLatest);

        s.write(&ctx, tuple_with(1)).unwrap();
        s.write(&ctx, tuple_with(2)).unwrap();
        s.write(&ctx, tuple_with(3)).unwrap(); // dropped
        let _ = r.recv();

        let stats = r.stats();
        assert_eq!(stats.pushed, 2);
        assert_eq!(stats.popped, 1);
        assert_eq!(stats.dropped, 1);
        // pushed - popped = in flight
        assert_eq!(stats.pushed - stats.popped, r.len() as u64);
    }

    #[test]
    fn test_single_producer_order_preserved() {
        let ctx = Context::new();
        let (s, r) = pipe("test", 1024);

        for i in 0..100 {
            s.write(&ctx, tuple_with(i)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(r.recv().unwrap().data["v"], Value::Int(i));
        }
    }

    #[test]
    fn test_drop_counter_reported_to_context() {
        let ctx = Context::new();
        let (s, _r) = pipe("test", 1);
        s.set_drop_mode(DropMode::DropLatest);

        s.write(&ctx, tuple_with(1)).unwrap();
        s.write(&ctx, tuple_with(2)).unwrap();

        assert_eq!(ctx.dropped_tuples(), 1);
    }
}
