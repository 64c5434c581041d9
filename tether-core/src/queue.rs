//! Exchange queue: single-writer / single-reader hand-off between threads.
//!
//! The writer stages items locally and publishes them in chunks with
//! [`ExchangeWriter::flush`]. Publication goes through one atomic counter of
//! flushed items that doubles as the reader's sleep flag:
//!
//! - the reader, finding nothing new, swaps the counter to `ASLEEP`;
//! - the next flush fails its compare-exchange, stores the new count anyway
//!   and returns `false`, telling the caller the reader must be woken.
//!
//! That single handshake is what lets mailboxes and pipes signal only on the
//! empty → non-empty edge.
//!
//! Staged chunks travel over an unbounded flume channel; items are always on
//! the channel before the counter announces them.
//!
//! ```
//! use tether_core::queue::exchange_queue;
//!
//! let (mut tx, mut rx) = exchange_queue(16);
//! assert!(rx.read().is_none()); // reader is now asleep
//!
//! tx.write(1, false);
//! assert!(!tx.flush()); // reader was asleep: caller must wake it
//! assert_eq!(rx.read(), Some(1));
//! ```

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel stored in the publication counter by a reader going to sleep.
const ASLEEP: u64 = u64::MAX;

type Chunk<T> = SmallVec<[T; 4]>;

/// Create a connected exchange queue with the given chunk granularity.
pub fn exchange_queue<T>(granularity: usize) -> (ExchangeWriter<T>, ExchangeReader<T>) {
    let granularity = granularity.max(1);
    let (tx, rx) = flume::unbounded();
    let published = Arc::new(AtomicU64::new(0));

    let writer = ExchangeWriter {
        chunks: tx,
        published: Arc::clone(&published),
        staged: Chunk::with_capacity(granularity),
        complete: 0,
        flushed: 0,
        granularity,
    };
    let reader = ExchangeReader {
        chunks: rx,
        published,
        current: VecDeque::with_capacity(granularity),
        consumed: 0,
        prefetched: 0,
    };
    (writer, reader)
}

/// Writer end of an exchange queue.
pub struct ExchangeWriter<T> {
    chunks: flume::Sender<Chunk<T>>,
    published: Arc<AtomicU64>,

    /// Items written but not yet flushed.
    staged: Chunk<T>,
    /// `staged[..complete]` may be flushed; the rest belongs to an
    /// unfinished sequence.
    complete: usize,
    /// Number of items published so far.
    flushed: u64,
    granularity: usize,
}

impl<T> ExchangeWriter<T> {
    /// Stage an item. With `incomplete = true` the item is held back until a
    /// later complete item is written.
    pub fn write(&mut self, item: T, incomplete: bool) {
        self.staged.push(item);
        if !incomplete {
            self.complete = self.staged.len();
        }
    }

    /// Remove the most recently staged item that is not yet flushable.
    pub fn unwrite(&mut self) -> Option<T> {
        if self.staged.len() > self.complete {
            self.staged.pop()
        } else {
            None
        }
    }

    /// Publish all complete staged items.
    ///
    /// Returns `false` when the reader was asleep and has to be woken by the
    /// caller.
    pub fn flush(&mut self) -> bool {
        if self.complete == 0 {
            return true;
        }

        let tail: Chunk<T> = self.staged.drain(self.complete..).collect();
        let chunk = std::mem::replace(&mut self.staged, Chunk::with_capacity(self.granularity));
        self.staged.extend(tail);

        let count = chunk.len() as u64;
        let target = self.flushed + count;
        self.complete = 0;

        // A dropped reader simply discards the chunk.
        let _ = self.chunks.send(chunk);

        let result = self.published.compare_exchange(
            self.flushed,
            target,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.flushed = target;

        match result {
            Ok(_) => true,
            Err(current) => {
                debug_assert_eq!(current, ASLEEP, "exchange queue has a second writer");
                self.published.store(target, Ordering::Release);
                false
            }
        }
    }

    /// Number of items staged but not flushed.
    #[must_use]
    pub fn staged(&self) -> usize {
        self.staged.len()
    }
}

/// Reader end of an exchange queue.
pub struct ExchangeReader<T> {
    chunks: flume::Receiver<Chunk<T>>,
    published: Arc<AtomicU64>,

    /// Items already pulled off the channel.
    current: VecDeque<T>,
    /// Number of items handed out by `read`.
    consumed: u64,
    /// Number of items known to be published.
    prefetched: u64,
}

impl<T> ExchangeReader<T> {
    /// Check whether an item is available.
    ///
    /// When nothing is available the reader marks itself asleep, so the next
    /// flush on the writer side reports that a wake-up is needed.
    pub fn check_read(&mut self) -> bool {
        if self.consumed < self.prefetched {
            return true;
        }

        match self.published.compare_exchange(
            self.consumed,
            ASLEEP,
            Ordering::Acquire,
            Ordering::Acquire,
        ) {
            Ok(_) => false,
            Err(ASLEEP) => false,
            Err(published) => {
                self.prefetched = published;
                true
            }
        }
    }

    /// Pop the next item.
    pub fn read(&mut self) -> Option<T> {
        if !self.check_read() {
            return None;
        }
        self.fill();
        let item = self.current.pop_front();
        if item.is_some() {
            self.consumed += 1;
        }
        item
    }

    /// Peek at the next item without consuming it.
    pub fn probe(&mut self) -> Option<&T> {
        if !self.check_read() {
            return None;
        }
        self.fill();
        self.current.front()
    }

    fn fill(&mut self) {
        while self.current.is_empty() {
            match self.chunks.try_recv() {
                Ok(chunk) => self.current.extend(chunk),
                // Published items are sent before the counter moves.
                Err(e) => panic!("exchange queue announced items that never arrived: {e}"),
            }
        }
    }
}

/// Create a conflating queue: the reader only ever sees the latest item.
pub fn conflate_queue<T>() -> (ConflateWriter<T>, ConflateReader<T>) {
    let shared = Arc::new(ConflateShared {
        slot: Mutex::new(None),
        reader_awake: AtomicBool::new(false),
    });
    (
        ConflateWriter {
            shared: Arc::clone(&shared),
        },
        ConflateReader { shared },
    )
}

struct ConflateShared<T> {
    slot: Mutex<Option<T>>,
    reader_awake: AtomicBool,
}

/// Writer end of a conflating queue.
pub struct ConflateWriter<T> {
    shared: Arc<ConflateShared<T>>,
}

impl<T> ConflateWriter<T> {
    /// Replace whatever is pending with `item`.
    pub fn write(&mut self, item: T, _incomplete: bool) {
        *self.shared.slot.lock() = Some(item);
    }

    /// Conflated items are visible immediately; nothing to roll back.
    pub fn unwrite(&mut self) -> Option<T> {
        None
    }

    /// Returns `false` unless the reader is known to be awake.
    pub fn flush(&mut self) -> bool {
        self.shared.reader_awake.load(Ordering::Acquire)
    }
}

/// Reader end of a conflating queue.
pub struct ConflateReader<T> {
    shared: Arc<ConflateShared<T>>,
}

impl<T> ConflateReader<T> {
    pub fn check_read(&mut self) -> bool {
        let ready = self.shared.slot.lock().is_some();
        if !ready {
            self.shared.reader_awake.store(false, Ordering::Release);
        }
        ready
    }

    pub fn read(&mut self) -> Option<T> {
        let item = self.shared.slot.lock().take();
        if item.is_none() {
            self.shared.reader_awake.store(false, Ordering::Release);
        }
        item
    }

    /// Apply `f` to the pending item without taking it.
    pub fn probe<R>(&mut self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.shared.slot.lock().as_ref().map(f)
    }
}

/// Writer end used by pipes: either a plain exchange queue or a conflating one.
pub enum QueueWriter<T> {
    Exchange(ExchangeWriter<T>),
    Conflate(ConflateWriter<T>),
}

/// Reader end used by pipes.
pub enum QueueReader<T> {
    Exchange(ExchangeReader<T>),
    Conflate(ConflateReader<T>),
}

/// Create a pipe queue of the requested kind.
pub fn pipe_queue<T>(conflate: bool, granularity: usize) -> (QueueWriter<T>, QueueReader<T>) {
    if conflate {
        let (w, r) = conflate_queue();
        (QueueWriter::Conflate(w), QueueReader::Conflate(r))
    } else {
        let (w, r) = exchange_queue(granularity);
        (QueueWriter::Exchange(w), QueueReader::Exchange(r))
    }
}

impl<T> QueueWriter<T> {
    pub fn write(&mut self, item: T, incomplete: bool) {
        match self {
            Self::Exchange(w) => w.write(item, incomplete),
            Self::Conflate(w) => w.write(item, incomplete),
        }
    }

    pub fn unwrite(&mut self) -> Option<T> {
        match self {
            Self::Exchange(w) => w.unwrite(),
            Self::Conflate(w) => w.unwrite(),
        }
    }

    pub fn flush(&mut self) -> bool {
        match self {
            Self::Exchange(w) => w.flush(),
            Self::Conflate(w) => w.flush(),
        }
    }
}

impl<T> QueueReader<T> {
    pub fn check_read(&mut self) -> bool {
        match self {
            Self::Exchange(r) => r.check_read(),
            Self::Conflate(r) => r.check_read(),
        }
    }

    pub fn read(&mut self) -> Option<T> {
        match self {
            Self::Exchange(r) => r.read(),
            Self::Conflate(r) => r.read(),
        }
    }

    /// Apply `f` to the next item without consuming it.
    pub fn probe<R>(&mut self, f: impl FnOnce(&T) -> R) -> Option<R> {
        match self {
            Self::Exchange(r) => r.probe().map(f),
            Self::Conflate(r) => r.probe(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_read_puts_reader_to_sleep() {
        let (mut tx, mut rx) = exchange_queue::<u32>(4);
        assert!(!rx.check_read());

        tx.write(7, false);
        assert!(!tx.flush(), "first flush after sleep must request a wake-up");

        tx.write(8, false);
        assert!(tx.flush(), "reader is awake, no wake-up needed");

        assert_eq!(rx.read(), Some(7));
        assert_eq!(rx.read(), Some(8));
        assert_eq!(rx.read(), None);
    }

    #[test]
    fn test_flush_without_staged_items_is_noop() {
        let (mut tx, mut rx) = exchange_queue::<u32>(4);
        assert!(tx.flush());
        assert!(rx.read().is_none());
        assert!(tx.flush());
    }

    #[test]
    fn test_items_invisible_until_flush() {
        let (mut tx, mut rx) = exchange_queue::<u32>(4);
        tx.write(1, false);
        assert!(rx.read().is_none());
        tx.flush();
        assert_eq!(rx.read(), Some(1));
    }

    #[test]
    fn test_incomplete_items_held_back() {
        let (mut tx, mut rx) = exchange_queue::<&str>(4);
        tx.write("part-1", true);
        tx.write("part-2", true);
        tx.flush();
        assert!(rx.read().is_none());
        assert_eq!(tx.staged(), 2);

        tx.write("part-3", false);
        tx.flush();
        assert_eq!(rx.read(), Some("part-1"));
        assert_eq!(rx.read(), Some("part-2"));
        assert_eq!(rx.read(), Some("part-3"));
    }

    #[test]
    fn test_unwrite_only_removes_incomplete_tail() {
        let (mut tx, mut rx) = exchange_queue::<u32>(4);
        tx.write(1, false);
        tx.write(2, true);
        tx.write(3, true);

        assert_eq!(tx.unwrite(), Some(3));
        assert_eq!(tx.unwrite(), Some(2));
        assert_eq!(tx.unwrite(), None, "complete items cannot be unwritten");

        tx.flush();
        assert_eq!(rx.read(), Some(1));
        assert!(rx.read().is_none());
    }

    #[test]
    fn test_probe_does_not_consume() {
        let (mut tx, mut rx) = exchange_queue::<u32>(1);
        tx.write(42, false);
        tx.flush();
        assert_eq!(rx.probe(), Some(&42));
        assert_eq!(rx.probe(), Some(&42));
        assert_eq!(rx.read(), Some(42));
        assert_eq!(rx.probe(), None);
    }

    #[test]
    fn test_chunk_boundaries_preserve_order() {
        let (mut tx, mut rx) = exchange_queue::<u32>(1);
        for i in 0..10 {
            tx.write(i, false);
        }
        tx.flush();
        for i in 10..20 {
            tx.write(i, false);
            tx.flush();
        }
        let got: Vec<u32> = std::iter::from_fn(|| rx.read()).collect();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_cross_thread_fifo() {
        let (mut tx, mut rx) = exchange_queue::<u64>(8);
        let writer = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                tx.write(i, false);
                if i % 7 == 0 {
                    tx.flush();
                }
            }
            tx.flush();
        });

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(v) = rx.read() {
                assert_eq!(v, expected);
                expected += 1;
            } else {
                std::thread::yield_now();
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_conflate_keeps_latest() {
        let (mut tx, mut rx) = conflate_queue::<u32>();
        assert!(!rx.check_read());
        tx.write(1, false);
        tx.write(2, false);
        assert!(!tx.flush());
        assert_eq!(rx.probe(|v| *v), Some(2));
        assert_eq!(rx.read(), Some(2));
        assert_eq!(rx.read(), None);
        assert!(tx.unwrite().is_none());
    }

    #[test]
    fn test_pipe_queue_dispatch() {
        let (mut tx, mut rx) = pipe_queue::<u32>(false, 4);
        tx.write(5, false);
        tx.flush();
        assert_eq!(rx.probe(|v| *v + 1), Some(6));
        assert_eq!(rx.read(), Some(5));

        let (mut tx, mut rx) = pipe_queue::<u32>(true, 4);
        tx.write(5, false);
        tx.write(6, false);
        tx.flush();
        assert_eq!(rx.read(), Some(6));
    }
}
