use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::tunables::Tunables;
use crate::value::SharedValue;

/// Per-signal ingest counters, zeroed on each status snapshot.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueCounters {
    pub n_updates: u64,
    pub n_bytes: u64,
    pub n_disconnects: u64,
    pub n_errors: u64,
    pub n_overflows: u64,
}

struct Inner {
    values: VecDeque<SharedValue>,
    /// Depth bound; recomputed from tunables on every accepted data push.
    limit: usize,
    connected: bool,
    counters: QueueCounters,
}

/// Bounded FIFO between one signal source and the aligner.
///
/// Sources push from transport worker threads; only the aligner pops. On
/// overflow the oldest element is dropped so a stalled aligner observes
/// the newest updates. All operations take the queue-local mutex briefly;
/// nothing blocks while holding it.
pub struct IngressQueue {
    inner: Mutex<Inner>,
}

impl IngressQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: VecDeque::new(),
                // Arbitrary; overwritten on the first data push.
                limit: 16,
                connected: false,
                counters: QueueCounters::default(),
            }),
        }
    }

    /// Enqueue a data update. Returns true if the queue was empty before
    /// the push, in which case the caller must wake the aligner.
    pub fn push(&self, v: SharedValue) -> bool {
        let mut g = self.inner.lock();
        let was_empty = g.values.is_empty();

        g.counters.n_updates += 1;
        g.counters.n_bytes += v.nbytes() as u64;
        g.limit = Tunables::snapshot().queue_limit(v.count as usize);

        Self::push_bounded(&mut g, v);
        was_empty
    }

    /// Enqueue a disconnect marker. Returns true if the queue was empty
    /// before the push.
    pub fn push_disconnect(&self, v: SharedValue) -> bool {
        let mut g = self.inner.lock();
        let was_empty = g.values.is_empty();

        g.connected = false;
        g.counters.n_disconnects += 1;

        Self::push_bounded(&mut g, v);
        was_empty
    }

    fn push_bounded(g: &mut Inner, v: SharedValue) {
        while g.values.len() >= g.limit {
            g.values.pop_front();
            g.counters.n_overflows += 1;
        }
        g.values.push_back(v);
    }

    /// Dequeue one update. Non-blocking; aligner only.
    pub fn pop(&self) -> Option<SharedValue> {
        self.inner.lock().values.pop_front()
    }

    /// Retain only the newest `keep` items (assembler overflow recovery).
    pub fn clear(&self, keep: usize) {
        let mut g = self.inner.lock();
        while g.values.len() > keep {
            g.values.pop_front();
        }
    }

    /// Record a transport-established connection.
    pub fn mark_connected(&self) {
        self.inner.lock().connected = true;
    }

    /// Record a discarded malformed update or source-layer failure.
    pub fn note_error(&self) {
        self.inner.lock().counters.n_errors += 1;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().values.is_empty()
    }

    pub fn connected(&self) -> bool {
        self.inner.lock().connected
    }

    /// Current depth bound.
    pub fn limit(&self) -> usize {
        self.inner.lock().limit
    }

    /// Non-zeroing counter view.
    pub fn counters(&self) -> QueueCounters {
        self.inner.lock().counters
    }

    /// Status sampling: read counters and connection state, then zero the
    /// counters, all under one lock acquisition so no update is lost.
    pub fn snapshot_and_zero(&self) -> (QueueCounters, bool) {
        let mut g = self.inner.lock();
        let snap = g.counters;
        g.counters = QueueCounters::default();
        (snap, g.connected)
    }
}

impl Default for IngressQueue {
    fn default() -> Self {
        Self::new()
    }
}
