//! The slice assembler.
//!
//! One dedicated thread per table drains the per-column ingress queues,
//! groups updates into slices keyed by their composite timestamp, decides
//! per slice whether it is complete (every connected column present) or
//! expired, and delivers completed slices to the registered receivers in
//! strictly increasing key order. All assembler state (`pending`,
//! `oldest_key`, the batch under construction) is thread-local to that
//! worker; the shared surface is the run flag, per-column ready flags, and
//! the receiver set, guarded by one mutex with a condvar for wakeups.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::ingress::IngressQueue;
use crate::source::{Connector, SourceAdapter, Subscription, Wakeup};
use crate::tunables::Tunables;
use crate::value::{SharedValue, Timestamp};

/// One completed row: alignment key plus one optional cell per column.
pub type Slice = (u64, Vec<Option<SharedValue>>);

/// Ordered batch of completed slices. Keys strictly increase within a
/// batch and across successive batches.
pub type SliceBatch = Vec<Slice>;

/// Downstream consumer of completed slices.
pub trait Receiver: Send + Sync {
    /// Column names, delivered synchronously on registration.
    fn names(&self, names: &[String]);

    /// A non-empty ordered batch. Called from the assembler thread with
    /// no aligner lock held; delivery is at-least-once within a run.
    fn slices(&self, batch: &SliceBatch);
}

/// One signal's ingest endpoint as seen by the assembler.
pub struct Column {
    pub name: String,
    pub queue: Arc<IngressQueue>,
}

/// Assembler counters since construction.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlignerStats {
    pub n_complete: u64,
    pub n_overflow: u64,
}

#[derive(Default)]
struct Stats {
    n_complete: AtomicU64,
    n_overflow: AtomicU64,
}

struct State {
    run: bool,
    /// Set while the worker is blocked on the wakeup condvar.
    waiting: bool,
    /// Per-column hint that the queue may hold data.
    ready: Vec<bool>,
    receivers: Vec<Arc<dyn Receiver>>,
    receivers_changed: bool,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

impl Shared {
    fn notify(&self, column: usize) {
        let mut g = self.state.lock();
        if let Some(ready) = g.ready.get_mut(column) {
            *ready = true;
        }
        let wake = g.waiting;
        drop(g);
        if wake {
            self.wakeup.notify_one();
        }
    }
}

struct WakeHandle {
    shared: Arc<Shared>,
}

impl Wakeup for WakeHandle {
    fn notify(&self, column: usize) {
        self.shared.notify(column);
    }
}

/// Owns one table's columns, their transport subscriptions, and the
/// assembler thread.
pub struct Aligner {
    columns: Arc<Vec<Column>>,
    adapters: Vec<Arc<SourceAdapter>>,
    subscriptions: Mutex<Vec<Box<dyn Subscription>>>,
    shared: Arc<Shared>,
    stats: Arc<Stats>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Aligner {
    /// Build columns for `names`, bind each through `connector`, and start
    /// the assembler thread.
    pub fn new(names: &[String], connector: &dyn Connector) -> Result<Self> {
        let columns: Arc<Vec<Column>> = Arc::new(
            names
                .iter()
                .map(|name| Column {
                    name: name.clone(),
                    queue: Arc::new(IngressQueue::new()),
                })
                .collect(),
        );

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                run: true,
                waiting: false,
                ready: vec![false; columns.len()],
                receivers: Vec::new(),
                receivers_changed: false,
            }),
            wakeup: Condvar::new(),
        });

        let mut adapters = Vec::with_capacity(columns.len());
        let mut subscriptions = Vec::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let adapter = Arc::new(SourceAdapter::new(
                column.name.clone(),
                i,
                Arc::clone(&column.queue),
                Arc::new(WakeHandle {
                    shared: Arc::clone(&shared),
                }) as Arc<dyn Wakeup>,
            ));
            let sub = connector
                .subscribe(Arc::clone(&adapter))
                .with_context(|| format!("subscribing to {}", column.name))?;
            adapters.push(adapter);
            subscriptions.push(sub);
        }

        let stats = Arc::new(Stats::default());
        let worker = {
            let columns = Arc::clone(&columns);
            let shared = Arc::clone(&shared);
            let stats = Arc::clone(&stats);
            std::thread::Builder::new()
                .name("aligner".to_string())
                .spawn(move || run_assembler(&columns, &shared, &stats))
                .context("spawning aligner thread")?
        };

        info!(columns = columns.len(), "aligner started");

        Ok(Self {
            columns,
            adapters,
            subscriptions: Mutex::new(subscriptions),
            shared,
            stats,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Column views for status sampling.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Ingest queue of one column. Status sampling and test drivers.
    pub fn queue(&self, column: usize) -> Arc<IngressQueue> {
        Arc::clone(&self.columns[column].queue)
    }

    /// Wake the assembler because `column`'s queue became non-empty.
    pub fn notify(&self, column: usize) {
        self.shared.notify(column);
    }

    /// Register a receiver. Its `names` hook is called before any slices
    /// are delivered to it.
    pub fn add_receiver(&self, receiver: Arc<dyn Receiver>) {
        let names = self.names();
        {
            let mut g = self.shared.state.lock();
            g.receivers.push(Arc::clone(&receiver));
            g.receivers_changed = true;
        }
        receiver.names(&names);
    }

    pub fn remove_receiver(&self, receiver: &Arc<dyn Receiver>) {
        let mut g = self.shared.state.lock();
        g.receivers.retain(|r| !Arc::ptr_eq(r, receiver));
        g.receivers_changed = true;
    }

    pub fn stats(&self) -> AlignerStats {
        AlignerStats {
            n_complete: self.stats.n_complete.load(Ordering::Relaxed),
            n_overflow: self.stats.n_overflow.load(Ordering::Relaxed),
        }
    }

    /// Tear down: cancel transports first so no callback can race the
    /// teardown, then stop and join the assembler thread.
    pub fn close(&self) {
        for sub in self.subscriptions.lock().iter_mut() {
            sub.cancel();
        }
        for adapter in &self.adapters {
            adapter.close();
        }

        {
            let mut g = self.shared.state.lock();
            g.run = false;
        }
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
            debug!("aligner stopped");
        }
    }
}

impl Drop for Aligner {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_assembler(columns: &[Column], shared: &Shared, stats: &Stats) {
    let ncols = columns.len();
    let mut pending: BTreeMap<u64, Vec<Option<SharedValue>>> = BTreeMap::new();
    let mut connected = vec![false; ncols];
    let mut oldest_key = 0u64;
    let mut completed: SliceBatch = Vec::new();
    let mut receivers_shadow: Vec<Arc<dyn Receiver>> = Vec::new();

    loop {
        let tunables = Tunables::snapshot();
        let will_wait;
        {
            let mut g = shared.state.lock();
            if !g.run {
                break;
            }
            g.waiting = false;

            let now_key = Timestamp::now().key();

            dequeue_phase(
                &mut g,
                columns,
                &mut pending,
                &mut connected,
                oldest_key,
                &tunables,
                stats,
            );
            expire_phase(
                &mut pending,
                &connected,
                &mut completed,
                &mut oldest_key,
                now_key,
                &tunables,
                stats,
            );

            if g.receivers_changed {
                receivers_shadow = g.receivers.clone();
                g.receivers_changed = false;
            }

            will_wait = g.waiting;
        }

        // Delivery and throttling run with no lock held.
        if !completed.is_empty() {
            stats
                .n_complete
                .fetch_add(completed.len() as u64, Ordering::Relaxed);
            for receiver in &receivers_shadow {
                receiver.slices(&completed);
            }
            completed.clear();

            let holdoff = tunables.flush_period_duration();
            if !holdoff.is_zero() {
                std::thread::sleep(holdoff);
            }
        }

        if will_wait {
            let mut g = shared.state.lock();
            while g.run && g.waiting && !g.ready.iter().any(|&r| r) {
                shared.wakeup.wait(&mut g);
            }
        }
    }
}

/// Drain the column queues into `pending` until every queue reports empty
/// or the pending map reaches the `max_events` bound.
fn dequeue_phase(
    g: &mut State,
    columns: &[Column],
    pending: &mut BTreeMap<u64, Vec<Option<SharedValue>>>,
    connected: &mut [bool],
    oldest_key: u64,
    tunables: &Tunables,
    stats: &Stats,
) {
    let max_events = tunables.max_events();
    let ncols = columns.len();
    let mut nothing = columns.is_empty();

    while !nothing && pending.len() < max_events {
        nothing = true;

        for (i, column) in columns.iter().enumerate() {
            // Column 0 is always polled; the rest only on a ready hint.
            if i != 0 && !g.ready[i] {
                continue;
            }

            let Some(value) = column.queue.pop() else {
                g.ready[i] = false;
                continue;
            };
            g.ready[i] = true;
            nothing = false;

            let key = value.key();
            connected[i] = value.is_connected();

            if connected[i] && key > oldest_key {
                let slice = pending.entry(key).or_insert_with(|| vec![None; ncols]);
                if slice[i].is_some() {
                    warn!(signal = %column.name, key, "ignoring duplicate key");
                } else {
                    slice[i] = Some(value);
                }
            } else if connected[i] {
                // Leftover older than the emit horizon.
                debug!(signal = %column.name, key, oldest_key, "discarding stale update");
            }
            // Disconnect markers are fully absorbed into `connected`.
        }
    }

    if !nothing {
        // Exited on the pending bound: shed load instead of growing.
        stats.n_overflow.fetch_add(1, Ordering::Relaxed);
        warn!(
            pending = pending.len(),
            max_events, "assembler overflow, truncating source queues",
        );
        for column in columns {
            column.queue.clear(4);
        }
    }

    g.waiting = nothing;
}

/// Decide which pending slices to emit and move them into `completed` in
/// key order, advancing `oldest_key`.
fn expire_phase(
    pending: &mut BTreeMap<u64, Vec<Option<SharedValue>>>,
    connected: &[bool],
    completed: &mut SliceBatch,
    oldest_key: &mut u64,
    now_key: u64,
    tunables: &Tunables,
    stats: &Stats,
) {
    let max_age = tunables.event_age_key() as i64;

    // Scan newest to oldest for the first slice that must be held back.
    // An age-expired slice ends the scan with everything flushable; all
    // slices newer than it were already seen to be complete.
    let mut flush_before: Option<u64> = None;
    for (&key, slice) in pending.iter().rev() {
        let age = (now_key as i64).wrapping_sub(key as i64);
        if age >= max_age {
            debug!(key, "force-flushing age-expired slices");
            break;
        }

        let complete = connected
            .iter()
            .enumerate()
            .all(|(c, &conn)| !conn || slice[c].is_some());
        if !complete {
            flush_before = Some(key);
            break;
        }
    }

    while let Some(entry) = pending.first_entry() {
        let key = *entry.key();
        if let Some(first_partial) = flush_before {
            if key >= first_partial {
                break;
            }
        }
        let slice = entry.remove();

        assert!(key > *oldest_key, "emit key must advance monotonically");
        *oldest_key = key;
        completed.push((key, slice));
    }

    // Carry over at most 4 partials between iterations.
    while pending.len() > 4 {
        pending.pop_first();
        stats.n_overflow.fetch_add(1, Ordering::Relaxed);
    }
}
