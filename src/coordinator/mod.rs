//! Per-table coordination.
//!
//! A [`Coordinator`] owns one (signal list, aligner, serializer) triple.
//! A handler thread applies signal-list updates by tearing the pair down
//! and rebuilding it (sources cancelled first, then the assembler joined,
//! then the published handle closed), and once per second samples every
//! column's ingest counters into a status document, zeroing them in the
//! same breath.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{error, info};

use crate::aligner::{Aligner, Receiver};
use crate::export::health::HealthMetrics;
use crate::export::{SignalStatus, StatusSink, StatusSnapshot};
use crate::ingress::IngressQueue;
use crate::source::Connector;
use crate::table::{TableSerializer, TableSink};
use crate::value::Timestamp;

struct TablePair {
    aligner: Aligner,
    serializer: Arc<TableSerializer>,
}

struct CoordState {
    running: bool,
    signals: Vec<String>,
    signals_changed: bool,
    pair: Option<TablePair>,
}

struct CoordShared {
    prefix: String,
    state: Mutex<CoordState>,
    wakeup: Condvar,
    connector: Arc<dyn Connector>,
    table_sink: Arc<dyn TableSink>,
    status_sink: Arc<dyn StatusSink>,
    metrics: Option<Arc<HealthMetrics>>,
}

/// Owns one table's aligner/serializer pair and its control state.
pub struct Coordinator {
    shared: Arc<CoordShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        prefix: String,
        initial_signals: Vec<String>,
        connector: Arc<dyn Connector>,
        table_sink: Arc<dyn TableSink>,
        status_sink: Arc<dyn StatusSink>,
        metrics: Option<Arc<HealthMetrics>>,
    ) -> Result<Self> {
        if prefix.is_empty() {
            bail!("table prefix must not be empty");
        }
        validate_signals(&initial_signals)?;

        let shared = Arc::new(CoordShared {
            prefix: prefix.clone(),
            state: Mutex::new(CoordState {
                running: true,
                signals: initial_signals,
                signals_changed: true,
                pair: None,
            }),
            wakeup: Condvar::new(),
            connector,
            table_sink,
            status_sink,
            metrics,
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("coord-{prefix}"))
                .spawn(move || run_handler(&shared))
                .context("spawning coordinator thread")?
        };

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn prefix(&self) -> &str {
        &self.shared.prefix
    }

    /// Currently configured signal names.
    pub fn signals(&self) -> Vec<String> {
        self.shared.state.lock().signals.clone()
    }

    /// Replace the column set. Validated synchronously; the rebuild runs
    /// on the handler thread. Re-writing the current list is a no-op, so
    /// repeated identical writes cause exactly one teardown/rebuild.
    pub fn set_signals(&self, signals: Vec<String>) -> Result<()> {
        validate_signals(&signals)?;

        {
            let mut g = self.shared.state.lock();
            if g.signals == signals {
                return Ok(());
            }
            g.signals = signals;
            g.signals_changed = true;
        }
        self.shared.wakeup.notify_all();
        Ok(())
    }

    /// Stop the handler thread and tear down the table pair.
    pub fn close(&self) {
        {
            let mut g = self.shared.state.lock();
            g.running = false;
        }
        self.shared.wakeup.notify_all();

        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
            info!(prefix = %self.shared.prefix, "coordinator stopped");
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_signals(signals: &[String]) -> Result<()> {
    for name in signals {
        if name.is_empty() {
            bail!("empty signal name not allowed");
        }
    }
    Ok(())
}

fn run_handler(shared: &CoordShared) {
    let mut expire = false;

    loop {
        let (changing, signals) = {
            let mut g = shared.state.lock();
            if !g.running {
                break;
            }
            let changing = g.signals_changed;
            g.signals_changed = false;
            (changing, g.signals.clone())
        };

        if changing {
            rebuild(shared, &signals);
        }

        if expire || changing {
            publish_status(shared);
        }

        {
            let mut g = shared.state.lock();
            if !g.running {
                break;
            }
            expire = shared
                .wakeup
                .wait_for(&mut g, Duration::from_secs(1))
                .timed_out();
        }
    }

    teardown(shared);
}

/// Tear down the existing pair (if any) and build a fresh one for the
/// given signal list.
fn rebuild(shared: &CoordShared, signals: &[String]) {
    teardown(shared);

    match Aligner::new(signals, shared.connector.as_ref()) {
        Ok(aligner) => {
            let serializer =
                TableSerializer::new(Arc::clone(&shared.table_sink), shared.metrics.clone());
            aligner.add_receiver(Arc::clone(&serializer) as Arc<dyn Receiver>);
            // One empty pass opens the initial all-f64 schema before any
            // data arrives.
            serializer.slices(&Vec::new());

            info!(
                prefix = %shared.prefix,
                signals = signals.len(),
                "table rebuilt",
            );
            shared.state.lock().pair = Some(TablePair {
                aligner,
                serializer,
            });
        }
        Err(e) => {
            error!(prefix = %shared.prefix, error = %e, "failed to build table");
        }
    }
}

/// Sources first, then the assembler, then the published handle.
fn teardown(shared: &CoordShared) {
    let pair = shared.state.lock().pair.take();
    if let Some(pair) = pair {
        pair.aligner.close();
        pair.serializer.close();
    }
}

fn publish_status(shared: &CoordShared) {
    // Grab column handles under the coordinator lock, sample unlocked.
    let (columns, stats): (Vec<(String, Arc<IngressQueue>)>, _) = {
        let g = shared.state.lock();
        match &g.pair {
            Some(pair) => (
                pair.aligner
                    .columns()
                    .iter()
                    .map(|c| (c.name.clone(), Arc::clone(&c.queue)))
                    .collect(),
                Some(pair.aligner.stats()),
            ),
            None => (Vec::new(), None),
        }
    };

    let mut signals = Vec::with_capacity(columns.len());
    let mut connected_count = 0i64;

    for (name, queue) in columns {
        let (counters, connected) = queue.snapshot_and_zero();
        if connected {
            connected_count += 1;
        }

        if let Some(metrics) = &shared.metrics {
            metrics.updates_total.inc_by(counters.n_updates);
            metrics.bytes_total.inc_by(counters.n_bytes);
            metrics.disconnects_total.inc_by(counters.n_disconnects);
            metrics.errors_total.inc_by(counters.n_errors);
            metrics.queue_overflows_total.inc_by(counters.n_overflows);
        }

        signals.push(SignalStatus {
            name,
            connected,
            n_updates: counters.n_updates,
            n_bytes: counters.n_bytes,
            n_disconnects: counters.n_disconnects,
            n_errors: counters.n_errors,
            n_overflows: counters.n_overflows,
        });
    }

    if let Some(metrics) = &shared.metrics {
        let table = shared.prefix.as_str();
        metrics
            .signals_connected
            .with_label_values(&[table])
            .set(connected_count);
        if let Some(stats) = stats {
            metrics
                .slices_emitted
                .with_label_values(&[table])
                .set(stats.n_complete as i64);
            metrics
                .assembler_overflows
                .with_label_values(&[table])
                .set(stats.n_overflow as i64);
        }
    }

    shared
        .status_sink
        .post(StatusSnapshot::new(signals, Timestamp::now()));
}
