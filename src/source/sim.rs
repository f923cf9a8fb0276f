//! Simulation signal transport.
//!
//! Drives every subscribed column with synthetic updates sharing one
//! wall-clock timestamp per tick, so downstream slices complete the way
//! they would against a real beam-synchronous source. Optionally drops a
//! signal every N ticks for one tick to exercise disconnect handling.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use super::{Connector, NativeType, RawUpdate, SourceAdapter, Subscription};
use crate::value::{ElemType, Timestamp, ValueBuf};

struct SimShared {
    adapters: Mutex<Vec<Arc<SourceAdapter>>>,
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// In-process transport generating coordinated synthetic updates.
pub struct SimConnector {
    shared: Arc<SimShared>,
    period: Duration,
    /// Every this many ticks, one signal misses the tick as a disconnect.
    /// Zero disables dropout.
    dropout_period: u64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimConnector {
    pub fn new(rate_hz: f64, dropout_period: u64) -> Self {
        let rate = rate_hz.max(0.1);
        Self {
            shared: Arc::new(SimShared {
                adapters: Mutex::new(Vec::new()),
                stopped: Mutex::new(false),
                wake: Condvar::new(),
            }),
            period: Duration::from_secs_f64(1.0 / rate),
            dropout_period,
            worker: Mutex::new(None),
        }
    }

    /// Start the driver thread. Idempotent.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return;
        }
        *self.shared.stopped.lock() = false;

        let shared = Arc::clone(&self.shared);
        let period = self.period;
        let dropout_period = self.dropout_period;

        info!(period = ?period, dropout_period, "simulation source started");

        *worker = Some(
            std::thread::Builder::new()
                .name("sim-source".to_string())
                .spawn(move || run_driver(&shared, period, dropout_period))
                .expect("spawning sim-source thread"),
        );
    }

    /// Stop the driver thread and wait for it to exit.
    pub fn stop(&self) {
        {
            let mut stopped = self.shared.stopped.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
            debug!("simulation source stopped");
        }
    }
}

impl Drop for SimConnector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Connector for SimConnector {
    fn subscribe(&self, adapter: Arc<SourceAdapter>) -> Result<Box<dyn Subscription>> {
        adapter.begin_connect();
        adapter.on_connected(NativeType::Numeric(ElemType::F64));
        self.shared.adapters.lock().push(Arc::clone(&adapter));

        Ok(Box::new(SimSubscription {
            shared: Arc::clone(&self.shared),
            adapter,
        }))
    }
}

struct SimSubscription {
    shared: Arc<SimShared>,
    adapter: Arc<SourceAdapter>,
}

impl Subscription for SimSubscription {
    fn cancel(&mut self) {
        self.shared
            .adapters
            .lock()
            .retain(|a| !Arc::ptr_eq(a, &self.adapter));
        self.adapter.close();
    }
}

fn run_driver(shared: &SimShared, period: Duration, dropout_period: u64) {
    let mut tick = 0u64;
    let mut reconnect: Option<Arc<SourceAdapter>> = None;

    loop {
        {
            let mut stopped = shared.stopped.lock();
            if *stopped {
                return;
            }
            // Timed wait doubles as the tick period; a stop request ends
            // the wait early.
            shared.wake.wait_for(&mut stopped, period);
            if *stopped {
                return;
            }
        }

        let adapters = shared.adapters.lock().clone();
        if adapters.is_empty() {
            continue;
        }

        if let Some(adapter) = reconnect.take() {
            adapter.begin_connect();
            adapter.on_connected(NativeType::Numeric(ElemType::F64));
        }

        let skip = if dropout_period > 0 && tick > 0 && tick % dropout_period == 0 {
            let victim = ((tick / dropout_period - 1) as usize) % adapters.len();
            adapters[victim].on_disconnected();
            reconnect = Some(Arc::clone(&adapters[victim]));
            Some(victim)
        } else {
            None
        };

        drive_tick(&adapters, tick, skip);
        tick += 1;
    }
}

/// Deliver one coordinated update to every adapter except `skip`.
fn drive_tick(adapters: &[Arc<SourceAdapter>], tick: u64, skip: Option<usize>) {
    let ts = Timestamp::now();

    for (column, adapter) in adapters.iter().enumerate() {
        if skip == Some(column) {
            continue;
        }
        adapter.on_update(RawUpdate {
            ts,
            severity: 0,
            status: 0,
            data: ValueBuf::from(vec![tick as f64 + column as f64 * 0.5]),
        });
    }
}
