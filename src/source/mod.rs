pub mod sim;

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::ingress::IngressQueue;
use crate::value::{ElemType, Timestamp, Value, ValueBuf};

/// Wakeup side of the aligner. Called by source adapters whenever a
/// column's queue transitions from empty to non-empty.
pub trait Wakeup: Send + Sync {
    fn notify(&self, column: usize);
}

/// Transport seam: binds one adapter to its live signal. Connection
/// management and wire decoding live behind this trait.
pub trait Connector: Send + Sync {
    fn subscribe(&self, adapter: Arc<SourceAdapter>) -> Result<Box<dyn Subscription>>;
}

/// A live transport binding. `cancel` must stop all callbacks before it
/// returns; no pushes are possible afterwards.
pub trait Subscription: Send {
    fn cancel(&mut self);
}

/// Transport that never connects. Columns bound through it stay silent
/// until something pushes into their queues directly; used by tests and
/// by tables configured without a live source.
pub struct NullConnector;

impl Connector for NullConnector {
    fn subscribe(&self, adapter: Arc<SourceAdapter>) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(NullSubscription { adapter }))
    }
}

struct NullSubscription {
    adapter: Arc<SourceAdapter>,
}

impl Subscription for NullSubscription {
    fn cancel(&mut self) {
        self.adapter.close();
    }
}

/// Native value type reported by the transport on connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    Numeric(ElemType),
    /// String signals are unsupported; the adapter stays inert.
    String,
}

/// Adapter lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// One decoded update as delivered by the transport.
#[derive(Debug, Clone)]
pub struct RawUpdate {
    pub ts: Timestamp,
    pub severity: u16,
    pub status: u16,
    pub data: ValueBuf,
}

struct AdapterInner {
    lifecycle: AdapterState,
    /// Element type declared at connect time; updates must match it.
    declared: Option<ElemType>,
}

/// Per-column glue between a signal transport and the aligner: validates
/// updates, constructs immutable [`Value`]s, pushes them into the column's
/// ingress queue, and wakes the aligner on empty-to-non-empty transitions.
///
/// Transport failures never propagate: malformed updates and source-layer
/// errors are counted and discarded, and the adapter stays operational.
pub struct SourceAdapter {
    pub name: String,
    pub column: usize,
    queue: Arc<IngressQueue>,
    wakeup: Arc<dyn Wakeup>,
    inner: Mutex<AdapterInner>,
}

impl SourceAdapter {
    pub fn new(
        name: String,
        column: usize,
        queue: Arc<IngressQueue>,
        wakeup: Arc<dyn Wakeup>,
    ) -> Self {
        Self {
            name,
            column,
            queue,
            wakeup,
            inner: Mutex::new(AdapterInner {
                lifecycle: AdapterState::Idle,
                declared: None,
            }),
        }
    }

    pub fn state(&self) -> AdapterState {
        self.inner.lock().lifecycle
    }

    /// Transport is attempting to establish the connection.
    pub fn begin_connect(&self) {
        let mut g = self.inner.lock();
        if matches!(g.lifecycle, AdapterState::Idle | AdapterState::Disconnected) {
            g.lifecycle = AdapterState::Connecting;
        }
    }

    /// Connection established. A string-typed signal is logged once and
    /// left inert: no updates will be accepted for it.
    pub fn on_connected(&self, native: NativeType) {
        let mut g = self.inner.lock();
        if g.lifecycle == AdapterState::Closed {
            return;
        }

        match native {
            NativeType::String => {
                warn!(signal = %self.name, "string-typed signal not supported, ignoring");
                g.declared = None;
            }
            NativeType::Numeric(elem) => {
                g.declared = Some(elem);
                g.lifecycle = AdapterState::Connected;
                drop(g);
                self.queue.mark_connected();
                debug!(signal = %self.name, elem = elem.as_str(), "signal connected");
            }
        }
    }

    /// One update from the transport. Malformed updates (type mismatch
    /// with the declared type, empty payload) are counted and discarded.
    pub fn on_update(&self, update: RawUpdate) {
        let declared = {
            let g = self.inner.lock();
            if g.lifecycle != AdapterState::Connected {
                return;
            }
            g.declared
        };

        let Some(declared) = declared else {
            return; // inert (unsupported native type)
        };

        if update.data.is_empty() {
            warn!(signal = %self.name, "discarding empty update");
            self.queue.note_error();
            return;
        }

        if update.data.elem_type() != declared {
            warn!(
                signal = %self.name,
                declared = declared.as_str(),
                got = update.data.elem_type().as_str(),
                "discarding update with unexpected element type",
            );
            self.queue.note_error();
            return;
        }

        let value = Arc::new(Value::new(
            update.ts,
            update.severity,
            update.status,
            update.data,
        ));

        if self.queue.push(value) {
            self.wakeup.notify(self.column);
        }
    }

    /// Connection lost. Pushes a disconnect marker stamped with the
    /// current wall clock; its severity lets it bypass the aligner's
    /// stale-key filter and fold into the column's connected state.
    pub fn on_disconnected(&self) {
        {
            let mut g = self.inner.lock();
            if g.lifecycle != AdapterState::Connected {
                return;
            }
            g.lifecycle = AdapterState::Disconnected;
        }

        debug!(signal = %self.name, "signal disconnected");
        let marker = Arc::new(Value::disconnect(Timestamp::now()));
        if self.queue.push_disconnect(marker) {
            self.wakeup.notify(self.column);
        }
    }

    /// A failure inside the source layer. Counted; the adapter remains
    /// operational.
    pub fn on_error(&self, what: &str) {
        warn!(signal = %self.name, error = %what, "source layer error");
        self.queue.note_error();
    }

    /// Terminal: no callbacks are accepted after this returns. The owning
    /// subscription must be cancelled alongside.
    pub fn close(&self) {
        self.inner.lock().lifecycle = AdapterState::Closed;
    }
}
