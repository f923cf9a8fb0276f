use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Offset between the POSIX epoch and the source (EPICS) epoch, in seconds.
/// Added to `Timestamp::sec` when publishing wall-clock times downstream.
pub const POSIX_TIME_AT_EPICS_EPOCH: u32 = 631_152_000;

/// Alarm severity reserved for disconnect markers. Real alarm levels are 0..=3.
pub const SEVERITY_DISCONNECTED: u16 = 4;

/// Source timestamp: seconds and nanoseconds past the source epoch.
///
/// Orders and hashes as its composite 64-bit key, `(sec << 32) | nsec`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    pub sec: u32,
    pub nsec: u32,
}

impl Timestamp {
    pub const fn new(sec: u32, nsec: u32) -> Self {
        Self { sec, nsec }
    }

    /// The composite 64-bit alignment key.
    pub const fn key(self) -> u64 {
        ((self.sec as u64) << 32) | self.nsec as u64
    }

    pub const fn from_key(key: u64) -> Self {
        Self {
            sec: (key >> 32) as u32,
            nsec: key as u32,
        }
    }

    /// Current wall-clock time expressed in the source epoch.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: (elapsed.as_secs() as u32).saturating_sub(POSIX_TIME_AT_EPICS_EPOCH),
            nsec: elapsed.subsec_nanos(),
        }
    }

    /// Seconds field shifted to the POSIX epoch for publication.
    pub const fn posix_sec(self) -> u32 {
        self.sec.wrapping_add(POSIX_TIME_AT_EPICS_EPOCH)
    }
}

/// Element type of a signal's value buffer. String signals are unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElemType {
    I8,
    I16,
    I32,
    F32,
    F64,
}

impl ElemType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            Self::I8 => 1,
            Self::I16 => 2,
            Self::I32 => 4,
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Canonical label for logs and schema documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::I8 => "i8",
            Self::I16 => "i16",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

/// Immutably shared, typed element array carried by a [`Value`].
///
/// Cloning is cheap; the underlying storage is reference counted and is
/// freed when the last slice or publish batch holding it is dropped.
#[derive(Debug, Clone)]
pub enum ValueBuf {
    I8(Arc<[i8]>),
    I16(Arc<[i16]>),
    I32(Arc<[i32]>),
    F32(Arc<[f32]>),
    F64(Arc<[f64]>),
}

impl ValueBuf {
    pub fn elem_type(&self) -> ElemType {
        match self {
            Self::I8(_) => ElemType::I8,
            Self::I16(_) => ElemType::I16,
            Self::I32(_) => ElemType::I32,
            Self::F32(_) => ElemType::F32,
            Self::F64(_) => ElemType::F64,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total payload size in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * self.elem_type().size()
    }

    /// An empty buffer of the given element type (disconnect markers).
    pub fn empty(elem: ElemType) -> Self {
        match elem {
            ElemType::I8 => Self::I8(Arc::from([])),
            ElemType::I16 => Self::I16(Arc::from([])),
            ElemType::I32 => Self::I32(Arc::from([])),
            ElemType::F32 => Self::F32(Arc::from([])),
            ElemType::F64 => Self::F64(Arc::from([])),
        }
    }

    /// Element at `idx` widened to f64, if in range. Lossy for i32 beyond
    /// 2^53 but convenient for logs and the simulation driver.
    pub fn get_f64(&self, idx: usize) -> Option<f64> {
        match self {
            Self::I8(v) => v.get(idx).map(|&x| f64::from(x)),
            Self::I16(v) => v.get(idx).map(|&x| f64::from(x)),
            Self::I32(v) => v.get(idx).map(|&x| f64::from(x)),
            Self::F32(v) => v.get(idx).map(|&x| f64::from(x)),
            Self::F64(v) => v.get(idx).copied(),
        }
    }
}

impl From<Vec<f64>> for ValueBuf {
    fn from(v: Vec<f64>) -> Self {
        Self::F64(Arc::from(v))
    }
}

impl From<Vec<f32>> for ValueBuf {
    fn from(v: Vec<f32>) -> Self {
        Self::F32(Arc::from(v))
    }
}

impl From<Vec<i32>> for ValueBuf {
    fn from(v: Vec<i32>) -> Self {
        Self::I32(Arc::from(v))
    }
}

impl From<Vec<i16>> for ValueBuf {
    fn from(v: Vec<i16>) -> Self {
        Self::I16(Arc::from(v))
    }
}

impl From<Vec<i8>> for ValueBuf {
    fn from(v: Vec<i8>) -> Self {
        Self::I8(Arc::from(v))
    }
}

/// One timestamped update from a signal source. Observably immutable once
/// constructed; shared by reference counting between the ingress queue, at
/// most one slice, and downstream publication.
#[derive(Debug, Clone)]
pub struct Value {
    pub ts: Timestamp,
    /// Alarm severity, 0..=3, or [`SEVERITY_DISCONNECTED`].
    pub severity: u16,
    /// Opaque status code from the source.
    pub status: u16,
    /// Element count, >= 1 for data updates.
    pub count: u32,
    pub buffer: ValueBuf,
}

impl Value {
    /// Build a data update. `count` is taken from the buffer length.
    pub fn new(ts: Timestamp, severity: u16, status: u16, buffer: ValueBuf) -> Self {
        Self {
            ts,
            severity,
            status,
            count: buffer.len() as u32,
            buffer,
        }
    }

    /// Build a disconnect marker stamped with the detection time. Fields
    /// other than the timestamp carry no information.
    pub fn disconnect(ts: Timestamp) -> Self {
        Self {
            ts,
            severity: SEVERITY_DISCONNECTED,
            status: 0,
            count: 1,
            buffer: ValueBuf::empty(ElemType::F64),
        }
    }

    /// True for real data (severity 0..=3), false for disconnect markers.
    pub fn is_connected(&self) -> bool {
        self.severity <= 3
    }

    pub fn key(&self) -> u64 {
        self.ts.key()
    }

    pub fn nbytes(&self) -> usize {
        self.buffer.nbytes()
    }
}

/// Shared handle to an immutable update.
pub type SharedValue = Arc<Value>;
