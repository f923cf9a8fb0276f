//! Column-typed table serialization.
//!
//! A [`TableSerializer`] consumes ordered slice batches from the aligner
//! and maintains a typed, column-major table document. Columns start as
//! scalar f64 and rebind when the data disagrees: a type or shape change
//! flags a retype, the transitional batch is dropped, and the schema is
//! rebuilt and re-opened before the next publish.

mod copier;

use std::sync::Arc;

use anyhow::{bail, Result};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use self::copier::{bind_copier, ColumnCopier, CopyResult};
use crate::aligner::{Receiver, SliceBatch};
use crate::export::health::HealthMetrics;
use crate::value::{ElemType, SharedValue, Timestamp, ValueBuf};

/// Column shape: one element per row, or a nested array per row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    Scalar,
    Array,
}

/// One output field of the table schema.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FieldSpec {
    /// Mangled field name, `[A-Za-z_][A-Za-z0-9_]*`.
    pub name: String,
    pub elem: ElemType,
    pub shape: Shape,
}

/// Table schema: raw signal labels plus one typed field per column.
/// Every table additionally carries trailing per-row `secondsPastEpoch`
/// and `nanoseconds` u32 arrays.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TableSchema {
    pub labels: Vec<String>,
    pub fields: Vec<FieldSpec>,
}

/// One row's worth of array-column payload.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum ArrayCell {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl ArrayCell {
    fn from_buf(buf: &ValueBuf) -> Self {
        match buf {
            ValueBuf::I8(v) => Self::I8(v.to_vec()),
            ValueBuf::I16(v) => Self::I16(v.to_vec()),
            ValueBuf::I32(v) => Self::I32(v.to_vec()),
            ValueBuf::F32(v) => Self::F32(v.to_vec()),
            ValueBuf::F64(v) => Self::F64(v.to_vec()),
        }
    }
}

/// One materialized output column.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(untagged)]
pub enum ColumnData {
    I8(Vec<i8>),
    I16(Vec<i16>),
    I32(Vec<i32>),
    F32(Vec<f32>),
    F64(Vec<f64>),
    Array(Vec<Option<ArrayCell>>),
}

impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::I8(v) => v.len(),
            Self::I16(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::F64(v) => v.len(),
            Self::Array(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A published table document. All column arrays and the two timestamp
/// arrays share the same length; row r is the r-th completed slice of the
/// batch.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TableSnapshot {
    pub labels: Vec<String>,
    pub columns: Vec<ColumnData>,
    #[serde(rename = "secondsPastEpoch")]
    pub seconds_past_epoch: Vec<u32>,
    pub nanoseconds: Vec<u32>,
}

/// Publish-side failure surface.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PostError {
    /// The handle has not been opened yet (startup race) or was closed.
    #[error("table handle not open")]
    NotOpen,
}

/// Downstream publish transport for table documents. Out of scope for the
/// core; implementations live behind this seam.
pub trait TableSink: Send + Sync {
    /// (Re-)open the published handle with a new schema.
    fn open(&self, schema: &TableSchema);

    /// Post one snapshot under the current schema.
    fn post(&self, snapshot: TableSnapshot) -> Result<(), PostError>;

    fn close(&self);
}

/// Per-column serializer state.
pub(crate) struct ColumnState {
    pub(crate) fname: String,
    pub(crate) elem: ElemType,
    pub(crate) shape: Shape,
    /// Last populated value, used for backfill (arrays only in practice).
    pub(crate) last: Option<SharedValue>,
}

/// Adjust a signal name into a valid output field name.
///
/// Characters outside `[A-Za-z0-9_]` are replaced by `_`, a leading digit
/// is replaced, and an empty name is rejected.
pub fn mangle_name(name: &str) -> Result<String> {
    if name.is_empty() {
        bail!("empty signal name not allowed");
    }

    Ok(name
        .chars()
        .enumerate()
        .map(|(i, c)| match c {
            'A'..='Z' | 'a'..='z' | '_' => c,
            '0'..='9' if i != 0 => c,
            _ => '_',
        })
        .collect())
}

struct Inner {
    /// Raw signal names, order matching the aligner's columns.
    names: Vec<String>,
    /// Raw names plus the trailing timestamp labels.
    labels: Vec<String>,
    columns: Vec<ColumnState>,
    copiers: Vec<Box<dyn ColumnCopier>>,
    retype: bool,
    /// Set when a name failed to mangle; publication is disabled.
    schema_error: bool,
    /// First publish-before-open race is swallowed silently.
    post_race_seen: bool,
}

/// Receiver that serializes slice batches into table snapshots.
pub struct TableSerializer {
    sink: Arc<dyn TableSink>,
    metrics: Option<Arc<HealthMetrics>>,
    inner: Mutex<Inner>,
}

impl TableSerializer {
    pub fn new(sink: Arc<dyn TableSink>, metrics: Option<Arc<HealthMetrics>>) -> Arc<Self> {
        Arc::new(Self {
            sink,
            metrics,
            inner: Mutex::new(Inner {
                names: Vec::new(),
                labels: Vec::new(),
                columns: Vec::new(),
                copiers: Vec::new(),
                retype: true,
                schema_error: false,
                post_race_seen: false,
            }),
        })
    }

    /// Raw signal names currently bound.
    pub fn signal_names(&self) -> Vec<String> {
        self.inner.lock().names.clone()
    }

    /// Close the published handle (table teardown).
    pub fn close(&self) {
        self.sink.close();
    }
}

impl Receiver for TableSerializer {
    fn names(&self, names: &[String]) {
        let mut schema_error = false;
        let columns: Vec<ColumnState> = names
            .iter()
            .map(|name| {
                let fname = match mangle_name(name) {
                    Ok(fname) => fname,
                    Err(e) => {
                        error!(error = %e, "invalid signal name, table disabled");
                        schema_error = true;
                        "_".to_string()
                    }
                };
                ColumnState {
                    fname,
                    // Assume scalar f64 until the data proves otherwise.
                    elem: ElemType::F64,
                    shape: Shape::Scalar,
                    last: None,
                }
            })
            .collect();

        let mut labels = names.to_vec();
        labels.push("secondsPastEpoch".to_string());
        labels.push("nanoseconds".to_string());

        {
            let mut g = self.inner.lock();
            g.schema_error = schema_error;
            g.names = names.to_vec();
            g.labels = labels;
            g.columns = columns;
            g.copiers.clear();
            g.retype = true;
        }

        self.sink.close();
    }

    fn slices(&self, batch: &SliceBatch) {
        let mut g = self.inner.lock();
        if g.schema_error {
            return;
        }

        if g.retype {
            g.retype = false;

            let schema = TableSchema {
                labels: g.labels.clone(),
                fields: g
                    .columns
                    .iter()
                    .map(|c| FieldSpec {
                        name: c.fname.clone(),
                        elem: c.elem,
                        shape: c.shape,
                    })
                    .collect(),
            };
            let copiers: Vec<Box<dyn ColumnCopier>> = g
                .columns
                .iter()
                .map(|c| bind_copier(c.elem, c.shape))
                .collect();
            g.copiers = copiers;

            debug!(columns = g.columns.len(), "rebuilding table schema");
            if let Some(metrics) = &self.metrics {
                metrics.retypes_total.inc();
            }

            self.sink.close();
            self.sink.open(&schema);
        }

        let mut seconds = Vec::with_capacity(batch.len());
        let mut nanoseconds = Vec::with_capacity(batch.len());
        for (key, _) in batch {
            let ts = Timestamp::from_key(*key);
            seconds.push(ts.posix_sec());
            nanoseconds.push(ts.nsec);
        }

        let mut data = Vec::with_capacity(g.columns.len());
        {
            let Inner {
                columns,
                copiers,
                retype,
                ..
            } = &mut *g;

            for (c, copier) in copiers.iter().enumerate() {
                match copier.copy(batch, c, &mut columns[c]) {
                    CopyResult::Data(column) => data.push(column),
                    CopyResult::Retype => {
                        *retype = true;
                        debug!(
                            column = %columns[c].fname,
                            "column type change, dropping transitional batch",
                        );
                        return;
                    }
                }
            }
        }

        let snapshot = TableSnapshot {
            labels: g.labels.clone(),
            columns: data,
            seconds_past_epoch: seconds,
            nanoseconds,
        };
        let race_seen = g.post_race_seen;
        drop(g);

        match self.sink.post(snapshot) {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.batches_published_total.inc();
                }
            }
            Err(PostError::NotOpen) => {
                if race_seen {
                    warn!("table post on unopened handle");
                } else {
                    self.inner.lock().post_race_seen = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::value::Value;

    #[derive(Debug, PartialEq)]
    enum SinkEvent {
        Open(TableSchema),
        Post(TableSnapshot),
        Close,
    }

    /// Records the open/post/close protocol; refuses posts while closed.
    struct RecordingSink {
        events: Mutex<Vec<SinkEvent>>,
        open: Mutex<bool>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                events: Mutex::new(Vec::new()),
                open: Mutex::new(false),
            })
        }

        fn posts(&self) -> Vec<TableSnapshot> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::Post(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }

        fn opens(&self) -> Vec<TableSchema> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| match e {
                    SinkEvent::Open(s) => Some(s.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl TableSink for RecordingSink {
        fn open(&self, schema: &TableSchema) {
            *self.open.lock() = true;
            self.events.lock().push(SinkEvent::Open(schema.clone()));
        }

        fn post(&self, snapshot: TableSnapshot) -> Result<(), PostError> {
            if !*self.open.lock() {
                return Err(PostError::NotOpen);
            }
            self.events.lock().push(SinkEvent::Post(snapshot));
            Ok(())
        }

        fn close(&self) {
            *self.open.lock() = false;
            self.events.lock().push(SinkEvent::Close);
        }
    }

    fn cell(val: f64) -> Option<SharedValue> {
        Some(Arc::new(Value::new(
            Timestamp::new(1, 0),
            0,
            0,
            ValueBuf::from(vec![val]),
        )))
    }

    fn names() -> Vec<String> {
        vec!["foo".to_string(), "bar".to_string()]
    }

    #[test]
    fn test_mangle_name() {
        assert_eq!(mangle_name("DEV:sig-1").expect("valid"), "DEV_sig_1");
        assert_eq!(mangle_name("plain_name").expect("valid"), "plain_name");
        assert_eq!(mangle_name("0abc").expect("valid"), "_abc");
        assert_eq!(mangle_name("a0bc").expect("valid"), "a0bc");
        assert!(mangle_name("").is_err());
    }

    #[test]
    fn test_initial_schema_all_scalar_f64() {
        let sink = RecordingSink::new();
        let ser = TableSerializer::new(Arc::clone(&sink) as Arc<dyn TableSink>, None);
        ser.names(&names());
        ser.slices(&Vec::new());

        let opens = sink.opens();
        assert_eq!(opens.len(), 1);
        assert_eq!(
            opens[0].labels,
            vec!["foo", "bar", "secondsPastEpoch", "nanoseconds"],
        );
        assert_eq!(
            opens[0].fields,
            vec![
                FieldSpec {
                    name: "foo".to_string(),
                    elem: ElemType::F64,
                    shape: Shape::Scalar,
                },
                FieldSpec {
                    name: "bar".to_string(),
                    elem: ElemType::F64,
                    shape: Shape::Scalar,
                },
            ],
        );

        // The empty batch still posts an empty table.
        let posts = sink.posts();
        assert_eq!(posts.len(), 1);
        assert!(posts[0].seconds_past_epoch.is_empty());
    }

    #[test]
    fn test_publish_rows_with_posix_offset() {
        let sink = RecordingSink::new();
        let ser = TableSerializer::new(Arc::clone(&sink) as Arc<dyn TableSink>, None);
        ser.names(&names());
        ser.slices(&Vec::new());

        let t0 = Timestamp::new(100, 7);
        let t1 = Timestamp::new(101, 8);
        let batch: SliceBatch = vec![
            (t0.key(), vec![cell(1.0), cell(2.0)]),
            (t1.key(), vec![cell(3.0), None]),
        ];
        ser.slices(&batch);

        let posts = sink.posts();
        assert_eq!(posts.len(), 2);
        let table = &posts[1];

        assert_eq!(
            table.seconds_past_epoch,
            vec![
                100 + crate::value::POSIX_TIME_AT_EPICS_EPOCH,
                101 + crate::value::POSIX_TIME_AT_EPICS_EPOCH,
            ],
        );
        assert_eq!(table.nanoseconds, vec![7, 8]);

        match (&table.columns[0], &table.columns[1]) {
            (ColumnData::F64(foo), ColumnData::F64(bar)) => {
                assert_eq!(foo, &vec![1.0, 3.0]);
                assert_eq!(bar[0], 2.0);
                assert!(bar[1].is_nan());
            }
            other => panic!("unexpected column data: {other:?}"),
        }
    }

    #[test]
    fn test_retype_drops_transitional_batch_and_rebuilds() {
        let sink = RecordingSink::new();
        let ser = TableSerializer::new(Arc::clone(&sink) as Arc<dyn TableSink>, None);
        ser.names(&names());
        ser.slices(&Vec::new());

        // foo switches to an i32 array of 8.
        let wave = Some(Arc::new(Value::new(
            Timestamp::new(10, 0),
            0,
            0,
            ValueBuf::from(vec![5i32; 8]),
        )));
        let transitional: SliceBatch =
            vec![(Timestamp::new(10, 0).key(), vec![wave.clone(), cell(1.0)])];
        ser.slices(&transitional);

        // Transitional batch dropped: still only the initial empty post.
        assert_eq!(sink.posts().len(), 1);

        // The next batch publishes under the rebuilt schema.
        let next: SliceBatch = vec![(Timestamp::new(11, 0).key(), vec![wave, cell(2.0)])];
        ser.slices(&next);

        let opens = sink.opens();
        assert_eq!(opens.len(), 2);
        assert_eq!(
            opens[1].fields[0],
            FieldSpec {
                name: "foo".to_string(),
                elem: ElemType::I32,
                shape: Shape::Array,
            },
        );

        let posts = sink.posts();
        assert_eq!(posts.len(), 2);
        match &posts[1].columns[0] {
            ColumnData::Array(cells) => {
                assert_eq!(cells[0], Some(ArrayCell::I32(vec![5; 8])));
            }
            other => panic!("unexpected column data: {other:?}"),
        }
    }

    #[test]
    fn test_post_before_open_swallowed_once() {
        struct NeverOpenSink;

        impl TableSink for NeverOpenSink {
            fn open(&self, _schema: &TableSchema) {}
            fn post(&self, _snapshot: TableSnapshot) -> Result<(), PostError> {
                Err(PostError::NotOpen)
            }
            fn close(&self) {}
        }

        let ser = TableSerializer::new(Arc::new(NeverOpenSink), None);
        ser.names(&names());
        // Both calls must come back cleanly.
        ser.slices(&Vec::new());
        ser.slices(&Vec::new());
    }

    #[test]
    fn test_names_resets_schema() {
        let sink = RecordingSink::new();
        let ser = TableSerializer::new(Arc::clone(&sink) as Arc<dyn TableSink>, None);
        ser.names(&names());
        ser.slices(&Vec::new());

        ser.names(&["baz".to_string()]);
        ser.slices(&Vec::new());

        let opens = sink.opens();
        assert_eq!(opens.len(), 2);
        assert_eq!(opens[1].labels, vec!["baz", "secondsPastEpoch", "nanoseconds"]);
        assert_eq!(ser.signal_names(), vec!["baz"]);
    }

    #[test]
    fn test_empty_signal_name_disables_table() {
        let sink = RecordingSink::new();
        let ser = TableSerializer::new(Arc::clone(&sink) as Arc<dyn TableSink>, None);
        ser.names(&[String::new()]);
        ser.slices(&Vec::new());

        assert!(sink.opens().is_empty());
        assert!(sink.posts().is_empty());
    }
}
