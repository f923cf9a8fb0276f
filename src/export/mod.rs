pub mod api;
pub mod health;

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::table::{PostError, TableSchema, TableSink, TableSnapshot};
use crate::value::Timestamp;

/// One row of the per-table status document.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct SignalStatus {
    #[serde(rename = "PV")]
    pub name: String,
    pub connected: bool,
    #[serde(rename = "nEvent")]
    pub n_updates: u64,
    #[serde(rename = "nBytes")]
    pub n_bytes: u64,
    #[serde(rename = "nDiscon")]
    pub n_disconnects: u64,
    #[serde(rename = "nError")]
    pub n_errors: u64,
    #[serde(rename = "nOFlow")]
    pub n_overflows: u64,
}

/// Table-wide counters snapshot, one row per signal. Counters cover the
/// interval since the previous snapshot.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct StatusSnapshot {
    pub labels: Vec<String>,
    pub signals: Vec<SignalStatus>,
    #[serde(rename = "secondsPastEpoch")]
    pub seconds_past_epoch: u32,
    pub nanoseconds: u32,
}

impl StatusSnapshot {
    pub fn new(signals: Vec<SignalStatus>, now: Timestamp) -> Self {
        Self {
            labels: [
                "PV",
                "connected",
                "#Event",
                "#Bytes",
                "#Discon",
                "#Error",
                "#OFlow",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            signals,
            seconds_past_epoch: now.posix_sec(),
            nanoseconds: now.nsec,
        }
    }
}

/// Downstream publish transport for status documents.
pub trait StatusSink: Send + Sync {
    fn post(&self, snapshot: StatusSnapshot);
}

/// Table sink holding the latest schema and snapshot in memory. Serves
/// the HTTP table endpoint and the tests.
#[derive(Default)]
pub struct MemoryTableSink {
    schema: ArcSwapOption<TableSchema>,
    latest: ArcSwapOption<TableSnapshot>,
}

impl MemoryTableSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn schema(&self) -> Option<Arc<TableSchema>> {
        self.schema.load_full()
    }

    /// Last published table document, retained across handle reopens.
    pub fn latest(&self) -> Option<Arc<TableSnapshot>> {
        self.latest.load_full()
    }
}

impl TableSink for MemoryTableSink {
    fn open(&self, schema: &TableSchema) {
        self.schema.store(Some(Arc::new(schema.clone())));
    }

    fn post(&self, snapshot: TableSnapshot) -> Result<(), PostError> {
        if self.schema.load().is_none() {
            return Err(PostError::NotOpen);
        }
        self.latest.store(Some(Arc::new(snapshot)));
        Ok(())
    }

    fn close(&self) {
        self.schema.store(None);
    }
}

/// Status sink holding the latest snapshot in memory.
#[derive(Default)]
pub struct MemoryStatusSink {
    latest: ArcSwapOption<StatusSnapshot>,
}

impl MemoryStatusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn latest(&self) -> Option<Arc<StatusSnapshot>> {
        self.latest.load_full()
    }
}

impl StatusSink for MemoryStatusSink {
    fn post(&self, snapshot: StatusSnapshot) {
        self.latest.store(Some(Arc::new(snapshot)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnData, FieldSpec, Shape};
    use crate::value::ElemType;

    fn schema() -> TableSchema {
        TableSchema {
            labels: vec!["foo".to_string()],
            fields: vec![FieldSpec {
                name: "foo".to_string(),
                elem: ElemType::F64,
                shape: Shape::Scalar,
            }],
        }
    }

    fn snapshot() -> TableSnapshot {
        TableSnapshot {
            labels: vec!["foo".to_string()],
            columns: vec![ColumnData::F64(vec![1.0])],
            seconds_past_epoch: vec![1],
            nanoseconds: vec![2],
        }
    }

    #[test]
    fn test_memory_table_sink_rejects_post_before_open() {
        let sink = MemoryTableSink::new();
        assert_eq!(sink.post(snapshot()), Err(PostError::NotOpen));

        sink.open(&schema());
        assert!(sink.post(snapshot()).is_ok());
        assert!(sink.latest().is_some());
        assert_eq!(sink.schema().expect("schema").fields.len(), 1);
    }

    #[test]
    fn test_memory_table_sink_close_retains_latest() {
        let sink = MemoryTableSink::new();
        sink.open(&schema());
        sink.post(snapshot()).expect("post");
        sink.close();

        assert!(sink.schema().is_none());
        assert!(sink.latest().is_some());
        assert_eq!(sink.post(snapshot()), Err(PostError::NotOpen));
    }

    #[test]
    fn test_status_snapshot_labels() {
        let snap = StatusSnapshot::new(Vec::new(), Timestamp::new(10, 20));
        assert_eq!(snap.labels[0], "PV");
        assert_eq!(snap.labels.len(), 7);
        assert_eq!(
            snap.seconds_past_epoch,
            10 + crate::value::POSIX_TIME_AT_EPICS_EPOCH,
        );
    }

    #[test]
    fn test_memory_status_sink() {
        let sink = MemoryStatusSink::new();
        assert!(sink.latest().is_none());

        sink.post(StatusSnapshot::new(Vec::new(), Timestamp::new(1, 0)));
        assert!(sink.latest().is_some());
    }
}
