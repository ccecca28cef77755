//! PIMAP Metric Store - Derived Metric Storage
//!
//! Holds at most one record per metric key: either the computed metric or an
//! explicit failure marker. Recomputation overwrites in place; an upsert of
//! an identical record is a no-op and is not logged.
//!
//! Key Features:
//! - Upsert keyed by (metric, scope, window_start, window_end)
//! - Range reads ordered by window start for the Visualize stage
//! - Last-record-wins replay from the record log
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::log::{LogRecordType, RecordLog};
use parking_lot::RwLock;
use pimap_common::config::StorageConfig;
use pimap_common::{
    InputsVersion, MetricId, MetricKey, MetricRecord, Result, ScopeId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Upsert Outcome
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced,
    /// The stored record was already identical.
    Unchanged,
}

// =============================================================================
// Statistics
// =============================================================================

/// Metric store counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricStoreStats {
    pub records: usize,
    pub failures: usize,
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
}

// =============================================================================
// Metric Store
// =============================================================================

/// Durable key/value storage of metric records.
pub struct MetricStore {
    records: RwLock<BTreeMap<MetricKey, MetricRecord>>,
    log: Option<RecordLog>,
    inserted: AtomicU64,
    replaced: AtomicU64,
    unchanged: AtomicU64,
}

impl MetricStore {
    pub fn in_memory() -> Self {
        Self {
            records: RwLock::new(BTreeMap::new()),
            log: None,
            inserted: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            unchanged: AtomicU64::new(0),
        }
    }

    /// Open the store described by `config`, replaying its log if persistent.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let Some(dir) = config.metrics_directory() else {
            return Ok(Self::in_memory());
        };

        let (log, recovery) =
            RecordLog::open_and_recover(dir, config.segment_size, config.sync_writes)?;

        let mut records = BTreeMap::new();
        for record in &recovery.records {
            if record.record_type != LogRecordType::Metric {
                continue;
            }
            let metric: MetricRecord = record.decode()?;
            records.insert(metric.key(), metric);
        }

        tracing::info!(
            records = records.len(),
            replayed = recovery.records.len(),
            "metric store opened"
        );

        Ok(Self {
            records: RwLock::new(records),
            log: Some(log),
            ..Self::in_memory()
        })
    }

    /// Insert or replace the record for its key.
    pub fn upsert(&self, record: MetricRecord) -> Result<UpsertOutcome> {
        let key = record.key();
        let mut records = self.records.write();

        let outcome = match records.get(&key) {
            Some(existing) if *existing == record => {
                self.unchanged.fetch_add(1, Ordering::Relaxed);
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) => UpsertOutcome::Replaced,
            None => UpsertOutcome::Inserted,
        };

        if let Some(log) = &self.log {
            log.append_json(LogRecordType::Metric, &record)?;
        }
        records.insert(key, record);

        match outcome {
            UpsertOutcome::Inserted => self.inserted.fetch_add(1, Ordering::Relaxed),
            _ => self.replaced.fetch_add(1, Ordering::Relaxed),
        };
        Ok(outcome)
    }

    pub fn get(&self, key: &MetricKey) -> Option<MetricRecord> {
        self.records.read().get(key).cloned()
    }

    /// Inputs version of the computed metric for `key`, if any.
    pub fn current_version(&self, key: &MetricKey) -> Option<InputsVersion> {
        self.records
            .read()
            .get(key)
            .and_then(|r| r.as_metric())
            .map(|m| m.inputs_version)
    }

    /// Records with `start <= window_start < end`, ordered by window start
    /// then window end.
    pub fn read_range(
        &self,
        metric_id: &MetricId,
        scope: &ScopeId,
        start: Timestamp,
        end: Timestamp,
    ) -> Vec<MetricRecord> {
        if start >= end {
            return Vec::new();
        }
        let lower = MetricKey {
            metric_id: metric_id.clone(),
            scope: scope.clone(),
            window_start: start,
            window_end: Timestamp::MIN,
        };
        let upper = MetricKey {
            metric_id: metric_id.clone(),
            scope: scope.clone(),
            window_start: end,
            window_end: Timestamp::MIN,
        };
        self.records
            .read()
            .range(lower..upper)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        match &self.log {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> MetricStoreStats {
        let records = self.records.read();
        MetricStoreStats {
            records: records.len(),
            failures: records.values().filter(|r| r.is_failure()).count(),
            inserted: self.inserted.load(Ordering::Relaxed),
            replaced: self.replaced.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
        }
    }
}

impl Default for MetricStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pimap_common::{FailureClass, Metric, MetricFailure, MetricValue};

    fn metric(scope: &str, start_ms: i64, value: f64, version: u128) -> MetricRecord {
        MetricRecord::Computed(Metric {
            metric_id: MetricId::new("sum"),
            scope: ScopeId::new(scope),
            window_start: Timestamp::from_millis(start_ms),
            window_end: Timestamp::from_millis(start_ms + 1_000),
            value: MetricValue::Scalar(value),
            inputs_version: InputsVersion(version),
            sample_count: 1,
        })
    }

    #[test]
    fn test_upsert_outcomes() {
        let store = MetricStore::in_memory();
        assert_eq!(store.upsert(metric("s1", 0, 6.0, 1)).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(metric("s1", 0, 6.0, 1)).unwrap(), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert(metric("s1", 0, 7.0, 2)).unwrap(), UpsertOutcome::Replaced);
        assert_eq!(store.len(), 1);

        let key = metric("s1", 0, 0.0, 0).key();
        assert_eq!(store.current_version(&key), Some(InputsVersion(2)));

        let stats = store.stats();
        assert_eq!((stats.inserted, stats.replaced, stats.unchanged), (1, 1, 1));
    }

    #[test]
    fn test_failure_marker_replaced_by_metric() {
        let store = MetricStore::in_memory();
        let key = metric("s1", 0, 0.0, 0).key();
        let failure = MetricRecord::Failed(MetricFailure {
            metric_id: key.metric_id.clone(),
            scope: key.scope.clone(),
            window_start: key.window_start,
            window_end: key.window_end,
            class: FailureClass::Transient,
            error: "store unavailable".to_string(),
            attempts: 3,
            inputs_version: None,
        });

        store.upsert(failure).unwrap();
        assert!(store.get(&key).unwrap().is_failure());
        assert_eq!(store.current_version(&key), None);
        assert_eq!(store.stats().failures, 1);

        assert_eq!(store.upsert(metric("s1", 0, 6.0, 1)).unwrap(), UpsertOutcome::Replaced);
        assert!(!store.get(&key).unwrap().is_failure());
    }

    #[test]
    fn test_read_range_ordering_and_isolation() {
        let store = MetricStore::in_memory();
        for start in [3_000, 0, 2_000, 1_000] {
            store.upsert(metric("s1", start, 1.0, 1)).unwrap();
        }
        store.upsert(metric("s2", 1_000, 9.0, 1)).unwrap();

        let records = store.read_range(
            &MetricId::new("sum"),
            &ScopeId::new("s1"),
            Timestamp::from_millis(1_000),
            Timestamp::from_millis(3_000),
        );
        let starts: Vec<i64> = records.iter().map(|r| r.window_start().as_millis()).collect();
        assert_eq!(starts, vec![1_000, 2_000]);

        let other = store.read_range(
            &MetricId::new("sum"),
            &ScopeId::new("s2"),
            Timestamp::from_millis(0),
            Timestamp::from_millis(10_000),
        );
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_replay_last_record_wins() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");
        let config = StorageConfig {
            data_directory: Some(temp_dir.path().to_path_buf()),
            sync_writes: false,
            ..Default::default()
        };

        {
            let store = MetricStore::open(&config).unwrap();
            store.upsert(metric("s1", 0, 6.0, 1)).unwrap();
            store.upsert(metric("s1", 0, 7.0, 2)).unwrap();
            store.upsert(metric("s1", 1_000, 1.0, 3)).unwrap();
        }

        let store = MetricStore::open(&config).unwrap();
        assert_eq!(store.len(), 2);
        let key = metric("s1", 0, 0.0, 0).key();
        let record = store.get(&key).unwrap();
        assert_eq!(record.as_metric().unwrap().value, MetricValue::Scalar(7.0));
    }
}
