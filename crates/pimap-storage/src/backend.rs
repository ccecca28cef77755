//! PIMAP Backend - Store Access Traits
//!
//! Async read and write seams between the metric engine and the stores.
//! The engine only sees these traits, so evaluation can be driven against
//! the local stores or any other implementation (remote stores, fault
//! injecting test doubles).
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::metric_store::{MetricStore, UpsertOutcome};
use crate::sample_store::SampleStore;
use async_trait::async_trait;
use pimap_common::{MetricKey, MetricRecord, Result, Sample, StreamId, Timestamp};

// =============================================================================
// Store Traits
// =============================================================================

/// Read access to raw samples.
#[async_trait]
pub trait SampleSource: Send + Sync {
    /// Samples of `stream` with `start <= timestamp < end`, in key order.
    async fn read_range(
        &self,
        stream: &StreamId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample>>;
}

/// Read/write access to derived metric records.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Current record for a metric key.
    async fn get(&self, key: &MetricKey) -> Result<Option<MetricRecord>>;

    /// Insert or replace the record for its key.
    async fn upsert(&self, record: MetricRecord) -> Result<UpsertOutcome>;
}

// =============================================================================
// Local Store Implementations
// =============================================================================

#[async_trait]
impl SampleSource for SampleStore {
    async fn read_range(
        &self,
        stream: &StreamId,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Sample>> {
        Ok(SampleStore::read_range(self, stream, start, end))
    }
}

#[async_trait]
impl MetricSink for MetricStore {
    async fn get(&self, key: &MetricKey) -> Result<Option<MetricRecord>> {
        Ok(MetricStore::get(self, key))
    }

    async fn upsert(&self, record: MetricRecord) -> Result<UpsertOutcome> {
        MetricStore::upsert(self, record)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pimap_common::{InputsVersion, Metric, MetricValue, ScopeId, MetricId};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_stores_behind_traits() {
        let samples = Arc::new(SampleStore::in_memory());
        samples
            .write(Sample::scalar("s1", Timestamp::from_millis(5), 2.0))
            .unwrap();
        let source: Arc<dyn SampleSource> = samples;
        let stream = StreamId::new("s1");
        let read = source
            .read_range(&stream, Timestamp::from_millis(0), Timestamp::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read.len(), 1);

        let sink: Arc<dyn MetricSink> = Arc::new(MetricStore::in_memory());
        let record = MetricRecord::Computed(Metric {
            metric_id: MetricId::new("sum"),
            scope: ScopeId::new("s1"),
            window_start: Timestamp::from_millis(0),
            window_end: Timestamp::from_millis(10),
            value: MetricValue::Scalar(2.0),
            inputs_version: InputsVersion(9),
            sample_count: 1,
        });
        let key = record.key();
        assert_eq!(sink.upsert(record.clone()).await.unwrap(), UpsertOutcome::Inserted);
        assert_eq!(sink.get(&key).await.unwrap(), Some(record));
    }
}
