//! PIMAP Sample Store - Raw Sample Storage
//!
//! Append-only storage for timestamped sensor samples, partitioned by
//! stream. Each partition keeps its samples ordered by
//! `(timestamp, sequence)` so window range reads are a single ordered scan.
//!
//! Key Features:
//! - Idempotent writes keyed by (stream, timestamp, sequence)
//! - Conflicting re-writes rejected instead of overwritten
//! - Per-stream locking for parallel ingest across streams
//! - Record log durability with replay on open
//! - Write-order cursor for replaying samples stored after a checkpoint
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use crate::log::{LogRecordType, RecordLog};
use parking_lot::{Mutex, RwLock};
use pimap_common::config::StorageConfig;
use pimap_common::{
    Lsn, PimapError, Result, Sample, SampleKey, SampleValue, StreamId, Timestamp,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

// =============================================================================
// Write Outcome
// =============================================================================

/// Result of a successful sample write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The sample was new and is now durable. Carries the stream's
    /// observed-maximum timestamp after the write.
    Stored { observed_max: Timestamp },
    /// An identical sample was already stored.
    Unchanged,
}

// =============================================================================
// Stream Partition
// =============================================================================

#[derive(Default)]
struct StreamPartition {
    samples: BTreeMap<(Timestamp, u64), SampleValue>,
    /// Write position of every stored sample.
    written: BTreeMap<Lsn, (Timestamp, u64)>,
    max_timestamp: Option<Timestamp>,
}

impl StreamPartition {
    fn insert(
        &mut self,
        lsn: Lsn,
        timestamp: Timestamp,
        sequence: u64,
        value: SampleValue,
    ) -> Timestamp {
        self.samples.insert((timestamp, sequence), value);
        self.written.insert(lsn, (timestamp, sequence));
        let max = self.max_timestamp.map_or(timestamp, |m| m.max(timestamp));
        self.max_timestamp = Some(max);
        max
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Sample store counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleStoreStats {
    pub streams: usize,
    pub samples: usize,
    pub stored: u64,
    pub unchanged: u64,
    pub rejected: u64,
    pub recovered: u64,
}

#[derive(Default)]
struct Counters {
    stored: AtomicU64,
    unchanged: AtomicU64,
    rejected: AtomicU64,
    recovered: AtomicU64,
}

// =============================================================================
// Sample Store
// =============================================================================

/// Durable, append-only sample storage.
pub struct SampleStore {
    partitions: RwLock<HashMap<StreamId, Arc<Mutex<StreamPartition>>>>,
    log: Option<RecordLog>,
    /// Highest write position handed out so far.
    high_water: AtomicU64,
    counters: Counters,
}

impl SampleStore {
    /// Memory-only store.
    pub fn in_memory() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            log: None,
            high_water: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    /// Open the store described by `config`, replaying its log if persistent.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let Some(dir) = config.samples_directory() else {
            return Ok(Self::in_memory());
        };

        let (log, recovery) =
            RecordLog::open_and_recover(dir, config.segment_size, config.sync_writes)?;
        let mut store = Self::in_memory();

        {
            let mut partitions = store.partitions.write();
            for record in &recovery.records {
                if record.record_type != LogRecordType::Sample {
                    continue;
                }
                let sample: Sample = record.decode()?;
                let partition = partitions
                    .entry(sample.stream_id.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(StreamPartition::default())));
                partition
                    .lock()
                    .insert(record.lsn, sample.timestamp, sample.sequence, sample.value);
            }
        }

        store
            .counters
            .recovered
            .store(recovery.records.len() as u64, Ordering::Relaxed);
        store
            .high_water
            .store(recovery.max_lsn.0, Ordering::SeqCst);
        store.log = Some(log);

        tracing::info!(
            streams = store.partitions.read().len(),
            samples = recovery.records.len(),
            "sample store opened"
        );
        Ok(store)
    }

    fn partition(&self, stream: &StreamId) -> Option<Arc<Mutex<StreamPartition>>> {
        self.partitions.read().get(stream).cloned()
    }

    fn partition_or_create(&self, stream: &StreamId) -> Arc<Mutex<StreamPartition>> {
        if let Some(partition) = self.partition(stream) {
            return partition;
        }
        self.partitions
            .write()
            .entry(stream.clone())
            .or_insert_with(|| Arc::new(Mutex::new(StreamPartition::default())))
            .clone()
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    /// Store a sample.
    ///
    /// Re-writing an identical sample succeeds without change; re-writing a
    /// key with a different payload is a `DuplicateSample` conflict.
    pub fn write(&self, sample: Sample) -> Result<WriteOutcome> {
        if let Err(e) = sample.validate() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(e);
        }

        let partition = self.partition_or_create(&sample.stream_id);
        let mut partition = partition.lock();

        if let Some(existing) = partition.samples.get(&(sample.timestamp, sample.sequence)) {
            if *existing == sample.value {
                self.counters.unchanged.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %sample.key(), "duplicate sample ignored");
                return Ok(WriteOutcome::Unchanged);
            }
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(PimapError::DuplicateSample(sample.key().to_string()));
        }

        let lsn = match &self.log {
            Some(log) => log.append_json(LogRecordType::Sample, &sample)?,
            None => Lsn(self.high_water.fetch_add(1, Ordering::SeqCst) + 1),
        };
        self.high_water.fetch_max(lsn.0, Ordering::SeqCst);

        let observed_max =
            partition.insert(lsn, sample.timestamp, sample.sequence, sample.value);
        self.counters.stored.fetch_add(1, Ordering::Relaxed);
        Ok(WriteOutcome::Stored { observed_max })
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    /// Samples with `start <= timestamp < end`, ordered by (timestamp, sequence).
    pub fn read_range(&self, stream: &StreamId, start: Timestamp, end: Timestamp) -> Vec<Sample> {
        if start >= end {
            return Vec::new();
        }
        let Some(partition) = self.partition(stream) else {
            return Vec::new();
        };
        let partition = partition.lock();
        partition
            .samples
            .range((start, 0)..(end, 0))
            .map(|(&(timestamp, sequence), value)| Sample {
                stream_id: stream.clone(),
                timestamp,
                sequence,
                value: value.clone(),
            })
            .collect()
    }

    /// Sample with the highest (timestamp, sequence) in the stream.
    pub fn latest(&self, stream: &StreamId) -> Option<Sample> {
        let partition = self.partition(stream)?;
        let partition = partition.lock();
        partition
            .samples
            .last_key_value()
            .map(|(&(timestamp, sequence), value)| Sample {
                stream_id: stream.clone(),
                timestamp,
                sequence,
                value: value.clone(),
            })
    }

    pub fn get(&self, key: &SampleKey) -> Option<Sample> {
        let partition = self.partition(&key.stream_id)?;
        let partition = partition.lock();
        partition
            .samples
            .get(&(key.timestamp, key.sequence))
            .map(|value| Sample {
                stream_id: key.stream_id.clone(),
                timestamp: key.timestamp,
                sequence: key.sequence,
                value: value.clone(),
            })
    }

    /// Write position of the most recently stored sample, `Lsn(0)` when
    /// nothing has been stored.
    pub fn high_water(&self) -> Lsn {
        Lsn(self.high_water.load(Ordering::SeqCst))
    }

    /// Samples stored after write position `after`, in write order.
    pub fn samples_after(&self, after: Lsn) -> Vec<Sample> {
        let partitions: Vec<(StreamId, Arc<Mutex<StreamPartition>>)> = self
            .partitions
            .read()
            .iter()
            .map(|(stream, partition)| (stream.clone(), Arc::clone(partition)))
            .collect();

        let mut found: Vec<(Lsn, Sample)> = Vec::new();
        for (stream, partition) in partitions {
            let partition = partition.lock();
            let after_key = Lsn(after.0.saturating_add(1));
            for (&lsn, &(timestamp, sequence)) in partition.written.range(after_key..) {
                if let Some(value) = partition.samples.get(&(timestamp, sequence)) {
                    found.push((
                        lsn,
                        Sample {
                            stream_id: stream.clone(),
                            timestamp,
                            sequence,
                            value: value.clone(),
                        },
                    ));
                }
            }
        }
        found.sort_by_key(|(lsn, _)| *lsn);
        found.into_iter().map(|(_, sample)| sample).collect()
    }

    pub fn max_timestamp(&self, stream: &StreamId) -> Option<Timestamp> {
        self.partition(stream)?.lock().max_timestamp
    }

    /// Known streams, sorted.
    pub fn streams(&self) -> Vec<StreamId> {
        let mut streams: Vec<StreamId> = self.partitions.read().keys().cloned().collect();
        streams.sort();
        streams
    }

    pub fn stream_len(&self, stream: &StreamId) -> usize {
        self.partition(stream).map_or(0, |p| p.lock().samples.len())
    }

    /// Total number of stored samples.
    pub fn len(&self) -> usize {
        let partitions: Vec<_> = self.partitions.read().values().cloned().collect();
        partitions.iter().map(|p| p.lock().samples.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<()> {
        match &self.log {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> SampleStoreStats {
        SampleStoreStats {
            streams: self.partitions.read().len(),
            samples: self.len(),
            stored: self.counters.stored.load(Ordering::Relaxed),
            unchanged: self.counters.unchanged.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            recovered: self.counters.recovered.load(Ordering::Relaxed),
        }
    }
}

impl Default for SampleStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

// =============================================================================
// Tests
// =============================================================================
