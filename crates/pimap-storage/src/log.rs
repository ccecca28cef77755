//! PIMAP Record Log - Append-Only Durability Log
//!
//! Segmented record log backing the sample and metric stores. Every stored
//! sample and every metric upsert is framed, checksummed and appended before
//! it becomes visible in the in-memory index; on open the log is replayed to
//! rebuild that index.
//!
//! Key Features:
//! - Sequential appends with log sequence numbers (LSN)
//! - CRC32 framing with torn-tail detection and truncation
//! - Segment rotation by size (`log_current.log`, `log_<n>.log`)
//! - Full replay on open
//!
//! @version 0.1.0
//! @author PIMAP Development Team

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use pimap_common::{Lsn, PimapError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Constants
// =============================================================================

/// Size of the fixed frame header before the payload:
/// lsn(8) + type(1) + padding(3) + payload_len(4) = 16
pub const RECORD_HEADER_SIZE: usize = 16;
pub const RECORD_CHECKSUM_SIZE: usize = 4;

const CURRENT_SEGMENT: &str = "log_current.log";

// =============================================================================
// Log Record Types
// =============================================================================

/// Kind of payload carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordType {
    Sample = 1,
    Metric = 2,
}

impl TryFrom<u8> for LogRecordType {
    type Error = PimapError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(LogRecordType::Sample),
            2 => Ok(LogRecordType::Metric),
            other => Err(PimapError::Corruption(format!(
                "unknown log record type {}",
                other
            ))),
        }
    }
}

// =============================================================================
// Log Record
// =============================================================================

/// A single framed record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub record_type: LogRecordType,
    pub data: Bytes,
}

impl LogRecord {
    pub fn new(lsn: Lsn, record_type: LogRecordType, data: Bytes) -> Self {
        Self {
            lsn,
            record_type,
            data,
        }
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.data).map_err(|e| {
            PimapError::Corruption(format!("record {} payload: {}", self.lsn.0, e))
        })
    }

    /// Serialize the record to its on-disk frame.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(RECORD_HEADER_SIZE + self.data.len() + RECORD_CHECKSUM_SIZE);

        buf.put_u64_le(self.lsn.0);
        buf.put_u8(self.record_type as u8);
        buf.put_bytes(0, 3); // padding
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);

        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);

        buf.freeze()
    }

    /// Deserialize a record from one complete frame.
    pub fn from_bytes(frame: &[u8]) -> Result<Self> {
        if frame.len() < RECORD_HEADER_SIZE + RECORD_CHECKSUM_SIZE {
            return Err(PimapError::Corruption("log record too small".to_string()));
        }

        let body_len = frame.len() - RECORD_CHECKSUM_SIZE;
        let mut tail = &frame[body_len..];
        let stored_checksum = tail.get_u32_le();
        if stored_checksum != crc32fast::hash(&frame[..body_len]) {
            return Err(PimapError::Corruption(
                "log record checksum mismatch".to_string(),
            ));
        }

        let mut buf = &frame[..body_len];
        let lsn = Lsn(buf.get_u64_le());
        let record_type = LogRecordType::try_from(buf.get_u8())?;
        buf.advance(3);
        let data_len = buf.get_u32_le() as usize;

        if buf.remaining() != data_len {
            return Err(PimapError::Corruption(
                "log record length mismatch".to_string(),
            ));
        }

        Ok(Self {
            lsn,
            record_type,
            data: Bytes::copy_from_slice(buf),
        })
    }
}

// =============================================================================
// Recovery
// =============================================================================

/// Records replayed from an existing log directory.
#[derive(Debug, Default)]
pub struct Recovery {
    /// Valid records in LSN order.
    pub records: Vec<LogRecord>,
    pub max_lsn: Lsn,
    pub segments_scanned: usize,
    /// Bytes discarded from torn or corrupt segment tails.
    pub bytes_discarded: u64,
}

// =============================================================================
// Record Log
// =============================================================================

/// Append-only segmented log with crash recovery.
pub struct RecordLog {
    dir: PathBuf,
    next_lsn: AtomicU64,
    segment_size: u64,
    sync_writes: bool,
    writer: Mutex<SegmentWriter>,
}

struct SegmentWriter {
    file: BufWriter<File>,
    segment_offset: u64,
    current_segment: u64,
}

impl RecordLog {
    /// Open the log in `dir`, replaying every existing segment.
    pub fn open_and_recover(
        dir: impl Into<PathBuf>,
        segment_size: u64,
        sync_writes: bool,
    ) -> Result<(Self, Recovery)> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let recovery = Self::recover_from_directory(&dir)?;
        let current_segment = Self::find_latest_segment(&dir)?.map_or(0, |n| n + 1);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(CURRENT_SEGMENT))?;
        let segment_offset = file.metadata()?.len();

        let log = Self {
            dir,
            next_lsn: AtomicU64::new(recovery.max_lsn.0.saturating_add(1).max(1)),
            segment_size: segment_size.max(1),
            sync_writes,
            writer: Mutex::new(SegmentWriter {
                file: BufWriter::new(file),
                segment_offset,
                current_segment,
            }),
        };

        if !recovery.records.is_empty() || recovery.bytes_discarded > 0 {
            tracing::info!(
                dir = %log.dir.display(),
                records = recovery.records.len(),
                segments = recovery.segments_scanned,
                discarded = recovery.bytes_discarded,
                "record log recovered"
            );
        }

        Ok((log, recovery))
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// LSN the next append will receive.
    pub fn next_lsn(&self) -> Lsn {
        Lsn(self.next_lsn.load(Ordering::SeqCst))
    }

    /// Append a raw payload, rotating the segment if it would overflow.
    pub fn append(&self, record_type: LogRecordType, data: Bytes) -> Result<Lsn> {
        let mut writer = self.writer.lock();

        // LSNs are allocated under the writer lock so file order matches LSN order.
        let lsn = Lsn(self.next_lsn.fetch_add(1, Ordering::SeqCst));
        let frame = LogRecord::new(lsn, record_type, data).to_bytes();
        let frame_len = frame.len() as u64;

        if writer.segment_offset > 0 && writer.segment_offset + frame_len > self.segment_size {
            self.rotate_segment(&mut writer)?;
        }

        writer.file.write_all(&frame)?;
        writer.file.flush()?;
        if self.sync_writes {
            writer.file.get_ref().sync_data()?;
        }
        writer.segment_offset += frame_len;

        Ok(lsn)
    }

    /// Serialize `value` as JSON and append it.
    pub fn append_json<T: Serialize>(&self, record_type: LogRecordType, value: &T) -> Result<Lsn> {
        let data =
            serde_json::to_vec(value).map_err(|e| PimapError::Serialization(e.to_string()))?;
        self.append(record_type, Bytes::from(data))
    }

    /// Flush buffered frames and sync the current segment.
    pub fn flush(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.file.flush()?;
        writer.file.get_ref().sync_all()?;
        Ok(())
    }

    fn rotate_segment(&self, writer: &mut SegmentWriter) -> Result<()> {
        writer.file.flush()?;
        if self.sync_writes {
            writer.file.get_ref().sync_all()?;
        }

        let current_path = self.dir.join(CURRENT_SEGMENT);
        let sealed_path = self
            .dir
            .join(format!("log_{:016}.log", writer.current_segment));
        std::fs::rename(&current_path, &sealed_path)?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&current_path)?;

        writer.file = BufWriter::new(file);
        writer.segment_offset = 0;
        writer.current_segment += 1;

        tracing::info!(
            dir = %self.dir.display(),
            segment = writer.current_segment,
            "rotated record log segment"
        );
        Ok(())
    }

    /// Highest sealed segment number, if any.
    fn find_latest_segment(dir: &Path) -> Result<Option<u64>> {
        let mut latest = None;
        for entry in std::fs::read_dir(dir)?.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(num) = name
                .strip_prefix("log_")
                .and_then(|s| s.strip_suffix(".log"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                latest = Some(latest.map_or(num, |l: u64| l.max(num)));
            }
        }
        Ok(latest)
    }

    fn recover_from_directory(dir: &Path) -> Result<Recovery> {
        let mut recovery = Recovery::default();

        let mut segments: Vec<PathBuf> = std::fs::read_dir(dir)?
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("log_") && n.ends_with(".log"))
            })
            .collect();

        // Zero-padded numbers sort before "log_current.log".
        segments.sort();

        for path in &segments {
            recovery.segments_scanned += 1;
            let (records, valid_len, total_len) = Self::read_segment(path)?;

            if valid_len < total_len {
                let discarded = total_len - valid_len;
                recovery.bytes_discarded += discarded;
                tracing::warn!(
                    segment = %path.display(),
                    offset = valid_len,
                    discarded,
                    "discarding corrupt record log tail"
                );
                // Truncate so later appends don't land after garbage.
                OpenOptions::new().write(true).open(path)?.set_len(valid_len)?;
            }

            for record in records {
                recovery.max_lsn = recovery.max_lsn.max(record.lsn);
                recovery.records.push(record);
            }
        }

        recovery.records.sort_by_key(|r| r.lsn);
        Ok(recovery)
    }

    /// Read valid frames from a segment; returns (records, valid bytes, file bytes).
    fn read_segment(path: &Path) -> Result<(Vec<LogRecord>, u64, u64)> {
        let mut buffer = Vec::new();
        File::open(path)?.read_to_end(&mut buffer)?;

        let mut records = Vec::new();
        let mut offset = 0;
        while buffer.len() - offset >= RECORD_HEADER_SIZE + RECORD_CHECKSUM_SIZE {
            let len_at = offset + 12;
            let data_len = u32::from_le_bytes([
                buffer[len_at],
                buffer[len_at + 1],
                buffer[len_at + 2],
                buffer[len_at + 3],
            ]) as usize;

            let frame_len = RECORD_HEADER_SIZE + data_len + RECORD_CHECKSUM_SIZE;
            if offset + frame_len > buffer.len() {
                break;
            }

            match LogRecord::from_bytes(&buffer[offset..offset + frame_len]) {
                Ok(record) => {
                    records.push(record);
                    offset += frame_len;
                }
                Err(e) => {
                    tracing::warn!(segment = %path.display(), offset, "bad record: {}", e);
                    break;
                }
            }
        }

        Ok((records, offset as u64, buffer.len() as u64))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let record = LogRecord::new(Lsn(7), LogRecordType::Metric, Bytes::from("{\"a\":1}"));
        let frame = record.to_bytes();
        assert_eq!(frame.len(), RECORD_HEADER_SIZE + 7 + RECORD_CHECKSUM_SIZE);

        let restored = LogRecord::from_bytes(&frame).expect("failed to decode frame");
        assert_eq!(restored.lsn, Lsn(7));
        assert_eq!(restored.record_type, LogRecordType::Metric);
        assert_eq!(restored.data, Bytes::from("{\"a\":1}"));
    }

    #[test]
    fn test_checksum_mismatch() {
        let record = LogRecord::new(Lsn(1), LogRecordType::Sample, Bytes::from("payload"));
        let mut frame = record.to_bytes().to_vec();
        frame[RECORD_HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            LogRecord::from_bytes(&frame),
            Err(PimapError::Corruption(_))
        ));
    }

    #[test]
    fn test_append_and_recover() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        {
            let (log, recovery) = RecordLog::open_and_recover(temp_dir.path(), 1024, false)
                .expect("failed to open log");
            assert!(recovery.records.is_empty());
            assert_eq!(log.append_json(LogRecordType::Sample, &1u32).unwrap(), Lsn(1));
            assert_eq!(log.append_json(LogRecordType::Sample, &2u32).unwrap(), Lsn(2));
            assert_eq!(log.append_json(LogRecordType::Metric, &3u32).unwrap(), Lsn(3));
        }

        let (log, recovery) =
            RecordLog::open_and_recover(temp_dir.path(), 1024, false).expect("failed to recover");
        assert_eq!(recovery.records.len(), 3);
        assert_eq!(recovery.max_lsn, Lsn(3));
        let values: Vec<u32> = recovery
            .records
            .iter()
            .map(|r| r.decode().unwrap())
            .collect();
        assert_eq!(values, vec![1, 2, 3]);
        assert_eq!(log.next_lsn(), Lsn(4));
    }

    #[test]
    fn test_segment_rotation() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        {
            let (log, _) =
                RecordLog::open_and_recover(temp_dir.path(), 64, false).expect("failed to open");
            for i in 0..10u32 {
                log.append_json(LogRecordType::Sample, &format!("sample-{}", i))
                    .expect("append failed");
            }
        }

        let sealed = std::fs::read_dir(temp_dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy() != CURRENT_SEGMENT)
            .count();
        assert!(sealed >= 1);

        let (log, recovery) =
            RecordLog::open_and_recover(temp_dir.path(), 64, false).expect("failed to recover");
        assert_eq!(recovery.records.len(), 10);
        let lsns: Vec<u64> = recovery.records.iter().map(|r| r.lsn.0).collect();
        assert_eq!(lsns, (1..=10).collect::<Vec<_>>());

        // New appends after reopen keep rotating past the recovered segments.
        for _ in 0..5 {
            log.append_json(LogRecordType::Sample, &"more").unwrap();
        }
        drop(log);
        let (_, recovery) =
            RecordLog::open_and_recover(temp_dir.path(), 64, false).expect("failed to recover");
        assert_eq!(recovery.records.len(), 15);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let temp_dir = tempfile::tempdir().expect("failed to create temp directory");

        {
            let (log, _) =
                RecordLog::open_and_recover(temp_dir.path(), 1 << 20, false).unwrap();
            log.append_json(LogRecordType::Sample, &"complete").unwrap();
        }

        // Simulate a crash halfway through a frame.
        let path = temp_dir.path().join(CURRENT_SEGMENT);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[1, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 200, 0, 0, 0, 1, 2])
            .unwrap();
        drop(file);

        let (log, recovery) =
            RecordLog::open_and_recover(temp_dir.path(), 1 << 20, false).unwrap();
        assert_eq!(recovery.records.len(), 1);
        assert_eq!(recovery.bytes_discarded, 18);

        log.append_json(LogRecordType::Sample, &"after").unwrap();
        drop(log);
        let (_, recovery) =
            RecordLog::open_and_recover(temp_dir.path(), 1 << 20, false).unwrap();
        assert_eq!(recovery.records.len(), 2);
    }
}
