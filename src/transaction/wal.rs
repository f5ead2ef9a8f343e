// Write-ahead log.
//
// Append-only segments under `wal_dir`, one process-wide append point
// guarded by a mutex over the LSN counter and segment writer.
//
// Segment layout:
//   magic (8) · version (u32) · first-LSN (u64) · records · sentinel
// where the close sentinel (magic + last-LSN) is written on clean shutdown
// and on rotation, and is absent after a crash.
//
// Record framing:
//   length:u32 · lsn:u64 · txn-id:u64 · kind:u8 · timestamp:i64 ·
//   payload:length bytes · crc32:u32
// The CRC covers header and payload. `length` counts payload bytes only.
// A record never spans two segments; rotation happens before the write.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as IoWrite};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::{Lsn, TransactionId, Value};
use crate::error::{DbError, Result};
use crate::monitoring::metrics::{metrics, names};
use crate::storage::{WriteKind, WriteOp};

pub const SEGMENT_MAGIC: &[u8; 8] = b"MANTISDB";
pub const FORMAT_VERSION: u32 = 1;

const SEGMENT_HEADER_LEN: usize = 8 + 4 + 8;
const RECORD_HEADER_LEN: usize = 4 + 8 + 8 + 1 + 8;
const SENTINEL_LEN: usize = 8 + 8;

/// Separator between table and row key inside a logged key.
const KEY_SEP: char = '\u{1f}';

/// Logged operation kinds. The coordinator's prepare intent shares the log
/// with ordinary transaction records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    Begin,
    Insert {
        table: String,
        key: String,
        value: Vec<Value>,
    },
    Update {
        table: String,
        key: String,
        value: Vec<Value>,
        old: Vec<Value>,
    },
    Delete {
        table: String,
        key: String,
        old: Vec<Value>,
    },
    Commit,
    Abort,
    Checkpoint {
        active_txns: Vec<TransactionId>,
    },
    SavepointMark {
        name: String,
    },
    TwoPhasePrepare {
        participants: Vec<String>,
    },
}

impl WalOperation {
    pub fn kind(&self) -> u8 {
        match self {
            WalOperation::Begin => 1,
            WalOperation::Insert { .. } => 2,
            WalOperation::Update { .. } => 3,
            WalOperation::Delete { .. } => 4,
            WalOperation::Commit => 5,
            WalOperation::Abort => 6,
            WalOperation::Checkpoint { .. } => 7,
            WalOperation::SavepointMark { .. } => 8,
            WalOperation::TwoPhasePrepare { .. } => 9,
        }
    }

    pub fn from_write_op(op: &WriteOp) -> WalOperation {
        match op.kind {
            WriteKind::Insert => WalOperation::Insert {
                table: op.table.clone(),
                key: op.key.clone(),
                value: op.values.clone().unwrap_or_default(),
            },
            WriteKind::Update => WalOperation::Update {
                table: op.table.clone(),
                key: op.key.clone(),
                value: op.values.clone().unwrap_or_default(),
                old: op.old.clone().unwrap_or_default(),
            },
            WriteKind::Delete => WalOperation::Delete {
                table: op.table.clone(),
                key: op.key.clone(),
                old: op.old.clone().unwrap_or_default(),
            },
        }
    }

    /// Mutation view of the operation, for recovery replay.
    pub fn to_write_op(&self, lsn: Lsn) -> Option<WriteOp> {
        match self {
            WalOperation::Insert { table, key, value } => Some(WriteOp {
                table: table.clone(),
                key: key.clone(),
                kind: WriteKind::Insert,
                values: Some(value.clone()),
                old: None,
                version: lsn,
            }),
            WalOperation::Update {
                table,
                key,
                value,
                old,
            } => Some(WriteOp {
                table: table.clone(),
                key: key.clone(),
                kind: WriteKind::Update,
                values: Some(value.clone()),
                old: Some(old.clone()),
                version: lsn,
            }),
            WalOperation::Delete { table, key, old } => Some(WriteOp {
                table: table.clone(),
                key: key.clone(),
                kind: WriteKind::Delete,
                values: None,
                old: Some(old.clone()),
                version: lsn,
            }),
            _ => None,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        match self {
            WalOperation::Begin | WalOperation::Commit | WalOperation::Abort => {}
            WalOperation::Insert { table, key, value } => {
                put_key(&mut buf, table, key);
                put_values(&mut buf, value)?;
            }
            WalOperation::Update {
                table,
                key,
                value,
                old,
            } => {
                put_key(&mut buf, table, key);
                put_values(&mut buf, value)?;
                put_values(&mut buf, old)?;
            }
            WalOperation::Delete { table, key, old } => {
                put_key(&mut buf, table, key);
                put_values(&mut buf, old)?;
            }
            WalOperation::Checkpoint { active_txns } => {
                buf.put_u32_le(active_txns.len() as u32);
                for id in active_txns {
                    buf.put_u64_le(*id);
                }
            }
            WalOperation::SavepointMark { name } => {
                let raw = name.as_bytes();
                buf.put_u32_le(raw.len() as u32);
                buf.put_slice(raw);
            }
            WalOperation::TwoPhasePrepare { participants } => {
                buf.put_u32_le(participants.len() as u32);
                for p in participants {
                    let raw = p.as_bytes();
                    buf.put_u32_le(raw.len() as u32);
                    buf.put_slice(raw);
                }
            }
        }
        Ok(buf.to_vec())
    }

    fn decode_payload(kind: u8, payload: &[u8]) -> Result<WalOperation> {
        let mut cursor = Cursor::new(payload);
        let op = match kind {
            1 => WalOperation::Begin,
            2 => {
                let (table, key) = cursor.key()?;
                let value = cursor.values()?;
                WalOperation::Insert { table, key, value }
            }
            3 => {
                let (table, key) = cursor.key()?;
                let value = cursor.values()?;
                let old = cursor.values()?;
                WalOperation::Update {
                    table,
                    key,
                    value,
                    old,
                }
            }
            4 => {
                let (table, key) = cursor.key()?;
                let old = cursor.values()?;
                WalOperation::Delete { table, key, old }
            }
            5 => WalOperation::Commit,
            6 => WalOperation::Abort,
            7 => {
                let count = cursor.u32()? as usize;
                let mut active_txns = Vec::with_capacity(count);
                for _ in 0..count {
                    active_txns.push(cursor.u64()?);
                }
                WalOperation::Checkpoint { active_txns }
            }
            8 => {
                let name = cursor.string()?;
                WalOperation::SavepointMark { name }
            }
            9 => {
                let count = cursor.u32()? as usize;
                let mut participants = Vec::with_capacity(count);
                for _ in 0..count {
                    participants.push(cursor.string()?);
                }
                WalOperation::TwoPhasePrepare { participants }
            }
            other => {
                return Err(DbError::Corruption(format!(
                    "unknown WAL record kind {}",
                    other
                )))
            }
        };
        Ok(op)
    }
}

fn put_key(buf: &mut BytesMut, table: &str, key: &str) {
    let composite = format!("{}{}{}", table, KEY_SEP, key);
    let raw = composite.as_bytes();
    buf.put_u32_le(raw.len() as u32);
    buf.put_slice(raw);
}

fn put_values(buf: &mut BytesMut, values: &[Value]) -> Result<()> {
    let raw = bincode::serialize(values)?;
    buf.put_u32_le(raw.len() as u32);
    buf.put_slice(&raw);
    Ok(())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(DbError::Corruption("short WAL payload".to_string()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes(raw.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        let raw = self.take(8)?;
        Ok(u64::from_le_bytes(raw.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| DbError::Corruption("invalid UTF-8 in WAL payload".to_string()))
    }

    fn key(&mut self) -> Result<(String, String)> {
        let composite = self.string()?;
        match composite.split_once(KEY_SEP) {
            Some((table, key)) => Ok((table.to_string(), key.to_string())),
            None => Err(DbError::Corruption("malformed WAL key".to_string())),
        }
    }

    fn values(&mut self) -> Result<Vec<Value>> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        Ok(bincode::deserialize(raw)?)
    }
}

/// One decoded log record.
#[derive(Debug, Clone, PartialEq)]
pub struct WalEntry {
    pub lsn: Lsn,
    pub txn_id: TransactionId,
    pub op: WalOperation,
    pub timestamp_micros: i64,
}

#[derive(Debug, Clone)]
pub struct IntegrityIssue {
    pub segment: PathBuf,
    pub lsn: Option<Lsn>,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Appends land in the OS buffer; COMMIT and a background ticker sync.
    GroupSync,
    /// Every append syncs (`sync_writes = true`).
    SyncPerWrite,
}

#[derive(Debug, Clone)]
pub struct WalConfig {
    pub dir: PathBuf,
    pub segment_size: u64,
    pub sync_mode: SyncMode,
    /// Group-sync ticker period.
    pub sync_interval: Duration,
}

impl WalConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::GroupSync,
            sync_interval: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WalStats {
    pub records: u64,
    pub bytes: u64,
    pub syncs: u64,
    pub rotations: u64,
}

struct WalInner {
    writer: BufWriter<File>,
    segment_first_lsn: Lsn,
    segment_bytes: u64,
    next_lsn: Lsn,
    last_lsn: Lsn,
    dirty: bool,
    closed: bool,
    stats: WalStats,
}

pub struct WalManager {
    inner: Mutex<WalInner>,
    flushed_lsn: AtomicU64,
    config: WalConfig,
    shutdown: Arc<AtomicBool>,
}

impl WalManager {
    /// Open the log, scanning existing segments to continue the LSN
    /// sequence. A fresh segment is always started; prior segments stay as
    /// recovery input.
    pub fn open(config: WalConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let (entries, _issues) = Self::read_segments(&config.dir)?;
        let next_lsn = entries.last().map(|e| e.lsn + 1).unwrap_or(1);

        let inner = Self::open_segment(&config.dir, next_lsn)?;
        Ok(Self {
            inner: Mutex::new(inner),
            flushed_lsn: AtomicU64::new(next_lsn.saturating_sub(1)),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    fn segment_path(dir: &Path, first_lsn: Lsn) -> PathBuf {
        dir.join(format!("wal-{:016x}.seg", first_lsn))
    }

    fn open_segment(dir: &Path, first_lsn: Lsn) -> Result<WalInner> {
        let path = Self::segment_path(dir, first_lsn);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| DbError::DurabilityFailure(format!("cannot open WAL segment: {}", e)))?;
        let mut writer = BufWriter::new(file);

        let mut header = BytesMut::with_capacity(SEGMENT_HEADER_LEN);
        header.put_slice(SEGMENT_MAGIC);
        header.put_u32_le(FORMAT_VERSION);
        header.put_u64_le(first_lsn);
        writer
            .write_all(&header)
            .map_err(|e| DbError::DurabilityFailure(format!("WAL header write failed: {}", e)))?;

        Ok(WalInner {
            writer,
            segment_first_lsn: first_lsn,
            segment_bytes: SEGMENT_HEADER_LEN as u64,
            next_lsn: first_lsn,
            last_lsn: first_lsn.saturating_sub(1),
            dirty: true,
            closed: false,
            stats: WalStats::default(),
        })
    }

    /// Serialised append: assigns the next LSN, frames and checksums the
    /// record, writes it to the active segment.
    pub fn append(&self, txn_id: TransactionId, op: WalOperation) -> Result<Lsn> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(DbError::DurabilityFailure(
                "write-ahead log is closed".to_string(),
            ));
        }

        let lsn = inner.next_lsn;
        let payload = op.encode_payload()?;
        let frame = encode_frame(lsn, txn_id, op.kind(), Utc::now().timestamp_micros(), &payload);

        self.rotate_if_needed_locked(&mut inner, frame.len() as u64)?;

        if let Err(e) = inner.writer.write_all(&frame) {
            metrics().incr(names::WAL_ERRORS);
            return Err(DbError::DurabilityFailure(format!(
                "WAL append failed: {}",
                e
            )));
        }
        inner.next_lsn = lsn + 1;
        inner.last_lsn = lsn;
        inner.segment_bytes += frame.len() as u64;
        inner.dirty = true;
        inner.stats.records += 1;
        inner.stats.bytes += frame.len() as u64;
        metrics().incr(names::WAL_WRITES);

        if self.config.sync_mode == SyncMode::SyncPerWrite {
            self.sync_locked(&mut inner)?;
        }
        Ok(lsn)
    }

    /// Make everything appended so far durable. COMMIT must not be reported
    /// successful until its LSN has passed through here.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.dirty {
            return Ok(());
        }
        self.sync_locked(&mut inner)
    }

    fn sync_locked(&self, inner: &mut WalInner) -> Result<()> {
        let start = std::time::Instant::now();
        inner
            .writer
            .flush()
            .and_then(|_| inner.writer.get_ref().sync_all())
            .map_err(|e| {
                metrics().incr(names::WAL_ERRORS);
                DbError::DurabilityFailure(format!("WAL sync failed: {}", e))
            })?;
        inner.dirty = false;
        inner.stats.syncs += 1;
        self.flushed_lsn.store(inner.last_lsn, Ordering::SeqCst);
        metrics().incr(names::WAL_SYNCS);
        metrics().incr_by(names::WAL_SYNC_MICROS, start.elapsed().as_micros() as u64);
        Ok(())
    }

    /// Rotate when the active segment would exceed the configured size.
    pub fn rotate_if_needed(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.rotate_if_needed_locked(&mut inner, 0)
    }

    fn rotate_if_needed_locked(&self, inner: &mut WalInner, incoming: u64) -> Result<()> {
        if inner.segment_bytes + incoming <= self.config.segment_size
            || inner.segment_bytes <= SEGMENT_HEADER_LEN as u64
        {
            return Ok(());
        }

        // Close the full segment with its sentinel, then start the
        // successor whose first LSN continues the sequence.
        write_sentinel(&mut inner.writer, inner.last_lsn)?;
        inner
            .writer
            .flush()
            .and_then(|_| inner.writer.get_ref().sync_all())
            .map_err(|e| DbError::DurabilityFailure(format!("WAL rotation sync failed: {}", e)))?;
        self.flushed_lsn.store(inner.last_lsn, Ordering::SeqCst);

        let fresh = Self::open_segment(&self.config.dir, inner.next_lsn)?;
        let stats = inner.stats.clone();
        *inner = fresh;
        inner.stats = stats;
        inner.stats.rotations += 1;
        metrics().incr(names::WAL_ROTATIONS);
        tracing::info!(first_lsn = inner.segment_first_lsn, "rotated WAL segment");
        Ok(())
    }

    /// Largest assigned LSN (0 before the first append).
    pub fn current_lsn(&self) -> Lsn {
        self.inner.lock().last_lsn
    }

    /// Largest durable LSN.
    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WalStats {
        self.inner.lock().stats.clone()
    }

    /// Log a checkpoint record carrying the still-active transactions, and
    /// make it durable.
    pub fn checkpoint(&self, active_txns: Vec<TransactionId>) -> Result<Lsn> {
        let lsn = self.append(0, WalOperation::Checkpoint { active_txns })?;
        self.sync()?;
        Ok(lsn)
    }

    /// Background ticker for group-sync mode.
    pub fn spawn_sync_ticker(self: &Arc<Self>, handle: &tokio::runtime::Handle) {
        if self.config.sync_mode != SyncMode::GroupSync {
            return;
        }
        let wal = Arc::clone(self);
        let shutdown = Arc::clone(&self.shutdown);
        let period = self.config.sync_interval;
        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = wal.sync() {
                    tracing::error!(error = %e, "background WAL sync failed");
                }
            }
        });
    }

    /// Clean close: sync, write the end-of-file sentinel, refuse further
    /// appends.
    pub fn shutdown(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        if inner.closed {
            return Ok(());
        }
        let last_lsn = inner.last_lsn;
        write_sentinel(&mut inner.writer, last_lsn)?;
        inner.dirty = true;
        self.sync_locked(&mut inner)?;
        inner.closed = true;
        Ok(())
    }

    /// Remove segments entirely below `keep_from`; both the durable
    /// checkpoint and the oldest live transaction bound the cut.
    pub fn prune_segments(&self, keep_from: Lsn) -> Result<usize> {
        let active_first = self.inner.lock().segment_first_lsn;
        let mut segments = list_segments(&self.config.dir)?;
        segments.sort();
        let mut removed = 0;
        for window in segments.windows(2) {
            let (first, next_first) = (window[0], window[1]);
            if first == active_first {
                break;
            }
            // A segment's records all precede the next segment's first LSN.
            if next_first <= keep_from {
                std::fs::remove_file(Self::segment_path(&self.config.dir, first))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Decode every segment in LSN order, stopping at the first integrity
    /// failure: a bad record poisons the rest of the log, so everything
    /// after it is withheld from callers.
    pub fn read_segments(dir: &Path) -> Result<(Vec<WalEntry>, Vec<IntegrityIssue>)> {
        let mut entries = Vec::new();
        let mut issues = Vec::new();
        if !dir.exists() {
            return Ok((entries, issues));
        }

        let mut segments = list_segments(dir)?;
        segments.sort();

        for first_lsn in segments {
            let path = Self::segment_path(dir, first_lsn);
            let data = std::fs::read(&path)?;
            if !decode_segment(&path, &data, &mut entries, &mut issues) {
                break;
            }
        }

        for issue in &issues {
            metrics().incr(names::CORRUPTION_EVENTS);
            tracing::warn!(segment = %issue.segment.display(), lsn = ?issue.lsn, reason = %issue.reason, "WAL integrity issue");
        }
        Ok((entries, issues))
    }
}

fn list_segments(dir: &Path) -> Result<Vec<Lsn>> {
    let mut firsts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(hex) = name
            .strip_prefix("wal-")
            .and_then(|rest| rest.strip_suffix(".seg"))
        {
            if let Ok(first) = Lsn::from_str_radix(hex, 16) {
                firsts.push(first);
            }
        }
    }
    Ok(firsts)
}

fn encode_frame(lsn: Lsn, txn_id: TransactionId, kind: u8, timestamp: i64, payload: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len() + 4);
    frame.put_u32_le(payload.len() as u32);
    frame.put_u64_le(lsn);
    frame.put_u64_le(txn_id);
    frame.put_u8(kind);
    frame.put_i64_le(timestamp);
    frame.put_slice(payload);
    let crc = crc32fast::hash(&frame);
    frame.put_u32_le(crc);
    frame.to_vec()
}

fn write_sentinel(writer: &mut BufWriter<File>, last_lsn: Lsn) -> Result<()> {
    let mut sentinel = BytesMut::with_capacity(SENTINEL_LEN);
    sentinel.put_slice(SEGMENT_MAGIC);
    sentinel.put_u64_le(last_lsn);
    writer
        .write_all(&sentinel)
        .map_err(|e| DbError::DurabilityFailure(format!("WAL sentinel write failed: {}", e)))
}

/// Returns false when scanning must stop (integrity failure bounds the
/// recovery horizon).
fn decode_segment(
    path: &Path,
    data: &[u8],
    entries: &mut Vec<WalEntry>,
    issues: &mut Vec<IntegrityIssue>,
) -> bool {
    if data.len() < SEGMENT_HEADER_LEN
        || &data[0..8] != SEGMENT_MAGIC
        || u32::from_le_bytes(data[8..12].try_into().unwrap()) != FORMAT_VERSION
    {
        issues.push(IntegrityIssue {
            segment: path.to_path_buf(),
            lsn: None,
            reason: "bad segment header".to_string(),
        });
        return false;
    }

    let mut pos = SEGMENT_HEADER_LEN;
    loop {
        let rem = data.len() - pos;
        if rem == 0 {
            // Unclean close; everything decoded so far stands.
            return true;
        }
        if rem >= SENTINEL_LEN && &data[pos..pos + 8] == SEGMENT_MAGIC {
            // Clean close sentinel.
            return true;
        }
        if rem < RECORD_HEADER_LEN + 4 {
            issues.push(IntegrityIssue {
                segment: path.to_path_buf(),
                lsn: None,
                reason: "torn record at segment tail".to_string(),
            });
            return false;
        }

        let length = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
        let total = RECORD_HEADER_LEN + length + 4;
        if rem < total {
            issues.push(IntegrityIssue {
                segment: path.to_path_buf(),
                lsn: None,
                reason: "torn record at segment tail".to_string(),
            });
            return false;
        }

        let lsn = u64::from_le_bytes(data[pos + 4..pos + 12].try_into().unwrap());
        let txn_id = u64::from_le_bytes(data[pos + 12..pos + 20].try_into().unwrap());
        let kind = data[pos + 20];
        let timestamp = i64::from_le_bytes(data[pos + 21..pos + 29].try_into().unwrap());
        let payload = &data[pos + RECORD_HEADER_LEN..pos + RECORD_HEADER_LEN + length];
        let stored_crc = u32::from_le_bytes(
            data[pos + RECORD_HEADER_LEN + length..pos + total]
                .try_into()
                .unwrap(),
        );

        let computed = crc32fast::hash(&data[pos..pos + RECORD_HEADER_LEN + length]);
        if computed != stored_crc {
            issues.push(IntegrityIssue {
                segment: path.to_path_buf(),
                lsn: Some(lsn),
                reason: "checksum mismatch".to_string(),
            });
            return false;
        }

        match WalOperation::decode_payload(kind, payload) {
            Ok(op) => entries.push(WalEntry {
                lsn,
                txn_id,
                op,
                timestamp_micros: timestamp,
            }),
            Err(e) => {
                issues.push(IntegrityIssue {
                    segment: path.to_path_buf(),
                    lsn: Some(lsn),
                    reason: e.to_string(),
                });
                return false;
            }
        }
        pos += total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(dir: &Path) -> WalConfig {
        WalConfig {
            dir: dir.to_path_buf(),
            segment_size: 64 * 1024 * 1024,
            sync_mode: SyncMode::GroupSync,
            sync_interval: Duration::from_millis(10),
        }
    }

    fn insert_op(key: &str, v: i64) -> WalOperation {
        WalOperation::Insert {
            table: "t".to_string(),
            key: key.to_string(),
            value: vec![Value::Integer(v)],
        }
    }

    #[test]
    fn test_append_assigns_monotonic_lsns() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(config(dir.path())).unwrap();
        let a = wal.append(1, WalOperation::Begin).unwrap();
        let b = wal.append(1, insert_op("1", 1)).unwrap();
        let c = wal.append(1, WalOperation::Commit).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(wal.current_lsn(), 3);
    }

    #[test]
    fn test_roundtrip_byte_identical() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(config(dir.path())).unwrap();
        wal.append(7, WalOperation::Begin).unwrap();
        wal.append(
            7,
            WalOperation::Update {
                table: "t".to_string(),
                key: "k".to_string(),
                value: vec![Value::Text("new".into())],
                old: vec![Value::Text("old".into())],
            },
        )
        .unwrap();
        wal.append(7, WalOperation::Commit).unwrap();
        wal.shutdown().unwrap();

        let (entries, issues) = WalManager::read_segments(dir.path()).unwrap();
        assert!(issues.is_empty());
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].op, WalOperation::Begin);
        assert_eq!(entries[1].txn_id, 7);
        assert!(matches!(entries[1].op, WalOperation::Update { .. }));
    }

    #[test]
    fn test_commit_durable_after_sync() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(config(dir.path())).unwrap();
        let lsn = wal.append(1, WalOperation::Commit).unwrap();
        assert!(wal.flushed_lsn() < lsn);
        wal.sync().unwrap();
        assert_eq!(wal.flushed_lsn(), lsn);
    }

    #[test]
    fn test_sync_per_write_mode() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.sync_mode = SyncMode::SyncPerWrite;
        let wal = WalManager::open(cfg).unwrap();
        let lsn = wal.append(1, WalOperation::Begin).unwrap();
        assert_eq!(wal.flushed_lsn(), lsn);
    }

    #[test]
    fn test_rotation_continues_lsn_sequence() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.segment_size = 256;
        let wal = WalManager::open(cfg).unwrap();
        for i in 0..20 {
            wal.append(1, insert_op(&i.to_string(), i)).unwrap();
        }
        wal.shutdown().unwrap();
        assert!(wal.stats().rotations > 0);

        let (entries, issues) = WalManager::read_segments(dir.path()).unwrap();
        assert!(issues.is_empty());
        let lsns: Vec<Lsn> = entries.iter().map(|e| e.lsn).collect();
        assert_eq!(lsns, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_lsn_sequence_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let wal = WalManager::open(config(dir.path())).unwrap();
            wal.append(1, WalOperation::Begin).unwrap();
            wal.append(1, WalOperation::Commit).unwrap();
            wal.shutdown().unwrap();
        }
        let wal = WalManager::open(config(dir.path())).unwrap();
        let lsn = wal.append(2, WalOperation::Begin).unwrap();
        assert_eq!(lsn, 3);
    }

    #[test]
    fn test_zeroed_tail_truncates_cleanly() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(config(dir.path())).unwrap();
        for i in 0..5 {
            wal.append(1, insert_op(&i.to_string(), i)).unwrap();
        }
        wal.sync().unwrap();
        drop(wal);

        // Zero the last 24 bytes of the only segment.
        let seg = std::fs::read_dir(dir.path())
            .unwrap()
            .next()
            .unwrap()
            .unwrap()
            .path();
        let mut data = std::fs::read(&seg).unwrap();
        let n = data.len();
        for b in &mut data[n - 24..] {
            *b = 0;
        }
        std::fs::write(&seg, data).unwrap();

        let (entries, issues) = WalManager::read_segments(dir.path()).unwrap();
        assert!(!issues.is_empty());
        // Every surviving entry precedes the zeroed region.
        assert!(entries.len() < 5);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.lsn, i as u64 + 1);
        }
    }

    #[test]
    fn test_append_after_shutdown_fails() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(config(dir.path())).unwrap();
        wal.shutdown().unwrap();
        assert!(matches!(
            wal.append(1, WalOperation::Begin),
            Err(DbError::DurabilityFailure(_))
        ));
    }

    #[test]
    fn test_checkpoint_record_roundtrip() {
        let dir = tempdir().unwrap();
        let wal = WalManager::open(config(dir.path())).unwrap();
        wal.checkpoint(vec![3, 9]).unwrap();
        wal.shutdown().unwrap();
        let (entries, _) = WalManager::read_segments(dir.path()).unwrap();
        assert_eq!(
            entries[0].op,
            WalOperation::Checkpoint {
                active_txns: vec![3, 9]
            }
        );
    }
}
