use crate::entry::Entry;
use crate::util::{atomic_write, ensure_parent};
use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// A persisted entry with its storage-assigned key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub client: String,
}

impl LogRecord {
    pub fn into_entry(self) -> Entry {
        Entry::new(self.client, self.timestamp)
    }
}

/// Append-only history of request events.
#[async_trait]
pub trait DurableLog: Send + Sync {
    /// Entries with `start <= timestamp <= end`.
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Vec<Entry>>;
    async fn append_all(&self, entries: &[Entry]) -> anyhow::Result<usize>;
    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    records: Vec<LogRecord>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct MemoryLog {
    state: Mutex<MemoryState>,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<LogRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[async_trait]
impl DurableLog for MemoryLog {
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Vec<Entry>> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .cloned()
            .map(LogRecord::into_entry)
            .collect())
    }

    async fn append_all(&self, entries: &[Entry]) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        if state.closed {
            bail!("log is closed");
        }
        let mut id = state.records.last().map(|r| r.id).unwrap_or(0);
        for entry in entries {
            id += 1;
            state.records.push(LogRecord {
                id,
                timestamp: entry.timestamp,
                client: entry.client.clone(),
            });
        }
        Ok(entries.len())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

#[derive(Debug)]
struct FileState {
    last_id: u64,
    // set when the file does not end in a newline, e.g. after a torn write
    torn_tail: bool,
    closed: bool,
}

/// Keeps the id sequence monotonic after compaction drops the newest records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct HighWater {
    last_id: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LogLine {
    Record(LogRecord),
    HighWater(HighWater),
}

#[derive(Debug, Default)]
struct Parsed {
    records: Vec<LogRecord>,
    malformed: usize,
    high_water: u64,
}

impl Parsed {
    fn last_id(&self) -> u64 {
        self.records
            .iter()
            .map(|r| r.id)
            .max()
            .unwrap_or(0)
            .max(self.high_water)
    }
}

/// JSON-lines log, one [`LogRecord`] per line.
#[derive(Debug)]
pub struct FileLog {
    path: PathBuf,
    state: Mutex<FileState>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStats {
    pub records: usize,
    pub malformed: usize,
    pub last_id: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactReport {
    pub kept: usize,
    pub expired: usize,
    pub duplicates: usize,
    pub malformed: usize,
}

impl FileLog {
    /// Opens or creates the log. Failure here is not recoverable.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        ensure_parent(&path)?;
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open durable log {}", path.display()))?;
        let raw = std::fs::read_to_string(&path).context("read durable log")?;
        let torn_tail = !raw.is_empty() && !raw.ends_with('\n');
        if torn_tail {
            warn!(path = %path.display(), "durable log ends mid-record");
        }
        let stats = stats_of(&parse_records(&raw));
        info!(path = %path.display(), records = stats.records, last_id = stats.last_id, "durable log opened");
        Ok(Self {
            path,
            state: Mutex::new(FileState {
                last_id: stats.last_id,
                torn_tail,
                closed: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(path: &Path) -> anyhow::Result<LogStats> {
        let raw = std::fs::read_to_string(path).context("read durable log")?;
        Ok(stats_of(&parse_records(&raw)))
    }

    /// Rewrites the log keeping records at or after `keep_from`, collapsing
    /// records with the same timestamp and client. Run only while no daemon
    /// has the log open.
    pub fn compact(path: &Path, keep_from: DateTime<Utc>) -> anyhow::Result<CompactReport> {
        let raw = std::fs::read_to_string(path).context("read durable log")?;
        let parsed = parse_records(&raw);
        let mut report = CompactReport {
            malformed: parsed.malformed,
            ..CompactReport::default()
        };
        let mut seen = HashSet::new();
        let mut out = serde_json::to_string(&HighWater {
            last_id: parsed.last_id(),
        })?;
        out.push('\n');
        for record in parsed.records {
            if record.timestamp < keep_from {
                report.expired += 1;
                continue;
            }
            if !seen.insert((record.timestamp, record.client.clone())) {
                report.duplicates += 1;
                continue;
            }
            out.push_str(&serde_json::to_string(&record)?);
            out.push('\n');
            report.kept += 1;
        }
        atomic_write(path, out.as_bytes())?;
        Ok(report)
    }
}

fn parse_records(raw: &str) -> Parsed {
    let mut parsed = Parsed::default();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<LogLine>(line) {
            Ok(LogLine::Record(record)) => parsed.records.push(record),
            Ok(LogLine::HighWater(mark)) => {
                parsed.high_water = parsed.high_water.max(mark.last_id);
            }
            Err(err) => {
                parsed.malformed += 1;
                warn!(line = idx + 1, %err, "skipping malformed log record");
            }
        }
    }
    parsed
}

fn stats_of(parsed: &Parsed) -> LogStats {
    LogStats {
        records: parsed.records.len(),
        malformed: parsed.malformed,
        last_id: parsed.last_id(),
        oldest: parsed.records.iter().map(|r| r.timestamp).min(),
        newest: parsed.records.iter().map(|r| r.timestamp).max(),
    }
}

#[async_trait]
impl DurableLog for FileLog {
    async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Vec<Entry>> {
        let _guard = self.state.lock().await;
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .context("read durable log")?;
        Ok(parse_records(&raw)
            .records
            .into_iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .map(LogRecord::into_entry)
            .collect())
    }

    async fn append_all(&self, entries: &[Entry]) -> anyhow::Result<usize> {
        let mut state = self.state.lock().await;
        if state.closed {
            bail!("log is closed");
        }
        if entries.is_empty() {
            return Ok(0);
        }
        let mut id = state.last_id;
        let mut buf = String::new();
        if state.torn_tail {
            buf.push('\n');
        }
        for entry in entries {
            id += 1;
            let record = LogRecord {
                id,
                timestamp: entry.timestamp,
                client: entry.client.clone(),
            };
            buf.push_str(&serde_json::to_string(&record)?);
            buf.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("open durable log for append")?;
        file.write_all(buf.as_bytes()).await.context("append to durable log")?;
        file.sync_all().await.context("sync durable log")?;
        state.last_id = id;
        state.torn_tail = false;
        Ok(entries.len())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.state.lock().await.closed = true;
        Ok(())
    }
}

#[cfg(feature = "redis")]
pub mod redis_log {
    use super::*;
    use redis::AsyncCommands;

    /// Sorted set of JSON records scored by timestamp millis.
    #[derive(Clone)]
    pub struct RedisLog {
        client: redis::Client,
        key: String,
    }

    impl RedisLog {
        pub fn new(client: redis::Client, key: impl Into<String>) -> Self {
            Self {
                client,
                key: key.into(),
            }
        }

        fn id_key(&self) -> String {
            format!("{}:id", self.key)
        }
    }

    #[async_trait]
    impl DurableLog for RedisLog {
        async fn query_range(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> anyhow::Result<Vec<Entry>> {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let raws: Vec<String> = conn
                .zrangebyscore(&self.key, start.timestamp_millis(), end.timestamp_millis())
                .await?;
            let mut out = Vec::new();
            for raw in raws {
                match serde_json::from_str::<LogRecord>(&raw) {
                    Ok(record) => out.push(record.into_entry()),
                    Err(err) => warn!(%err, "skipping malformed log record"),
                }
            }
            Ok(out)
        }

        async fn append_all(&self, entries: &[Entry]) -> anyhow::Result<usize> {
            if entries.is_empty() {
                return Ok(0);
            }
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let last: u64 = conn.incr(self.id_key(), entries.len() as u64).await?;
            let first = last + 1 - entries.len() as u64;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for (offset, entry) in entries.iter().enumerate() {
                let record = LogRecord {
                    id: first + offset as u64,
                    timestamp: entry.timestamp,
                    client: entry.client.clone(),
                };
                let raw = serde_json::to_string(&record)?;
                pipe.zadd(&self.key, raw, entry.timestamp.timestamp_millis()).ignore();
            }
            let _: () = pipe.query_async(&mut conn).await?;
            Ok(entries.len())
        }
    }
}
