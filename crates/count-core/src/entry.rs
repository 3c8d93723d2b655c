use anyhow::bail;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One observed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: DateTime<Utc>,
    pub client: String,
}

impl Entry {
    pub fn new(client: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            client: client.into(),
        }
    }

    pub fn now(client: impl Into<String>) -> Self {
        Self::new(client, Utc::now())
    }
}

/// Trailing span over which requests are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    span: Duration,
}

impl Window {
    pub const DEFAULT_SECS: u64 = 60;

    pub fn from_secs(secs: u64) -> anyhow::Result<Self> {
        if secs == 0 {
            bail!("window must be at least one second");
        }
        let secs = i64::try_from(secs)?;
        let Some(span) = Duration::try_seconds(secs) else {
            bail!("window of {secs}s is out of range");
        };
        Ok(Self { span })
    }

    pub fn span(&self) -> Duration {
        self.span
    }

    pub fn as_secs(&self) -> i64 {
        self.span.num_seconds()
    }

    /// Oldest timestamp still inside the window at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - self.span
    }

    pub fn contains(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        entry.timestamp >= self.cutoff(now) && entry.timestamp <= now
    }
}

impl Default for Window {
    fn default() -> Self {
        Self {
            span: Duration::seconds(Self::DEFAULT_SECS as i64),
        }
    }
}
