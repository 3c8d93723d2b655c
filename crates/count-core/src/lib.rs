pub mod client;
pub mod entry;
pub mod evictor;
pub mod lifecycle;
pub mod log;
pub mod store;
pub mod util;

pub use client::{resolve_client, ClientError, TrustedProxies};
pub use entry::{Entry, Window};
pub use evictor::{spawn_evictor, sweep, DEFAULT_EVICT_INTERVAL};
pub use lifecycle::{bootstrap, flush, release, FlushOutcome, DEFAULT_IO_TIMEOUT};
pub use log::{DurableLog, FileLog, LogRecord, MemoryLog};
pub use store::{EventStore, Pending};
