//! Log sinks for notable job events.
//!
//! The core calls [`Sink::emit`] synchronously on every notable event. The
//! dispatcher-forwarding sink is one concrete implementation, not a hidden
//! hook inside the logging framework: it hands entries to a background task
//! through a bounded channel and drops them on overflow, so forwarding can
//! never stall job execution.

use crate::config::Config;
use crate::crypto::CryptoProvider;
use crate::rpc::RpcClient;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// One notable event, optionally tied to a job.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub job_id: Option<u64>,
    pub message: String,
}

impl LogEntry {
    pub fn for_job(job_id: u64, message: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id),
            message: message.into(),
        }
    }
}

pub trait Sink: Send + Sync {
    fn emit(&self, entry: LogEntry);
}

const FORWARD_QUEUE_DEPTH: usize = 256;
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Sink that forwards entries to the dispatcher over the RPC client.
pub struct DispatcherSink {
    tx: mpsc::Sender<LogEntry>,
}

impl DispatcherSink {
    /// Starts the forwarding task and returns the sink plus its handle.
    pub fn spawn(config: Config) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(FORWARD_QUEUE_DEPTH);
        let handle = tokio::spawn(async move {
            let crypto = CryptoProvider::new(&config);
            let rpc = RpcClient::new(&config, &crypto);
            while let Some(entry) = rx.recv().await {
                let forward = rpc.log(entry.job_id, &entry.message);
                if tokio::time::timeout(FORWARD_TIMEOUT, forward).await.is_err() {
                    debug!("Dropped forwarded log entry: dispatcher timeout");
                }
            }
        });
        (Self { tx }, handle)
    }
}

impl Sink for DispatcherSink {
    fn emit(&self, entry: LogEntry) {
        // Full queue means the dispatcher is slow; the local log already has
        // the entry, so dropping the forward is acceptable.
        if self.tx.try_send(entry).is_err() {
            debug!("Dropped forwarded log entry: queue full");
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Sink that collects entries for assertions.
    #[derive(Default)]
    pub struct CollectSink {
        pub entries: Mutex<Vec<LogEntry>>,
    }

    impl Sink for CollectSink {
        fn emit(&self, entry: LogEntry) {
            self.entries.lock().unwrap().push(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CollectSink;
    use super::*;

    #[test]
    fn test_collect_sink_records_entries() {
        let sink = CollectSink::default();
        sink.emit(LogEntry::for_job(1, "a"));
        sink.emit(LogEntry::for_job(1, "b"));
        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "a");
        assert_eq!(entries[1].job_id, Some(1));
    }
}
