//! Stage log buffering
//!
//! Plugins stream log lines while a stage runs. Lines are buffered per
//! stage attempt and shipped to the control plane periodically by a
//! background sender, and once more when the stage ends.

use keel_core::domain::log::{LogEntry, LogLevel};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::reporter::Reporter;

type Key = (String, u32);

pub struct LogPersister {
    deployment_id: String,
    buffer: Mutex<BTreeMap<Key, Vec<LogEntry>>>,
    reporter: Reporter,
    cancel: CancellationToken,
}

impl LogPersister {
    /// `cancel` bounds report retries; it is the deployment's context
    pub fn new(deployment_id: impl Into<String>, reporter: Reporter, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            deployment_id: deployment_id.into(),
            buffer: Mutex::new(BTreeMap::new()),
            reporter,
            cancel,
        })
    }

    pub fn add(&self, stage_id: &str, retried_count: u32, entry: LogEntry) {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer
            .entry((stage_id.to_string(), retried_count))
            .or_default()
            .push(entry);
    }

    /// Agent-side note in the stage log
    pub fn note(&self, stage_id: &str, retried_count: u32, level: LogLevel, message: impl Into<String>) {
        self.add(stage_id, retried_count, LogEntry::new(level, message));
    }

    fn drain(&self) -> BTreeMap<Key, Vec<LogEntry>> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *buffer)
    }

    pub fn pending(&self) -> usize {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.values().map(Vec::len).sum()
    }

    /// Send everything buffered so far
    pub async fn flush(&self) {
        for ((stage_id, retried_count), entries) in self.drain() {
            debug!(
                deployment_id = %self.deployment_id,
                stage_id = %stage_id,
                "Sending {} log line(s)",
                entries.len()
            );
            self.reporter
                .stage_logs(&self.deployment_id, &stage_id, retried_count, entries, &self.cancel)
                .await;
        }
    }

    /// Flushes every `interval`; once `stop` fires, flushes what is left and returns
    ///
    /// A flush in progress always finishes, so awaiting the handle after
    /// `stop` loses no lines.
    pub fn spawn_sender(self: &Arc<Self>, interval: Duration, stop: CancellationToken) -> JoinHandle<()> {
        let persister = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => persister.flush().await,
                }
            }
            persister.flush().await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers_per_attempt() {
        let shutdown = CancellationToken::new();
        let reporter = crate::testing::reporter(shutdown.clone());
        let persister = LogPersister::new("d1", reporter, shutdown);
        persister.note("stage-0", 0, LogLevel::Info, "first try");
        persister.note("stage-0", 1, LogLevel::Info, "second try");
        persister.note("stage-0", 1, LogLevel::Error, "still failing");
        assert_eq!(persister.pending(), 3);

        let drained = persister.drain();
        assert_eq!(drained[&("stage-0".to_string(), 0)].len(), 1);
        assert_eq!(drained[&("stage-0".to_string(), 1)].len(), 2);
        assert_eq!(persister.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sender_ships_every_line() {
        let cp = Arc::new(crate::testing::RecordingControlPlane::default());
        let shutdown = CancellationToken::new();
        let reporter = crate::testing::reporter_with(Arc::clone(&cp), shutdown.clone());
        let persister = LogPersister::new("d1", reporter, shutdown);

        let stop = CancellationToken::new();
        let sender = persister.spawn_sender(Duration::from_secs(60), stop.clone());
        persister.note("stage-0", 0, LogLevel::Info, "applying manifests");
        time::sleep(Duration::from_secs(1)).await;
        persister.note("stage-0", 0, LogLevel::Info, "rollout complete");

        stop.cancel();
        sender.await.unwrap();
        assert_eq!(persister.pending(), 0);
        let shipped: usize = cp.logs.lock().unwrap().iter().map(|l| l.entries.len()).sum();
        assert_eq!(shipped, 2);
    }
}
