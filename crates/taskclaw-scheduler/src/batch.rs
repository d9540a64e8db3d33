//! Batched audit persistence.
//!
//! Firings hand finished records to [`BatchWriter::enqueue`], which never blocks and
//! never fails. A single background task accumulates them and commits to the ledger
//! when the buffer reaches `batch_size` or the oldest buffered record has waited
//! `flush_interval_ms`, whichever comes first. Failed commits are retried with
//! exponential backoff; records the ledger never accepts are appended to a local
//! JSONL fallback log.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use taskclaw_core::config::BatchConfig;
use taskclaw_core::error::Result;
use taskclaw_core::{Ledger, LedgerRecord};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::retry;

const MAX_COMMIT_BACKOFF: Duration = Duration::from_secs(30);

enum Command {
    Record(Box<LedgerRecord>),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

#[derive(Default)]
struct Counters {
    enqueued: AtomicU64,
    written: AtomicU64,
    failed: AtomicU64,
    fallback_logged: AtomicU64,
    flushes: AtomicU64,
}

/// Point-in-time writer counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchStats {
    pub enqueued: u64,
    pub written: u64,
    /// Records that exhausted every commit attempt.
    pub failed: u64,
    pub fallback_logged: u64,
    pub flushes: u64,
}

/// Minimal line written for a record the ledger never accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub tenant_id: String,
    pub agent_id: String,
    pub capability_name: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&LedgerRecord> for FallbackEntry {
    fn from(record: &LedgerRecord) -> Self {
        Self {
            tenant_id: record.tenant_id.clone(),
            agent_id: record.agent_id.clone(),
            capability_name: record.capability_name.clone(),
            timestamp: record.created_at,
        }
    }
}

/// Append-only JSONL log of records that could not be persisted.
#[derive(Debug, Clone)]
pub struct FallbackLog {
    path: PathBuf,
}

impl FallbackLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &LedgerRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(&FallbackEntry::from(record))?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Every entry written so far. Unparseable lines are skipped.
    pub fn read_all(&self) -> Result<Vec<FallbackEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

pub struct BatchWriter {
    tx: mpsc::UnboundedSender<Command>,
    counters: Arc<Counters>,
    fallback: FallbackLog,
    handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Start the background flush task. Must be called inside a tokio runtime.
    pub fn spawn(ledger: Arc<dyn Ledger>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let fallback = FallbackLog::new(config.fallback_log_path.clone());

        let worker = FlushWorker {
            ledger,
            config,
            counters: counters.clone(),
            fallback: fallback.clone(),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            tx,
            counters,
            fallback,
            handle: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Hand a record off. Returns immediately; persistence problems never reach the caller.
    pub fn enqueue(&self, record: LedgerRecord) {
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Err(mpsc::error::SendError(cmd)) = self.tx.send(Command::Record(Box::new(record))) {
            if let Command::Record(record) = cmd {
                tracing::error!(
                    "💾 Batch writer stopped; logging '{}' to fallback",
                    record.capability_name
                );
                write_fallback(&self.fallback, &self.counters, &record);
            }
        }
    }

    /// Force a flush of everything enqueued so far and wait for it.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Flush, then stop the background task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
        let handle = self.handle.lock().ok().and_then(|mut h| h.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            fallback_logged: self.counters.fallback_logged.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }

    pub fn fallback_log(&self) -> &FallbackLog {
        &self.fallback
    }
}

fn write_fallback(fallback: &FallbackLog, counters: &Counters, record: &LedgerRecord) {
    match fallback.append(record) {
        Ok(()) => {
            counters.fallback_logged.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            tracing::error!(
                "❌ Fallback log write failed ({}): {e}; record: {}",
                fallback.path().display(),
                serde_json::to_string(record).unwrap_or_default()
            );
        }
    }
}

struct FlushWorker {
    ledger: Arc<dyn Ledger>,
    config: BatchConfig,
    counters: Arc<Counters>,
    fallback: FallbackLog,
}

impl FlushWorker {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let batch_size = self.config.batch_size.max(1);
        let mut pending: Vec<LedgerRecord> = Vec::new();
        let mut deadline: Option<Instant> = None;

        loop {
            let cmd = match deadline {
                Some(at) => tokio::select! {
                    cmd = rx.recv() => cmd,
                    _ = tokio::time::sleep_until(at) => {
                        deadline = None;
                        if let Some(ack) = self.flush(&mut pending, &mut rx).await {
                            self.drain_and_stop(&mut pending, &mut rx, vec![ack]).await;
                            break;
                        }
                        continue;
                    }
                },
                None => rx.recv().await,
            };

            match cmd {
                Some(Command::Record(record)) => {
                    if pending.is_empty() {
                        deadline = Some(Instant::now() + interval);
                    }
                    pending.push(*record);
                    if pending.len() >= batch_size {
                        deadline = None;
                        if let Some(ack) = self.flush(&mut pending, &mut rx).await {
                            self.drain_and_stop(&mut pending, &mut rx, vec![ack]).await;
                            break;
                        }
                    }
                }
                Some(Command::Flush(ack)) => {
                    deadline = None;
                    let shutdown = self.flush(&mut pending, &mut rx).await;
                    let _ = ack.send(());
                    if let Some(shutdown) = shutdown {
                        self.drain_and_stop(&mut pending, &mut rx, vec![shutdown]).await;
                        break;
                    }
                }
                Some(Command::Shutdown(ack)) => {
                    self.drain_and_stop(&mut pending, &mut rx, vec![ack]).await;
                    break;
                }
                None => {
                    self.drain_and_stop(&mut pending, &mut rx, Vec::new()).await;
                    break;
                }
            }
        }
        tracing::debug!("💾 Batch writer stopped");
    }

    /// Drain whatever is already queued, then commit. Stops draining at a shutdown
    /// request and hands back its ack.
    async fn flush(
        &self,
        pending: &mut Vec<LedgerRecord>,
        rx: &mut mpsc::UnboundedReceiver<Command>,
    ) -> Option<oneshot::Sender<()>> {
        let mut acks = Vec::new();
        let mut shutdown = None;
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                Command::Record(record) => pending.push(*record),
                Command::Flush(ack) => acks.push(ack),
                Command::Shutdown(ack) => {
                    shutdown = Some(ack);
                    break;
                }
            }
        }

        if !pending.is_empty() {
            let batch = std::mem::take(pending);
            self.commit_with_retry(&batch).await;
        }
        for ack in acks {
            let _ = ack.send(());
        }
        shutdown
    }

    /// Close the channel so later `enqueue` calls go straight to the fallback log,
    /// then commit everything that was sent before the close.
    async fn drain_and_stop(
        &self,
        pending: &mut Vec<LedgerRecord>,
        rx: &mut mpsc::UnboundedReceiver<Command>,
        mut acks: Vec<oneshot::Sender<()>>,
    ) {
        rx.close();
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Record(record) => pending.push(*record),
                Command::Flush(ack) | Command::Shutdown(ack) => acks.push(ack),
            }
        }

        if !pending.is_empty() {
            let batch = std::mem::take(pending);
            self.commit_with_retry(&batch).await;
        }
        for ack in acks {
            let _ = ack.send(());
        }
    }

    async fn commit_with_retry(&self, batch: &[LedgerRecord]) {
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        let max_attempts = self.config.max_attempts.max(1);
        let base = Duration::from_millis(self.config.retry_base_delay_ms);
        let mut committed = 0;

        for attempt in 1..=max_attempts {
            match self.commit_from(batch, &mut committed).await {
                Ok(()) => {
                    tracing::debug!("💾 Flushed {} ledger record(s)", batch.len());
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        "⚠️ Ledger commit failed (attempt {}/{}, {} of {} written): {e}",
                        attempt,
                        max_attempts,
                        committed,
                        batch.len()
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(retry::calculate_delay(attempt - 1, base, MAX_COMMIT_BACKOFF)).await;
                    }
                }
            }
        }

        let remaining = &batch[committed..];
        tracing::error!(
            "❌ Ledger unavailable after {} attempts; {} record(s) go to {}",
            max_attempts,
            remaining.len(),
            self.fallback.path().display()
        );
        self.counters
            .failed
            .fetch_add(remaining.len() as u64, Ordering::Relaxed);
        for record in remaining {
            write_fallback(&self.fallback, &self.counters, record);
        }
    }

    /// Commit `batch[*committed..]` in order, advancing `committed` as records land.
    async fn commit_from(&self, batch: &[LedgerRecord], committed: &mut usize) -> Result<()> {
        if self.ledger.supports_batch() {
            let chunk_size = self.config.chunk_size.max(1);
            for chunk in batch[*committed..].chunks(chunk_size) {
                self.ledger.batch_record_executions(chunk).await?;
                *committed += chunk.len();
                self.counters
                    .written
                    .fetch_add(chunk.len() as u64, Ordering::Relaxed);
            }
        } else {
            for record in &batch[*committed..] {
                self.ledger.record_execution(record).await?;
                *committed += 1;
                self.counters.written.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}
