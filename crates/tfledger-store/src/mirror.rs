// ABOUTME: Background work queue that copies artifacts between the local and remote stores.
// ABOUTME: A dispatcher task hands jobs to detached workers bounded by a semaphore.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tfledger_core::Run;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, StoreError};
use crate::local::LocalStore;
use crate::remote::RemoteStore;

/// One unit of background copying.
#[derive(Debug, Clone)]
pub enum MirrorJob {
    /// Upload a record written locally.
    PushRun(Run),
    PushOutput { id: String, output: Vec<u8> },
    /// Persist locally a record that was read from the remote store.
    BackfillRun(Run),
    BackfillOutput { id: String, output: Vec<u8> },
}

impl MirrorJob {
    fn label(&self) -> &'static str {
        match self {
            MirrorJob::PushRun(_) => "upload run",
            MirrorJob::PushOutput { .. } => "upload output",
            MirrorJob::BackfillRun(_) => "backfill run",
            MirrorJob::BackfillOutput { .. } => "backfill output",
        }
    }

    fn run_id(&self) -> &str {
        match self {
            MirrorJob::PushRun(run) | MirrorJob::BackfillRun(run) => &run.id,
            MirrorJob::PushOutput { id, .. } | MirrorJob::BackfillOutput { id, .. } => id,
        }
    }

    fn key(&self) -> JobKey {
        (self.label(), self.run_id().to_string())
    }
}

/// Jobs writing the same artifact share a key and are applied in enqueue order.
type JobKey = (&'static str, String);

struct Slot {
    latest: u64,
    lock: Arc<Mutex<()>>,
}

/// Tracks the newest queued job per key. A job that is no longer the newest
/// for its key when it gets the key's lock is skipped.
#[derive(Default)]
struct Sequencer {
    next: AtomicU64,
    slots: std::sync::Mutex<HashMap<JobKey, Slot>>,
}

impl Sequencer {
    fn claim(&self, key: JobKey) -> (u64, Arc<Mutex<()>>) {
        let seq = self.next.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(key).or_insert_with(|| Slot {
            latest: seq,
            lock: Arc::new(Mutex::new(())),
        });
        slot.latest = seq;
        (seq, Arc::clone(&slot.lock))
    }

    fn is_latest(&self, key: &JobKey, seq: u64) -> bool {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).is_some_and(|slot| slot.latest == seq)
    }

    fn release(&self, key: &JobKey, seq: u64) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if slots.get(key).is_some_and(|slot| slot.latest == seq) {
            slots.remove(key);
        }
    }
}

enum Command {
    Job(MirrorJob),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Handle to the background queue. Jobs are fire-and-forget: failures are
/// logged and counted, never reported to the caller that enqueued them.
#[derive(Debug)]
pub struct Mirror {
    tx: mpsc::UnboundedSender<Command>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Mirror {
    /// Start the dispatcher. Must be called from within a tokio runtime.
    pub fn spawn(local: LocalStore, remote: RemoteStore, concurrency: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let workers = Workers {
            local,
            remote,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            permits: concurrency.max(1) as u32,
            counters: Arc::clone(&counters),
            sequencer: Sequencer::default(),
        };
        let dispatcher = tokio::spawn(workers.run(rx));

        Self {
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            counters,
        }
    }

    /// Queue a job without waiting. After `drain` the job is dropped and counted as failed.
    pub fn enqueue(&self, job: MirrorJob) {
        if let Err(mpsc::error::SendError(Command::Job(job))) = self.tx.send(Command::Job(job)) {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!("mirror is closed, dropping {} for {}", job.label(), job.run_id());
        }
    }

    pub fn completed(&self) -> u64 {
        self.counters.completed.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.counters.failed.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait up to `timeout` for queued and in-flight
    /// work to finish. On timeout the remaining work is left running detached.
    /// Calling it again is a no-op.
    pub async fn drain(&self, timeout: Duration) -> Result<()> {
        let Some(dispatcher) = self.dispatcher.lock().await.take() else {
            return Ok(());
        };
        let _ = self.tx.send(Command::Shutdown);

        match tokio::time::timeout(timeout, dispatcher).await {
            Ok(joined) => {
                joined.map_err(StoreError::from)?;
                tracing::debug!(
                    "mirror drained: {} completed, {} failed",
                    self.completed(),
                    self.failures()
                );
                Ok(())
            }
            Err(_) => {
                tracing::warn!(
                    "mirror did not drain within {:?}, leaving remaining uploads in the background",
                    timeout
                );
                Ok(())
            }
        }
    }
}

struct Workers {
    local: LocalStore,
    remote: RemoteStore,
    semaphore: Arc<Semaphore>,
    permits: u32,
    counters: Arc<Counters>,
    sequencer: Sequencer,
}

impl Workers {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<Command>) {
        let this = Arc::new(self);

        while let Some(command) = rx.recv().await {
            let job = match command {
                Command::Job(job) => job,
                Command::Shutdown => break,
            };
            let permit = match Arc::clone(&this.semaphore).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let key = job.key();
            let (seq, lock) = this.sequencer.claim(key.clone());
            let workers = Arc::clone(&this);
            tokio::spawn(async move {
                let _permit = permit;
                let _ordered = lock.lock().await;
                if !workers.sequencer.is_latest(&key, seq) {
                    workers.counters.completed.fetch_add(1, Ordering::SeqCst);
                    tracing::debug!("{} for {} superseded by a newer job", key.0, key.1);
                    return;
                }
                workers.process(job).await;
                workers.sequencer.release(&key, seq);
            });
        }

        rx.close();
        while let Ok(command) = rx.try_recv() {
            if let Command::Job(job) = command {
                this.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("mirror is closed, dropping {} for {}", job.label(), job.run_id());
            }
        }

        // Every permit back means every worker has finished.
        let _ = this.semaphore.acquire_many(this.permits).await;
    }

    async fn process(&self, job: MirrorJob) {
        let label = job.label();
        let id = job.run_id().to_string();

        let result = match job {
            MirrorJob::PushRun(run) => self.remote.save_run(&run).await,
            MirrorJob::PushOutput { id, output } => self.remote.save_output(&id, &output).await,
            MirrorJob::BackfillRun(run) => {
                let local = self.local.clone();
                tokio::task::spawn_blocking(move || local.save_run(&run))
                    .await
                    .map_err(StoreError::from)
                    .and_then(|r| r)
            }
            MirrorJob::BackfillOutput { id, output } => {
                let local = self.local.clone();
                tokio::task::spawn_blocking(move || local.save_output(&id, &output))
                    .await
                    .map_err(StoreError::from)
                    .and_then(|r| r)
            }
        };

        match result {
            Ok(()) => {
                self.counters.completed.fetch_add(1, Ordering::SeqCst);
                tracing::debug!("{} for {} done", label, id);
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::SeqCst);
                tracing::warn!("background {} for {} failed: {}", label, id, e);
            }
        }
    }
}
