//! Buffered record write pipeline.
//!
//! Producers (connection handlers) append samples to a mutex-guarded staging
//! buffer; full chunks are handed over a bounded queue to one dedicated
//! worker thread, which owns the variable-id memo and commits each chunk in a
//! single transaction. Samples from one producer reach the store in
//! submission order.
//!
//! # Backpressure
//! The queue holds up to `QUEUE_CAPACITY` chunks; below that threshold
//! `record` never blocks on I/O, past it producers block on the hand-off.
//! Growth is visible through `backlog`, which the listener logs every few
//! seconds.
//!
//! # Failure
//! A failed commit is stored in a shared slot and the worker stops consuming;
//! subsequent `record` calls and the final `close` report it. `record` after
//! `close` fails with `WriterError::ShutDown`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use rec_protocol::messages::Sample;
use tracing::{debug, error};
use uuid::Uuid;

use crate::store::{NewRecord, Store, StoreError};

/// Maximum queued chunks before producers block on the hand-off.
const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("writer has been shut down")]
    ShutDown,
    #[error("writer worker failed: {0}")]
    Failed(String),
}

/// One variable sample as submitted by a connection handler.
#[derive(Debug, Clone)]
pub struct VarSample {
    pub experiment_id: Uuid,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub value: Sample,
}

struct Staging {
    buf: Vec<VarSample>,
    /// `None` once `close` has run; further records are rejected.
    tx: Option<SyncSender<Vec<VarSample>>>,
}

struct Inner {
    chunk_size: usize,
    staging: Mutex<Staging>,
    /// Chunks handed to the worker and not yet committed.
    queued_chunks: AtomicUsize,
    /// First worker failure, rendered; set once, never cleared.
    failure: Mutex<Option<String>>,
}

/// Buffered, batching writer over the store.
pub struct BufferedWriter {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedWriter {
    /// Start the writer worker. `chunk_size` is the number of samples per
    /// committed batch.
    pub fn new(store: Arc<Store>, chunk_size: usize) -> std::io::Result<Self> {
        let (tx, rx) = std::sync::mpsc::sync_channel(QUEUE_CAPACITY);
        let inner = Arc::new(Inner {
            chunk_size: chunk_size.max(1),
            staging: Mutex::new(Staging {
                buf: Vec::new(),
                tx: Some(tx),
            }),
            queued_chunks: AtomicUsize::new(0),
            failure: Mutex::new(None),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("recorder-writer".to_owned())
            .spawn(move || worker_loop(&store, &worker_inner, &rx))?;
        Ok(BufferedWriter {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.inner.chunk_size
    }

    /// Queued chunks and the approximate record count they hold.
    pub fn backlog(&self) -> (usize, usize) {
        let chunks = self.inner.queued_chunks.load(Ordering::SeqCst);
        (chunks, chunks * self.inner.chunk_size)
    }

    /// Append one sample; hands a full chunk to the worker.
    pub fn record(&self, sample: VarSample) -> Result<(), WriterError> {
        self.check_failure()?;
        let mut staging = self.staging();
        let Some(tx) = staging.tx.clone() else {
            return Err(WriterError::ShutDown);
        };
        staging.buf.push(sample);
        if staging.buf.len() >= self.inner.chunk_size {
            let chunk = std::mem::take(&mut staging.buf);
            self.hand_off(&tx, chunk)?;
        }
        Ok(())
    }

    /// Hand any partial chunk to the worker.
    pub fn flush(&self) -> Result<(), WriterError> {
        let mut staging = self.staging();
        let Some(tx) = staging.tx.clone() else {
            return Err(WriterError::ShutDown);
        };
        if !staging.buf.is_empty() {
            let chunk = std::mem::take(&mut staging.buf);
            self.hand_off(&tx, chunk)?;
        }
        Ok(())
    }

    /// Flush staging, signal end of work, drain the worker and join it.
    ///
    /// Called once from the shutdown path; any stored worker failure is
    /// propagated from here.
    pub fn close(&self) -> Result<(), WriterError> {
        {
            let mut staging = self.staging();
            let Some(tx) = staging.tx.take() else {
                return Err(WriterError::ShutDown);
            };
            if !staging.buf.is_empty() {
                let chunk = std::mem::take(&mut staging.buf);
                // Best effort: a send failure here means the worker already
                // died and the stored failure is reported below.
                let _ = self.hand_off(&tx, chunk);
            }
            // Dropping the sender lets the worker drain and exit.
        }
        let handle = self
            .worker
            .lock()
            .expect("writer lock poisoned")
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                return Err(WriterError::Failed("writer worker panicked".to_owned()));
            }
        }
        self.check_failure()
    }

    fn staging(&self) -> std::sync::MutexGuard<'_, Staging> {
        self.inner.staging.lock().expect("writer lock poisoned")
    }

    fn check_failure(&self) -> Result<(), WriterError> {
        let failure = self.inner.failure.lock().expect("writer lock poisoned");
        match failure.as_ref() {
            Some(msg) => Err(WriterError::Failed(msg.clone())),
            None => Ok(()),
        }
    }

    fn hand_off(
        &self,
        tx: &SyncSender<Vec<VarSample>>,
        chunk: Vec<VarSample>,
    ) -> Result<(), WriterError> {
        self.inner.queued_chunks.fetch_add(1, Ordering::SeqCst);
        if tx.send(chunk).is_err() {
            // Worker exited after a failure; the chunk is lost.
            self.inner.queued_chunks.fetch_sub(1, Ordering::SeqCst);
            return self.check_failure().and(Err(WriterError::ShutDown));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

fn worker_loop(store: &Store, inner: &Inner, rx: &Receiver<Vec<VarSample>>) {
    // Variable-id memo, owned exclusively by this thread.
    let mut memo: HashMap<(Uuid, String), Uuid> = HashMap::new();
    while let Ok(chunk) = rx.recv() {
        let count = chunk.len();
        match commit_chunk(store, &mut memo, chunk) {
            Ok(()) => {
                inner.queued_chunks.fetch_sub(1, Ordering::SeqCst);
                debug!(records = count, "chunk committed");
            }
            Err(err) => {
                error!(error = %err, "chunk commit failed, writer stopping");
                let mut failure = inner.failure.lock().expect("writer lock poisoned");
                *failure = Some(err.to_string());
                break;
            }
        }
    }
}

fn commit_chunk(
    store: &Store,
    memo: &mut HashMap<(Uuid, String), Uuid>,
    chunk: Vec<VarSample>,
) -> Result<(), StoreError> {
    let mut rows = Vec::with_capacity(chunk.len());
    for sample in chunk {
        let key = (sample.experiment_id, sample.name);
        let variable_id = match memo.get(&key) {
            Some(id) => *id,
            None => {
                let id = store.ensure_variable(key.0, &key.1)?;
                memo.insert(key, id);
                id
            }
        };
        rows.push(NewRecord {
            variable_id,
            timestamp: sample.timestamp,
            value: sample.value.to_string(),
        });
    }
    store.insert_records(&rows)
}
