//! Shared experiment interface.
//!
//! The single façade the connection handlers talk to: experiment lifecycle
//! and metadata mutations run synchronously under one lock, variable records
//! go through the buffered writer and return immediately. One instance is
//! shared by every connection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rec_protocol::messages::Sample;
use tracing::info;
use uuid::Uuid;

use crate::export::{ExportError, Exporter};
use crate::store::{Store, StoreError};
use crate::writer::{BufferedWriter, VarSample, WriterError};

#[derive(Debug, thiserror::Error)]
pub enum InterfaceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Export(#[from] ExportError),
}

pub struct ExperimentInterface {
    store: Arc<Store>,
    writer: BufferedWriter,
    exporter: Exporter,
    default_metadata: BTreeMap<String, String>,
    /// Serializes lifecycle mutations across connections.
    lifecycle: Mutex<()>,
    /// Ids created this run; export covers exactly these, even when the
    /// database file persists across runs.
    experiment_ids: Mutex<Vec<Uuid>>,
}

impl ExperimentInterface {
    pub fn new(
        store: Arc<Store>,
        exporter: Exporter,
        chunk_size: usize,
        default_metadata: BTreeMap<String, String>,
    ) -> std::io::Result<Self> {
        let writer = BufferedWriter::new(Arc::clone(&store), chunk_size)?;
        Ok(ExperimentInterface {
            store,
            writer,
            exporter,
            default_metadata,
            lifecycle: Mutex::new(()),
            experiment_ids: Mutex::new(Vec::new()),
        })
    }

    /// Create a fresh experiment instance and apply the default metadata.
    pub fn new_experiment_instance(&self) -> Result<Uuid, InterfaceError> {
        let _guard = self.lifecycle.lock().expect("lifecycle lock poisoned");
        let id = self.store.create_experiment()?;
        for (label, value) in &self.default_metadata {
            self.store.upsert_metadata(id, label, value)?;
        }
        self.experiment_ids
            .lock()
            .expect("experiment id lock poisoned")
            .push(id);
        info!(experiment_id = %id, "experiment instance created");
        Ok(id)
    }

    /// Upsert metadata pairs for an instance.
    pub fn add_metadata(
        &self,
        id: Uuid,
        pairs: &BTreeMap<String, String>,
    ) -> Result<(), InterfaceError> {
        let _guard = self.lifecycle.lock().expect("lifecycle lock poisoned");
        for (label, value) in pairs {
            self.store.upsert_metadata(id, label, value)?;
        }
        Ok(())
    }

    /// Set the instance end time to now.
    pub fn finish_experiment_instance(&self, id: Uuid) -> Result<(), InterfaceError> {
        let _guard = self.lifecycle.lock().expect("lifecycle lock poisoned");
        self.store.finish_experiment(id, Utc::now())?;
        info!(experiment_id = %id, "experiment instance finished");
        Ok(())
    }

    /// Append one sample per (name, value) pair to the write pipeline.
    ///
    /// Returns the number of samples appended; the only deferred path.
    pub fn record_variables(
        &self,
        id: Uuid,
        timestamp: DateTime<Utc>,
        variables: &BTreeMap<String, Sample>,
    ) -> Result<usize, InterfaceError> {
        for (name, value) in variables {
            self.writer.record(VarSample {
                experiment_id: id,
                name: name.clone(),
                timestamp,
                value: *value,
            })?;
        }
        Ok(variables.len())
    }

    pub fn backlog(&self) -> (usize, usize) {
        self.writer.backlog()
    }

    pub fn chunk_size(&self) -> usize {
        self.writer.chunk_size()
    }

    /// Ids of every experiment instance created this run.
    pub fn experiment_instances(&self) -> Vec<Uuid> {
        self.experiment_ids
            .lock()
            .expect("experiment id lock poisoned")
            .clone()
    }

    /// Drain the writer, export the run's artifacts, then close the store.
    ///
    /// A worker failure aborts before export and is propagated. The store
    /// close checkpoints the WAL, so a non-persistent run can delete the
    /// backing file (and its sidecars) cleanly afterwards.
    pub fn close(&self) -> Result<(), InterfaceError> {
        self.writer.close()?;
        let ids = self.experiment_instances();
        self.exporter.export(&self.store, &ids)?;
        self.store.close()?;
        Ok(())
    }
}
