//! Shutdown artifact export.
//!
//! Writes three files under the configured output directory:
//! - the records CSV: record rows pivoted into a wide table, one row per
//!   (experiment, timestamp), one column per variable observed anywhere in
//!   the run, empty cells for missing samples;
//! - the metadata JSON: `{experiment_id → {label → value}}`, pretty-printed;
//! - the times JSON: `{experiment_id → {start, end}}`, RFC 3339 strings,
//!   `end` null when the instance never finished cleanly.
//!
//! Pre-existing files at the target paths are overwritten with a warning;
//! config loading has already rejected directories at these paths.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::{json, Map as JsonMap, Value as JsonValue};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::OutputConfig;
use crate::store::{fmt_ts, RecordRow, Store, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct Exporter {
    record_path: PathBuf,
    metadata_path: PathBuf,
    times_path: PathBuf,
}

impl Exporter {
    pub fn from_config(output: &OutputConfig) -> Self {
        Exporter {
            record_path: output.record_path(),
            metadata_path: output.metadata_path(),
            times_path: output.times_path(),
        }
    }

    /// Read everything recorded for `ids` and write the three artifacts.
    pub fn export(&self, store: &Store, ids: &[Uuid]) -> Result<(), ExportError> {
        let records = store.export_records(ids)?;
        let metadata = store.export_metadata(ids)?;
        let times = store.export_times(ids)?;

        self.write_records_csv(&records)?;
        self.write_metadata_json(&metadata)?;
        self.write_times_json(&times)?;
        Ok(())
    }

    fn write_records_csv(&self, records: &[RecordRow]) -> Result<(), ExportError> {
        // Pivot: rows keyed on (experiment, timestamp), one column per
        // variable name seen anywhere in the set.
        let mut columns: BTreeSet<&str> = BTreeSet::new();
        let mut rows: BTreeMap<(String, &str), BTreeMap<&str, &str>> = BTreeMap::new();
        for r in records {
            columns.insert(r.variable.as_str());
            rows.entry((r.experiment.to_string(), r.timestamp.as_str()))
                .or_default()
                .insert(r.variable.as_str(), r.value.as_str());
        }

        let mut out = BufWriter::new(create_artifact(&self.record_path)?);
        write!(out, "experiment,timestamp")?;
        for col in &columns {
            write!(out, ",{}", csv_field(col))?;
        }
        writeln!(out)?;
        for ((experiment, timestamp), cells) in &rows {
            write!(out, "{},{}", csv_field(experiment), csv_field(timestamp))?;
            for col in &columns {
                match cells.get(col) {
                    Some(value) => write!(out, ",{}", csv_field(value))?,
                    None => write!(out, ",")?,
                }
            }
            writeln!(out)?;
        }
        out.flush()?;
        info!(path = %self.record_path.display(), rows = rows.len(), "records exported");
        Ok(())
    }

    fn write_metadata_json(
        &self,
        metadata: &BTreeMap<Uuid, BTreeMap<String, Option<String>>>,
    ) -> Result<(), ExportError> {
        let mut root = JsonMap::new();
        for (id, pairs) in metadata {
            let mut entry = JsonMap::new();
            for (label, value) in pairs {
                let value = match value {
                    Some(v) => JsonValue::String(v.clone()),
                    None => JsonValue::Null,
                };
                entry.insert(label.clone(), value);
            }
            root.insert(id.to_string(), JsonValue::Object(entry));
        }
        write_pretty_json(&self.metadata_path, &JsonValue::Object(root))?;
        info!(path = %self.metadata_path.display(), "metadata exported");
        Ok(())
    }

    fn write_times_json(
        &self,
        times: &BTreeMap<Uuid, crate::store::ExperimentTimes>,
    ) -> Result<(), ExportError> {
        let mut root = JsonMap::new();
        for (id, t) in times {
            root.insert(
                id.to_string(),
                json!({
                    "start": fmt_ts(&t.start),
                    "end": t.end.as_ref().map(fmt_ts),
                }),
            );
        }
        write_pretty_json(&self.times_path, &JsonValue::Object(root))?;
        info!(path = %self.times_path.display(), "times exported");
        Ok(())
    }
}

fn create_artifact(path: &Path) -> Result<File, ExportError> {
    if path.exists() {
        warn!(path = %path.display(), "overwriting existing output file");
    }
    Ok(File::create(path)?)
}

fn write_pretty_json(path: &Path, value: &JsonValue) -> Result<(), ExportError> {
    let mut out = BufWriter::new(create_artifact(path)?);
    serde_json::to_writer_pretty(&mut out, value)?;
    out.flush()?;
    Ok(())
}

/// RFC 4180 CSV field quoting.
/// Wraps in double-quotes if the field contains comma, double-quote, or
/// newline; embedded double-quotes are doubled.
fn csv_field(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        let escaped = s.replace('"', "\"\"");
        format!("\"{escaped}\"")
    } else {
        s.to_owned()
    }
}
