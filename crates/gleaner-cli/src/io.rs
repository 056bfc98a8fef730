//! File-backed record source and result sink.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use gleaner_core::error::AppError;
use gleaner_core::models::{EnrichedRecord, FieldMap, Record, RunSummary};
use gleaner_core::traits::{RecordSource, ResultSink};

pub const ENRICHED_JSON: &str = "enriched.json";
pub const ENRICHED_CSV: &str = "enriched.csv";
pub const SUMMARY_JSON: &str = "summary.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Json,
    Csv,
}

impl InputFormat {
    /// `.csv` is CSV; anything else is read as a JSON array of objects.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => InputFormat::Csv,
            _ => InputFormat::Json,
        }
    }
}

/// Loads input records from a JSON or CSV file.
///
/// One column/key names the record id (the page URL); every other non-blank
/// scalar becomes a known field.
#[derive(Debug, Clone)]
pub struct FileRecordSource {
    path: PathBuf,
    id_field: String,
    format: InputFormat,
}

impl FileRecordSource {
    pub fn new(path: impl Into<PathBuf>, id_field: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            format: InputFormat::from_path(&path),
            path,
            id_field: id_field.into(),
        }
    }

    fn read_json(&self) -> Result<Vec<Record>, AppError> {
        let text = fs::read_to_string(&self.path).map_err(|e| {
            AppError::InputError(format!("Failed to read {}: {e}", self.path.display()))
        })?;
        let rows: Vec<serde_json::Map<String, serde_json::Value>> = serde_json::from_str(&text)
            .map_err(|e| {
                AppError::InputError(format!(
                    "{} is not a JSON array of objects: {e}",
                    self.path.display()
                ))
            })?;

        rows.into_iter()
            .enumerate()
            .map(|(row, object)| {
                let pairs = object.into_iter().filter_map(|(key, value)| {
                    let text = match value {
                        serde_json::Value::String(s) => s,
                        serde_json::Value::Number(n) => n.to_string(),
                        serde_json::Value::Bool(b) => b.to_string(),
                        _ => return None,
                    };
                    Some((key, text))
                });
                self.to_record(row + 1, pairs)
            })
            .collect()
    }

    fn read_csv(&self) -> Result<Vec<Record>, AppError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_path(&self.path)
            .map_err(|e| {
                AppError::InputError(format!("Failed to read {}: {e}", self.path.display()))
            })?;
        let headers = reader
            .headers()
            .map_err(|e| AppError::InputError(format!("Bad CSV header: {e}")))?
            .clone();

        let mut records = Vec::new();
        for (row, result) in reader.records().enumerate() {
            let line = result.map_err(|e| AppError::InputError(format!("Bad CSV row: {e}")))?;
            let pairs = headers
                .iter()
                .zip(line.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()));
            records.push(self.to_record(row + 1, pairs)?);
        }
        Ok(records)
    }

    fn to_record(
        &self,
        row: usize,
        pairs: impl Iterator<Item = (String, String)>,
    ) -> Result<Record, AppError> {
        let mut id = None;
        let mut known = FieldMap::new();
        for (key, value) in pairs {
            let value = value.trim();
            if key == self.id_field {
                id = Some(value.to_string());
            } else if !value.is_empty() {
                known.insert(key, value.to_string());
            }
        }

        match id.filter(|id| !id.is_empty()) {
            Some(id) => Ok(Record {
                known_fields: known,
                ..Record::new(id)
            }),
            None => Err(AppError::InputError(format!(
                "row {row} of {} has no '{}' value",
                self.path.display(),
                self.id_field
            ))),
        }
    }
}

impl RecordSource for FileRecordSource {
    async fn load(&self) -> Result<Vec<Record>, AppError> {
        let records = match self.format {
            InputFormat::Json => self.read_json()?,
            InputFormat::Csv => self.read_csv()?,
        };
        tracing::info!(path = %self.path.display(), records = records.len(), "Loaded input");
        Ok(records)
    }
}

/// Writes `enriched.json`, `enriched.csv` and `summary.json` into a directory.
#[derive(Debug, Clone)]
pub struct FileResultSink {
    dir: PathBuf,
}

impl FileResultSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn write_json<T: serde::Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), AppError> {
        let path = self.dir.join(name);
        let file = File::create(&path).map_err(|e| sink_error(&path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| sink_error(&path, e))?;
        writer.flush().map_err(|e| sink_error(&path, e))
    }

    /// One row per record: id, status, attempts, last error, then every
    /// known field (`known.<name>`) and every extracted field.
    fn write_csv(&self, records: &[EnrichedRecord]) -> Result<(), AppError> {
        let path = self.dir.join(ENRICHED_CSV);
        let known: BTreeSet<&str> = records
            .iter()
            .flat_map(|r| r.record.known_fields.keys().map(String::as_str))
            .collect();
        let extracted: BTreeSet<String> = records
            .iter()
            .filter_map(|r| r.payload.as_ref())
            .flat_map(|p| p.fields.keys().cloned())
            .collect();

        let mut writer = csv::Writer::from_path(&path).map_err(|e| sink_error(&path, e))?;

        let mut header: Vec<String> = ["id", "status", "attempts", "last_error"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        header.extend(known.iter().map(|k| format!("known.{k}")));
        header.extend(extracted.iter().cloned());
        writer.write_record(&header).map_err(|e| sink_error(&path, e))?;

        for record in records {
            let values = record.extracted();
            let mut row = vec![
                record.record.id.clone(),
                record.record.status.to_string(),
                record.attempt_count.to_string(),
                record.last_error.clone().unwrap_or_default(),
            ];
            row.extend(
                known
                    .iter()
                    .map(|k| record.record.known_fields.get(*k).cloned().unwrap_or_default()),
            );
            row.extend(
                extracted
                    .iter()
                    .map(|f| values.get(f).cloned().unwrap_or_default()),
            );
            writer.write_record(&row).map_err(|e| sink_error(&path, e))?;
        }
        writer.flush().map_err(|e| sink_error(&path, e))
    }
}

fn sink_error(path: &Path, e: impl std::fmt::Display) -> AppError {
    AppError::SinkError(format!("Failed to write {}: {e}", path.display()))
}

impl ResultSink for FileResultSink {
    async fn write(&self, records: &[EnrichedRecord], summary: &RunSummary) -> Result<(), AppError> {
        fs::create_dir_all(&self.dir).map_err(|e| sink_error(&self.dir, e))?;
        self.write_json(ENRICHED_JSON, records)?;
        self.write_csv(records)?;
        self.write_json(SUMMARY_JSON, summary)?;
        tracing::info!(dir = %self.dir.display(), records = records.len(), "Wrote results");
        Ok(())
    }
}
