//! JSON-lines export and import files

use anyhow::{Context, Result, bail};
use blobnode_storage::{
    BlobEngine, FileSnapshot, ImportOutcome, SnapshotEntry, SnapshotGroup,
};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};

/// One line of an export file
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Record {
    Entry(SnapshotEntry),
    Group(SnapshotGroup),
    File(FileSnapshot),
}

/// What to export
#[derive(Debug, Clone)]
pub enum Selection {
    /// Every metadata entry
    Full,
    /// Metadata of a sequence range
    Range { start: u64, limit: usize },
    /// Metadata of named paths
    Paths(Vec<String>),
    /// Path contents of a sequence range
    Files { start: u64, limit: usize },
}

/// Totals of an import run
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub applied: u64,
    pub skipped: u64,
}

impl ImportSummary {
    fn record(&mut self, outcome: ImportOutcome) {
        match outcome {
            ImportOutcome::Applied => self.applied += 1,
            ImportOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Write `selection` as JSON lines to `out`; returns the number of records
pub fn export(engine: &BlobEngine, selection: &Selection, out: &mut dyn Write) -> Result<u64> {
    let mut failure = None;
    let mut emit = |record: Record| match write_line(out, &record) {
        Ok(()) => true,
        Err(e) => {
            failure = Some(e);
            false
        }
    };
    let count = match selection {
        Selection::Full => engine.export_all(&mut |e| emit(Record::Entry(e)))?,
        Selection::Range { start, limit } => {
            engine.export_by_range(*start, *limit, &mut |g| emit(Record::Group(g)))?
        }
        Selection::Paths(paths) => engine.export_by_paths(paths, &mut |g| emit(Record::Group(g)))?,
        Selection::Files { start, limit } => {
            engine.export_file_data(*start, *limit, &mut |f| emit(Record::File(f)))?
        }
    };
    if let Some(e) = failure {
        return Err(e);
    }
    out.flush()?;
    Ok(count)
}

fn write_line(out: &mut dyn Write, record: &Record) -> Result<()> {
    serde_json::to_writer(&mut *out, record)?;
    out.write_all(b"\n")?;
    Ok(())
}

/// Replay an export file produced by [`export`]
pub fn import(engine: &BlobEngine, input: impl BufRead, overwrite: bool) -> Result<ImportSummary> {
    let mut summary = ImportSummary::default();
    for (index, line) in input.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: Record = serde_json::from_str(&line)
            .with_context(|| format!("line {}: not an export record", index + 1))?;
        match record {
            Record::Entry(entry) => summary.record(engine.import_entry(&entry, overwrite)?),
            Record::Group(group) => {
                for entry in &group.entries {
                    summary.record(engine.import_entry(entry, overwrite)?);
                }
            }
            Record::File(file) => {
                if !overwrite && engine.exists(&file.path)? {
                    summary.record(ImportOutcome::Skipped);
                    continue;
                }
                summary.record(engine.import_file(&file)?);
            }
        }
    }
    Ok(summary)
}

/// Parse a `start:limit` range argument
pub fn parse_range(value: &str) -> Result<(u64, usize)> {
    let Some((start, limit)) = value.split_once(':') else {
        bail!("expected START:LIMIT, got {value:?}");
    };
    Ok((
        start.parse().context("invalid range start")?,
        limit.parse().context("invalid range limit")?,
    ))
}
