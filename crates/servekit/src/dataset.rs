//! Seeded shuffle-and-select over JSONL records.
//!
//! Prepares rollout inputs: a fixed-size, reproducible subset of a larger
//! instruction dataset. Records are kept as raw `serde_json::Value`s so any
//! field layout passes through unchanged.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::Value;
use std::fmt;
use std::io::{self, BufRead, Write};

pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_COUNT: usize = 1000;

#[derive(Debug)]
pub enum DatasetError {
    Io(io::Error),
    Parse { line: usize, source: serde_json::Error },
}

impl fmt::Display for DatasetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "dataset i/o: {e}"),
            Self::Parse { line, source } => write!(f, "line {line}: {source}"),
        }
    }
}

impl std::error::Error for DatasetError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse { source, .. } => Some(source),
        }
    }
}

impl From<io::Error> for DatasetError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Parse one JSON value per non-blank line. Line numbers in errors are 1-based.
pub fn read_jsonl<R: BufRead>(reader: R) -> Result<Vec<Value>, DatasetError> {
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let value = serde_json::from_str(&line)
            .map_err(|source| DatasetError::Parse { line: i + 1, source })?;
        out.push(value);
    }
    Ok(out)
}

pub fn write_jsonl<W: Write>(mut writer: W, records: &[Value]) -> Result<(), DatasetError> {
    for r in records {
        serde_json::to_writer(&mut writer, r).map_err(io::Error::from)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

/// Shuffle with a seeded RNG and keep the first `count` records.
pub fn sample(mut records: Vec<Value>, count: usize, seed: u64) -> Vec<Value> {
    let mut rng = StdRng::seed_from_u64(seed);
    records.shuffle(&mut rng);
    records.truncate(count);
    records
}
