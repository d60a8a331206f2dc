//! Append-only log of applied action envelopes, one JSON object per line.
//!
//! A journal taken from a session can be replayed into an empty store to
//! rebuild the same snapshot, since handlers are deterministic in the
//! envelope contents.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::core::actions::ActionEnvelope;
use crate::core::config::data::path_display;

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("journal at {} is not writable: {source}", path_display(.path))]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write journal: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

pub struct ActionJournal {
    path: PathBuf,
    writer: BufWriter<File>,
    is_active: bool,
    written: u64,
}

impl ActionJournal {
    /// Opens `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            is_active: true,
            written: 0,
        })
    }

    /// Appends one envelope. Does nothing while paused.
    pub fn record(&mut self, envelope: &ActionEnvelope) -> Result<(), JournalError> {
        if !self.is_active {
            return Ok(());
        }
        let line = serde_json::to_string(envelope).map_err(JournalError::Encode)?;
        writeln!(self.writer, "{line}")?;
        self.writer.flush()?;
        self.written += 1;
        Ok(())
    }

    pub fn pause(&mut self) {
        self.is_active = false;
    }

    pub fn resume(&mut self) {
        self.is_active = true;
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn status(&self) -> String {
        let name = self
            .path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy();
        if self.is_active {
            format!("active ({name})")
        } else {
            format!("paused ({name})")
        }
    }
}

/// Reads every envelope from a journal file. Blank lines are skipped.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<ActionEnvelope>, JournalError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| JournalError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    parse_lines(BufReader::new(file))
}

pub fn parse_lines(reader: impl BufRead) -> Result<Vec<ActionEnvelope>, JournalError> {
    let mut envelopes = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let envelope = serde_json::from_str(&line).map_err(|source| JournalError::Parse {
            line: index + 1,
            source,
        })?;
        envelopes.push(envelope);
    }
    Ok(envelopes)
}
