//! Append-only JSON-lines conversation log.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ConversationTurn, Role};
use crate::error::{ParleyError, Result};

/// One line of the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub turn_id: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&ConversationTurn> for LogRecord {
    fn from(turn: &ConversationTurn) -> Self {
        Self {
            turn_id: turn.id,
            role: turn.role,
            text: turn.text.clone(),
            timestamp: turn.timestamp,
        }
    }
}

pub struct ConversationLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl ConversationLog {
    /// Open (or create) the log for appending. Parent directories are
    /// created on demand.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one finalized turn and flush it to disk.
    pub fn append(&mut self, turn: &ConversationTurn) -> Result<()> {
        let mut line = serde_json::to_string(&LogRecord::from(turn))?;
        line.push('\n');
        let written = self
            .writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.flush());
        written.map_err(|e| ParleyError::Log(format!("{}: {e}", self.path.display())))
    }
}

/// Read every record from a log file, in write order.
pub fn read_log(path: &Path) -> Result<Vec<LogRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_record_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("conversation.jsonl");

        let mut log = ConversationLog::open(&path).unwrap();
        log.append(&ConversationTurn::new(1, Role::Human, "hello"))
            .unwrap();
        log.append(&ConversationTurn::new(2, Role::Agent, "hi there"))
            .unwrap();
        drop(log);

        // Reopening appends instead of truncating.
        let mut log = ConversationLog::open(&path).unwrap();
        log.append(&ConversationTurn::new(3, Role::Human, "bye"))
            .unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert!(raw.lines().next().unwrap().contains("\"turn_id\":1"));

        let records = read_log(&path).unwrap();
        let ids: Vec<u64> = records.iter().map(|r| r.turn_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(records[1].role, Role::Agent);
        assert_eq!(records[1].text, "hi there");
    }
}
