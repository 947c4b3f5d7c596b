//! Structured event log.
//!
//! Every LLM call, SQL execution and communication/plan state transition is
//! one CSV row `(timestamp, instruction, query, response)`. The file is the
//! canonical audit trail; tests consume it to assert event ordering. Rows are
//! mirrored to `tracing` under the `confab::trace` target.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;

const HEADER: &str = "timestamp,instruction,query,response";

enum Sink {
    File(BufWriter<File>),
    Memory(Vec<String>),
}

struct Inner {
    sink: Sink,
}

/// Append-only event log, cheap to clone and share between the store,
/// backends and the communication.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<Inner>>,
    path: Option<PathBuf>,
}

impl EventLog {
    /// Open (or create) a CSV log file. The header is written once per file.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create log dir: {}", parent.display()))?;
            }
        }
        let fresh = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        if fresh {
            writeln!(writer, "{HEADER}")?;
            writer.flush()?;
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                sink: Sink::File(writer),
            })),
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory log for tests and throwaway sessions.
    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                sink: Sink::Memory(vec![HEADER.to_string()]),
            })),
            path: None,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record one event. Absent query/response fields are written as "None",
    /// matching the log consumers' expectations.
    pub fn log(&self, instruction: &str, query: Option<&str>, response: Option<&str>) {
        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let query = query.unwrap_or("None");
        let response = response.unwrap_or("None");
        let row = format!(
            "{},{},{},{}",
            escape_field(&timestamp),
            escape_field(instruction),
            escape_field(query),
            escape_field(response)
        );

        tracing::info!(
            target: "confab::trace",
            instruction = %instruction,
            "{instruction}\n>>>>>>>> Input >>>>>>>>:\n{query}\n<<<<<<<< Output <<<<<<<<:\n{response}"
        );

        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        match &mut inner.sink {
            Sink::File(writer) => {
                // Log failures must never take the communication down.
                let _ = writeln!(writer, "{row}");
                let _ = writer.flush();
            }
            Sink::Memory(rows) => rows.push(row),
        }
    }

    /// Shorthand for rows that carry only an instruction.
    pub fn note(&self, instruction: &str) {
        self.log(instruction, None, None);
    }

    /// Instruction column of every logged row, in order. Only available for
    /// in-memory logs; file logs are read back from disk by their consumers.
    pub fn instructions(&self) -> Result<Vec<String>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("event log poisoned"))?;
        match &inner.sink {
            Sink::Memory(rows) => Ok(rows
                .iter()
                .skip(1)
                .map(|row| parse_field(row, 1))
                .collect()),
            Sink::File(_) => Err(anyhow!("instructions() requires an in-memory log")),
        }
    }
}

/// RFC 4180 escaping: quote the field when it contains a comma, quote or
/// newline, doubling embedded quotes.
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Extract the n-th field of a CSV row written by `escape_field`.
fn parse_field(row: &str, index: usize) -> String {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = row.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    current.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields.into_iter().nth(index).unwrap_or_default()
}
