//! Input recording and deterministic replay.
//!
//! Every byte the guest consumes is filed under the instruction counter at which it was
//! requested. A later run that replays the table sees exactly the same bytes at exactly
//! the same instructions, without touching the live console.

use crate::console::Console;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

pub const INPUT_LOG_MAGIC: &str = "synacor.input-log";
pub const INPUT_LOG_VERSION: u32 = 1;
pub const LINE_PROMPT: &str = "Gets (':'-prefix for hex)> ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedInput {
    pub insn: u64,
    pub bytes: Vec<u8>,
}

/// On-disk form of the record table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputLog {
    pub magic: String,
    pub version: u32,
    #[serde(default)]
    pub records: Vec<LoggedInput>,
}

impl Default for InputLog {
    fn default() -> Self {
        Self {
            magic: INPUT_LOG_MAGIC.to_string(),
            version: INPUT_LOG_VERSION,
            records: Vec::new(),
        }
    }
}

/// Record table plus replay-mode bookkeeping. Owned by the session, so it survives
/// machine resets.
#[derive(Debug, Clone, Default)]
pub struct InputRecorder {
    records: BTreeMap<u64, Vec<u8>>,
    replay_mode: bool,
    replay_limit: u64,
}

impl InputRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_log(log: InputLog) -> Result<Self> {
        if log.magic != INPUT_LOG_MAGIC || log.version != INPUT_LOG_VERSION {
            return Err(CoreError::InputLog(
                "input log magic/version mismatch".to_string(),
            ));
        }
        let mut records = BTreeMap::new();
        for entry in log.records {
            if records.insert(entry.insn, entry.bytes).is_some() {
                return Err(CoreError::InputLog(format!(
                    "duplicate record for insn {}",
                    entry.insn
                )));
            }
        }
        Ok(Self {
            records,
            ..Self::default()
        })
    }

    pub fn to_log(&self) -> InputLog {
        InputLog {
            records: self
                .records
                .iter()
                .map(|(&insn, bytes)| LoggedInput {
                    insn,
                    bytes: bytes.clone(),
                })
                .collect(),
            ..InputLog::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read(path)?;
        let log: InputLog = serde_json::from_slice(&raw)?;
        let recorder = Self::from_log(log)?;
        tracing::info!(
            path = %path.display(),
            records = recorder.len(),
            "loaded input log"
        );
        Ok(recorder)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, &self.to_log())?;
        tracing::info!(path = %path.display(), records = self.len(), "wrote input log");
        Ok(())
    }

    /// Replay recorded input while the instruction counter is below `limit`.
    pub fn start_replay(&mut self, limit: u64) {
        self.replay_limit = limit;
        self.replay_mode = limit > 0;
    }

    pub fn replay_mode(&self) -> bool {
        self.replay_mode
    }

    pub fn replay_limit(&self) -> u64 {
        self.replay_limit
    }

    /// Loop-top transition. Returns true when replay mode just ended.
    pub fn update_mode(&mut self, insns: u64) -> bool {
        if self.replay_mode && insns >= self.replay_limit {
            self.replay_mode = false;
            self.replay_limit = 0;
            tracing::info!(insns, "replay limit reached, switching to live input");
            return true;
        }
        false
    }

    pub fn get(&self, insn: u64) -> Option<&[u8]> {
        self.records.get(&insn).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Highest instruction counter that has a record.
    pub fn last_insn(&self) -> Option<u64> {
        self.records.keys().next_back().copied()
    }

    fn insert(&mut self, insn: u64, bytes: Vec<u8>) {
        tracing::debug!(insn, len = bytes.len(), "recorded input");
        self.records.insert(insn, bytes);
    }

    fn lookup(&self, insn: u64) -> Result<Option<&[u8]>> {
        match self.get(insn) {
            None if self.replay_mode => Err(CoreError::InputRecordMissing { insn }),
            found => Ok(found),
        }
    }

    /// Single-byte read for the `in` instruction. `None` means end of stream.
    pub fn read_byte<C: Console>(&mut self, insn: u64, console: &mut C) -> Result<Option<u8>> {
        if let Some(bytes) = self.lookup(insn)? {
            return match bytes.first() {
                Some(&byte) => Ok(Some(byte)),
                None => Err(CoreError::InputLog(format!(
                    "record for insn {insn} is empty"
                ))),
            };
        }
        let Some(byte) = console.read_byte()? else {
            return Ok(None);
        };
        self.insert(insn, vec![byte]);
        Ok(Some(byte))
    }

    /// Line read of at most `bufsz - 1` bytes (the caller appends the terminator).
    /// `None` means end of stream.
    pub fn read_line<C: Console>(
        &mut self,
        insn: u64,
        bufsz: usize,
        console: &mut C,
    ) -> Result<Option<Vec<u8>>> {
        if let Some(bytes) = self.lookup(insn)? {
            return Ok(Some(bytes.to_vec()));
        }
        console.write_text(LINE_PROMPT)?;
        let Some(line) = console.read_line()? else {
            return Ok(None);
        };
        let bytes = decode_line(&line, bufsz.saturating_sub(1));
        self.insert(insn, bytes.clone());
        Ok(Some(bytes))
    }
}

/// Turn a raw console line into the bytes stored in guest memory.
///
/// A leading `:` switches to hex pairs; decoding stops at the first incomplete or
/// non-hex pair. Plain lines lose their trailing CR/LF.
pub fn decode_line(line: &[u8], max: usize) -> Vec<u8> {
    let mut text = line;
    while let [rest @ .., b'\n' | b'\r'] = text {
        text = rest;
    }
    match text.split_first() {
        Some((b':', hex)) => hex
            .chunks(2)
            .map_while(|pair| match pair {
                [hi, lo] => Some((hex_digit(*hi)? << 4) | hex_digit(*lo)?),
                _ => None,
            })
            .take(max)
            .collect(),
        _ => text.iter().copied().take(max).collect(),
    }
}

fn hex_digit(byte: u8) -> Option<u8> {
    (byte as char).to_digit(16).map(|digit| digit as u8)
}
