//! Snapshot file codec.
//!
//! Layout (little-endian):
//! `stack_depth:u64 || pc:u32 || crc32:u32 || memory[32768]:u16 || regs[8]:u16 || stack[depth]:u16`
//!
//! The CRC-32 covers `stack_depth || pc || memory || regs || stack` in that order, which
//! is everything except the checksum field itself.

use crate::state::MachineState;
use crate::{MEMORY_WORDS, NUM_REGS};
use std::fs::{self, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Bytes before the memory image.
pub const HEADER_BYTES: usize = 16;
const FIXED_BODY_BYTES: usize = (MEMORY_WORDS + NUM_REGS) * 2;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("truncated snapshot: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Checksum { stored: u32, computed: u32 },
    #[error("{path:?}: file already exists; refusing to overwrite")]
    AlreadyExists { path: PathBuf },
    #[error("snapshot pc {0} is outside memory")]
    InvalidPc(u32),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Fully validated snapshot contents, ready for `MachineState::restore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub pc: u32,
    pub memory: Vec<u16>,
    pub regs: [u16; NUM_REGS],
    pub stack: Vec<u16>,
}

impl Snapshot {
    pub fn capture(state: &MachineState) -> Self {
        Self {
            pc: state.pc,
            memory: state.memory().to_vec(),
            regs: state.regs,
            stack: state.stack.as_slice().to_vec(),
        }
    }
}

fn push_words(out: &mut Vec<u8>, words: &[u16]) {
    for word in words {
        out.extend_from_slice(&word.to_le_bytes());
    }
}

fn read_words(bytes: &[u8]) -> impl Iterator<Item = u16> + '_ {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
}

/// Serialize the restorable parts of `state`.
pub fn encode(state: &MachineState) -> Vec<u8> {
    let stack = state.stack.as_slice();
    let mut out = Vec::with_capacity(HEADER_BYTES + FIXED_BODY_BYTES + stack.len() * 2);
    out.extend_from_slice(&(stack.len() as u64).to_le_bytes());
    out.extend_from_slice(&state.pc.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    push_words(&mut out, state.memory());
    push_words(&mut out, &state.regs);
    push_words(&mut out, stack);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&out[..12]);
    hasher.update(&out[HEADER_BYTES..]);
    out[12..16].copy_from_slice(&hasher.finalize().to_le_bytes());
    out
}

/// Parse and validate a snapshot. Bytes after the stack are ignored.
pub fn decode(bytes: &[u8]) -> Result<Snapshot, SnapshotError> {
    let truncated = |needed: usize| SnapshotError::Truncated {
        needed,
        available: bytes.len(),
    };
    if bytes.len() < HEADER_BYTES {
        return Err(truncated(HEADER_BYTES));
    }
    let mut u64_buf = [0u8; 8];
    u64_buf.copy_from_slice(&bytes[0..8]);
    let depth = u64::from_le_bytes(u64_buf);
    let pc = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
    let stored = u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);

    // Size the body from the header before allocating anything for the stack.
    let needed = usize::try_from(depth)
        .ok()
        .and_then(|depth| depth.checked_mul(2))
        .and_then(|stack_bytes| stack_bytes.checked_add(HEADER_BYTES + FIXED_BODY_BYTES))
        .ok_or_else(|| truncated(usize::MAX))?;
    if bytes.len() < needed {
        return Err(truncated(needed));
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..12]);
    hasher.update(&bytes[HEADER_BYTES..needed]);
    let computed = hasher.finalize();
    if computed != stored {
        return Err(SnapshotError::Checksum { stored, computed });
    }
    if pc as usize >= MEMORY_WORDS {
        return Err(SnapshotError::InvalidPc(pc));
    }

    let memory_end = HEADER_BYTES + MEMORY_WORDS * 2;
    let regs_end = memory_end + NUM_REGS * 2;
    let memory = read_words(&bytes[HEADER_BYTES..memory_end]).collect();
    let mut regs = [0u16; NUM_REGS];
    for (slot, word) in regs.iter_mut().zip(read_words(&bytes[memory_end..regs_end])) {
        *slot = word;
    }
    let stack = read_words(&bytes[regs_end..needed]).collect();
    Ok(Snapshot {
        pc,
        memory,
        regs,
        stack,
    })
}

/// Write a snapshot of `state` to a new file. An existing file is never overwritten.
pub fn save_snapshot(path: &Path, state: &MachineState) -> Result<(), SnapshotError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path).map_err(|err| match err.kind() {
        io::ErrorKind::AlreadyExists => SnapshotError::AlreadyExists {
            path: path.to_path_buf(),
        },
        _ => SnapshotError::Io(err),
    })?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&encode(state))?;
    writer.flush()?;
    tracing::info!(
        path = %path.display(),
        pc = state.pc,
        stack_depth = state.stack.depth(),
        "saved snapshot"
    );
    Ok(())
}

pub fn load_snapshot(path: &Path) -> Result<Snapshot, SnapshotError> {
    let bytes = fs::read(path)?;
    let snapshot = decode(&bytes)?;
    tracing::info!(path = %path.display(), pc = snapshot.pc, "loaded snapshot");
    Ok(snapshot)
}
