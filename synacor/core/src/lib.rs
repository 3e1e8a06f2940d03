//! Execution core for the 16-bit word-addressed Synacor machine.
//!
//! The crate is split the same way the runtime is driven: `operand`, `stack` and `isa`
//! are the leaves, `state` + `exec` form the engine, `input` and `snapshot` hang off the
//! machine state, and `session` owns all of it and runs the instruction loop.

use thiserror::Error;

pub mod console;
pub mod exec;
pub mod input;
pub mod isa;
pub mod operand;
pub mod session;
pub mod signals;
pub mod snapshot;
pub mod stack;
pub mod state;
pub mod trace;

pub use console::{BufferConsole, Console, StreamConsole};
pub use exec::{ExecMode, Fault, FaultKind, Machine};
pub use input::{InputLog, InputRecorder, LoggedInput};
pub use isa::{Opcode, OpcodeInfo, OPCODES};
pub use operand::Operand;
pub use session::{RunConfig, Session, StopReason};
pub use signals::HostSignals;
pub use snapshot::{load_snapshot, save_snapshot, Snapshot, SnapshotError};
pub use stack::Stack;
pub use state::MachineState;
pub use trace::{TraceEncoding, TraceWriter};

/// Number of addressable 16-bit words.
pub const MEMORY_WORDS: usize = 32768;
/// Number of general purpose registers.
pub const NUM_REGS: usize = 8;
/// Largest literal operand; also the mask applied by mod-32768 arithmetic.
pub const MAX_LITERAL: u16 = 0x7FFF;
/// First code word that names a register (`r0`).
pub const REGISTER_BASE: u16 = 0x8000;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Fault(#[from] Fault),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("program image holds {words} words; memory has room for 32768")]
    ImageTooLarge { words: usize },
    #[error("write of {len} words at {addr} runs past the end of memory")]
    AddressRange { addr: usize, len: usize },
    #[error("program image has an odd byte count ({0})")]
    OddImageLength(usize),
    #[error("input at insn:{insn} not found in replay log")]
    InputRecordMissing { insn: u64 },
    #[error("input log error: {0}")]
    InputLog(String),
    #[error("stack allocation of {words} words failed")]
    Alloc { words: usize },
    #[error("overflow pc: {pc:#x} is outside memory")]
    PcOutOfBounds { pc: u32 },
}

impl CoreError {
    /// Guest faults are the machine's own doing; everything else comes from the host.
    pub fn is_guest_fault(&self) -> bool {
        matches!(self, CoreError::Fault(_))
    }

    pub fn is_internal(&self) -> bool {
        matches!(self, CoreError::PcOutOfBounds { .. })
    }
}
