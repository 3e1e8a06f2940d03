use crate::console::Console;
use crate::input::InputRecorder;
use crate::isa::{Opcode, MAX_INSTR_WORDS};
use crate::operand::{resolve, write_register, Operand};
use crate::snapshot::Snapshot;
use crate::state::MachineState;
use crate::trace::TraceWriter;
use crate::{CoreError, Result, MAX_LITERAL, MEMORY_WORDS};
use std::fmt;

/// How the dispatcher treats each fetched instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    #[default]
    Execute,
    /// Walk memory linearly, emitting trace lines without running anything.
    Disassemble,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    IllegalOpcode,
    IllegalOperand { word: u16 },
    StackUnderflow,
    DivideByZero,
    AddressOutOfRange { addr: u16 },
    /// Operand words would be fetched past the end of memory.
    TruncatedInstruction,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::IllegalOpcode => f.write_str("illegal opcode"),
            FaultKind::IllegalOperand { word } => write!(f, "illegal operand {word}"),
            FaultKind::StackUnderflow => f.write_str("pop from empty stack"),
            FaultKind::DivideByZero => f.write_str("mod by zero"),
            FaultKind::AddressOutOfRange { addr } => write!(f, "address {addr} out of range"),
            FaultKind::TruncatedInstruction => {
                f.write_str("instruction runs off the end of memory")
            }
        }
    }
}

/// A guest fault: the program did something the architecture forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub kind: FaultKind,
    pub opcode: u16,
    pub pc: u32,
    /// First three words at `pc`, zero past the end of memory.
    pub raw: [u16; 3],
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "ILLEGAL Instruction: {} @PC={} ({})",
            self.opcode, self.pc, self.kind
        )?;
        write!(
            f,
            "Raw at PC: {:04x}{:04x}{:04x}",
            self.raw[0], self.raw[1], self.raw[2]
        )
    }
}

impl std::error::Error for Fault {}

/// Machine state plus the dispatcher that mutates it.
#[derive(Debug, Clone, Default)]
pub struct Machine {
    state: MachineState,
    mode: ExecMode,
}

impl Machine {
    pub fn new(mode: ExecMode) -> Self {
        Self {
            state: MachineState::new(),
            mode,
        }
    }

    pub fn with_state(state: MachineState, mode: ExecMode) -> Self {
        Self { state, mode }
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn state(&self) -> &MachineState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut MachineState {
        &mut self.state
    }

    /// Clear registers, stack, pc and counters; memory survives.
    pub fn reset(&mut self) {
        self.state.reset();
        tracing::debug!("machine reset");
    }

    pub fn restore(&mut self, snapshot: Snapshot) {
        self.state.restore(snapshot);
        tracing::info!(
            pc = self.state.pc,
            stack_depth = self.state.stack.depth(),
            "restored machine state"
        );
    }

    /// Fetch, decode and dispatch exactly one instruction.
    pub fn step<C: Console>(
        &mut self,
        console: &mut C,
        recorder: &mut InputRecorder,
        trace: Option<&mut TraceWriter>,
    ) -> Result<()> {
        let pc = self.state.pc;
        if pc as usize >= MEMORY_WORDS {
            if self.mode == ExecMode::Disassemble {
                self.state.halted = true;
                return Ok(());
            }
            return Err(CoreError::PcOutOfBounds { pc });
        }

        let word = self.state.memory()[pc as usize];
        let Some(opcode) = Opcode::from_word(word) else {
            if self.mode == ExecMode::Execute {
                return Err(self.fault(FaultKind::IllegalOpcode));
            }
            if let Some(trace) = trace {
                trace.illegal(pc, word)?;
            }
            self.state.pc = pc + 1;
            return self.retire();
        };

        let len = opcode.encoded_len();
        let mut encoded = [0u16; MAX_INSTR_WORDS];
        match self.state.memory().get(pc as usize..pc as usize + len) {
            Some(words) => encoded[..len].copy_from_slice(words),
            None if self.mode == ExecMode::Disassemble => {
                self.state.halted = true;
                return self.retire();
            }
            None => return Err(self.fault(FaultKind::TruncatedInstruction)),
        }

        let next = pc + len as u32;
        let target = match self.mode {
            ExecMode::Execute => self.execute(opcode, &encoded[1..len], next, console, recorder)?,
            ExecMode::Disassemble => None,
        };
        self.state.pc = target.unwrap_or(next);

        if !recorder.replay_mode() {
            if let Some(trace) = trace {
                trace.record(pc, opcode, &encoded[..len])?;
            }
        }
        self.retire()
    }

    fn retire(&mut self) -> Result<()> {
        self.state.insns += 1;
        if self.state.pc as usize >= MEMORY_WORDS {
            match self.mode {
                ExecMode::Disassemble => self.state.halted = true,
                ExecMode::Execute if !self.state.halted => {
                    return Err(CoreError::PcOutOfBounds { pc: self.state.pc });
                }
                ExecMode::Execute => {}
            }
        }
        Ok(())
    }

    /// Run one decoded instruction. Returns the new pc when control was transferred.
    fn execute<C: Console>(
        &mut self,
        opcode: Opcode,
        args: &[u16],
        next: u32,
        console: &mut C,
        recorder: &mut InputRecorder,
    ) -> Result<Option<u32>> {
        match opcode {
            Opcode::Halt => self.state.halted = true,
            Opcode::Set => {
                let value = self.src(args[1])?;
                self.set(args[0], value)?;
            }
            Opcode::Push => {
                let value = self.src(args[0])?;
                self.state.stack.push(value)?;
            }
            Opcode::Pop => {
                let value = self
                    .state
                    .stack
                    .pop()
                    .ok_or_else(|| self.fault(FaultKind::StackUnderflow))?;
                self.set(args[0], value)?;
            }
            Opcode::Eq => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                self.set(args[0], u16::from(b == c))?;
            }
            Opcode::Gt => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                self.set(args[0], u16::from(b > c))?;
            }
            Opcode::Jmp => return Ok(Some(self.src(args[0])? as u32)),
            Opcode::Jt | Opcode::Jf => {
                let (cond, dest) = (self.src(args[0])?, self.src(args[1])?);
                if (cond != 0) == (opcode == Opcode::Jt) {
                    return Ok(Some(dest as u32));
                }
            }
            Opcode::Add => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                self.set(args[0], b.wrapping_add(c) & MAX_LITERAL)?;
            }
            Opcode::Mult => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                let product = (b as u32).wrapping_mul(c as u32) & MAX_LITERAL as u32;
                self.set(args[0], product as u16)?;
            }
            Opcode::Mod => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                if c == 0 {
                    return Err(self.fault(FaultKind::DivideByZero));
                }
                self.set(args[0], b % c)?;
            }
            Opcode::And => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                self.set(args[0], b & c)?;
            }
            Opcode::Or => {
                let (b, c) = (self.src(args[1])?, self.src(args[2])?);
                self.set(args[0], b | c)?;
            }
            Opcode::Not => {
                let value = self.src(args[1])?;
                self.set(args[0], !value & MAX_LITERAL)?;
            }
            Opcode::Rmem => {
                let addr = self.src(args[1])?;
                let value = self
                    .state
                    .read_mem(addr as usize)
                    .ok_or_else(|| self.fault(FaultKind::AddressOutOfRange { addr }))?;
                self.set(args[0], value)?;
            }
            Opcode::Wmem => {
                let (addr, value) = (self.src(args[0])?, self.src(args[1])?);
                if self.state.write_mem(addr as usize, value).is_none() {
                    return Err(self.fault(FaultKind::AddressOutOfRange { addr }));
                }
            }
            Opcode::Call => {
                let dest = self.src(args[0])?;
                self.state.stack.push(next as u16)?;
                return Ok(Some(dest as u32));
            }
            Opcode::Ret => match self.state.stack.pop() {
                Some(dest) => return Ok(Some(dest as u32)),
                None => {
                    tracing::debug!(pc = self.state.pc, "ret on empty stack");
                    self.state.halted = true;
                }
            },
            Opcode::Out => {
                let value = self.src(args[0])?;
                console.write_byte(value as u8)?;
            }
            Opcode::In => {
                if Operand::decode(args[0]).register().is_none() {
                    return Err(self.fault(FaultKind::IllegalOperand { word: args[0] }));
                }
                match recorder.read_byte(self.state.insns, console)? {
                    Some(byte) => self.set(args[0], byte as u16)?,
                    None => {
                        tracing::warn!("Cannot proceed without input.");
                        self.state.halted = true;
                    }
                }
            }
            Opcode::Nop => {}
        }
        Ok(None)
    }

    /// Bulk line read into guest memory: up to `bufsz - 1` bytes, one per word, then a
    /// zero terminator. End of input halts the machine.
    pub fn read_line<C: Console>(
        &mut self,
        addr: u16,
        bufsz: usize,
        console: &mut C,
        recorder: &mut InputRecorder,
    ) -> Result<()> {
        if bufsz <= 1 {
            return Ok(());
        }
        let start = addr as usize;
        if start + bufsz > MEMORY_WORDS {
            return Err(self.fault(FaultKind::AddressOutOfRange { addr }));
        }
        let Some(bytes) = recorder.read_line(self.state.insns, bufsz, console)? else {
            tracing::warn!("Cannot proceed without input.");
            self.state.halted = true;
            return Ok(());
        };
        let mut words: Vec<u16> = bytes.iter().take(bufsz - 1).map(|&b| b as u16).collect();
        words.push(0);
        self.state.load_words(start, &words)
    }

    fn src(&self, word: u16) -> Result<u16> {
        resolve(&self.state.regs, word)
            .ok_or_else(|| self.fault(FaultKind::IllegalOperand { word }))
    }

    fn set(&mut self, word: u16, value: u16) -> Result<()> {
        match write_register(&mut self.state.regs, word, value) {
            Some(()) => Ok(()),
            None => Err(self.fault(FaultKind::IllegalOperand { word })),
        }
    }

    fn fault(&self, kind: FaultKind) -> CoreError {
        let pc = self.state.pc;
        let mut raw = [0u16; 3];
        for (offset, slot) in raw.iter_mut().enumerate() {
            *slot = self.state.read_mem(pc as usize + offset).unwrap_or(0);
        }
        tracing::error!(pc, opcode = raw[0], %kind, "guest fault");
        CoreError::Fault(Fault {
            kind,
            opcode: raw[0],
            pc,
            raw,
        })
    }
}
