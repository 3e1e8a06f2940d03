use crate::snapshot::Snapshot;
use crate::stack::Stack;
use crate::{CoreError, Result, MEMORY_WORDS, NUM_REGS};
use std::fmt::Write as _;

/// Complete architectural state of one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineState {
    pub regs: [u16; NUM_REGS],
    memory: Vec<u16>,
    pub stack: Stack,
    pub pc: u32,
    pub halted: bool,
    /// Instructions dispatched since the last reset.
    pub insns: u64,
}

impl Default for MachineState {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineState {
    pub fn new() -> Self {
        Self {
            regs: [0; NUM_REGS],
            memory: vec![0; MEMORY_WORDS],
            stack: Stack::new(),
            pc: 0,
            halted: false,
            insns: 0,
        }
    }

    /// Back to power-on register/stack state. Memory is left alone.
    pub fn reset(&mut self) {
        self.regs = [0; NUM_REGS];
        self.stack.clear();
        self.pc = 0;
        self.halted = false;
        self.insns = 0;
    }

    /// Load a little-endian program image at address 0 and return its length in words.
    pub fn load_image(&mut self, blob: &[u8]) -> Result<usize> {
        if blob.len() % 2 != 0 {
            return Err(CoreError::OddImageLength(blob.len()));
        }
        let words = blob.len() / 2;
        if words > MEMORY_WORDS {
            return Err(CoreError::ImageTooLarge { words });
        }
        for (slot, chunk) in self.memory.iter_mut().zip(blob.chunks_exact(2)) {
            *slot = u16::from_le_bytes([chunk[0], chunk[1]]);
        }
        tracing::info!(words, "loaded program image");
        Ok(words)
    }

    /// Copy `words` into memory starting at `addr`.
    pub fn load_words(&mut self, addr: usize, words: &[u16]) -> Result<()> {
        let end = addr.saturating_add(words.len());
        if end > MEMORY_WORDS {
            return Err(CoreError::AddressRange {
                addr,
                len: words.len(),
            });
        }
        self.memory[addr..end].copy_from_slice(words);
        Ok(())
    }

    pub fn memory(&self) -> &[u16] {
        &self.memory
    }

    pub fn read_mem(&self, addr: usize) -> Option<u16> {
        self.memory.get(addr).copied()
    }

    pub fn write_mem(&mut self, addr: usize, value: u16) -> Option<()> {
        let slot = self.memory.get_mut(addr)?;
        *slot = value;
        Some(())
    }

    /// Replace registers, memory, stack and pc with a validated snapshot.
    pub fn restore(&mut self, snapshot: Snapshot) {
        self.memory = snapshot.memory;
        self.regs = snapshot.regs;
        self.stack = Stack::from_words(snapshot.stack);
        self.pc = snapshot.pc;
        self.halted = false;
        self.insns = 0;
    }

    /// One-line register dump used by the initial and final reports.
    pub fn register_summary(&self) -> String {
        let mut line = String::new();
        for (index, value) in self.regs.iter().enumerate() {
            let _ = write!(line, "r{index}={value:04x} ");
        }
        let _ = write!(
            line,
            "pc={:05} sp={} insns={}",
            self.pc,
            self.stack.depth(),
            self.insns
        );
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_image_is_little_endian() {
        let mut state = MachineState::new();
        let words = state.load_image(&[0x13, 0x00, 0x68, 0x00, 0x00, 0x80]).unwrap();
        assert_eq!(words, 3);
        assert_eq!(&state.memory()[..4], &[19, 104, 0x8000, 0]);
    }

    #[test]
    fn load_image_rejects_oversized_images() {
        let mut state = MachineState::new();
        let blob = vec![0u8; (MEMORY_WORDS + 1) * 2];
        assert!(matches!(
            state.load_image(&blob),
            Err(CoreError::ImageTooLarge { words }) if words == MEMORY_WORDS + 1
        ));
        let full = vec![0u8; MEMORY_WORDS * 2];
        assert_eq!(state.load_image(&full).unwrap(), MEMORY_WORDS);
    }

    #[test]
    fn load_image_rejects_odd_lengths() {
        let mut state = MachineState::new();
        assert!(matches!(
            state.load_image(&[1, 2, 3]),
            Err(CoreError::OddImageLength(3))
        ));
    }

    #[test]
    fn reset_keeps_memory() {
        let mut state = MachineState::new();
        state.load_words(0, &[21, 21, 0]).unwrap();
        state.regs[2] = 5;
        state.pc = 2;
        state.halted = true;
        state.insns = 9;
        state.stack.push(3).unwrap();
        state.reset();
        assert_eq!(state.regs, [0; NUM_REGS]);
        assert_eq!(state.pc, 0);
        assert!(!state.halted);
        assert_eq!(state.insns, 0);
        assert!(state.stack.is_empty());
        assert_eq!(&state.memory()[..3], &[21, 21, 0]);
    }

    #[test]
    fn load_words_past_the_end_is_a_range_error() {
        let mut state = MachineState::new();
        assert!(matches!(
            state.load_words(MEMORY_WORDS - 1, &[1, 2]),
            Err(CoreError::AddressRange { addr, len: 2 }) if addr == MEMORY_WORDS - 1
        ));
        assert_eq!(state.read_mem(MEMORY_WORDS - 1), Some(0), "nothing written");
        state.load_words(MEMORY_WORDS - 2, &[1, 2]).unwrap();
        assert_eq!(&state.memory()[MEMORY_WORDS - 2..], &[1, 2]);
    }

    #[test]
    fn memory_access_is_bounds_checked() {
        let mut state = MachineState::new();
        assert_eq!(state.write_mem(MEMORY_WORDS, 1), None);
        assert_eq!(state.read_mem(MEMORY_WORDS), None);
        state.write_mem(MEMORY_WORDS - 1, 77).unwrap();
        assert_eq!(state.read_mem(MEMORY_WORDS - 1), Some(77));
    }
}
