//! Per-instruction trace stream.

use crate::isa::Opcode;
use crate::operand::Operand;
use crate::Result;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceEncoding {
    /// Raw little-endian instruction words.
    #[default]
    Binary,
    /// `%04x ` per word, one instruction per line.
    Hex,
    /// `mnemonic a, b` text.
    Disasm,
}

pub struct TraceWriter {
    out: Box<dyn Write>,
    encoding: TraceEncoding,
    with_address: bool,
}

impl TraceWriter {
    pub fn new(out: impl Write + 'static, encoding: TraceEncoding) -> Self {
        Self {
            out: Box::new(out),
            encoding,
            with_address: false,
        }
    }

    pub fn create(path: &Path, encoding: TraceEncoding) -> Result<Self> {
        let file = File::create(path)?;
        tracing::debug!(path = %path.display(), ?encoding, "opened trace file");
        Ok(Self::new(BufWriter::new(file), encoding))
    }

    /// Prefix text lines with the `%05u: ` instruction address.
    pub fn with_address(mut self, enabled: bool) -> Self {
        self.with_address = enabled;
        self
    }

    /// One executed (or disassembled) instruction; `words` includes the opcode word.
    pub fn record(&mut self, pc: u32, opcode: Opcode, words: &[u16]) -> io::Result<()> {
        match self.encoding {
            TraceEncoding::Binary => {
                for word in words {
                    self.out.write_all(&word.to_le_bytes())?;
                }
                Ok(())
            }
            TraceEncoding::Hex => {
                let mut line = self.prefix(pc);
                for word in words {
                    let _ = write!(line, "{word:04x} ");
                }
                writeln!(self.out, "{line}")
            }
            TraceEncoding::Disasm => {
                let line = self.prefix(pc) + &format_instruction(opcode, &words[1..]);
                writeln!(self.out, "{line}")
            }
        }
    }

    /// A word that is not an opcode, seen while disassembling.
    pub fn illegal(&mut self, pc: u32, word: u16) -> io::Result<()> {
        let mut line = format!("{pc:05}: illegal instruction {word}");
        if (32..128).contains(&word) {
            let _ = write!(line, " '{}'", word as u8 as char);
        }
        writeln!(self.out, "{line}")
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }

    fn prefix(&self, pc: u32) -> String {
        if self.with_address {
            format!("{pc:05}: ")
        } else {
            String::new()
        }
    }
}

impl std::fmt::Debug for TraceWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceWriter")
            .field("encoding", &self.encoding)
            .field("with_address", &self.with_address)
            .finish_non_exhaustive()
    }
}

/// Render an instruction as `mnemonic a, b, c`.
pub fn format_instruction(opcode: Opcode, args: &[u16]) -> String {
    let mut text = opcode.mnemonic().to_string();
    for (index, &word) in args.iter().enumerate() {
        let sep = if index == 0 { " " } else { ", " };
        let _ = write!(text, "{sep}{}", Operand::decode(word));
    }
    text
}

/// Cloneable in-memory sink so tests can read back what a boxed writer produced.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub(crate) fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub(crate) fn contents_string(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
