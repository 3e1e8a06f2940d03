use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// Byte-stream seam between the machine and the outside world.
pub trait Console {
    /// Next input byte, `None` at end of stream.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;
    /// Next input line including its terminator, `None` at end of stream.
    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;
    fn write_byte(&mut self, byte: u8) -> io::Result<()>;
    fn write_text(&mut self, text: &str) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Console over any buffered reader and writer (stdin/stdout in the CLI).
pub struct StreamConsole<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> StreamConsole<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn into_parts(self) -> (R, W) {
        (self.input, self.output)
    }
}

impl<R: BufRead, W: Write> Console for StreamConsole<R, W> {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        // Pending output (prompts) must be visible before blocking on input.
        self.output.flush()?;
        let byte = match self.input.fill_buf()? {
            [] => return Ok(None),
            buf => buf[0],
        };
        self.input.consume(1);
        Ok(Some(byte))
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        self.output.flush()?;
        let mut line = Vec::new();
        if self.input.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.output.write_all(&[byte])
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.output.write_all(text.as_bytes())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.output.flush()
    }
}

/// In-memory console: queued input, captured output.
#[derive(Debug, Default, Clone)]
pub struct BufferConsole {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl BufferConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(input: impl AsRef<[u8]>) -> Self {
        Self {
            input: input.as_ref().iter().copied().collect(),
            output: Vec::new(),
        }
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn pending_input(&self) -> usize {
        self.input.len()
    }
}

impl Console for BufferConsole {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        Ok(self.input.pop_front())
    }

    fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        if self.input.is_empty() {
            return Ok(None);
        }
        let end = self
            .input
            .iter()
            .position(|&byte| byte == b'\n')
            .map(|pos| pos + 1)
            .unwrap_or(self.input.len());
        Ok(Some(self.input.drain(..end).collect()))
    }

    fn write_byte(&mut self, byte: u8) -> io::Result<()> {
        self.output.push(byte);
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> io::Result<()> {
        self.output.extend_from_slice(text.as_bytes());
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
