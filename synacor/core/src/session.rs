use crate::console::Console;
use crate::exec::{ExecMode, Machine};
use crate::input::InputRecorder;
use crate::signals::HostSignals;
use crate::snapshot::{save_snapshot, SnapshotError};
use crate::trace::TraceWriter;
use crate::Result;
use std::path::PathBuf;
use std::time::Instant;

pub const DEFAULT_SNAPSHOT_PATH: &str = "synacor.save";

#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Initial r7, applied only when given.
    pub r7: Option<u16>,
    /// Stop once this many instructions have run. `None` or 0 means unlimited.
    pub insn_limit: Option<u64>,
    pub mode: ExecMode,
    /// Replay boundary; defaults to one past the last recorded instruction.
    pub replay_limit: Option<u64>,
    pub snapshot_path: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            r7: None,
            insn_limit: None,
            mode: ExecMode::default(),
            replay_limit: None,
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Halted,
    LimitReached,
    Cancelled,
}

/// Owns a machine and everything that feeds it, and drives the instruction loop.
pub struct Session<C: Console> {
    machine: Machine,
    recorder: InputRecorder,
    console: C,
    trace: Option<TraceWriter>,
    signals: HostSignals,
    config: RunConfig,
    started: Instant,
    /// Most recent requested save that could not be written.
    snapshot_failure: Option<SnapshotError>,
}

impl<C: Console> Session<C> {
    pub fn new(mut machine: Machine, console: C, config: RunConfig) -> Self {
        if config.mode == ExecMode::Execute {
            if let Some(r7) = config.r7 {
                machine.state_mut().regs[7] = r7;
            }
        }
        Self {
            machine,
            recorder: InputRecorder::new(),
            console,
            trace: None,
            signals: HostSignals::new(),
            config,
            started: Instant::now(),
            snapshot_failure: None,
        }
    }

    pub fn with_trace(mut self, trace: TraceWriter) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn with_signals(mut self, signals: HostSignals) -> Self {
        self.signals = signals;
        self
    }

    /// Replay `recorder`'s table before switching to live input.
    pub fn with_replay(mut self, mut recorder: InputRecorder) -> Self {
        let limit = self
            .config
            .replay_limit
            .or_else(|| recorder.last_insn().map(|insn| insn + 1))
            .unwrap_or(0);
        recorder.start_replay(limit);
        tracing::info!(limit, records = recorder.len(), "replaying recorded input");
        self.recorder = recorder;
        self
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn recorder(&self) -> &InputRecorder {
        &self.recorder
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn signals(&self) -> &HostSignals {
        &self.signals
    }

    /// Reset the machine for another run. The record table is kept.
    pub fn reset(&mut self) {
        self.machine.reset();
        self.started = Instant::now();
    }

    /// Run until the machine halts, the instruction limit is hit or a halt is requested.
    pub fn run(&mut self) -> Result<StopReason> {
        let outcome = self.run_loop();
        let flushed = self.flush_outputs();
        let reason = outcome?;
        flushed?;
        tracing::info!(?reason, insns = self.machine.state().insns, "run stopped");
        Ok(reason)
    }

    /// Flush both sinks even if the first one fails; the first error wins.
    fn flush_outputs(&mut self) -> Result<()> {
        let trace = match self.trace.as_mut() {
            Some(trace) => trace.flush(),
            None => Ok(()),
        };
        let console = self.console.flush();
        trace?;
        console?;
        Ok(())
    }

    fn run_loop(&mut self) -> Result<StopReason> {
        let limit = self.config.insn_limit.filter(|&limit| limit > 0);
        loop {
            if self.signals.halt_requested() {
                return Ok(StopReason::Cancelled);
            }
            self.recorder.update_mode(self.machine.state().insns);
            if self.signals.take_snapshot_request() {
                if let Err(err) = self.save_snapshot() {
                    tracing::error!(
                        path = %self.config.snapshot_path.display(),
                        %err,
                        "snapshot not written"
                    );
                    self.snapshot_failure = Some(err);
                }
            }
            if self.machine.state().halted {
                return Ok(StopReason::Halted);
            }

            self.machine
                .step(&mut self.console, &mut self.recorder, self.trace.as_mut())?;

            if self.machine.state().halted {
                return Ok(StopReason::Halted);
            }
            if limit.is_some_and(|limit| self.machine.state().insns >= limit) {
                return Ok(StopReason::LimitReached);
            }
        }
    }

    /// Save at the current instruction boundary.
    pub fn save_snapshot(&self) -> std::result::Result<(), SnapshotError> {
        save_snapshot(&self.config.snapshot_path, self.machine.state())
    }

    /// A requested save failed during `run`. The run itself kept going; the caller decides
    /// how to report it.
    pub fn take_snapshot_failure(&mut self) -> Option<SnapshotError> {
        self.snapshot_failure.take()
    }

    /// Host line read into guest memory at `addr`.
    pub fn read_line(&mut self, addr: u16, bufsz: usize) -> Result<()> {
        self.machine
            .read_line(addr, bufsz, &mut self.console, &mut self.recorder)
    }

    pub fn initial_report(&self) -> String {
        format!(
            "Initial register state:\n{}\n============================================\n",
            self.machine.state().register_summary()
        )
    }

    pub fn throughput_line(&self) -> String {
        let insns = self.machine.state().insns;
        let micros = self.started.elapsed().as_micros().max(1);
        let rate = u128::from(insns) * 1_000_000 / micros;
        format!("Approx. {rate} instructions per second (Total: {insns}).")
    }

    pub fn final_report(&self) -> String {
        format!(
            "{}\n{}",
            self.machine.state().register_summary(),
            self.throughput_line()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::BufferConsole;
    use crate::REGISTER_BASE;

    fn session(program: &[u16], input: &str, config: RunConfig) -> Session<BufferConsole> {
        let mut machine = Machine::new(config.mode);
        machine.state_mut().load_words(0, program).unwrap();
        Session::new(machine, BufferConsole::with_input(input), config)
    }

    #[test]
    fn runs_until_halt() {
        let mut s = session(&[19, 104, 19, 105, 19, 10, 0], "", RunConfig::default());
        assert_eq!(s.run().unwrap(), StopReason::Halted);
        assert_eq!(s.console().output(), b"hi\n");
        assert_eq!(s.machine().state().insns, 4);
    }

    #[test]
    fn insn_limit_stops_the_loop() {
        let config = RunConfig {
            insn_limit: Some(3),
            ..RunConfig::default()
        };
        // jmp 0 forever.
        let mut s = session(&[6, 0], "", config);
        assert_eq!(s.run().unwrap(), StopReason::LimitReached);
        assert_eq!(s.machine().state().insns, 3);
    }

    #[test]
    fn halt_request_cancels_before_dispatch() {
        let mut s = session(&[21, 0], "", RunConfig::default());
        s.signals().request_halt();
        assert_eq!(s.run().unwrap(), StopReason::Cancelled);
        assert_eq!(s.machine().state().insns, 0);
    }

    #[test]
    fn r7_is_applied_only_when_given() {
        let mut machine = Machine::new(ExecMode::Execute);
        machine.state_mut().regs[7] = 11;
        let kept = Session::new(machine.clone(), BufferConsole::new(), RunConfig::default());
        assert_eq!(kept.machine().state().regs[7], 11);

        let config = RunConfig {
            r7: Some(25734),
            ..RunConfig::default()
        };
        let set = Session::new(machine, BufferConsole::new(), config);
        assert_eq!(set.machine().state().regs[7], 25734);
    }

    #[test]
    fn replay_feeds_recorded_bytes_then_goes_live() {
        let r0 = REGISTER_BASE;
        let program = [20, r0, 19, r0, 20, r0, 19, r0, 0];
        let mut first = session(&program, "ab", RunConfig::default());
        first.run().unwrap();
        assert_eq!(first.console().output(), b"ab");

        // Keep only the first record; the second byte must come from the live console.
        let mut log = first.recorder().to_log();
        log.records.truncate(1);
        let recorder = InputRecorder::from_log(log).unwrap();
        let mut second = session(&program, "z", RunConfig::default()).with_replay(recorder);
        assert!(second.recorder().replay_mode());
        second.run().unwrap();
        assert_eq!(second.console().output(), b"az");
        assert!(!second.recorder().replay_mode());
    }

    #[test]
    fn reset_keeps_the_record_table() {
        let r0 = REGISTER_BASE;
        let mut s = session(&[20, r0, 0], "q", RunConfig::default());
        s.run().unwrap();
        s.reset();
        assert_eq!(s.machine().state().insns, 0);
        assert_eq!(s.recorder().get(0), Some(&b"q"[..]));
        // Second pass reuses the record; no live input is left.
        assert_eq!(s.run().unwrap(), StopReason::Halted);
        assert_eq!(s.machine().state().regs[0], b'q' as u16);
    }

    #[test]
    fn reports_use_the_classic_wording() {
        let mut s = session(&[0], "", RunConfig::default());
        s.run().unwrap();
        assert!(s.initial_report().starts_with("Initial register state:\n"));
        let line = s.throughput_line();
        assert!(line.starts_with("Approx. "));
        assert!(line.ends_with("instructions per second (Total: 1)."));
    }

    #[test]
    fn refused_snapshot_is_kept_for_the_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("taken.save");
        std::fs::write(&path, b"older save").unwrap();
        let config = RunConfig {
            snapshot_path: path.clone(),
            ..RunConfig::default()
        };
        let mut s = session(&[21, 0], "", config);
        s.signals().request_snapshot();
        assert_eq!(s.run().unwrap(), StopReason::Halted);
        assert!(matches!(
            s.take_snapshot_failure(),
            Some(SnapshotError::AlreadyExists { .. })
        ));
        assert!(s.take_snapshot_failure().is_none());
        assert_eq!(std::fs::read(&path).unwrap(), b"older save");
    }

    /// Console whose flush always fails.
    struct BrokenFlush(BufferConsole);

    impl Console for BrokenFlush {
        fn read_byte(&mut self) -> std::io::Result<Option<u8>> {
            self.0.read_byte()
        }

        fn read_line(&mut self) -> std::io::Result<Option<Vec<u8>>> {
            self.0.read_line()
        }

        fn write_byte(&mut self, byte: u8) -> std::io::Result<()> {
            self.0.write_byte(byte)
        }

        fn write_text(&mut self, text: &str) -> std::io::Result<()> {
            self.0.write_text(text)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }
    }

    fn broken_session(program: &[u16]) -> Session<BrokenFlush> {
        let mut machine = Machine::new(ExecMode::Execute);
        machine.state_mut().load_words(0, program).unwrap();
        Session::new(machine, BrokenFlush(BufferConsole::new()), RunConfig::default())
    }

    #[test]
    fn run_error_wins_over_flush_error() {
        let mut s = broken_session(&[11, REGISTER_BASE, 1, 0]);
        assert!(matches!(s.run(), Err(crate::CoreError::Fault(_))));
    }

    #[test]
    fn flush_error_surfaces_after_a_clean_stop() {
        let mut s = broken_session(&[0]);
        assert!(matches!(s.run(), Err(crate::CoreError::Io(_))));
    }
}
