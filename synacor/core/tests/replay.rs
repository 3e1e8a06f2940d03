use synacor_core::{
    BufferConsole, CoreError, ExecMode, InputRecorder, Machine, RunConfig, Session, StopReason,
    TraceEncoding, TraceWriter, REGISTER_BASE,
};
use tempfile::tempdir;

const R0: u16 = REGISTER_BASE;
const R1: u16 = REGISTER_BASE + 1;

/// Reads two bytes, echoes their sum-ish mix, reads a third and halts.
fn program() -> Vec<u16> {
    vec![
        20, R0, // in r0
        20, R1, // in r1
        9, R0, R0, R1, // add r0 r0 r1
        19, R0, // out r0
        20, R1, // in r1
        19, R1, // out r1
        0,
    ]
}

fn session(input: &str, config: RunConfig) -> Session<BufferConsole> {
    let mut machine = Machine::new(ExecMode::Execute);
    machine
        .state_mut()
        .load_words(0, &program())
        .expect("load program");
    Session::new(machine, BufferConsole::with_input(input), config)
}

#[test]
fn replayed_run_is_indistinguishable_from_the_recorded_one() {
    let dir = tempdir().expect("tempdir");
    let log_path = dir.path().join("input.json");

    let mut recorded = session("\u{1}\u{2}z", RunConfig::default());
    assert_eq!(recorded.run().expect("run"), StopReason::Halted);
    recorded.recorder().save(&log_path).expect("save log");

    let recorder = InputRecorder::load(&log_path).expect("load log");
    assert_eq!(recorder.len(), 3);
    let mut replayed = session("", RunConfig::default()).with_replay(recorder);
    assert_eq!(replayed.run().expect("run"), StopReason::Halted);

    assert_eq!(replayed.console().output(), recorded.console().output());
    assert_eq!(
        replayed.machine().state().regs,
        recorded.machine().state().regs
    );
    assert_eq!(
        replayed.machine().state().insns,
        recorded.machine().state().insns
    );
}

#[test]
fn missing_record_inside_the_replay_window_is_fatal() {
    let mut recorder = InputRecorder::new();
    let mut console = BufferConsole::with_input("a");
    recorder.read_byte(0, &mut console).expect("record");

    let config = RunConfig {
        replay_limit: Some(100),
        ..RunConfig::default()
    };
    let mut s = session("bc", config).with_replay(recorder);
    match s.run() {
        Err(CoreError::InputRecordMissing { insn }) => assert_eq!(insn, 1),
        other => panic!("expected missing record, got {other:?}"),
    }
    assert_eq!(s.console().pending_input(), 2, "live input untouched");
}

#[test]
fn replay_limit_hands_over_to_live_input() {
    let mut recorder = InputRecorder::new();
    let mut console = BufferConsole::with_input("\u{1}\u{2}");
    recorder.read_byte(0, &mut console).expect("record");
    recorder.read_byte(1, &mut console).expect("record");

    let mut s = session("!", RunConfig::default()).with_replay(recorder);
    assert_eq!(s.recorder().replay_limit(), 2);
    s.run().expect("run");
    assert_eq!(s.console().output(), &[3, b'!']);
    assert!(!s.recorder().replay_mode());
    // The live byte was recorded under its own instruction count.
    assert_eq!(s.recorder().get(4), Some(&b"!"[..]));
}

#[test]
fn trace_skips_replayed_instructions() {
    let dir = tempdir().expect("tempdir");
    let trace_path = dir.path().join("trace.txt");

    let mut recorder = InputRecorder::new();
    let mut console = BufferConsole::with_input("\u{1}\u{2}");
    recorder.read_byte(0, &mut console).expect("record");
    recorder.read_byte(1, &mut console).expect("record");

    let trace = TraceWriter::create(&trace_path, TraceEncoding::Disasm).expect("trace file");
    let mut s = session("!", RunConfig::default())
        .with_replay(recorder)
        .with_trace(trace);
    s.run().expect("run");

    let text = std::fs::read_to_string(&trace_path).expect("read trace");
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines,
        ["add r0, r0, r1", "out r0", "in r1", "out r1", "halt"]
    );
}
