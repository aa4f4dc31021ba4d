use std::io::{self, Read, Write};

use thiserror::Error;

use crate::engine::{HostContext, ScriptEngine, ScriptError};
use crate::intrinsics::FuzzOutput;
use crate::runner::channel::{ProtocolError, ReprlChannel};
use crate::runner::coverage::CoverageSession;

/// Outcome of one iteration, as reported to the fuzzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Exception,
}

impl Verdict {
    fn code(self) -> u32 {
        match self {
            Verdict::Success => 0,
            Verdict::Exception => 1,
        }
    }

    /// The exit code sits in the second byte, like a `waitpid` status.
    pub fn status(self) -> u32 {
        (self.code() & 0xff) << 8
    }
}

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Script is not valid UTF-8")]
    InvalidEncoding(#[source] std::str::Utf8Error),
}

/// Runs one fresh engine per fuzzer request until the channel fails.
pub struct ReprlLoop<'c, R, W, D> {
    channel: ReprlChannel<R, W, D>,
    output: FuzzOutput,
    coverage: &'c CoverageSession,
    executions: u64,
}

impl<'c, R: Read, W: Write, D: Read> ReprlLoop<'c, R, W, D> {
    pub fn new(channel: ReprlChannel<R, W, D>, output: FuzzOutput, coverage: &'c CoverageSession) -> Self {
        Self {
            channel,
            output,
            coverage,
            executions: 0,
        }
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    /// Loop forever; only a fatal error gets us out.
    pub fn run<E: ScriptEngine>(&mut self) -> HarnessError {
        loop {
            if let Err(err) = self.run_iteration::<E>() {
                return err;
            }
        }
    }

    pub fn run_iteration<E: ScriptEngine>(&mut self) -> Result<Verdict, HarnessError> {
        let mut engine = E::init(HostContext {
            output: self.output.clone(),
        });

        self.channel.recv_action()?;
        let script = self.channel.recv_script()?;
        let source = match std::str::from_utf8(&script) {
            Ok(source) => source,
            Err(err) => {
                eprintln!("[REPRL] Script is not valid UTF-8");
                return Err(HarnessError::InvalidEncoding(err));
            }
        };

        let verdict = match execute(&mut engine, source) {
            Ok(()) => Verdict::Success,
            Err(err) => {
                eprintln!("{err}");
                Verdict::Exception
            }
        };

        drop(engine);
        drop(script);
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();

        self.channel.send_status(verdict.status())?;
        self.coverage.reset();
        self.executions += 1;
        Ok(verdict)
    }
}

/// Parse, run, then drain queued jobs; the first failure wins.
pub fn execute<E: ScriptEngine>(engine: &mut E, source: &str) -> Result<(), ScriptError> {
    let program = engine.parse(source)?;
    engine.run(program)?;
    engine.drain_jobs()
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::io::Write;

    use super::*;
    use crate::engine::Interpreter;
    use crate::intrinsics::tests::Captured;
    use crate::runner::channel::tests::channel_pair;
    use crate::runner::coverage::CoverageRegion;

    thread_local! {
        static LIVE_ENGINES: Cell<usize> = const { Cell::new(0) };
        static INITS: Cell<usize> = const { Cell::new(0) };
    }

    /// Treats the script as a command word.
    struct ScriptedEngine;

    impl ScriptEngine for ScriptedEngine {
        type Program = String;

        fn init(_: HostContext) -> Self {
            LIVE_ENGINES.with(|n| n.set(n.get() + 1));
            INITS.with(|n| n.set(n.get() + 1));
            ScriptedEngine
        }

        fn parse(&mut self, source: &str) -> Result<String, ScriptError> {
            match source {
                "syntax" => Err(ScriptError::Syntax("unexpected token".into())),
                other => Ok(other.to_string()),
            }
        }

        fn run(&mut self, program: String) -> Result<(), ScriptError> {
            assert_eq!(LIVE_ENGINES.with(Cell::get), 1, "previous engine survived");
            match program.as_str() {
                "throw" => Err(ScriptError::Uncaught("Error: thrown".into())),
                _ => Ok(()),
            }
        }

        fn drain_jobs(&mut self) -> Result<(), ScriptError> {
            Ok(())
        }
    }

    impl Drop for ScriptedEngine {
        fn drop(&mut self) {
            LIVE_ENGINES.with(|n| n.set(n.get() - 1));
        }
    }

    fn local_coverage(guards: &mut [u32]) -> CoverageSession {
        let session = CoverageSession::new();
        let range = guards.as_mut_ptr_range();
        let installed = unsafe { session.initialize_with(range.start, range.end, CoverageRegion::private) }.unwrap();
        assert!(installed);
        session
    }

    #[test]
    fn verdict_status_sits_in_second_byte() {
        assert_eq!(Verdict::Success.status(), 0);
        assert_eq!(Verdict::Exception.status(), 0x100);
    }

    #[test]
    fn verdicts_follow_script_outcome() {
        let (channel, mut fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(Captured::default()), &coverage);

        for (script, expected) in [
            ("ok", Verdict::Success),
            ("syntax", Verdict::Exception),
            ("throw", Verdict::Exception),
            ("ok", Verdict::Success),
        ] {
            fuzzer.send_exec(script.as_bytes());
            assert_eq!(harness.run_iteration::<ScriptedEngine>().unwrap(), expected);
            assert_eq!(fuzzer.read_status(), expected.status());
        }
        assert_eq!(harness.executions(), 4);
        assert_eq!(LIVE_ENGINES.with(Cell::get), 0);
    }

    #[test]
    fn interpreter_verdicts_and_output() {
        let (channel, mut fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let captured = Captured::default();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(captured.clone()), &coverage);

        fuzzer.send_exec(b"fuzzilli('FUZZILLI_PRINT', 'hello', 42);");
        assert_eq!(harness.run_iteration::<Interpreter>().unwrap(), Verdict::Success);
        assert_eq!(fuzzer.read_status(), 0);

        fuzzer.send_exec(b"throw new Error('x');");
        assert_eq!(harness.run_iteration::<Interpreter>().unwrap(), Verdict::Exception);
        assert_ne!(fuzzer.read_status(), 0);

        fuzzer.send_exec(b"let = ;");
        assert_eq!(harness.run_iteration::<Interpreter>().unwrap(), Verdict::Exception);
        assert_ne!(fuzzer.read_status(), 0);

        fuzzer.send_exec(b"queueMicrotask(() => { throw 1; });");
        assert_eq!(harness.run_iteration::<Interpreter>().unwrap(), Verdict::Exception);
        assert_ne!(fuzzer.read_status(), 0);

        // no state leaks from one iteration into the next
        fuzzer.send_exec(b"var x = 1;");
        harness.run_iteration::<Interpreter>().unwrap();
        fuzzer.read_status();
        fuzzer.send_exec(b"fuzzilli('FUZZILLI_PRINT', typeof x);");
        harness.run_iteration::<Interpreter>().unwrap();
        fuzzer.read_status();

        assert_eq!(captured.contents(), b"hello 42\nundefined\n");
    }

    #[test]
    fn hostile_scripts_end_as_exceptions_not_crashes() {
        let (channel, mut fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let captured = Captured::default();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(captured.clone()), &coverage);

        for script in ["!".repeat(50_000) + "1", "(".repeat(50_000)] {
            fuzzer.send_exec(script.as_bytes());
            assert_eq!(harness.run_iteration::<Interpreter>().unwrap(), Verdict::Exception);
            assert_eq!(fuzzer.read_status(), Verdict::Exception.status());
        }

        fuzzer.send_exec(b"let a = [1]; a[0] = a; a[1e18] = 2; fuzzilli('FUZZILLI_PRINT', a[0] === a, a[1e18]);");
        assert_eq!(harness.run_iteration::<Interpreter>().unwrap(), Verdict::Success);
        assert_eq!(fuzzer.read_status(), 0);
        assert_eq!(captured.contents(), b"true 2\n");
        assert_eq!(harness.executions(), 3);
    }

    #[test]
    fn invalid_utf8_is_fatal_and_sends_no_verdict() {
        let (channel, mut fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(Captured::default()), &coverage);

        fuzzer.send_exec(&[0x66, 0xff, 0xfe]);
        let err = harness.run_iteration::<ScriptedEngine>().unwrap_err();
        assert!(matches!(err, HarnessError::InvalidEncoding(_)));
        assert_eq!(err.to_string(), "Script is not valid UTF-8");
        assert_eq!(harness.executions(), 0);
    }

    #[test]
    fn unknown_command_stops_the_loop() {
        let (channel, mut fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(Captured::default()), &coverage);

        fuzzer.send_exec(b"ok");
        fuzzer.ctrl_tx.write_all(b"quit").unwrap();
        let err = harness.run::<ScriptedEngine>();
        assert!(matches!(err, HarnessError::Protocol(ProtocolError::UnknownAction(_))));
        assert_eq!(fuzzer.read_status(), 0);
        assert_eq!(harness.executions(), 1);
    }

    #[test]
    fn closed_control_pipe_is_fatal() {
        let (channel, fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(Captured::default()), &coverage);
        drop(fuzzer);

        let err = harness.run_iteration::<ScriptedEngine>().unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(ProtocolError::ActionRead(_))));
    }

    #[test]
    fn coverage_guards_are_rearmed_after_each_iteration() {
        let guards = Box::leak(vec![0u32; 8].into_boxed_slice());
        let coverage = local_coverage(guards);
        let (channel, mut fuzzer) = channel_pair();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(Captured::default()), &coverage);

        // edges hit by the previous iteration
        unsafe {
            coverage.record_edge(&mut guards[2]);
            coverage.record_edge(&mut guards[5]);
        }
        assert_eq!(guards[2], 0);

        fuzzer.send_exec(b"ok");
        harness.run_iteration::<ScriptedEngine>().unwrap();
        fuzzer.read_status();

        assert_eq!(&guards[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(coverage.edge_is_set(3));
        assert!(coverage.edge_is_set(6));
    }

    #[test]
    fn engine_is_created_before_command_arrives() {
        let (channel, fuzzer) = channel_pair();
        let coverage = CoverageSession::new();
        let mut harness = ReprlLoop::new(channel, FuzzOutput::new(Captured::default()), &coverage);
        drop(fuzzer);

        let before = INITS.with(Cell::get);
        assert!(harness.run_iteration::<ScriptedEngine>().is_err());
        assert_eq!(INITS.with(Cell::get), before + 1);
        assert_eq!(LIVE_ENGINES.with(Cell::get), 0);
    }
}
