mod engine;
mod intrinsics;
mod runner;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use clap::builder::FalseyValueParser;

use crate::engine::{HostContext, Interpreter, ScriptEngine};
use crate::intrinsics::FuzzOutput;
use crate::runner::channel::ReprlChannel;
use crate::runner::coverage;
use crate::runner::harness::{ReprlLoop, execute};

#[derive(Parser, Debug)]
#[command(name = "fuzzshell", about = "Script shell with a REPRL fuzzing harness")]
struct Cli {
    /// Serve the fuzzer over the REPRL descriptors instead of running files.
    /// `REPRL_MODE` accepts the usual truthy and falsey spellings.
    #[arg(long, env = "REPRL_MODE", value_parser = FalseyValueParser::new())]
    reprl: bool,

    /// Scripts to run when not in REPRL mode.
    files: Vec<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.reprl {
        // only returns on a fatal error
        if let Err(err) = serve_reprl() {
            eprintln!("[REPRL] {err:#}");
        }
        return ExitCode::FAILURE;
    }

    match run_files(&cli.files) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn serve_reprl() -> Result<()> {
    let mut channel = unsafe { ReprlChannel::from_fixed_descriptors() };
    let output = unsafe { FuzzOutput::reprl() };

    channel.handshake().context("REPRL handshake failed")?;
    match coverage::session().num_edges() {
        Some(edges) => eprintln!("[REPRL] serving with {edges} coverage edges"),
        None => eprintln!("[REPRL] serving without coverage instrumentation"),
    }

    let mut harness = ReprlLoop::new(channel, output, coverage::session());
    let err = harness.run::<Interpreter>();
    eprintln!("[REPRL] stopping after {} executions", harness.executions());
    Err(anyhow::Error::new(err).context("REPRL loop terminated"))
}

/// Run each file in its own engine. Returns whether all of them succeeded.
fn run_files(files: &[PathBuf]) -> Result<bool> {
    let mut all_ok = true;
    for path in files {
        let source = fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))?;
        let mut engine = Interpreter::init(HostContext {
            output: FuzzOutput::stdout(),
        });
        if let Err(err) = execute(&mut engine, &source) {
            eprintln!("{}: {err}", path.display());
            all_ok = false;
        }
    }
    Ok(all_ok)
}
