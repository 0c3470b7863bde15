use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::{BufRead, Write},
    path::PathBuf,
    process::ExitCode,
};

use clap::{Parser, Subcommand};
use log::LevelFilter;

use blockgraph_api::primitives::secret::Secret;

use crate::{activation::ActivationCallbacks, BLOCKGRAPH_VERSION};

/// Exit codes of the `blockgraph` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockgraphExitCodes {
    Success = 0,

    /// Logging, tracing or configuration could not be set up.
    SetupFailed = 1,

    /// The command failed.
    Failed = 2,

    /// The probed graph violates structural rules.
    CheckFailed = 3,
}

impl From<BlockgraphExitCodes> for ExitCode {
    fn from(code: BlockgraphExitCodes) -> Self {
        Self::from(code as u8)
    }
}

#[derive(Parser, Debug)]
#[clap(version = BLOCKGRAPH_VERSION)]
pub struct Cli {
    /// Logging verbosity [OFF, ERROR, WARN, INFO, DEBUG, TRACE]
    #[arg(global = true, short, long, default_value_t = LevelFilter::Info)]
    pub verbosity: LevelFilter,

    /// Agent configuration file
    #[arg(global = true, short, long)]
    pub config: Option<PathBuf>,

    /// Emit tracing spans as JSON on stderr
    #[arg(global = true, long)]
    pub trace: bool,

    /// Also write every log record as JSON to this file
    #[arg(global = true, long)]
    pub log_file: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// Where the probed state comes from.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProbeArgs {
    /// Play back this inventory snapshot instead of querying the system
    #[arg(long)]
    pub inventory: Option<PathBuf>,

    /// Drop devices that cannot be probed instead of failing
    #[arg(long)]
    pub best_effort: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Probe the storage stack and print the device graph
    Probe {
        #[clap(flatten)]
        source: ProbeArgs,

        /// Write the graph as YAML to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Probe the storage stack and check it against the structural rules
    Check {
        #[clap(flatten)]
        source: ProbeArgs,
    },

    /// Assemble RAID arrays and open LUKS containers, reading passphrases
    /// from stdin
    Activate,

    /// Close LUKS containers and stop RAID arrays
    Deactivate,
}

impl Commands {
    pub fn name(&self) -> &'static str {
        match self {
            Commands::Probe { .. } => "probe",
            Commands::Check { .. } => "check",
            Commands::Activate => "activate",
            Commands::Deactivate => "deactivate",
        }
    }
}

impl Display for Commands {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.name())
    }
}

/// Reads passphrases line by line. An empty line or the end of input cancels
/// the prompt.
pub struct LinePrompt<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> LinePrompt<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }
}

impl<R: BufRead, W: Write> ActivationCallbacks for LinePrompt<R, W> {
    fn message(&mut self, message: &str) {
        let _ = writeln!(self.output, "{message}");
    }

    fn passphrase(&mut self, uuid: &str, attempt: u32) -> Option<Secret> {
        let _ = write!(self.output, "Passphrase for {uuid} (attempt {attempt}): ");
        let _ = self.output.flush();

        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => {
                let passphrase = line.trim_end_matches(['\r', '\n']);
                (!passphrase.is_empty()).then(|| Secret::new(passphrase))
            }
        }
    }
}
