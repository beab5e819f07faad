use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod driver;
mod render;

use completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "updraft")]
#[command(about = "Resumable chunked self-update agent", long_about = None)]
struct Cli {
    /// Configuration file; `UPDRAFT_*` variables override its values.
    #[arg(long, global = true, default_value = "updraft.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask the license server whether a newer release exists.
    Check,
    /// Start a new update session for a release.
    Initiate {
        version: String,
        #[arg(long)]
        tenant: bool,
    },
    Status,
    ResumeInfo,
    /// Print the next operation the session needs.
    Next,
    Cancel,
    Chunks {
        #[command(subcommand)]
        command: ChunkCommands,
    },
    Extract {
        batch: u32,
    },
    ExtractProgress,
    Replace {
        batch: u32,
    },
    ReplaceProgress,
    /// Comma separated files to leave untouched during replacement.
    SkipFiles {
        list: String,
    },
    /// Comma separated directories to leave untouched during replacement.
    SkipDirs {
        list: String,
    },
    Maintenance {
        state: Toggle,
    },
    Pause {
        state: Toggle,
    },
    Migrate {
        /// Also migrate every tenant database.
        #[arg(long)]
        tenant: bool,
    },
    Complete,
    Finalize,
    /// Drive the update to completion, resuming any unfinished session.
    Run {
        /// Release to install; defaults to the latest available one.
        version: Option<String>,
        #[arg(long)]
        tenant: bool,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
}

#[derive(Subcommand, Debug)]
enum ChunkCommands {
    Missing,
    Download { index: u32 },
    Redownload { index: u32 },
    Progress,
    Merge,
    /// Re-hashes the merged archive against `--hash` or the declared hash.
    Verify {
        #[arg(long)]
        hash: Option<String>,
    },
}

#[derive(ValueEnum, Copy, Clone, Debug, Eq, PartialEq)]
enum Toggle {
    On,
    Off,
}

impl Toggle {
    fn enabled(self) -> bool {
        self == Self::On
    }
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();

    match dispatch::run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            render::print_error(&err);
            ExitCode::from(dispatch::exit_code_for(&err))
        }
    }
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("UPDRAFT_LOG")
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[cfg(test)]
mod tests;
