use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use mason_sched::ErrorAction;

fn default_builders() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnError {
    /// Keep scheduling the remaining elements and report failure at the end.
    Continue,
    /// Stop dispatching new work and drain in-flight jobs.
    Quit,
}

impl From<OnError> for ErrorAction {
    fn from(value: OnError) -> ErrorAction {
        match value {
            OnError::Continue => ErrorAction::Continue,
            OnError::Quit => ErrorAction::Quit,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "mason", version, about = "A parallel build pipeline orchestrator")]
pub struct Cli {
    /// Project directory (containing project.json).
    #[arg(long, env = "MASON_PROJECT", default_value = ".")]
    pub project: PathBuf,

    /// Number of parallel build jobs.
    #[arg(long, env = "MASON_BUILDERS", default_value_t = default_builders())]
    pub builders: usize,

    /// Number of parallel track/fetch/pull jobs.
    #[arg(long, env = "MASON_FETCHERS", default_value_t = 10)]
    pub fetchers: usize,

    /// Number of parallel push jobs.
    #[arg(long, env = "MASON_PUSHERS", default_value_t = 4)]
    pub pushers: usize,

    /// Automatic retries for failed fetch/pull/push jobs.
    #[arg(long, env = "MASON_MAX_RETRIES", default_value_t = 2)]
    pub max_retries: u32,

    /// What to do when an element fails.
    #[arg(long, value_enum, default_value_t = OnError::Quit)]
    pub on_error: OnError,

    /// Withhold status chatter; warnings and failures still print.
    #[arg(long, default_value_t = false)]
    pub silent: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Resolve source refs and rewrite the project file.
    Track {
        /// Elements to track (all when omitted).
        targets: Vec<String>,
    },
    /// Import sources into the local source cache.
    Fetch {
        targets: Vec<String>,
        /// Track before fetching.
        #[arg(long)]
        track: bool,
    },
    /// Build elements (pulling and pushing artifacts when a cache is configured).
    Build {
        targets: Vec<String>,
        /// Track before building.
        #[arg(long)]
        track: bool,
    },
    /// Pull artifacts from the remote cache.
    Pull { targets: Vec<String> },
    /// Push built artifacts to the remote cache.
    Push { targets: Vec<String> },
    /// Copy a built artifact into a directory.
    Checkout {
        target: String,
        directory: PathBuf,
        /// Overwrite files already present in the directory.
        #[arg(long)]
        force: bool,
    },
    /// Print element states.
    Show { targets: Vec<String> },
    /// Internal: run one action as an isolated worker process.
    #[command(hide = true)]
    Worker,
}
