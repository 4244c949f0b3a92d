mod commands;
mod helpers;

use clap::Parser;
use msautotest_core::AutotestError;
use msautotest_core::comparator::ComparatorError;
use msautotest_core::runner::RunnerError;

pub fn run_from_env() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match run(args) {
        Ok(code) => code,
        Err(error) => {
            let autotest_error = error.as_autotest_error();
            eprintln!("{}", autotest_error.diagnostic_line());
            eprintln!("{}", autotest_error.fatal_exit_line());
            autotest_error.exit_code()
        }
    }
}

pub fn run<I, S>(args: I) -> Result<i32, CliError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let full_args = std::iter::once("msautotest".to_string())
        .chain(args.into_iter().map(Into::into))
        .collect::<Vec<_>>();
    parse_and_dispatch(full_args)
}

fn parse_and_dispatch(args: Vec<String>) -> Result<i32, CliError> {
    match Cli::try_parse_from(&args) {
        Ok(cli) => dispatch_parsed(cli),
        Err(err) => match err.kind() {
            clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
                print!("{}", err);
                Ok(0)
            }
            _ => Err(CliError::Usage(err.to_string())),
        },
    }
}

#[derive(Parser)]
#[command(
    name = "msautotest",
    version,
    about = "Regression harness for map renderer fixtures"
)]
struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(clap::Subcommand)]
enum CliCommand {
    /// Run fixtures and compare their results against expected baselines
    Run(commands::RunArgs),
    /// Print every test id with its expanded command without running anything
    List(commands::ListArgs),
}

fn dispatch_parsed(cli: Cli) -> Result<i32, CliError> {
    helpers::init_tracing(cli.verbose);
    match cli.command {
        CliCommand::Run(args) => commands::run_run_command(args),
        CliCommand::List(args) => commands::run_list_command(args),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("{0}")]
    Harness(AutotestError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl CliError {
    fn as_autotest_error(&self) -> AutotestError {
        match self {
            Self::Usage(message) => {
                AutotestError::input_validation("INPUT.CLI_USAGE", message.clone())
            }
            Self::Harness(error) => error.clone(),
            Self::Internal(error) => AutotestError::io_system("IO.CLI", format!("{error:#}")),
        }
    }
}

impl From<AutotestError> for CliError {
    fn from(error: AutotestError) -> Self {
        Self::Harness(error)
    }
}

impl From<RunnerError> for CliError {
    fn from(error: RunnerError) -> Self {
        Self::Harness(error.into())
    }
}

impl From<ComparatorError> for CliError {
    fn from(error: ComparatorError) -> Self {
        Self::Harness(error.into())
    }
}
