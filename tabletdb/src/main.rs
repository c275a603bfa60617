//! Entrypoint of the tabletdb binary

use dotenvy::dotenv;
use tabletdb_clap_blocks::runtime::TokioRuntimeConfig;
use trogging::{
    TroggingGuard,
    cli::LoggingConfigBuilderExt,
    tracing_subscriber::{Registry, prelude::*},
};

mod commands {
    pub(crate) mod cluster;
    pub(crate) mod load;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "tabletdb",
    version = env!("CARGO_PKG_VERSION"),
    disable_help_flag = true,
    arg(
        clap::Arg::new("help")
            .short('h')
            .long("help")
            .help("Print help information")
            .action(clap::ArgAction::Help)
            .global(true)
    ),
    about = "TabletDB client batching tools",
    long_about = r#"TabletDB client batching tools

Examples:
    # Push 1000 batches through a simulated cluster of 8 tablets
    tabletdb load --batches 1000 --tablets 8

    # Same, with one request in a hundred failing
    tabletdb load --batches 1000 --request-failure-rate 0.01

    # Display all commands long form
    tabletdb --help

    # Run with full debug logging specified with LOG_FILTER
    LOG_FILTER=debug tabletdb load
"#
)]
struct Config {
    #[clap(flatten)]
    runtime_config: TokioRuntimeConfig,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
enum Command {
    /// Drive batchers against a simulated cluster and report the outcome
    Load(commands::load::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    let tokio_runtime = config.runtime_config.builder()?.build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<TroggingGuard, trogging::Error>) -> TroggingGuard {
            match r {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("Initializing logs failed: {e}");
                    std::process::exit(ReturnCode::Failure as _);
                }
            }
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Load(config)) => {
                let _tracing_guard =
                    handle_init_logs(init_logs_and_tracing(&config.logging_config));
                match commands::load::command(config).await {
                    Ok(report) => println!("{report}"),
                    Err(e) => {
                        eprintln!("Load command failed: {e}");
                        std::process::exit(ReturnCode::Failure as _)
                    }
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

fn init_logs_and_tracing(
    config: &trogging::cli::LoggingConfig,
) -> Result<TroggingGuard, trogging::Error> {
    let log_layer = trogging::Builder::new()
        .with_default_log_filter("info")
        .with_logging_config(config)
        .build()?;

    let subscriber = Registry::default().with(log_layer);
    trogging::install_global(subscriber)
}
