use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use holdfast_utils::config::HoldfastConfig;
use holdfast_utils::{init_logging, init_logging_to_stderr, LoggingGuard};

mod demo;
mod dispatch;
mod serve;
mod target;

/// An in-process breakpoint, memory scan and value freeze agent.
#[derive(Parser, Debug)]
#[command(name = "holdfast")]
#[command(version)]
#[command(about = "An in-process breakpoint, memory scan and value freeze agent", long_about = None)]
struct Cli
{
    /// Configuration file (defaults to ./holdfast.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands
{
    /// Serve the JSON-lines control channel on stdin/stdout
    Serve,
    /// Run a scripted walkthrough against the built-in target layout
    Demo,
    /// Print the effective configuration as TOML
    Config,
}

fn main()
{
    let cli = Cli::parse();

    // stdout is the control channel in serve mode
    let logging = match cli.command {
        Commands::Serve => init_logging_to_stderr(),
        Commands::Demo | Commands::Config => init_logging(),
    };
    let _guard: LoggingGuard = match logging {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>>
{
    let config = HoldfastConfig::resolve(cli.config.as_deref())?;
    match cli.command {
        Commands::Serve => serve::serve(&config),
        Commands::Demo => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(demo::demo(&config))
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
