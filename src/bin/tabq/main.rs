//! tabq command-line entry point.

use std::io::Write;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Streaming query engine over XML, JSON, log, and CSV/TSV inputs.
///
/// The query itself is the positional arguments: column expressions and
/// directives such as `in(file)`, `where[pred]`, `sort[key]`, `top[n]`.
#[derive(Debug, Parser)]
#[command(name = "tabq")]
#[command(version)]
#[command(disable_help_flag = true)]
struct Cli {
    /// Enable diagnostic logging to stderr.
    #[arg(long)]
    verbose: bool,

    /// Query tokens: column expressions and directives, in order.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    query: Vec<String>,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("tabq=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_usage() {
    println!("Example: cat file.json | tabq id sum[cost]");
    println!("Example: tabq --in=orders.csv \"Customer Name\" first[5]");
    println!("For complete documentation, open README.md.");
}

fn run(cli: Cli) -> Result<tabq::RunOutcome> {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        let _ = ctrlc::set_handler(move || {
            cancel.store(true, Ordering::Relaxed);
        });
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let outcome = tabq::run(&cli.query, &mut out, cancel)?;
    out.flush()?;
    Ok(outcome)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(tabq::RunOutcome::Usage) => {
            print_usage();
            ExitCode::SUCCESS
        }
        Ok(tabq::RunOutcome::Done) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{}", err);
            ExitCode::FAILURE
        }
    }
}
