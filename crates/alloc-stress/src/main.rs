//! Multi-threaded stress driver for the extent allocator.
//!
//! Installs the process-wide extent allocator as the global allocator and
//! runs randomized allocate/release workers against it, verifying alignment,
//! non-overlap and block contents along the way.

use std::process;

use argh::FromArgs;
use extent_alloc::global::ExtentGlobalAlloc;
use log::{LevelFilter, SetLoggerError, info};
use snafu::{ResultExt as _, Snafu, ensure};

use self::workload::{Config, WorkloadError};

mod logger;
mod workload;

#[global_allocator]
static ALLOCATOR: ExtentGlobalAlloc = ExtentGlobalAlloc;

/// Stress the extent allocator with concurrent random workloads.
#[derive(Debug, FromArgs)]
struct Args {
    /// number of worker threads
    #[argh(option, default = "4")]
    threads: usize,
    /// operations per worker
    #[argh(option, default = "10_000")]
    iterations: usize,
    /// largest request in bytes
    #[argh(option, default = "16 * 1024")]
    max_size: usize,
    /// seed for the workload, random when omitted
    #[argh(option)]
    seed: Option<u64>,
    /// log every operation
    #[argh(switch, short = 'v')]
    verbose: bool,
    /// log errors only
    #[argh(switch, short = 'q')]
    quiet: bool,
}

impl Args {
    fn level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Trace
        } else if self.quiet {
            LevelFilter::Error
        } else {
            LevelFilter::Info
        }
    }
}

#[derive(Debug, Snafu)]
enum StressError {
    #[snafu(display("--{name} must be positive"))]
    InvalidOption { name: &'static str },
    #[snafu(display("failed to install logger"))]
    InitLogger { source: SetLoggerError },
    #[snafu(display("stress run failed"))]
    Workload { source: WorkloadError },
}

fn main() {
    let args: Args = argh::from_env();

    if let Err(err) = run(&args) {
        let report = snafu::Report::from_error(err);
        eprintln!("{report}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), StressError> {
    ensure!(args.threads > 0, InvalidOptionSnafu { name: "threads" });
    ensure!(args.max_size > 0, InvalidOptionSnafu { name: "max-size" });
    logger::init(args.level()).context(InitLoggerSnafu)?;

    let config = Config {
        threads: args.threads,
        iterations: args.iterations,
        max_size: args.max_size,
        seed: args.seed.unwrap_or_else(rand::random),
    };
    info!(
        "starting {} workers, {} operations each, sizes up to {} bytes, seed {}",
        config.threads, config.iterations, config.max_size, config.seed
    );

    let summary = workload::run(&config).context(WorkloadSnafu)?;
    info!(
        "{} workers finished in {:?}: {} allocations, {} releases, {} bytes, peak {} live blocks per worker",
        summary.threads,
        summary.elapsed,
        summary.allocations,
        summary.releases,
        summary.bytes,
        summary.peak_live
    );
    Ok(())
}
