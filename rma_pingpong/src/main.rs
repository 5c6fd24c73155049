use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rma_pingpong::config::{ITERATIONS, MAX_SIZE, MIN_SIZE, WARMUP};
use rma_pingpong::{Error, SweepConfig, comm_init, driver, parquet_out};

#[derive(Parser, Debug)]
#[command(name = "rma_pingpong")]
#[command(about = "UCX one-sided PUT ping-pong between two MPI ranks")]
#[command(
    long_about = "UCX one-sided PUT ping-pong between two MPI ranks.\n\n\
                  Run without arguments for the fixed sweep: 100 iterations and 10 warmup puts \
                  per size, 8 B to 8 MiB, over an 800 MiB registered region. The flags narrow \
                  the sweep; the region then shrinks to what the largest size needs."
)]
struct Cli {
    /// Measured iterations per payload size
    #[arg(long, default_value_t = ITERATIONS)]
    iters: usize,

    /// Warmup puts per payload size
    #[arg(long, default_value_t = WARMUP)]
    warmup: usize,

    /// Smallest payload in bytes (power of two)
    #[arg(long, default_value_t = MIN_SIZE)]
    min_size: usize,

    /// Largest payload in bytes
    #[arg(long, default_value_t = MAX_SIZE)]
    max_size: usize,

    /// Also write the results of rank 0 to this parquet file
    #[arg(short = 'o', long)]
    output: Option<String>,
}

impl Cli {
    fn sweep_config(&self) -> Result<SweepConfig, Error> {
        SweepConfig {
            iters: self.iters,
            warmup: self.warmup,
            min_size: self.min_size,
            max_size: self.max_size,
            ..SweepConfig::default()
        }
        .sized_to_fit()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    let config = match cli.sweep_config().and_then(|c| c.validate().map(|()| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "refusing to start");
            return ExitCode::FAILURE;
        }
    };

    let mut comm = match comm_init() {
        Ok(comm) => comm,
        Err(e) => {
            error!(error = %e, "communication bring-up failed");
            return ExitCode::FAILURE;
        }
    };
    let rank = comm.rank();
    info!(rank, size = comm.size(), "communication initialized");

    let stdout = io::stdout();
    let measurements = match driver::run(&mut comm, &config, &mut stdout.lock()) {
        Ok(measurements) => measurements,
        Err(Error::PeerCount(n)) => {
            if rank == 0 {
                error!(peers = n, "the benchmark needs exactly 2 ranks");
            }
            comm.finalize();
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(rank, error = %e, "benchmark failed");
            std::process::abort();
        }
    };

    comm.finalize();

    if rank == 0
        && let Some(path) = &cli.output
    {
        match parquet_out::write_parquet(path, &measurements) {
            Ok(()) => info!(path, rows = measurements.len(), "results written"),
            Err(e) => error!(path, error = %e, "failed to write parquet"),
        }
    }

    ExitCode::SUCCESS
}
