use std::path::Path;
use std::time::Instant;

use clap::Parser;
use waggle_config::RootConfig;
use waggle_coordinator::CoordinatorError;
use waggle_index::{IndexError, IvfPqIndex};
use waggle_storage::read_vecs;

/// Builds the on-disk IVFPQ database: trains the codebooks on the base
/// vectors, populates the posting lists and segments, and persists both to
/// the configured index and database paths.
#[derive(Parser)]
#[command(name = "build-index")]
struct Args {
    /// Path to the YAML configuration.
    config: String,
    /// Raw base vectors (fvecs framing) to train on and populate from.
    base: String,
    /// Training sample count; 0 trains on the whole base set.
    #[arg(long, default_value_t = 0)]
    train_samples: usize,
    /// Training seed.
    #[arg(long, default_value_t = 123)]
    seed: u64,
}

fn main() {
    let args = Args::parse();
    waggle_tracing::init_stdout_tracing("build-index");
    waggle_tracing::init_panic_tracing_hook();

    let config = match RootConfig::load_from_path(&args.config) {
        Ok(config) => config,
        Err(err) => fatal(&err.to_string()),
    };
    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(config.task.num_threads)
        .build_global()
    {
        tracing::warn!("could not size the worker pool: {}", err);
    }
    for dir in [&config.data.index_path, &config.data.db_path] {
        if let Err(err) = std::fs::create_dir_all(dir) {
            fatal(&format!("cannot create {}: {}", dir, err));
        }
    }

    if let Err(err) = run(&config, &args) {
        fatal(&err.to_string());
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
    std::process::exit(1);
}

fn run(config: &RootConfig, args: &Args) -> Result<(), CoordinatorError> {
    let params = config.params();
    let base = read_vecs::<f32>(Path::new(&args.base))?;
    if base.records > 0 && base.dim != params.d {
        return Err(CoordinatorError::VectorFileDimension {
            expected: params.d,
            actual: base.dim,
        });
    }
    if base.records < params.n {
        return Err(CoordinatorError::Index(IndexError::DatabaseSize {
            n: params.n,
            actual: base.records,
        }));
    }

    let mut index = IvfPqIndex::new(params)?;

    let started = Instant::now();
    index.train(&base.data, args.seed, args.train_samples)?;
    tracing::info!("codebooks trained in {:?}", started.elapsed());

    let started = Instant::now();
    index.populate(&base.data[..params.n * params.d])?;
    tracing::info!("{} vectors populated in {:?}", params.n, started.elapsed());

    index.write_codebooks(Path::new(&config.data.index_path))?;
    index.write_database(Path::new(&config.data.db_path))?;
    tracing::info!(
        "index written to {} and {}",
        config.data.index_path,
        config.data.db_path
    );
    Ok(())
}
