use std::collections::HashSet;
use std::path::Path;
use std::time::Instant;

use clap::Parser;
use waggle_config::RootConfig;
use waggle_coordinator::{Coordinator, CoordinatorError};
use waggle_storage::{read_vecs, GROUND_TRUTH_FILE, QUERY_FILE};
use waggle_types::Neighbor;

/// Waggle coordinator: initializes the fleet, balances clusters, and runs
/// the configured query workload.
#[derive(Parser)]
#[command(name = "coordinator")]
struct Args {
    /// Path to the YAML configuration.
    config: String,
}

fn main() {
    let args = Args::parse();
    waggle_tracing::init_stdout_tracing("coordinator");
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

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Should be able to build the runtime")
        .block_on(run(config));
    if let Err(err) = result {
        fatal(&err.to_string());
    }
}

fn fatal(message: &str) -> ! {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
    std::process::exit(1);
}

async fn run(config: RootConfig) -> Result<(), CoordinatorError> {
    let mut coordinator = Coordinator::from_config(&config)?;
    coordinator.init().await?;
    coordinator.load_posting_list_sizes()?;

    let d = config.data.d;
    let query_path = Path::new(&config.data.query_path);
    let queries = read_vecs::<f32>(query_path.join(QUERY_FILE))?;
    if queries.records > 0 && queries.dim != d {
        return Err(CoordinatorError::VectorFileDimension {
            expected: d,
            actual: queries.dim,
        });
    }
    let ground_truth = read_vecs::<i32>(query_path.join(GROUND_TRUTH_FILE))?;

    coordinator.load_balance(config.task.balance_mode).await?;

    let nq = config.task.nq.min(queries.records);
    let (k, w) = (config.task.k, config.task.nprobe);
    let batch_size = config.task.batch_size.max(1);

    let mut results: Vec<Vec<Neighbor>> = Vec::with_capacity(nq);
    let started = Instant::now();
    for batch_start in (0..nq).step_by(batch_size) {
        let batch_end = (batch_start + batch_size).min(nq);
        let batch: Vec<Vec<f32>> = (batch_start..batch_end)
            .map(|i| queries.data[i * d..(i + 1) * d].to_vec())
            .collect();

        let batch_started = Instant::now();
        let batch_results = coordinator.run_queries(k, w, batch).await?;
        tracing::info!(
            "batch {}..{} answered in {:?}",
            batch_start,
            batch_end,
            batch_started.elapsed()
        );
        results.extend(batch_results);
    }
    tracing::info!(
        "{} queries answered in {:?} ({:?} balance mode)",
        nq,
        started.elapsed(),
        config.task.balance_mode
    );

    report_recall(&results, &ground_truth.data, ground_truth.dim, k);
    Ok(())
}

/// Recall@k against the ground-truth file: the fraction of true neighbors
/// recovered across all answered queries.
fn report_recall(results: &[Vec<Neighbor>], ground_truth: &[i32], gt_dim: usize, k: usize) {
    let nq = results.len();
    if nq == 0 || gt_dim < k || ground_truth.len() < nq * gt_dim {
        tracing::warn!("ground truth too small for recall@{}", k);
        return;
    }

    let mut hits = 0usize;
    for (q, neighbors) in results.iter().enumerate() {
        let truth: HashSet<u32> = ground_truth[q * gt_dim..q * gt_dim + k]
            .iter()
            .map(|&id| id as u32)
            .collect();
        hits += neighbors
            .iter()
            .take(k)
            .filter(|n| truth.contains(&n.id))
            .count();
    }
    tracing::info!("recall@{}: {:.4}", k, hits as f64 / (nq * k) as f64);
}
