use clap::Parser;

/// Waggle query node: serves index RPCs for the clusters it is assigned.
#[derive(Parser)]
#[command(name = "querynode")]
struct Args {
    /// Host or address to bind.
    host: String,
    /// Port to bind.
    port: u16,
    /// Worker threads for index scans.
    num_threads: usize,
}

fn main() {
    let args = Args::parse();
    waggle_tracing::init_stdout_tracing("querynode");
    waggle_tracing::init_panic_tracing_hook();

    if args.num_threads == 0 {
        eprintln!("\x1b[1;31merror:\x1b[0m num_threads must be at least 1");
        std::process::exit(1);
    }
    if let Err(err) = rayon::ThreadPoolBuilder::new()
        .num_threads(args.num_threads)
        .build_global()
    {
        tracing::warn!("could not size the worker pool: {}", err);
    }

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Should be able to build the runtime")
        .block_on(waggle_node::serve(&args.host, args.port));
    if let Err(err) = result {
        eprintln!("\x1b[1;31merror:\x1b[0m {}", err);
        std::process::exit(1);
    }
}
