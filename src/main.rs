#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use clap::Parser;
use edge_gateway::server;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "edge-gateway", about = "Edge request pipeline for an API gateway")]
struct Cli {
    /// Path to gateway config file (.toml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Admin API listen address (health, metrics, dashboard reads)
    #[arg(long, default_value = "0.0.0.0:9091")]
    admin_listen: String,

    /// Runtime worker threads; 1 runs a single cooperative event loop.
    /// Defaults to the container CPU limit.
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let plan = server::runtime::plan_workers(cli.workers);
    // Tracing is not installed until inside the runtime.
    eprintln!(
        "[runtime] worker threads: {} (source: {:?})",
        plan.threads, plan.source
    );
    let rt = server::runtime::build(&plan)?;

    rt.block_on(server::bootstrap::run(server::bootstrap::BootstrapArgs {
        config_path: cli.config,
        listen: cli.listen,
        admin_listen: cli.admin_listen,
    }))
}
