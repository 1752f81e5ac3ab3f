use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use calc_orchestrator::mock::{generate_expression, render, MockConfig};
use calc_orchestrator::{build_router, MemoryStore, Orchestrator, OrchestratorConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Distributed arithmetic orchestrator: accepts expressions over HTTP and
/// hands their operations to polling workers.
#[derive(Parser, Debug)]
#[command(name = "calc-orchestrator", version, about)]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "CALC_HTTP_ADDR")]
    addr: Option<String>,

    /// In-process workers to start (0 = remote workers only).
    #[arg(long, env = "COMPUTING_POWER")]
    workers: Option<usize>,

    /// Submit this many random expressions at startup and log their results.
    #[arg(long, default_value_t = 0)]
    demo: usize,
}

async fn run_demo(orchestrator: &Orchestrator, count: usize) {
    let config = MockConfig::default();
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let text = render(&generate_expression(&config));
        match orchestrator.submit(&text).await {
            Ok(id) => ids.push((id, text)),
            Err(err) => {
                tracing::warn!(expression = %text, error = %err, "demo expression rejected")
            }
        }
    }

    for (id, text) in ids {
        let status = orchestrator.wait_for(id, Duration::from_secs(60)).await;
        let record = orchestrator.store().get(id).await;
        info!(
            expression = %text,
            status = ?status,
            result = ?record.and_then(|r| r.result),
            "demo result"
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    calc_orchestrator::config::load_dotenv();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let demo_count = cli.demo;
    let mut config = OrchestratorConfig::from_env();
    if let Some(addr) = cli.addr {
        config.http_addr = addr;
    }
    if let Some(workers) = cli.workers {
        config.computing_power = workers;
    }

    let orchestrator = Orchestrator::new(config, Arc::new(MemoryStore::new()));
    let workers = orchestrator.spawn_local_workers();
    info!(
        workers = workers.len(),
        max_concurrent = orchestrator.config().max_concurrent_evaluations,
        "orchestrator started"
    );

    if demo_count > 0 {
        let demo = orchestrator.clone();
        tokio::spawn(async move { run_demo(&demo, demo_count).await });
    }

    let addr = orchestrator.config().http_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!("listening on http://{}", addr);

    axum::serve(listener, build_router(orchestrator))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("received Ctrl+C, shutting down");
        })
        .await
        .context("server error")?;

    workers.shutdown();
    Ok(())
}
