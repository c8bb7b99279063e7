mod appconfig;
mod cli;
mod collect;
mod dump;
mod error;
mod ingest;
mod metrics;
mod parse;
mod upstream;

#[cfg(test)]
mod tests;

use crate::appconfig::AppConfig;
use crate::cli::{Cli, Command};
use crate::collect::Collector;
use crate::dump::DumpStore;
use crate::ingest::AppState;
use crate::metrics::AppMetrics;
use crate::upstream::{BatchSink, QuerySender, Sender, ServerPool};

use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if matches!(cli.command, Some(Command::Version)) {
        println!(
            "{} ver. {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        );
        return Ok(());
    }

    let cnf = appconfig::load(&cli.config)?;
    init_tracing(&cnf);

    // one process-wide TLS provider for both the ingress and reqwest
    let _ = rustls::crypto::ring::default_provider().install_default();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config,
        servers = ?cnf.clickhouse.servers,
        "chfunnel starting"
    );

    let metrics = Arc::new(AppMetrics::new(&cnf.metrics_prefix)?);
    let pool = Arc::new(ServerPool::new(&cnf.clickhouse)?);
    let dumper = Arc::new(DumpStore::new(&cnf.dump_dir, metrics.clone()));
    let sender = Sender::start(pool, dumper.clone(), metrics.clone());
    let collector = Collector::start(
        sender.clone() as Arc<dyn BatchSink>,
        cnf.flush_count,
        cnf.flush_interval_ms,
        cnf.clean_interval_ms,
        cnf.remove_query_id,
        metrics.clone(),
    );

    let shutdown = CancellationToken::new();
    dumper.listen(
        sender.clone() as Arc<dyn QuerySender>,
        cnf.dump_check_interval_s,
        shutdown.clone(),
    );

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });

    let state = AppState {
        collector: collector.clone(),
        sender: sender.clone(),
        metrics,
        debug: cnf.debug,
        log_queries: cnf.log_queries,
    };
    let served = ingest::run_server(&cnf, state, shutdown.clone()).await;

    // drain: flush every batcher, then wait for the send queue to empty
    shutdown.cancel();
    let flushed = collector.flush_all().await;
    info!(tables_flushed = flushed, "draining send queue");
    collector.wait_flush().await;
    if !collector.empty().await {
        tracing::warn!("tables still hold rows after drain");
    }

    if let Err(e) = served {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
    info!("shutdown complete");
    Ok(())
}

fn init_tracing(cnf: &AppConfig) {
    let default_filter = if cnf.debug { "chfunnel=debug,info" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
