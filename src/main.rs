//! qand - query analytics back-end.
//!
//! Boots the store, the query classification service, the agent directory
//! and its reaper, the deferred-purge worker, and the agent TCP listener.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use qan_runtime::agent::{AgentServer, Directory};
use qan_runtime::database::instances::InstanceRegistry;
use qan_runtime::database::{schema, ConnectionManager};
use qan_runtime::qan::MetricWriter;
use qan_runtime::tasker::Tasker;
use qan_runtime::Config;
use query_info::Mini;

#[derive(Parser)]
#[command(name = "qand", about = "Query analytics back-end", version)]
struct Args {
    /// Configuration file.
    #[arg(short, long, default_value = "qand.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    info!(hostname = %config.api.hostname, "starting qand");

    let manager = ConnectionManager::new(&config.db.url, config.db.max_connections)
        .await
        .context("cannot open store")?;
    schema::initialize_schema(manager.pool()).await?;
    let pool = manager.pool().clone();
    info!(url = %config.db.url, "store ready");

    let registry = InstanceRegistry::new(pool.clone());

    let mini = Arc::new(Mini::new(config.query.helper_path.clone()).context("query service")?);
    match &config.query.helper_path {
        Some(path) => info!(helper = %path.display(), "query classification service started"),
        None => warn!("no abstract helper configured; tables-only query classification"),
    }

    let writer = Arc::new(MetricWriter::new(pool.clone(), registry.clone(), mini));

    let directory = Arc::new(Directory::new());
    directory.clone().start_reaper(
        Duration::from_secs(config.agent.refresh_secs),
        Duration::from_secs(config.agent.max_idle_secs),
    );

    let _tasker = Tasker::start(registry.clone());

    let listener = TcpListener::bind(&config.agent.listen)
        .await
        .with_context(|| format!("cannot bind {}", config.agent.listen))?;
    info!(listen = %config.agent.listen, "agent listener ready");

    let server = Arc::new(AgentServer::new(
        registry,
        directory,
        writer,
        Duration::from_secs(config.agent.read_timeout_secs),
        Duration::from_secs(config.agent.send_timeout_secs),
    ));

    tokio::select! {
        result = server.run(listener) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received");
        }
    }

    manager.close().await;
    info!("qand shutdown complete");
    Ok(())
}
