use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use keylock_gateway::{
    build_router, AppState, Args, HttpObjectStore, InMemoryObjectStore, ObjectStore,
    ServiceConfiguration, Upstream,
};
use keylock_raft::ClusterNode;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let service_config = ServiceConfiguration::load(Args::parse())?;
    if service_config.node.bootstrap {
        info!(seeds = ?service_config.node.seed_peers, "bootstrapping node with seeds");
    }

    let store: Arc<dyn ObjectStore> = match &service_config.upstream {
        Upstream::Memory => {
            warn!("using the in-memory object store, objects are lost on exit");
            Arc::new(InMemoryObjectStore::with_hash_header(&service_config.hash_header)?)
        }
        Upstream::Http(url) => Arc::new(HttpObjectStore::new(url, &service_config.hash_header)?),
    };

    let node = Arc::new(
        ClusterNode::start(service_config.node.clone())
            .await
            .context("failed to start cluster node")?,
    );

    let app_state = Arc::new(AppState {
        locks: node.clone(),
        store,
        forward_to_leader: service_config.node.forward_to_leader,
    });

    let listener = TcpListener::bind(service_config.http_addr)
        .await
        .with_context(|| format!("failed to bind gateway on {}", service_config.http_addr))?;
    info!(
        addr = %service_config.http_addr,
        upstream = ?service_config.upstream,
        "keylock gateway listening"
    );

    let served = axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    node.stop().await?;
    info!("exiting");
    served.context("gateway server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
