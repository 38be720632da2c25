use crate::{admin, api};
use anyhow::Result;
use clap::Parser;
use meshview_aggregator_registry::{ConnectionRegistry, Correlators};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "aggregator", about = "Multi-cluster mesh state aggregator")]
pub struct Args {
    #[clap(long, default_value = "meshview=info,warn", env = "MESHVIEW_LOG")]
    log_level: String,

    /// Address the collector stream listener binds to.
    #[clap(long, default_value = "0.0.0.0:9090")]
    collector_addr: SocketAddr,

    /// Address of the HTTP query API.
    #[clap(long, default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,

    /// Address of the readiness/liveness server.
    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    /// Deadline applied to on-demand inspection queries.
    #[clap(long, default_value = "5000")]
    dispatch_timeout_ms: u64,

    /// How long a disconnected cluster identity stays unregistrable, to
    /// absorb reconnect races. Disabled by default.
    #[clap(long, default_value = "0")]
    reconnect_grace_ms: u64,

    /// Cadence of the defensive stale-request sweep.
    #[clap(long, default_value = "10")]
    sweep_interval_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            collector_addr,
            api_addr,
            admin_addr,
            dispatch_timeout_ms,
            reconnect_grace_ms,
            sweep_interval_secs,
        } = self;

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .init();

        let registry = Arc::new(ConnectionRegistry::new(Duration::from_millis(
            reconnect_grace_ms,
        )));
        let correlators = Arc::new(Correlators::new(registry.clone()));

        let (signal, watch) = drain::channel();
        let (ready_tx, ready_rx) = watch::channel(false);

        let collectors = TcpListener::bind(collector_addr).await?;
        info!(addr = %collector_addr, "collector listener bound");
        tokio::spawn(
            meshview_aggregator_protocol::serve(
                collectors,
                registry.clone(),
                correlators.clone(),
                watch.clone(),
            )
            .instrument(info_span!("collectors")),
        );

        tokio::spawn(
            sweep(
                correlators.clone(),
                Duration::from_secs(sweep_interval_secs),
                watch.clone(),
            )
            .instrument(info_span!("sweep")),
        );

        let queries = api::Api::new(
            registry.clone(),
            correlators.clone(),
            Duration::from_millis(dispatch_timeout_ms),
        );
        tokio::spawn(api::serve(api_addr, queries, watch.clone()).instrument(info_span!("api")));
        tokio::spawn(admin::serve(admin_addr, ready_rx).instrument(info_span!("admin")));

        let _ = ready_tx.send(true);

        tokio::signal::ctrl_c().await?;
        info!("shutdown signal received");
        let _ = ready_tx.send(false);

        // Release every blocked caller before tearing the streams down.
        correlators.shutdown();
        registry.clear();
        drop(watch);
        signal.drain().await;
        Ok(())
    }
}

/// Guards against a dispatch timer and the pending map falling out of sync.
async fn sweep(correlators: Arc<Correlators>, interval: Duration, shutdown: drain::Watch) {
    let mut ticks = tokio::time::interval(interval);
    let release = shutdown.signaled();
    tokio::pin!(release);
    loop {
        tokio::select! {
            _ = ticks.tick() => correlators.expire_stale(),
            _ = &mut release => return,
        }
    }
}
