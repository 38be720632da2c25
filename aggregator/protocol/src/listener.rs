use crate::serve_connection;
use meshview_aggregator_registry::{ConnectionRegistry, Correlators};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, info_span, warn, Instrument};

/// Accepts collector streams until shutdown, one receive-loop task each.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    correlators: Arc<Correlators>,
    shutdown: drain::Watch,
) {
    let release = shutdown.clone().signaled();
    tokio::pin!(release);

    loop {
        let (io, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "failed to accept a collector connection");
                    continue;
                }
            },
            _ = &mut release => break,
        };
        info!(client.addr = %peer, "collector stream accepted");
        tokio::spawn(
            serve_connection(io, registry.clone(), correlators.clone(), shutdown.clone())
                .instrument(info_span!("collector", client.addr = %peer)),
        );
    }
}
