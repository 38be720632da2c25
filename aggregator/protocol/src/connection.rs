use chrono::Utc;
use futures::{SinkExt, StreamExt};
use meshview_aggregator_api::{
    collector_message, AggregatorMessage, CollectorMessage, Hello, ServerCodec, StateSync,
};
use meshview_aggregator_core::ClusterState;
use meshview_aggregator_registry::{ConnectionHandle, ConnectionRegistry, Correlators};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Where a connection stands in the identification sequence.
#[derive(Debug)]
enum State {
    /// No identification received yet; nothing else is legal.
    Unidentified,
    /// Registered as the owner of a cluster identity, no snapshot yet.
    Identified(String),
    /// At least one state sync applied.
    Streaming(String),
    /// Identification lost the admission race; the stream is being closed.
    Rejected,
    /// Terminal; registry and correlators have been released.
    Closed,
}

/// Runs one collector stream to completion.
///
/// The receive loop never blocks on a dispatch: inbound replies are handed
/// to the correlators without suspending, and all writes go through an
/// unbounded queue drained by a separate writer task.
pub async fn serve_connection<I>(
    io: I,
    registry: Arc<ConnectionRegistry>,
    correlators: Arc<Correlators>,
    shutdown: drain::Watch,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, mut inbound) = Framed::new(io, ServerCodec::new()).split();
    let (tx, rx) = mpsc::unbounded_channel::<AggregatorMessage>();

    // Writer task: pumps queued outbound messages into the framed sink. It
    // ends once every sender (the registry's handle and this task's own
    // queue) is gone, which flushes a trailing rejection before close.
    let writer = tokio::spawn(async move {
        let mut outbound = UnboundedReceiverStream::new(rx);
        let mut sink = sink;
        while let Some(message) = outbound.next().await {
            if let Err(error) = sink.send(message).await {
                debug!(%error, "collector write failed");
                break;
            }
        }
    });

    let mut connection = Connection {
        registry,
        correlators,
        handle: ConnectionHandle::new(tx),
        state: State::Unidentified,
    };

    let release = shutdown.signaled();
    tokio::pin!(release);
    let mut released = None;

    loop {
        let message = tokio::select! {
            message = inbound.next() => message,
            token = &mut release => {
                debug!("shutting down");
                released = Some(token);
                break;
            }
        };
        match message {
            Some(Ok(message)) => {
                if !connection.on_message(message) {
                    break;
                }
            }
            Some(Err(error)) => {
                warn!(%error, "malformed frame");
                break;
            }
            None => {
                debug!("collector closed the stream");
                break;
            }
        }
    }

    connection.close();
    drop(connection);
    let _ = writer.await;
    drop(released);
}

struct Connection {
    registry: Arc<ConnectionRegistry>,
    correlators: Arc<Correlators>,
    handle: ConnectionHandle,
    state: State,
}

impl Connection {
    /// Applies one inbound message; returns false once the stream should
    /// close. Out-of-sequence messages are protocol violations: logged and
    /// ignored, never fatal.
    fn on_message(&mut self, message: CollectorMessage) -> bool {
        use collector_message::Kind;
        let kind = match message.kind {
            Some(kind) => kind,
            None => {
                warn!("frame without a message kind");
                return true;
            }
        };
        match (kind, &self.state) {
            (Kind::Hello(hello), State::Unidentified) => self.on_hello(hello),
            (Kind::Hello(hello), _) => {
                warn!(cluster = %hello.cluster_id, "unexpected identification on an established stream");
                true
            }
            (Kind::StateSync(sync), State::Identified(cluster) | State::Streaming(cluster)) => {
                let cluster = cluster.clone();
                self.on_state_sync(&cluster, sync);
                true
            }
            (Kind::StateSync(_), _) => {
                warn!("state sync before identification");
                true
            }
            (Kind::InspectReply(reply), State::Identified(_) | State::Streaming(_)) => {
                self.correlators.handle_response(reply);
                true
            }
            (Kind::InspectReply(_), _) => {
                warn!("inspect reply before identification");
                true
            }
        }
    }

    fn on_hello(&mut self, hello: Hello) -> bool {
        let Hello {
            cluster_id,
            collector_version,
        } = hello;
        match self.registry.register(&cluster_id, self.handle.clone()) {
            Ok(()) => {
                info!(cluster = %cluster_id, version = %collector_version, "collector identified");
                self.send(AggregatorMessage::hello_ack(true, ""));
                self.state = State::Identified(cluster_id);
                true
            }
            Err(error) => {
                // The established connection keeps its slot; this stream is
                // told why and closed from our side.
                warn!(cluster = %cluster_id, %error, "rejecting collector");
                self.send(AggregatorMessage::hello_ack(false, error.to_string()));
                self.state = State::Rejected;
                false
            }
        }
    }

    fn on_state_sync(&mut self, cluster: &str, sync: StateSync) {
        let resource_count = sync.resource_count;
        let state = ClusterState {
            payload: sync.payload,
            resource_count,
            received_at: Utc::now(),
        };
        match self.registry.update_state(cluster, state) {
            Ok(()) => {
                debug!(%cluster, resources = resource_count, "state replaced");
                self.state = State::Streaming(cluster.to_string());
            }
            Err(error) => warn!(%cluster, %error, "dropping state sync"),
        }
    }

    fn send(&self, message: AggregatorMessage) {
        if !self.handle.send(message) {
            debug!("outbound channel closed");
        }
    }

    /// Releases everything this stream owns: the registry slot (only if
    /// still ours, so a replacement that raced past us survives) and every
    /// pending request scoped to the cluster.
    fn close(&mut self) {
        let state = std::mem::replace(&mut self.state, State::Closed);
        let cluster = match state {
            State::Identified(cluster) | State::Streaming(cluster) => cluster,
            State::Unidentified | State::Rejected | State::Closed => return,
        };
        if self.registry.unregister_stream(&cluster, self.handle.token()) {
            self.correlators.fail_cluster(&cluster);
        }
    }
}
