use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use meshview_aggregator_api::{
    aggregator_message, ClientCodec, CollectorMessage, HelloAck, InspectReply, InspectRequest,
    ProxyConfigRequest, ProxyConfigResponse,
};
use meshview_aggregator_core::{DispatchError, RequestKind};
use meshview_aggregator_protocol::serve_connection;
use meshview_aggregator_registry::{ConnectionRegistry, Correlators};
use prost::Message;
use std::{sync::Arc, time::Duration};
use tokio::io::DuplexStream;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

type Collector = Framed<DuplexStream, ClientCodec>;

struct Harness {
    registry: Arc<ConnectionRegistry>,
    correlators: Arc<Correlators>,
    _signal: drain::Signal,
    watch: drain::Watch,
}

impl Harness {
    fn new() -> Self {
        let registry = Arc::new(ConnectionRegistry::new(Duration::ZERO));
        let correlators = Arc::new(Correlators::new(registry.clone()));
        let (signal, watch) = drain::channel();
        Self {
            registry,
            correlators,
            _signal: signal,
            watch,
        }
    }

    /// Opens an in-process collector stream against a fresh connection task.
    fn connect(&self) -> Collector {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(
            server,
            self.registry.clone(),
            self.correlators.clone(),
            self.watch.clone(),
        ));
        Framed::new(client, ClientCodec::new())
    }

    /// Waits for an asynchronous effect of the receive loop to land.
    async fn eventually(&self, mut ok: impl FnMut(&Self) -> bool) {
        for _ in 0..200 {
            if ok(self) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }
}

async fn identify(collector: &mut Collector, cluster: &str) -> HelloAck {
    collector
        .send(CollectorMessage::hello(cluster, "test"))
        .await
        .expect("send hello");
    match collector.next().await.expect("an ack").expect("decode").kind {
        Some(aggregator_message::Kind::HelloAck(ack)) => ack,
        other => panic!("expected a hello ack, got {other:?}"),
    }
}

async fn next_inspect_request(collector: &mut Collector) -> InspectRequest {
    match collector
        .next()
        .await
        .expect("a request")
        .expect("decode")
        .kind
    {
        Some(aggregator_message::Kind::InspectRequest(request)) => request,
        other => panic!("expected an inspect request, got {other:?}"),
    }
}

#[tokio::test]
async fn identification_then_streaming_state() {
    let harness = Harness::new();
    let mut collector = harness.connect();

    let ack = identify(&mut collector, "east").await;
    assert!(ack.accepted, "rejected: {}", ack.reason);
    assert!(harness.registry.is_connected("east"));

    collector
        .send(CollectorMessage::state_sync(
            Bytes::from_static(b"{\"services\":[\"a\"]}"),
            1,
        ))
        .await
        .expect("send sync");
    harness
        .eventually(|h| h.registry.state("east").is_ok())
        .await;

    // A later sync replaces the snapshot wholesale.
    collector
        .send(CollectorMessage::state_sync(
            Bytes::from_static(b"{\"services\":[\"a\",\"b\"]}"),
            2,
        ))
        .await
        .expect("send sync");
    harness
        .eventually(|h| {
            h.registry
                .state("east")
                .map(|s| s.resource_count == 2)
                .unwrap_or(false)
        })
        .await;
}

#[tokio::test]
async fn second_stream_is_rejected_and_the_first_survives() {
    let harness = Harness::new();
    let mut first = harness.connect();
    let ack = identify(&mut first, "east").await;
    assert!(ack.accepted);

    let mut second = harness.connect();
    let ack = identify(&mut second, "east").await;
    assert!(!ack.accepted);
    assert!(ack.reason.contains("already connected"));

    // The rejected stream is closed from the aggregator side.
    assert!(second.next().await.is_none());
    assert!(harness.registry.is_connected("east"));

    // The survivor still works.
    first
        .send(CollectorMessage::state_sync(Bytes::from_static(b"{}"), 0))
        .await
        .expect("send sync");
    harness
        .eventually(|h| h.registry.state("east").is_ok())
        .await;
}

#[tokio::test]
async fn inspect_round_trip_over_the_stream() {
    let harness = Harness::new();
    let mut collector = harness.connect();
    assert!(identify(&mut collector, "east").await.accepted);

    let dispatch = {
        let correlators = harness.correlators.clone();
        tokio::spawn(async move {
            correlators
                .proxy_config
                .dispatch(
                    "east",
                    ProxyConfigRequest {
                        namespace: "prod".to_string(),
                        pod: "web-0".to_string(),
                    },
                    Duration::from_secs(5),
                    CancellationToken::new(),
                )
                .await
        })
    };

    let request = next_inspect_request(&mut collector).await;
    assert_eq!(request.kind, RequestKind::ProxyConfig as i32);
    collector
        .send(CollectorMessage::inspect_reply(InspectReply {
            correlation_id: request.correlation_id,
            kind: request.kind,
            ok: true,
            error: String::new(),
            payload: ProxyConfigResponse {
                config: Bytes::from_static(b"{\"clusters\":[]}"),
            }
            .encode_to_vec()
            .into(),
        }))
        .await
        .expect("send reply");

    let response = dispatch.await.expect("join").expect("dispatch");
    assert_eq!(&response.config[..], b"{\"clusters\":[]}");
    assert_eq!(harness.correlators.pending_len(), 0);
}

#[tokio::test]
async fn disconnect_fails_in_flight_requests_and_frees_the_slot() {
    let harness = Harness::new();
    let mut collector = harness.connect();
    assert!(identify(&mut collector, "east").await.accepted);

    let dispatch = {
        let correlators = harness.correlators.clone();
        tokio::spawn(async move {
            correlators
                .proxy_config
                .dispatch(
                    "east",
                    ProxyConfigRequest::default(),
                    Duration::from_secs(60),
                    CancellationToken::new(),
                )
                .await
        })
    };

    // Drop the stream once the request is on the wire; the pending request
    // must fail fast rather than wait for its deadline.
    let _ = next_inspect_request(&mut collector).await;
    drop(collector);

    let result = tokio::time::timeout(Duration::from_secs(5), dispatch)
        .await
        .expect("fail-fast, not deadline expiry")
        .expect("join");
    assert_eq!(
        result,
        Err(DispatchError::ClusterUnavailable("east".to_string()))
    );

    // The identity is registrable again.
    harness.eventually(|h| !h.registry.is_connected("east")).await;
    let mut replacement = harness.connect();
    assert!(identify(&mut replacement, "east").await.accepted);
}

#[tokio::test]
async fn out_of_sequence_messages_are_ignored_not_fatal() {
    let harness = Harness::new();
    let mut collector = harness.connect();

    // Syncing before identification is a protocol violation; the stream
    // stays open and a later identification still succeeds.
    collector
        .send(CollectorMessage::state_sync(Bytes::from_static(b"{}"), 0))
        .await
        .expect("send sync");
    collector
        .send(CollectorMessage::inspect_reply(InspectReply::default()))
        .await
        .expect("send reply");
    assert!(identify(&mut collector, "east").await.accepted);

    // A second identification on the same stream is ignored.
    collector
        .send(CollectorMessage::hello("other", "test"))
        .await
        .expect("send hello");
    collector
        .send(CollectorMessage::state_sync(Bytes::from_static(b"{}"), 0))
        .await
        .expect("send sync");
    harness
        .eventually(|h| h.registry.state("east").is_ok())
        .await;
    assert!(!harness.registry.is_connected("other"));
}

#[tokio::test]
async fn unknown_replies_do_not_disturb_other_requests() {
    let harness = Harness::new();
    let mut collector = harness.connect();
    assert!(identify(&mut collector, "east").await.accepted);

    let dispatch = {
        let correlators = harness.correlators.clone();
        tokio::spawn(async move {
            correlators
                .proxy_config
                .dispatch(
                    "east",
                    ProxyConfigRequest::default(),
                    Duration::from_secs(5),
                    CancellationToken::new(),
                )
                .await
        })
    };
    let request = next_inspect_request(&mut collector).await;

    // A reply naming an id that was never issued is absorbed.
    collector
        .send(CollectorMessage::inspect_reply(InspectReply {
            correlation_id: "00000000-0000-0000-0000-000000000000".to_string(),
            kind: RequestKind::ProxyConfig as i32,
            ok: true,
            error: String::new(),
            payload: ProxyConfigResponse::default().encode_to_vec().into(),
        }))
        .await
        .expect("send reply");

    // The real reply still lands.
    collector
        .send(CollectorMessage::inspect_reply(InspectReply {
            correlation_id: request.correlation_id,
            kind: request.kind,
            ok: true,
            error: String::new(),
            payload: ProxyConfigResponse {
                config: Bytes::from_static(b"{}"),
            }
            .encode_to_vec()
            .into(),
        }))
        .await
        .expect("send reply");

    let response = dispatch.await.expect("join").expect("dispatch");
    assert_eq!(&response.config[..], b"{}");
}
