use bytes::Bytes;
use http_body_util::Full;
use hyper::{body::Incoming, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use meshview_aggregator_api::{ProxyConfigRequest, ServiceMetricsRequest};
use meshview_aggregator_core::{DispatchError, RegistryError};
use meshview_aggregator_registry::{ConnectionRegistry, Correlators};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The query surface consumed by the frontend and CLI: aggregated state
/// reads plus the kind-specific on-demand fetches.
#[derive(Clone, Debug)]
pub struct Api {
    registry: Arc<ConnectionRegistry>,
    correlators: Arc<Correlators>,
    dispatch_timeout: Duration,
}

/// Serves the query API until shutdown.
pub async fn serve(addr: SocketAddr, api: Api, shutdown: drain::Watch) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%error, "failed to bind the query API");
            return;
        }
    };
    info!(%addr, "query API listening");

    let release = shutdown.clone().signaled();
    tokio::pin!(release);
    loop {
        let (io, _peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    warn!(%error, "failed to accept a query connection");
                    continue;
                }
            },
            _ = &mut release => return,
        };
        let api = api.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let api = api.clone();
                async move { Ok::<_, hyper::Error>(api.handle(req).await) }
            });
            if let Err(error) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(io), service)
                .await
            {
                debug!(%error, "query connection error");
            }
        });
    }
}

impl Api {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        correlators: Arc<Correlators>,
        dispatch_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            correlators,
            dispatch_timeout,
        }
    }

    async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        if req.method() != Method::GET {
            return error_response(StatusCode::METHOD_NOT_ALLOWED, "GET only");
        }
        let path = req.uri().path().to_string();
        let query = req.uri().query().map(str::to_string);
        let segments: Vec<&str> = path
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match segments.as_slice() {
            ["api", "clusters"] => self.clusters(),
            ["api", "state"] => self.all_states(),
            ["api", "clusters", cluster, "state"] => self.cluster_state(cluster),
            ["api", "clusters", cluster, "proxy-config"] => {
                self.proxy_config(cluster, query.as_deref()).await
            }
            ["api", "clusters", cluster, "service-metrics"] => {
                self.service_metrics(cluster, query.as_deref()).await
            }
            _ => error_response(StatusCode::NOT_FOUND, "unknown path"),
        }
    }

    fn clusters(&self) -> Response<Full<Bytes>> {
        json_response(StatusCode::OK, &json!({ "clusters": self.registry.summaries() }))
    }

    /// One point-in-time copy covering every synced cluster. Clusters whose
    /// snapshot fails to parse are reported in place rather than dropped.
    fn all_states(&self) -> Response<Full<Bytes>> {
        let mut clusters = serde_json::Map::new();
        for (cluster, state) in self.registry.all_states() {
            let resources: serde_json::Value = match serde_json::from_slice(&state.payload) {
                Ok(resources) => resources,
                Err(error) => {
                    warn!(%cluster, %error, "snapshot payload is not valid JSON");
                    json!({ "error": "invalid snapshot payload" })
                }
            };
            clusters.insert(
                cluster,
                json!({
                    "receivedAt": state.received_at,
                    "resourceCount": state.resource_count,
                    "resources": resources,
                }),
            );
        }
        json_response(StatusCode::OK, &json!({ "clusters": clusters }))
    }

    fn cluster_state(&self, cluster: &str) -> Response<Full<Bytes>> {
        let state = match self.registry.state(cluster) {
            Ok(state) => state,
            Err(error) => return registry_error_response(error),
        };
        let resources: serde_json::Value = match serde_json::from_slice(&state.payload) {
            Ok(resources) => resources,
            Err(error) => {
                warn!(%cluster, %error, "snapshot payload is not valid JSON");
                return error_response(StatusCode::BAD_GATEWAY, "invalid snapshot payload");
            }
        };
        json_response(
            StatusCode::OK,
            &json!({
                "clusterId": cluster,
                "receivedAt": state.received_at,
                "resourceCount": state.resource_count,
                "resources": resources,
            }),
        )
    }

    async fn proxy_config(&self, cluster: &str, query: Option<&str>) -> Response<Full<Bytes>> {
        let (namespace, pod) = match (
            query_param(query, "namespace"),
            query_param(query, "pod"),
        ) {
            (Some(namespace), Some(pod)) => (namespace, pod),
            _ => return error_response(StatusCode::BAD_REQUEST, "namespace and pod are required"),
        };
        let result = self
            .correlators
            .proxy_config
            .dispatch(
                cluster,
                ProxyConfigRequest { namespace, pod },
                self.dispatch_timeout,
                CancellationToken::new(),
            )
            .await;
        match result {
            Ok(response) => opaque_json_response(cluster, "proxyConfig", &response.config),
            Err(error) => dispatch_error_response(error),
        }
    }

    async fn service_metrics(&self, cluster: &str, query: Option<&str>) -> Response<Full<Bytes>> {
        let (service, namespace) = match (
            query_param(query, "service"),
            query_param(query, "namespace"),
        ) {
            (Some(service), Some(namespace)) => (service, namespace),
            _ => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    "service and namespace are required",
                )
            }
        };
        let since_ms = int_param(query, "since_ms");
        let until_ms = int_param(query, "until_ms");
        let result = self
            .correlators
            .service_metrics
            .dispatch(
                cluster,
                ServiceMetricsRequest {
                    service,
                    namespace,
                    since_ms,
                    until_ms,
                },
                self.dispatch_timeout,
                CancellationToken::new(),
            )
            .await;
        match result {
            Ok(response) => opaque_json_response(cluster, "metrics", &response.metrics),
            Err(error) => dispatch_error_response(error),
        }
    }
}

/// Extracts a form-decoded query value; empty values read as absent.
fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.into_owned())
}

fn int_param(query: Option<&str>, key: &str) -> i64 {
    query_param(query, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{int_param, query_param};

    #[test]
    fn query_params_are_form_decoded() {
        let query = Some("namespace=kube%2Dsystem&pod=web%20front-0&service=a+b%2Fc");
        assert_eq!(
            query_param(query, "namespace").as_deref(),
            Some("kube-system")
        );
        assert_eq!(query_param(query, "pod").as_deref(), Some("web front-0"));
        assert_eq!(query_param(query, "service").as_deref(), Some("a b/c"));
        assert_eq!(query_param(query, "absent"), None);
        assert_eq!(query_param(None, "namespace"), None);
    }

    #[test]
    fn empty_and_unparsable_params_fall_back() {
        let query = Some("namespace=&since_ms=1200&until_ms=soon");
        assert_eq!(query_param(query, "namespace"), None);
        assert_eq!(int_param(query, "since_ms"), 1200);
        assert_eq!(int_param(query, "until_ms"), 0);
        assert_eq!(int_param(None, "since_ms"), 0);
    }
}

fn json_response(status: StatusCode, body: &impl serde::Serialize) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::from(body))
        .expect("valid response")
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &json!({ "error": message }))
}

/// Embeds a collector-produced JSON blob without interpreting it.
fn opaque_json_response(cluster: &str, key: &str, payload: &[u8]) -> Response<Full<Bytes>> {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(error) => {
            warn!(%cluster, %error, "collector payload is not valid JSON");
            return error_response(StatusCode::BAD_GATEWAY, "invalid collector payload");
        }
    };
    json_response(StatusCode::OK, &json!({ "clusterId": cluster, key: value }))
}

/// A cluster that never synced reads differently from one that is absent.
fn registry_error_response(error: RegistryError) -> Response<Full<Bytes>> {
    let status = match &error {
        RegistryError::NotConnected(_) | RegistryError::NoState(_) => StatusCode::NOT_FOUND,
        RegistryError::AlreadyConnected(_) => StatusCode::CONFLICT,
    };
    json_response(status, &json!({ "error": error.to_string() }))
}

/// A timed-out query is distinguishable from a cluster that is not
/// connected at all.
fn dispatch_error_response(error: DispatchError) -> Response<Full<Bytes>> {
    let status = match &error {
        DispatchError::ClusterUnavailable(_) | DispatchError::Shutdown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        DispatchError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        DispatchError::Rejected(_) => StatusCode::BAD_GATEWAY,
        DispatchError::Canceled => StatusCode::SERVICE_UNAVAILABLE,
    };
    json_response(status, &json!({ "error": error.to_string() }))
}
