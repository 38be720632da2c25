use bytes::Bytes;
use http_body_util::Full;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Serves readiness and liveness probes.
#[instrument(skip(ready))]
pub async fn serve(addr: SocketAddr, ready: watch::Receiver<bool>) {
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(error) => {
            warn!(%error, "failed to bind the admin server");
            return;
        }
    };
    info!(%addr, "HTTP admin server listening");

    loop {
        let (io, _peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                warn!(%error, "failed to accept an admin connection");
                continue;
            }
        };
        let ready = ready.clone();
        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                let ready = ready.clone();
                async move { Ok::<_, hyper::Error>(handle(&ready, req)) }
            });
            if let Err(error) = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(io), service)
                .await
            {
                debug!(%error, "admin connection error");
            }
        });
    }
}

fn handle<B>(ready: &watch::Receiver<bool>, req: Request<B>) -> Response<Full<Bytes>> {
    match *req.method() {
        Method::GET | Method::HEAD => {}
        _ => {
            return Response::builder()
                .status(StatusCode::METHOD_NOT_ALLOWED)
                .body(Full::default())
                .expect("valid response")
        }
    }
    match req.uri().path() {
        "/live" => plain(StatusCode::OK, "live\n"),
        "/ready" => {
            if *ready.borrow() {
                plain(StatusCode::OK, "ready\n")
            } else {
                plain(StatusCode::INTERNAL_SERVER_ERROR, "not ready\n")
            }
        }
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::default())
            .expect("valid response"),
    }
}

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::from(body))
        .expect("valid response")
}
