//! `/metrics` and `/healthz` endpoints

use anyhow::Result;
use fleet_core::Metrics;
use http_body_util::Full;
use hyper::{body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::rt::tokio::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const METRICS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

fn respond(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

pub fn handle(method: &Method, path: &str, metrics: &Metrics) -> Response<Full<Bytes>> {
    if method != Method::GET {
        return respond(StatusCode::METHOD_NOT_ALLOWED, "text/plain", "Method Not Allowed\n");
    }
    match path {
        "/healthz" => respond(StatusCode::OK, "text/plain", "OK\n"),
        "/metrics" => match metrics.gather() {
            Ok(body) => respond(StatusCode::OK, METRICS_CONTENT_TYPE, body),
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "metrics unavailable\n")
            }
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "Not Found\n"),
    }
}

/// Serve until `stop` fires
pub async fn serve(addr: SocketAddr, metrics: Metrics, stop: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Metrics server listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = stop.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        let io = TokioIo::new(stream);
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = handle(req.method(), req.uri().path(), &metrics);
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(peer = %peer, error = %e, "Error serving metrics connection");
            }
        });
    }
    debug!("Metrics server stopped");
    Ok(())
}
