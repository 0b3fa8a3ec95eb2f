use std::{convert::Infallible, sync::Arc, time::Duration};

use http_body_util::Full;
use hyper::{
    body::{Bytes, Incoming},
    header::{HeaderValue, CONTENT_TYPE},
    server::conn::http1,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::{
    rt::{TokioIo, TokioTimer},
    server::graceful::GracefulShutdown,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::errors::ControllerError;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Meter provider whose metrics are collected into `registry`.
pub(crate) fn meter_provider(registry: &Registry) -> Result<SdkMeterProvider, ControllerError> {
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
        .map_err(|e| ControllerError::Metrics(e.to_string()))?;
    Ok(SdkMeterProvider::builder().with_reader(exporter).build())
}

fn respond(status: StatusCode, content_type: &'static str, body: Bytes) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn serve_metrics(registry: &Registry) -> Response<Full<Bytes>> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut result = Vec::new();
    match encoder.encode(&metric_families, &mut result) {
        Ok(_) => {
            let mut response = respond(StatusCode::OK, "text/plain", Bytes::from(result));
            if let Ok(format) = HeaderValue::from_str(encoder.format_type()) {
                response.headers_mut().insert(CONTENT_TYPE, format);
            }
            response
        }
        Err(e) => {
            error!("{}", e);
            respond(
                StatusCode::INTERNAL_SERVER_ERROR,
                "text/plain",
                Bytes::new(),
            )
        }
    }
}

fn serve_req<B>(req: &Request<B>, registry: &Registry) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/metrics" => serve_metrics(registry),
        "/healthz" => respond(StatusCode::OK, "text/plain", Bytes::from_static(b"OK")),
        _ => respond(
            StatusCode::NOT_FOUND,
            "text/plain",
            Bytes::from_static(b"Not Found"),
        ),
    }
}

/// Serve `/metrics` and `/healthz` until `shutdown` is cancelled, then give
/// open connections `grace_period` to finish.
pub(crate) async fn start_prometheus_metrics_server(
    listener: TcpListener,
    registry: Registry,
    shutdown: CancellationToken,
    grace_period: Duration,
) {
    if let Ok(addr) = listener.local_addr() {
        debug!("Listening on http://{}", addr);
    }
    let registry = Arc::new(registry);
    let graceful = GracefulShutdown::new();
    let mut http = http1::Builder::new();
    http.timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept metrics connection: {}", e);
                        continue;
                    }
                };
                let registry = registry.clone();
                let service = service_fn(move |req: Request<Incoming>| {
                    let registry = registry.clone();
                    async move { Ok::<_, Infallible>(serve_req(&req, &registry)) }
                });
                let connection = graceful.watch(http.serve_connection(TokioIo::new(stream), service));
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("metrics connection from {} failed: {}", peer, e);
                    }
                });
            }
        }
    }
    drop(listener);
    debug!("metrics server is shutting down");
    tokio::select! {
        _ = graceful.shutdown() => debug!("all metrics connections closed"),
        _ = tokio::time::sleep(grace_period) => {
            error!(
                "metrics server connections still open after {:?}, abandoning them",
                grace_period
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use opentelemetry::metrics::MeterProvider;

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    #[tokio::test]
    async fn healthz_says_ok() {
        let response = serve_req(&get("/healthz"), &Registry::new());
        assert_eq!(StatusCode::OK, response.status());
        assert_eq!("OK", body_text(response).await);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = serve_req(&get("/debug/pprof"), &Registry::new());
        assert_eq!(StatusCode::NOT_FOUND, response.status());
    }

    #[tokio::test]
    async fn metrics_are_exposed_in_text_format() {
        let registry = Registry::new();
        let provider = meter_provider(&registry).unwrap();
        let counter = provider
            .meter("test")
            .u64_counter("canary_controller_test_events")
            .build();
        counter.add(3, &[]);
        let response = serve_req(&get("/metrics"), &registry);
        assert_eq!(StatusCode::OK, response.status());
        assert!(
            response.headers()[CONTENT_TYPE]
                .to_str()
                .unwrap()
                .starts_with("text/plain")
        );
        let text = body_text(response).await;
        assert!(text.contains("canary_controller_test_events"), "{}", text);
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(start_prometheus_metrics_server(
            listener,
            Registry::new(),
            shutdown.clone(),
            Duration::from_secs(3),
        ));

        let body = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!("OK", body);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    }
}
