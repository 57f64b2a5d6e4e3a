//! Serve command — host a guest middleware in front of an echo handler.
//!
//! The echo handler reflects the request body and reports the method
//! and URI it observed, which makes guest rewrites visible with plain
//! `curl`.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use http::header::CONTENT_TYPE;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{info, warn};

use weft_host::{
    boxed, full, BoxError, HttpRequest, HttpResponse, MiddlewareConfig, Next, WasmMiddleware,
};

pub async fn run(guest: &str, host: &str, port: u16, config: Option<String>) -> Result<()> {
    let mut middleware_config =
        MiddlewareConfig::from_file(guest).context("failed to load guest")?;
    if let Some(config) = config {
        middleware_config = middleware_config.with_guest_config(config.into_bytes());
    }

    let middleware = Arc::new(
        WasmMiddleware::new(middleware_config)
            .await
            .context("failed to initialize middleware")?,
    );

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(
        guest = middleware.name(),
        features = %middleware.features(),
        %addr,
        "serving guest middleware"
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, remote_addr) = accepted.context("accept failed")?;
                let io = TokioIo::new(stream);
                let middleware = Arc::clone(&middleware);

                tokio::spawn(async move {
                    let service = service_fn(move |req: http::Request<Incoming>| {
                        let middleware = Arc::clone(&middleware);
                        async move {
                            let req = req.map(boxed);
                            let next: Next = Box::new(|req| Box::pin(echo(req)));
                            Ok::<_, Infallible>(middleware.serve(req, next).await)
                        }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        warn!(remote = %remote_addr, error = %e, "connection error");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// The built-in downstream handler: echoes the request body back.
async fn echo(req: HttpRequest) -> Result<HttpResponse, BoxError> {
    let (parts, body) = req.into_parts();
    let bytes = body.collect().await?.to_bytes();

    let mut builder = http::Response::builder()
        .status(http::StatusCode::OK)
        .header("x-echo-method", parts.method.as_str())
        .header("x-echo-uri", parts.uri.to_string());
    if let Some(content_type) = parts.headers.get(CONTENT_TYPE) {
        builder = builder.header(CONTENT_TYPE, content_type);
    }

    Ok(builder.body(full(bytes))?)
}
