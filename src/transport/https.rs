// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over HTTPS, GET and POST, over HTTP/1.1 or h2.
//! `axum` owns the connection and request routing; this module is just the
//! handler that bridges one HTTP request into the dispatch path and awaits
//! the reply handed back over a oneshot channel.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::Engine;
use http_body_util::BodyExt;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tower_service::Service;
use tracing::{debug, warn};

use crate::context::HttpRequestInfo;
use crate::dispatch::dispatch_with_http_info;
use crate::transport::ListenerHandle;
use crate::writer::https::HttpsWriter;

#[derive(Clone)]
struct HttpState {
    handle: ListenerHandle,
}

pub fn router(handle: ListenerHandle, path: &str) -> Router {
    let state = HttpState { handle };
    Router::new()
        .route(path, get(handle_get).post(handle_post).fallback(wrong_method))
        .with_state(state)
}

/// Any method other than GET/POST on the DoH path is reported as not found,
/// not axum's default 405, to avoid confirming to a prober that the path
/// validates separately from the method.
async fn wrong_method() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[derive(Deserialize)]
struct DohQuery {
    dns: Option<String>,
}

async fn handle_get(
    State(state): State<HttpState>,
    Query(query): Query<DohQuery>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let Some(encoded) = query.dns else {
        return (StatusCode::BAD_REQUEST, "missing dns query parameter").into_response();
    };
    let payload = match base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(encoded) {
        Ok(bytes) => bytes,
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid base64url dns parameter").into_response(),
    };
    serve_payload(state, remote, payload, &req).await
}

async fn handle_post(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let (parts, body) = req.into_parts();
    let payload = match body.collect().await {
        Ok(collected) => collected.to_bytes().to_vec(),
        Err(e) => {
            warn!(error = %e, "failed to read doh request body");
            return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
        }
    };
    let req = Request::from_parts(parts, Body::empty());
    serve_payload(state, remote, payload, &req).await
}

async fn serve_payload(
    state: HttpState,
    remote: SocketAddr,
    payload: Vec<u8>,
    req: &Request<Body>,
) -> Response {
    let local = "0.0.0.0:0".parse().unwrap();
    let (mut writer, rx) = HttpsWriter::new(local, remote);
    let handle = state.handle;
    let info = HttpRequestInfo::from_request(req, remote);

    handle.tracker.clone().spawn(async move {
        dispatch_with_http_info(
            &handle.routes(),
            &handle.listener_key,
            handle.cancel.clone(),
            &payload,
            &mut writer,
            handle.stacktrace,
            Some(info),
        )
        .await;
    });

    match rx.await {
        Ok(response) => response,
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "no reply produced").into_response(),
    }
}

/// Accept TLS connections on `listener` and serve `router` over HTTP/1.1
/// or h2 (negotiated by ALPN) on each one. One task per connection, matching
/// the accept-loop shape of the other stream transports.
pub async fn serve_https(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    handle: ListenerHandle,
    path: String,
    max_connections: Option<usize>,
) {
    let make_service = router(handle.clone(), &path).into_make_service_with_connect_info::<SocketAddr>();
    let semaphore = max_connections.map(|n| Arc::new(tokio::sync::Semaphore::new(n)));

    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "https accept failed");
                        continue;
                    }
                };
                let permit = match &semaphore {
                    Some(sem) => match sem.clone().try_acquire_owned() {
                        Ok(permit) => Some(permit),
                        Err(_) => {
                            debug!(%remote, "https connection cap reached, rejecting");
                            continue;
                        }
                    },
                    None => None,
                };
                let acceptor = acceptor.clone();
                let mut make_service = make_service.clone();
                handle.tracker.clone().spawn(async move {
                    let _permit = permit;
                    let tls_stream = match acceptor.accept(stream).await {
                        Ok(stream) => stream,
                        Err(e) => {
                            debug!(%remote, error = %e, "https tls handshake failed");
                            return;
                        }
                    };
                    let io = TokioIo::new(tls_stream);
                    let tower_service = match make_service.call(remote).await {
                        Ok(service) => service,
                        Err(e) => match e {},
                    };
                    let hyper_service = hyper::service::service_fn(move |req: Request<hyper::body::Incoming>| {
                        tower_service.clone().call(req)
                    });
                    if let Err(e) = auto::Builder::new(TokioExecutor::new())
                        .serve_connection_with_upgrades(io, hyper_service)
                        .await
                    {
                        debug!(%remote, error = %e, "https connection error");
                    }
                });
            }
        }
    }
}
