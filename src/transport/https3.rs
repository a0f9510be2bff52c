// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! DNS over HTTPS over HTTP/3. Mirrors the plain
//! HTTPS handler's GET/POST semantics; only the transport (QUIC via `h3`
//! instead of TCP+TLS via `axum`) differs.

use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use h3::error::ErrorLevel;
use h3::server::RequestStream;
use http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use tracing::{debug, warn};

use crate::context::HttpRequestInfo;
use crate::dispatch::dispatch_with_http_info;
use crate::transport::ListenerHandle;
use crate::writer::https::HttpsWriter;

pub async fn serve_https3(endpoint: quinn::Endpoint, handle: ListenerHandle, max_streams: usize) {
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => break,
            incoming = endpoint.accept() => {
                let Some(incoming) = incoming else { break };
                let handle = handle.clone();
                handle.tracker.clone().spawn(async move {
                    match incoming.await {
                        Ok(conn) => serve_connection(conn, handle, max_streams).await,
                        Err(e) => debug!(error = %e, "https3 handshake failed"),
                    }
                });
            }
        }
    }
}

async fn serve_connection(conn: quinn::Connection, handle: ListenerHandle, max_streams: usize) {
    let remote = conn.remote_address();
    let mut h3_conn =
        match h3::server::Connection::new(h3_quinn::Connection::new(conn)).await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(%remote, error = %e, "h3 connection setup failed");
                return;
            }
        };
    let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(max_streams));

    loop {
        let permit = semaphore.clone().acquire_owned().await;
        match h3_conn.accept().await {
            Ok(Some((req, stream))) => {
                let handle = handle.clone();
                handle.tracker.clone().spawn(async move {
                    let _permit = permit;
                    serve_request(req, stream, remote, handle).await;
                });
            }
            Ok(None) => break,
            Err(e) => {
                if let ErrorLevel::ConnectionError = e.get_error_level() {
                    debug!(%remote, error = %e, "h3 connection error");
                }
                break;
            }
        }
    }
}

async fn serve_request(
    req: Request<()>,
    mut stream: RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    remote: SocketAddr,
    handle: ListenerHandle,
) {
    let payload = match req.method() {
        &Method::GET => {
            let Some(query) = req.uri().query() else {
                let _ = respond_error(&mut stream, StatusCode::BAD_REQUEST).await;
                return;
            };
            let Some(encoded) = query
                .split('&')
                .find_map(|kv| kv.strip_prefix("dns="))
            else {
                let _ = respond_error(&mut stream, StatusCode::BAD_REQUEST).await;
                return;
            };
            match base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, encoded) {
                Ok(bytes) => bytes,
                Err(_) => {
                    let _ = respond_error(&mut stream, StatusCode::BAD_REQUEST).await;
                    return;
                }
            }
        }
        &Method::POST => {
            let mut body = Vec::new();
            while let Ok(Some(mut chunk)) = stream.recv_data().await {
                body.extend_from_slice(chunk.copy_to_bytes(chunk.remaining()).as_ref());
            }
            body
        }
        _ => {
            let _ = respond_error(&mut stream, StatusCode::METHOD_NOT_ALLOWED).await;
            return;
        }
    };

    let local = "0.0.0.0:0".parse().unwrap();
    let (mut writer, rx) = HttpsWriter::new(local, remote);
    let info = HttpRequestInfo {
        method: req.method().clone(),
        uri: req.uri().clone(),
        headers: req.headers().clone(),
        remote_addr: remote,
    };

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

    let Ok(response) = rx.await else {
        let _ = respond_error(&mut stream, StatusCode::INTERNAL_SERVER_ERROR).await;
        return;
    };
    let body = response
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    if let Err(e) = stream
        .send_response(
            http::Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/dns-message")
                .body(())
                .unwrap(),
        )
        .await
    {
        warn!(error = %e, "failed to send https3 response headers");
        return;
    }
    if let Err(e) = stream.send_data(Bytes::from(body.to_vec())).await {
        warn!(error = %e, "failed to send https3 response body");
        return;
    }
    let _ = stream.finish().await;
}

async fn respond_error(
    stream: &mut RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    status: StatusCode,
) -> Result<(), h3::Error> {
    stream
        .send_response(http::Response::builder().status(status).body(()).unwrap())
        .await?;
    stream.finish().await
}
