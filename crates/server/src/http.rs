//! Plain HTTP listener
//!
//! Answers ACME HTTP-01 challenges and redirects everything else to HTTPS.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONTENT_TYPE, HOST, LOCATION};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::acme::ChallengeManager;

/// Maximum number of concurrent connections
const MAX_CONCURRENT_CONNECTIONS: usize = 256;

/// Timeout for serving a single connection
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Accept HTTP connections until `shutdown` flips to true
pub async fn serve_http(
    listener: TcpListener,
    challenges: ChallengeManager,
    https_port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "HTTP listener started");
    }

    let connection_semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_CONNECTIONS));

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, remote_addr) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Error accepting HTTP connection");
                        continue;
                    }
                };

                let permit = match Arc::clone(&connection_semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!(remote = %remote_addr, "Connection limit reached, rejecting");
                        continue;
                    }
                };

                let challenges = challenges.clone();
                tokio::spawn(async move {
                    let _permit = permit;

                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                        let response = handle_request(&req, &challenges, https_port, remote_addr);
                        async move { Ok::<_, Infallible>(response) }
                    });

                    match tokio::time::timeout(
                        REQUEST_TIMEOUT,
                        http1::Builder::new().serve_connection(io, service),
                    )
                    .await
                    {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            debug!(
                                remote = %remote_addr,
                                error = %err,
                                "Error serving HTTP connection"
                            )
                        }
                        Err(_) => debug!(remote = %remote_addr, "HTTP connection timed out"),
                    }
                });
            }

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("HTTP listener shutting down");
                    break;
                }
            }
        }
    }
}

fn handle_request<B>(
    req: &Request<B>,
    challenges: &ChallengeManager,
    https_port: u16,
    remote_addr: SocketAddr,
) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if let Some(token) = ChallengeManager::extract_token(path) {
        if req.method() != Method::GET {
            return text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
        }
        return match challenges.key_authorization(token) {
            Some(key_auth) => {
                info!(token = %token, remote = %remote_addr, "Serving ACME challenge response");
                text(StatusCode::OK, key_auth)
            }
            None => {
                debug!(token = %token, remote = %remote_addr, "Unknown ACME challenge token");
                text(StatusCode::NOT_FOUND, "Challenge not found")
            }
        };
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    match https_location(req.headers(), path_and_query, https_port) {
        Some(location) => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::PERMANENT_REDIRECT;
            response.headers_mut().insert(LOCATION, location);
            response
        }
        None => text(StatusCode::BAD_REQUEST, "Missing or invalid Host header"),
    }
}

/// `https://` URL for the same host and path
fn https_location(
    headers: &HeaderMap,
    path_and_query: &str,
    https_port: u16,
) -> Option<HeaderValue> {
    let host = headers.get(HOST)?.to_str().ok()?;
    let hostname = strip_port(host);
    if hostname.is_empty() {
        return None;
    }

    let location = if https_port == 443 {
        format!("https://{}{}", hostname, path_and_query)
    } else {
        format!("https://{}:{}{}", hostname, https_port, path_and_query)
    };
    HeaderValue::from_str(&location).ok()
}

/// Host header without its port, keeping IPv6 brackets
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.rsplit_once(':').map_or(host, |(name, _)| name)
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
