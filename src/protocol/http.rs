//! Smart HTTP binding.
//!
//! Three endpoints per repository:
//! - `GET /{repo}/info/refs?service=git-{upload,receive}-pack` sends the advertisement with its
//!   `# service=` preamble.
//! - `POST /{repo}/git-upload-pack` and `POST /{repo}/git-receive-pack` run one stateless
//!   round of the exchange over the request body and stream the result back.
//!
//! Repository names may contain slashes, so a single wildcard route takes the whole path and
//! the endpoint is recognised by its suffix.

use std::{
    collections::HashMap,
    io::{Cursor, Read},
    net::SocketAddr,
    str::FromStr,
    sync::Arc,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use flate2::read::GzDecoder;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::oneshot,
};
use tokio_util::io::ReaderStream;

use super::{
    access::Peer,
    types::{ProtocolError, ServiceType},
};
use crate::{errors::GatewayError, gateway::Gateway};

/// Split `group/repo.git/info/refs` into the repository name and what follows it.
pub fn extract_repo_path(path: &str) -> Option<(&str, &str)> {
    let path = path.trim_start_matches('/');
    let endpoint = ["/info/refs", "/git-upload-pack", "/git-receive-pack"]
        .into_iter()
        .find(|suffix| path.ends_with(suffix))?;
    let repo = &path[..path.len() - endpoint.len()];
    (!repo.is_empty()).then_some((repo, &endpoint[1..]))
}

pub fn router(gateway: Gateway) -> Router {
    Router::new()
        .route("/{*path}", get(info_refs).post(service_rpc))
        .with_state(Arc::new(gateway))
}

/// Serve `router` until the listener fails.
pub async fn serve(listener: tokio::net::TcpListener, router: Router) -> std::io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "HTTP gateway listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

fn peer(request: &Request) -> Peer {
    Peer {
        addr: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0),
        user: None,
    }
}

fn protocol_env(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .get("git-protocol")
        .and_then(|value| value.to_str().ok())
        .map(|value| HashMap::from([("GIT_PROTOCOL".to_string(), value.to_string())]))
        .unwrap_or_default()
}

fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found").into_response()
}

async fn info_refs(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    request: Request,
) -> Result<Response, GatewayError> {
    let Some((repo, "info/refs")) = extract_repo_path(&path) else {
        return Ok(not_found());
    };
    // Dumb HTTP and unknown services are refused before the repository is looked up.
    let service = params
        .get("service")
        .and_then(|service| ServiceType::from_str(service).ok())
        .ok_or_else(|| ProtocolError::invalid_service("only smart git"))?;

    let mut session = gateway
        .open_session(
            repo,
            service,
            true,
            protocol_env(request.headers()),
            peer(&request),
        )
        .await?;
    let mut body = Vec::new();
    session.advertise(&mut body).await?;
    session.close()?;

    Ok((
        [
            (header::CONTENT_TYPE, service.advertisement_content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response())
}

async fn service_rpc(
    State(gateway): State<Arc<Gateway>>,
    Path(path): Path<String>,
    request: Request,
) -> Result<Response, GatewayError> {
    let Some((repo, endpoint)) = extract_repo_path(&path) else {
        return Ok(not_found());
    };
    let Ok(service) = ServiceType::from_str(endpoint) else {
        return Ok(not_found());
    };

    let env = protocol_env(request.headers());
    let peer = peer(&request);
    let gzip = request
        .headers()
        .get(header::CONTENT_ENCODING)
        .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"gzip"));
    let limit = gateway.max_request_body;
    let body = match axum::body::to_bytes(request.into_body(), limit).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(repo, %service, error = %e, "request body rejected");
            return Ok((StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response());
        }
    };
    let body = if gzip { inflate(&body, limit)? } else { body };

    let mut session = gateway
        .open_session(repo, service, true, env, peer)
        .await?;
    session.mark_advertised().await?;

    let (mut output, mut response) = tokio::io::duplex(64 * 1024);
    let (outcome_tx, outcome_rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut input = body.as_ref();
        let result = session.serve(&mut input, &mut output).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "HTTP session ended with an error");
        }
        let _ = outcome_tx.send(result);
        let _ = output.shutdown().await;
    });

    // The status line waits for the first response byte: a session that fails before writing
    // anything is reported through the status code instead of an empty 200.
    let mut first = vec![0u8; 8 * 1024];
    let read = response.read(&mut first).await?;
    if read == 0 {
        if let Ok(Err(e)) = outcome_rx.await {
            return Err(e.into());
        }
    }
    first.truncate(read);

    Ok((
        [
            (header::CONTENT_TYPE, service.result_content_type()),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        Body::from_stream(ReaderStream::new(AsyncReadExt::chain(
            Cursor::new(first),
            response,
        ))),
    )
        .into_response())
}

fn inflate(body: &[u8], limit: usize) -> Result<Bytes, ProtocolError> {
    let mut out = Vec::new();
    GzDecoder::new(body)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::InvalidRequest(format!("invalid gzip body: {e}")))?;
    if out.len() > limit {
        return Err(ProtocolError::invalid_request("request body too large"));
    }
    Ok(Bytes::from(out))
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Path(_) => StatusCode::NOT_FOUND,
            GatewayError::Protocol(e) => match e {
                ProtocolError::InvalidService(_) | ProtocolError::Forbidden(_) => {
                    StatusCode::FORBIDDEN
                }
                ProtocolError::Store(_) | ProtocolError::Io(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
                _ => StatusCode::BAD_REQUEST,
            },
            GatewayError::Store(_) | GatewayError::Io(_) | GatewayError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, %status, "request refused");
        }
        (status, self.to_string()).into_response()
    }
}
