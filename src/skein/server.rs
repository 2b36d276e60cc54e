//! HTTP front door: relay WebSocket endpoint plus health/metrics/admin
//! routes. Session admission (origin allowlist, session limit) happens here,
//! before the upgrade is accepted.

use std::{
    io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{ready, Context, Poll},
    time::Instant,
};

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{Sink, Stream};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::watch,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::skein::config::Config;
use crate::skein::relay::{
    dialer::Dialer,
    lifecycle::{SessionGuard, SessionRegistry},
    session::{self, SessionOptions},
    table::StreamTable,
};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub dialer: Arc<Dialer>,
    pub registry: Arc<SessionRegistry>,
    pub prom: Arc<PrometheusHandle>,
    pub shutdown: watch::Receiver<bool>,
    pub started: Instant,
}

pub fn router(state: AppState) -> Router {
    // The relay endpoint is addressed by suffix, so it cannot be a static
    // route: the fallback inspects every otherwise-unmatched path.
    Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .route("/sessions", get(sessions))
        .fallback(relay_ws)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(listen_addr = %addr, relay_path = %state.cfg.relay.path, "server: listening");

    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.wait_for(|stop| *stop).await;
    })
    .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_ms: u64,
    sessions: usize,
    streams: usize,
}

async fn health(State(st): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            uptime_ms: st.started.elapsed().as_millis() as u64,
            sessions: st.registry.len(),
            streams: st.registry.total_streams(),
        }),
    )
}

async fn metrics(State(st): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, st.prom.render())
}

async fn sessions(State(st): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, Json(st.registry.snapshot()))
}

async fn relay_ws(
    State(st): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !is_relay_path(uri.path(), &st.cfg.relay.path) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    if !origin_allowed(&headers, &st.cfg.relay.origin_whitelist) {
        tracing::warn!(peer = %peer, "server: upgrade rejected, origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    let table = Arc::new(StreamTable::new(st.cfg.relay.max_streams_per_session));
    let Some(guard) = st.registry.try_register(peer.to_string(), table.clone()) else {
        tracing::warn!(peer = %peer, "server: upgrade rejected, session limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "session limit reached").into_response();
    };

    ws.on_upgrade(move |socket| handle_session(socket, st, guard, table, peer))
}

async fn handle_session(
    socket: WebSocket,
    st: AppState,
    guard: SessionGuard,
    table: Arc<StreamTable>,
    peer: SocketAddr,
) {
    let session_id = guard.id();
    tracing::info!(session = session_id, peer = %peer, "server: session started");

    let opts = SessionOptions {
        session_id,
        stream_credit: st.cfg.relay.stream_credit,
        max_payload: st.cfg.relay.max_payload_bytes,
        idle_timeout: st.cfg.timeouts.idle_timeout,
        shutdown_grace: st.cfg.timeouts.shutdown_grace,
    };

    let transport = WsByteStream::new(socket);
    match session::run(transport, table, st.dialer.clone(), opts, st.shutdown.clone()).await {
        Ok(()) => tracing::info!(session = session_id, peer = %peer, "server: session ended"),
        Err(err) => {
            tracing::warn!(session = session_id, peer = %peer, err = %err, "server: session failed")
        }
    }
    drop(guard);
}

/// The relay endpoint matches by suffix: a request is admitted when its path
/// ends with the configured relay path, so deployments may nest the relay
/// under any outer prefix (`/proxy/wisp/` for a configured `/wisp/`).
fn is_relay_path(path: &str, configured: &str) -> bool {
    let want = configured.trim_end_matches('/');
    want.is_empty() || path.trim_end_matches('/').ends_with(want)
}

/// Checks the upgrade request's Origin (falling back to Referer) against the
/// configured allowlist. An empty allowlist admits everyone.
fn origin_allowed(headers: &HeaderMap, whitelist: &[String]) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    let value = headers
        .get("origin")
        .or_else(|| headers.get("referer"))
        .and_then(|v| v.to_str().ok());
    let Some(host) = value.and_then(origin_host) else {
        return false;
    };
    whitelist.iter().any(|allowed| *allowed == host)
}

/// Extracts the lowercased hostname from an Origin/Referer value like
/// `https://app.example.com:8443/path`.
fn origin_host(value: &str) -> Option<String> {
    let rest = match value.find("://") {
        Some(i) => &value[i + 3..],
        None => value,
    };
    let authority = rest.split(['/', '?', '#']).next()?;
    let host = if let Some(stripped) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal.
        stripped.split(']').next()?
    } else {
        authority.split(':').next()?
    };
    if host.is_empty() {
        return None;
    }
    Some(host.to_ascii_lowercase())
}

/// Adapts an axum WebSocket into a byte stream for the frame codec. Binary
/// messages carry the bytes; message boundaries are not significant, so a
/// frame may span messages and a message may hold several frames. Ping, pong
/// and text messages are skipped.
pub struct WsByteStream {
    ws: WebSocket,
    leftover: Bytes,
}

impl WsByteStream {
    pub fn new(ws: WebSocket) -> Self {
        Self {
            ws,
            leftover: Bytes::new(),
        }
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.leftover.is_empty() {
                let n = self.leftover.len().min(buf.remaining());
                buf.put_slice(&self.leftover.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut self.ws).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => self.leftover = data,
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => {}
                Some(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
            }
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.ws).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut self.ws)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(io::Error::other)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.ws)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
