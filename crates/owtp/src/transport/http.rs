//! HTTP transport.
//!
//! Every packet is one POST carrying fresh handshake headers. The answer
//! packet, if any, comes back as the JSON response body (204 when there is
//! nothing to answer). Server-side peers live for exactly one request.

use crate::auth::{
    derive_pid, verify_handshake, Authorization, Certificate, HEADER_PUBLIC_KEY,
};
use crate::listener::Listener;
use crate::peer::{wait_closed, Peer, PeerHandler, TransportTimings};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use owtp_types::packet::decode_packet;
use owtp_types::{ConnectConfig, ConnectType, DataPacket, OwtpError, OwtpResult};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// Client side of an HTTP conversation.
pub struct HttpClientPeer {
    pid: String,
    config: ConnectConfig,
    auth: Authorization,
    url: String,
    client: reqwest::Client,
    handler: Arc<dyn PeerHandler>,
    me: Weak<HttpClientPeer>,
    closed: AtomicBool,
}

impl HttpClientPeer {
    /// Prepare a client for `config`. No request is made until the first
    /// `send`.
    pub fn dial(
        pid: &str,
        config: ConnectConfig,
        cert: Arc<Certificate>,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
    ) -> OwtpResult<Arc<Self>> {
        if pid.is_empty() {
            return Err(OwtpError::Config("HTTP peers must be dialed by peer ID".into()));
        }
        let client = reqwest::Client::builder()
            .timeout(timings.http_timeout)
            .build()
            .map_err(|e| OwtpError::Http(e.to_string()))?;
        let url = config.url();
        let auth = Authorization::new(cert, config.enable_signature);
        Ok(Arc::new_cyclic(|me| Self {
            pid: pid.to_string(),
            config,
            auth,
            url,
            client,
            handler,
            me: me.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn fail(&self, error: OwtpError) -> OwtpError {
        warn!("OWTP: POST to {} failed: {}", self.url, error);
        let _ = self.close().await;
        error
    }
}

#[async_trait]
impl Peer for HttpClientPeer {
    fn pid(&self) -> &str {
        &self.pid
    }

    fn is_host(&self) -> bool {
        true
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn connect_config(&self) -> &ConnectConfig {
        &self.config
    }

    fn local_addr(&self) -> String {
        String::new()
    }

    fn remote_addr(&self) -> String {
        self.config.address.clone()
    }

    fn auth(&self) -> &Authorization {
        &self.auth
    }

    async fn send(&self, packet: DataPacket) -> OwtpResult<()> {
        if !self.is_connected() {
            return Err(OwtpError::Disconnected);
        }
        let mut request = self.client.post(&self.url).json(&packet);
        for (name, value) in self.auth.certificate().handshake_headers() {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.fail(OwtpError::Http(e.to_string())).await),
        };
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            let reason = response.text().await.unwrap_or_default();
            return Err(self.fail(OwtpError::HandshakeFailed(reason)).await);
        }
        if !status.is_success() {
            return Err(self
                .fail(OwtpError::Http(format!("{} answered {}", self.url, status)))
                .await);
        }

        if let Some(key) = response
            .headers()
            .get(HEADER_PUBLIC_KEY)
            .and_then(|v| v.to_str().ok())
        {
            self.auth.learn_remote_public_key(key)?;
            if let Some(actual) = self.auth.remote_pid().filter(|p| *p != self.pid) {
                let mismatch = OwtpError::PeerIdMismatch {
                    expected: self.pid.clone(),
                    actual,
                };
                return Err(self.fail(mismatch).await);
            }
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) => return Err(self.fail(OwtpError::Http(e.to_string())).await),
        };
        if body.is_empty() {
            return Ok(());
        }
        let answer = decode_packet(&body)?;
        if let Some(me) = self.me.upgrade() {
            self.handler.on_packet(me, answer).await;
        }
        Ok(())
    }

    async fn open_pipe(&self) -> OwtpResult<()> {
        Ok(())
    }

    async fn close(&self) -> OwtpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("OWTP: closing HTTP peer {}", self.pid);
        if let Some(me) = self.me.upgrade() {
            self.handler.on_peer_closed(me);
        }
        Ok(())
    }
}

/// Server side of one HTTP request. Its single `send` becomes the response
/// body. It is never part of the node's online set, so closing it notifies
/// nobody.
pub struct HttpServerPeer {
    pid: String,
    config: ConnectConfig,
    auth: Authorization,
    local_addr: String,
    remote_addr: String,
    reply: Mutex<Option<oneshot::Sender<DataPacket>>>,
    closed: AtomicBool,
}

impl HttpServerPeer {
    fn take_reply(&self) -> Option<oneshot::Sender<DataPacket>> {
        self.reply.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

#[async_trait]
impl Peer for HttpServerPeer {
    fn pid(&self) -> &str {
        &self.pid
    }

    fn is_host(&self) -> bool {
        false
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn connect_config(&self) -> &ConnectConfig {
        &self.config
    }

    fn local_addr(&self) -> String {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.clone()
    }

    fn auth(&self) -> &Authorization {
        &self.auth
    }

    async fn send(&self, packet: DataPacket) -> OwtpResult<()> {
        let reply = self.take_reply().ok_or(OwtpError::Disconnected)?;
        reply.send(packet).map_err(|_| OwtpError::Disconnected)
    }

    async fn open_pipe(&self) -> OwtpResult<()> {
        Ok(())
    }

    async fn close(&self) -> OwtpResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.take_reply();
        }
        Ok(())
    }
}

#[derive(Clone)]
struct HttpState {
    config: Arc<ConnectConfig>,
    cert: Arc<Certificate>,
    timings: TransportTimings,
    handler: Arc<dyn PeerHandler>,
    local_addr: SocketAddr,
}

/// Serves POSTs on one route. Requests are handled inline, so `accept`
/// only waits for the listener to close.
pub struct HttpListener {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl HttpListener {
    pub async fn bind(
        config: ConnectConfig,
        cert: Arc<Certificate>,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
    ) -> OwtpResult<Self> {
        if config.enable_ssl {
            return Err(OwtpError::Unsupported(
                "TLS termination on HTTP listeners".into(),
            ));
        }
        let listener = TcpListener::bind(&config.address).await?;
        let local_addr = listener.local_addr()?;
        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };
        let state = HttpState {
            config: Arc::new(config),
            cert,
            timings,
            handler,
            local_addr,
        };
        let app = Router::new()
            .route(&path, post(serve_packet))
            .with_state(state);

        let (shutdown, _) = watch::channel(false);
        let mut stop = shutdown.subscribe();
        info!("OWTP: HTTP listener on {}{}", local_addr, path);
        tokio::spawn(async move {
            let server = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move { wait_closed(&mut stop).await });
            if let Err(e) = server.await {
                warn!("OWTP: HTTP server error: {}", e);
            }
            debug!("OWTP: HTTP listener stopped");
        });

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for HttpListener {
    async fn accept(&self) -> OwtpResult<Arc<dyn Peer>> {
        let mut shutdown = self.shutdown.subscribe();
        wait_closed(&mut shutdown).await;
        Err(OwtpError::ListenerClosed)
    }

    async fn close(&self) -> OwtpResult<()> {
        let _ = self.shutdown.send(true);
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    fn connect_type(&self) -> ConnectType {
        ConnectType::Http
    }
}

async fn serve_packet(
    State(state): State<HttpState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let remote_key = match verify_handshake(header, state.config.enable_signature) {
        Ok(key) => key,
        Err(e) => {
            warn!("OWTP: rejected POST from {}: {}", remote, e);
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    let packet = match decode_packet(&body) {
        Ok(packet) => packet,
        Err(e) => {
            debug!("OWTP: undecodable POST body from {}: {}", remote, e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let (tx, rx) = oneshot::channel();
    let peer = Arc::new(HttpServerPeer {
        pid: derive_pid(&remote_key),
        config: (*state.config).clone(),
        auth: Authorization::with_remote(
            Arc::clone(&state.cert),
            Some(remote_key),
            state.config.enable_signature,
        ),
        local_addr: state.local_addr.to_string(),
        remote_addr: remote.to_string(),
        reply: Mutex::new(Some(tx)),
        closed: AtomicBool::new(false),
    });
    state
        .handler
        .on_packet(Arc::clone(&peer) as Arc<dyn Peer>, packet)
        .await;

    let mut response = match tokio::time::timeout(state.timings.http_timeout, rx).await {
        Ok(Ok(answer)) => Json(answer).into_response(),
        _ => StatusCode::NO_CONTENT.into_response(),
    };
    let _ = peer.close().await;
    if let Ok(value) = HeaderValue::from_str(&state.cert.public_key_hex()) {
        response.headers_mut().insert(HEADER_PUBLIC_KEY, value);
    }
    response
}
