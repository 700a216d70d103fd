//! WebSocket transport.
//!
//! The upgrade request carries the handshake headers of
//! [`Certificate::handshake_headers`]; the acceptor answers with its own
//! public key header. After the upgrade every packet is one JSON text frame.
//! Each peer runs a writer pump (outbound queue plus Ping heartbeat) and a
//! reader pump whose deadline is refreshed by any frame.

use crate::auth::{
    derive_pid, parse_public_key, verify_handshake, Authorization, Certificate, HEADER_PUBLIC_KEY,
};
use crate::listener::Listener;
use crate::peer::{dispatch, wait_closed, Peer, PeerHandler, TransportTimings};
use async_trait::async_trait;
use futures::{SinkExt, Stream, StreamExt};
use owtp_types::packet::{decode_packet, encode_packet};
use owtp_types::{ConnectConfig, ConnectType, DataPacket, OwtpError, OwtpResult};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = Pin<Box<dyn futures::Sink<Message, Error = WsError> + Send>>;
type WsSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

struct Pipe {
    outbound: mpsc::Receiver<Message>,
    sink: WsSink,
    source: WsSource,
}

/// A persistent WebSocket peer.
pub struct SocketPeer {
    pid: String,
    is_host: bool,
    config: ConnectConfig,
    auth: Authorization,
    local_addr: String,
    remote_addr: String,
    timings: TransportTimings,
    handler: Arc<dyn PeerHandler>,
    me: Weak<SocketPeer>,
    closed: AtomicBool,
    outbound: mpsc::Sender<Message>,
    pipe: Mutex<Option<Pipe>>,
    shutdown: watch::Sender<bool>,
}

impl SocketPeer {
    #[allow(clippy::too_many_arguments)]
    fn new<S>(
        pid: String,
        is_host: bool,
        config: ConnectConfig,
        auth: Authorization,
        local_addr: String,
        remote_addr: String,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
        ws: WebSocketStream<S>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, source) = ws.split();
        let (tx, rx) = mpsc::channel(config.write_buffer_size.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            pid,
            is_host,
            config,
            auth,
            local_addr,
            remote_addr,
            timings,
            handler,
            me: me.clone(),
            closed: AtomicBool::new(false),
            outbound: tx,
            pipe: Mutex::new(Some(Pipe {
                outbound: rx,
                sink: Box::pin(sink),
                source: Box::pin(source),
            })),
            shutdown,
        })
    }

    /// Dial `config` and verify the acceptor is `pid` (any identity when
    /// `pid` is empty).
    pub async fn dial(
        pid: &str,
        config: ConnectConfig,
        cert: Arc<Certificate>,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
    ) -> OwtpResult<Arc<Self>> {
        let url = config.url();
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| OwtpError::WebSocket(format!("invalid url {url}: {e}")))?;
        for (name, value) in cert.handshake_headers() {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| OwtpError::HandshakeFailed(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        debug!("OWTP: dialing {}", url);
        let (ws, response) = timeout(timings.http_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| OwtpError::HandshakeFailed(format!("dial {url} timed out")))?
            .map_err(|e| match e {
                WsError::Http(resp) => OwtpError::HandshakeFailed(format!(
                    "{url} refused upgrade with status {}",
                    resp.status()
                )),
                other => OwtpError::WebSocket(other.to_string()),
            })?;

        let remote_key = response
            .headers()
            .get(HEADER_PUBLIC_KEY)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| OwtpError::HandshakeFailed("acceptor sent no public key".into()))?;
        let remote_key = parse_public_key(remote_key)?;
        let actual = derive_pid(&remote_key);
        if !pid.is_empty() && actual != pid {
            return Err(OwtpError::PeerIdMismatch {
                expected: pid.to_string(),
                actual,
            });
        }

        let (local_addr, remote_addr) = match ws.get_ref() {
            MaybeTlsStream::Plain(stream) => stream_addrs(stream),
            _ => (String::new(), config.address.clone()),
        };
        let auth = Authorization::with_remote(cert, Some(remote_key), config.enable_signature);
        info!("OWTP: connected to {} at {}", actual, remote_addr);
        Ok(Self::new(
            actual,
            true,
            config,
            auth,
            local_addr,
            remote_addr,
            timings,
            handler,
            ws,
        ))
    }

    fn arc(&self) -> Option<Arc<SocketPeer>> {
        self.me.upgrade()
    }
}

fn stream_addrs(stream: &TcpStream) -> (String, String) {
    let local = stream.local_addr().map(|a| a.to_string()).unwrap_or_default();
    let remote = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
    (local, remote)
}

#[async_trait]
impl Peer for SocketPeer {
    fn pid(&self) -> &str {
        &self.pid
    }

    fn is_host(&self) -> bool {
        self.is_host
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
        if !self.is_connected() {
            return Err(OwtpError::Disconnected);
        }
        let text = String::from_utf8(encode_packet(&packet)?)
            .map_err(|e| OwtpError::WebSocket(e.to_string()))?;
        match timeout(self.timings.write_timeout, self.outbound.send(Message::Text(text))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(OwtpError::Disconnected),
            Err(_) => Err(OwtpError::WebSocket(format!(
                "outbound queue of {} full",
                self.pid
            ))),
        }
    }

    async fn open_pipe(&self) -> OwtpResult<()> {
        let pipe = self.pipe.lock().unwrap_or_else(|e| e.into_inner()).take();
        let (Some(pipe), Some(me)) = (pipe, self.arc()) else {
            return Ok(());
        };
        tokio::spawn(write_pump(
            Arc::clone(&me),
            pipe.outbound,
            pipe.sink,
            self.shutdown.subscribe(),
        ));
        tokio::spawn(read_pump(me, pipe.source, self.shutdown.subscribe()));
        Ok(())
    }

    async fn close(&self) -> OwtpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("OWTP: closing socket peer {}", self.pid);
        let _ = self.shutdown.send(true);
        // Pumps never started: drop the stream here
        self.pipe.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(me) = self.arc() {
            self.handler.on_peer_closed(me);
        }
        Ok(())
    }
}

async fn write_pump(
    peer: Arc<SocketPeer>,
    mut outbound: mpsc::Receiver<Message>,
    mut sink: WsSink,
    mut shutdown: watch::Receiver<bool>,
) {
    let period = peer.timings.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        let message = tokio::select! {
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = heartbeat.tick() => Message::Ping(Vec::new()),
            _ = wait_closed(&mut shutdown) => break,
        };
        match timeout(peer.timings.write_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("OWTP: write to {} failed: {}", peer.pid, e);
                break;
            }
            Err(_) => {
                warn!("OWTP: write to {} timed out", peer.pid);
                break;
            }
        }
    }
    let _ = timeout(peer.timings.write_timeout, sink.close()).await;
    let _ = peer.close().await;
}

async fn read_pump(peer: Arc<SocketPeer>, mut source: WsSource, mut shutdown: watch::Receiver<bool>) {
    loop {
        let frame = tokio::select! {
            frame = timeout(peer.timings.read_timeout, source.next()) => frame,
            _ = wait_closed(&mut shutdown) => break,
        };
        let message = match frame {
            Err(_) => {
                warn!("OWTP: no frame from {} within read deadline", peer.pid);
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!("OWTP: read from {} failed: {}", peer.pid, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };
        match message {
            Message::Text(text) => match decode_packet(text.as_bytes()) {
                Ok(packet) => dispatch(&peer.handler, Arc::clone(&peer) as Arc<dyn Peer>, packet),
                Err(e) => warn!("OWTP: undecodable frame from {}: {}", peer.pid, e),
            },
            Message::Close(_) => break,
            // Ping, Pong and binary frames only refresh the deadline
            _ => {}
        }
    }
    let _ = peer.close().await;
}

/// Accepts WebSocket upgrades on a TCP port.
pub struct SocketListener {
    local_addr: SocketAddr,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Arc<dyn Peer>>>,
    shutdown: watch::Sender<bool>,
}

impl SocketListener {
    pub async fn bind(
        config: ConnectConfig,
        cert: Arc<Certificate>,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
    ) -> OwtpResult<Self> {
        if config.enable_ssl {
            return Err(OwtpError::Unsupported(
                "TLS termination on socket listeners".into(),
            ));
        }
        let listener = TcpListener::bind(&config.address).await?;
        let local_addr = listener.local_addr()?;
        let (tx, rx) = mpsc::channel(config.read_buffer_size.max(1));
        let (shutdown, _) = watch::channel(false);

        info!("OWTP: socket listener on {}", local_addr);
        tokio::spawn(accept_loop(
            listener,
            config,
            cert,
            timings,
            handler,
            tx,
            shutdown.subscribe(),
        ));

        Ok(Self {
            local_addr,
            incoming: tokio::sync::Mutex::new(rx),
            shutdown,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

#[async_trait]
impl Listener for SocketListener {
    async fn accept(&self) -> OwtpResult<Arc<dyn Peer>> {
        let mut shutdown = self.shutdown.subscribe();
        let mut incoming = self.incoming.lock().await;
        tokio::select! {
            peer = incoming.recv() => peer.ok_or(OwtpError::ListenerClosed),
            _ = wait_closed(&mut shutdown) => Err(OwtpError::ListenerClosed),
        }
    }

    async fn close(&self) -> OwtpResult<()> {
        let _ = self.shutdown.send(true);
        Ok(())
    }

    fn local_addr(&self) -> String {
        self.local_addr.to_string()
    }

    fn connect_type(&self) -> ConnectType {
        ConnectType::Ws
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: ConnectConfig,
    cert: Arc<Certificate>,
    timings: TransportTimings,
    handler: Arc<dyn PeerHandler>,
    incoming: mpsc::Sender<Arc<dyn Peer>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = wait_closed(&mut shutdown) => break,
        };
        match accepted {
            Ok((stream, addr)) => {
                debug!("OWTP: accepted connection from {}", addr);
                let config = config.clone();
                let cert = Arc::clone(&cert);
                let handler = Arc::clone(&handler);
                let incoming = incoming.clone();
                tokio::spawn(async move {
                    match upgrade(stream, config, cert, timings, handler).await {
                        Ok(peer) => {
                            if let Err(mpsc::error::SendError(peer)) = incoming.send(peer).await {
                                let _ = peer.close().await;
                            }
                        }
                        Err(e) => debug!("OWTP: upgrade from {} failed: {}", addr, e),
                    }
                });
            }
            Err(e) => {
                error!("OWTP: accept error: {}", e);
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            }
        }
    }
    debug!("OWTP: socket accept loop stopped");
}

async fn upgrade(
    stream: TcpStream,
    config: ConnectConfig,
    cert: Arc<Certificate>,
    timings: TransportTimings,
    handler: Arc<dyn PeerHandler>,
) -> OwtpResult<Arc<dyn Peer>> {
    let (local_addr, remote_addr) = stream_addrs(&stream);
    let require_signature = config.enable_signature;
    let public_key_hex = cert.public_key_hex();
    let mut verified = None;

    let callback = |request: &Request, mut response: Response| {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        match verify_handshake(header, require_signature) {
            Ok(key) => {
                verified = Some(key);
                if let Ok(value) = HeaderValue::from_str(&public_key_hex) {
                    response.headers_mut().insert(HEADER_PUBLIC_KEY, value);
                }
                Ok(response)
            }
            Err(e) => {
                let mut refusal = ErrorResponse::new(Some(e.to_string()));
                *refusal.status_mut() = StatusCode::UNAUTHORIZED;
                Err(refusal)
            }
        }
    };

    let ws = timeout(
        timings.http_timeout,
        tokio_tungstenite::accept_hdr_async(stream, callback),
    )
    .await
    .map_err(|_| OwtpError::HandshakeFailed("upgrade timed out".into()))?
    .map_err(|e| OwtpError::HandshakeFailed(e.to_string()))?;

    let key = verified.ok_or_else(|| OwtpError::HandshakeFailed("no identity".into()))?;
    let pid = derive_pid(&key);
    let auth = Authorization::with_remote(cert, Some(key), config.enable_signature);
    info!("OWTP: peer {} connected from {}", pid, remote_addr);
    let peer: Arc<dyn Peer> = SocketPeer::new(
        pid,
        false,
        config,
        auth,
        local_addr,
        remote_addr,
        timings,
        handler,
        ws,
    );
    Ok(peer)
}
