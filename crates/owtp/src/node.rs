//! The OWTP node.
//!
//! An [`OwtpNode`] owns the identity certificate, the listeners, the set of
//! online peers, the [`ServeMux`] and the peerstore. Membership changes
//! (peers joining and leaving) are serialized through a single event-loop
//! task; inbound packets are processed concurrently on per-packet tasks.
//!
//! Outbound calls are correlated by nonce. A call is resolved exactly once:
//! by its response, by the timeout sweep or by the disconnect of its peer.

use crate::auth::{Certificate, SessionKey, ENCRYPT_TYPE_AES_GCM};
use crate::listener::Listener;
use crate::mux::{Context, Resolver, ServeMux};
use crate::nonce::NonceGenerator;
use crate::peer::{Peer, PeerHandler, TransportTimings};
use crate::peerstore::{MemoryPeerstore, PeerInfo, Peerstore, SESSION_KEY};
use crate::transport::{
    AmqpBroker, HttpClientPeer, HttpListener, MqBroker, MqListener, MqPeer, SocketListener,
    SocketPeer,
};
use async_trait::async_trait;
use dashmap::DashMap;
use owtp_types::{
    ConnectConfig, ConnectType, DataPacket, KeyAgreement, NodeConfig, OwtpError, OwtpResult,
    Response, StatusCode,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use owtp_types::packet::KEY_AGREEMENT_METHOD;

/// Callback fired when a peer connects or disconnects.
pub type PeerEventHandler = Arc<dyn Fn(Arc<dyn Peer>) + Send + Sync>;

/// Optional collaborators of a node.
#[derive(Default, Clone)]
pub struct NodeOptions {
    /// Defaults to a [`MemoryPeerstore`].
    pub peerstore: Option<Arc<dyn Peerstore>>,
    /// Broker for every MQ peer and listener. Without one, each distinct
    /// broker address is reached through an [`AmqpBroker`].
    pub mq_broker: Option<Arc<dyn MqBroker>>,
}

enum Membership {
    Join(Arc<dyn Peer>, oneshot::Sender<()>),
    Leave(Arc<dyn Peer>),
    Stop,
}

/// A dropped resolver means the peer went away with the call.
async fn outcome(rx: oneshot::Receiver<Response>) -> Response {
    rx.await
        .unwrap_or_else(|_| Response::from_status(StatusCode::NetworkDisconnected))
}

fn same_peer(a: &Arc<dyn Peer>, b: &Arc<dyn Peer>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

struct NodeInner {
    cert: Arc<Certificate>,
    config: NodeConfig,
    timings: TransportTimings,
    mux: Arc<ServeMux>,
    peerstore: Arc<dyn Peerstore>,
    broker: Option<Arc<dyn MqBroker>>,
    amqp: DashMap<String, Arc<AmqpBroker>>,
    nonces: NonceGenerator,
    online: RwLock<HashMap<String, Arc<dyn Peer>>>,
    listeners: tokio::sync::Mutex<HashMap<ConnectType, Arc<dyn Listener>>>,
    events: mpsc::UnboundedSender<Membership>,
    ka_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    open_handler: RwLock<Option<PeerEventHandler>>,
    close_handler: RwLock<Option<PeerEventHandler>>,
    closed: AtomicBool,
}

/// A peer-to-peer OWTP endpoint.
pub struct OwtpNode {
    inner: Arc<NodeInner>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl OwtpNode {
    /// Build a node with an in-memory peerstore and no MQ broker.
    ///
    /// Must be called inside a tokio runtime: the event loop and the
    /// timeout sweep start immediately.
    pub fn new(config: NodeConfig) -> OwtpResult<Self> {
        Self::with_options(config, NodeOptions::default())
    }

    pub fn with_options(config: NodeConfig, options: NodeOptions) -> OwtpResult<Self> {
        let cert = if config.private_key.trim().is_empty() {
            Certificate::random()
        } else {
            Certificate::from_hex_seed(&config.private_key)?
        };
        let peerstore = options
            .peerstore
            .unwrap_or_else(|| Arc::new(MemoryPeerstore::new()));
        let mux = Arc::new(ServeMux::new(config.request_timeout()));
        let (events, events_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(NodeInner {
            cert: Arc::new(cert),
            timings: TransportTimings::from_config(&config),
            config,
            mux,
            peerstore,
            broker: options.mq_broker,
            amqp: DashMap::new(),
            nonces: NonceGenerator::new(),
            online: RwLock::new(HashMap::new()),
            listeners: tokio::sync::Mutex::new(HashMap::new()),
            events,
            ka_locks: DashMap::new(),
            open_handler: RwLock::new(None),
            close_handler: RwLock::new(None),
            closed: AtomicBool::new(false),
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = inner
            .mux
            .spawn_timeout_sweep(inner.config.timeout_sweep(), shutdown_rx);
        let event_loop = tokio::spawn(run_event_loop(Arc::clone(&inner), events_rx));

        info!("OWTP: node {} started", inner.cert.pid());
        Ok(Self {
            inner,
            event_loop: Mutex::new(Some(event_loop)),
            sweeper: Mutex::new(Some(sweeper)),
            shutdown,
        })
    }

    /// This node's peer ID.
    pub fn node_id(&self) -> &str {
        self.inner.cert.pid()
    }

    pub fn certificate(&self) -> &Arc<Certificate> {
        &self.inner.cert
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn peerstore(&self) -> &Arc<dyn Peerstore> {
        &self.inner.peerstore
    }

    /// Start a listener. At most one per transport kind.
    pub async fn listen(&self, config: ConnectConfig) -> OwtpResult<()> {
        self.inner.listen(config).await
    }

    /// Start every listener of [`NodeConfig::listen`].
    pub async fn listen_configured(&self) -> OwtpResult<()> {
        for config in self.inner.config.listen.clone() {
            self.listen(config).await?;
        }
        Ok(())
    }

    /// Bound address of the listener of `connect_type`, if any.
    pub async fn listen_addr(&self, connect_type: ConnectType) -> Option<String> {
        let listeners = self.inner.listeners.lock().await;
        listeners.get(&connect_type).map(|l| l.local_addr())
    }

    /// Connect to `pid` at `config`.
    ///
    /// Returns the existing peer if it is already connected with the same
    /// config; a peer connected with a different config is closed first.
    /// When the config enables key agreement, a session key is negotiated
    /// before returning.
    pub async fn connect(&self, pid: &str, config: ConnectConfig) -> OwtpResult<Arc<dyn Peer>> {
        self.inner.connect(pid, config).await
    }

    /// Disconnect `pid`; its pending calls resolve with
    /// `NetworkDisconnected`.
    pub async fn close_peer(&self, pid: &str) -> OwtpResult<()> {
        let peer = self
            .inner
            .online_peer(pid)
            .ok_or_else(|| OwtpError::PeerNotFound(pid.to_string()))?;
        peer.close().await
    }

    /// Call `method` on `pid`.
    ///
    /// With `sync`, waits for the outcome and invokes `callback` before
    /// returning. Otherwise returns once the request is sent and `callback`
    /// fires later from the task that resolves the call. An `Err` means the
    /// request never left and `callback` will not fire.
    pub async fn call<F>(
        &self,
        pid: &str,
        method: &str,
        params: Value,
        sync: bool,
        callback: F,
    ) -> OwtpResult<()>
    where
        F: FnOnce(Response) + Send + 'static,
    {
        if sync {
            let response = self.call_sync(pid, method, params).await?;
            callback(response);
            Ok(())
        } else {
            self.inner
                .request(pid, method, params, Resolver::Async(Box::new(callback)))
                .await
        }
    }

    /// Call `method` on `pid` and wait for the outcome.
    pub async fn call_sync(&self, pid: &str, method: &str, params: Value) -> OwtpResult<Response> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .request(pid, method, params, Resolver::Sync(tx))
            .await?;
        Ok(outcome(rx).await)
    }

    /// Register the handler of `method`.
    ///
    /// # Panics
    ///
    /// Panics if `method` already has a handler or is the reserved
    /// [`KEY_AGREEMENT_METHOD`].
    pub fn handle_func<F>(&self, method: &str, handler: F)
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        if method == KEY_AGREEMENT_METHOD {
            panic!("owtp: method '{method}' is reserved");
        }
        self.inner.mux.handle_func(method, handler);
    }

    /// Negotiate a fresh session key with `pid`, replacing any cached one.
    pub async fn key_agreement(&self, pid: &str, encrypt_type: &str) -> OwtpResult<()> {
        let peer = self.inner.resolve_peer(pid).await?;
        self.inner.negotiate(&peer, encrypt_type, true).await
    }

    /// Whether a session key is cached for `pid`.
    pub fn has_session_key(&self, pid: &str) -> bool {
        self.inner.session_key(pid).is_some()
    }

    pub fn set_open_handler<F>(&self, handler: F)
    where
        F: Fn(Arc<dyn Peer>) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .open_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(handler));
    }

    pub fn set_close_handler<F>(&self, handler: F)
    where
        F: Fn(Arc<dyn Peer>) + Send + Sync + 'static,
    {
        let mut slot = self
            .inner
            .close_handler
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(Arc::new(handler));
    }

    pub fn is_connected(&self, pid: &str) -> bool {
        self.inner
            .online_peer(pid)
            .is_some_and(|peer| peer.is_connected())
    }

    /// IDs of all online peers.
    pub fn online_peers(&self) -> Vec<String> {
        let online = self.inner.online.read().unwrap_or_else(|e| e.into_inner());
        online.keys().cloned().collect()
    }

    /// Close every listener and peer, then stop the event loop and the
    /// timeout sweep. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("OWTP: node {} shutting down", self.node_id());

        let listeners: Vec<Arc<dyn Listener>> = {
            let mut listeners = self.inner.listeners.lock().await;
            listeners.drain().map(|(_, l)| l).collect()
        };
        for listener in listeners {
            if let Err(e) = listener.close().await {
                debug!("OWTP: closing {} listener failed: {}", listener.connect_type(), e);
            }
        }

        let peers: Vec<Arc<dyn Peer>> = {
            let online = self.inner.online.read().unwrap_or_else(|e| e.into_inner());
            online.values().cloned().collect()
        };
        for peer in peers {
            let _ = peer.close().await;
        }

        let brokers: Vec<Arc<AmqpBroker>> =
            self.inner.amqp.iter().map(|b| Arc::clone(b.value())).collect();
        self.inner.amqp.clear();
        for broker in brokers {
            broker.close().await;
        }

        let _ = self.inner.events.send(Membership::Stop);
        let event_loop = self
            .event_loop
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = event_loop {
            let _ = handle.await;
        }

        let _ = self.shutdown.send(true);
        let sweeper = self.sweeper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = sweeper {
            let _ = handle.await;
        }
    }
}

impl Drop for OwtpNode {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            let _ = self.inner.events.send(Membership::Stop);
            let _ = self.shutdown.send(true);
        }
    }
}

async fn run_event_loop(inner: Arc<NodeInner>, mut events: mpsc::UnboundedReceiver<Membership>) {
    while let Some(event) = events.recv().await {
        match event {
            Membership::Join(peer, ack) => {
                inner.on_join(peer).await;
                let _ = ack.send(());
            }
            Membership::Leave(peer) => inner.on_leave(peer),
            Membership::Stop => break,
        }
    }
    debug!("OWTP: event loop of {} stopped", inner.cert.pid());
}

async fn accept_loop(inner: Arc<NodeInner>, listener: Arc<dyn Listener>) {
    loop {
        match listener.accept().await {
            Ok(peer) => {
                if let Err(e) = inner.join(Arc::clone(&peer)).await {
                    debug!("OWTP: dropping inbound peer {}: {}", peer.pid(), e);
                    let _ = peer.close().await;
                    break;
                }
            }
            Err(OwtpError::ListenerClosed) => break,
            Err(e) => {
                warn!("OWTP: {} accept failed: {}", listener.connect_type(), e);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
    debug!("OWTP: {} accept loop stopped", listener.connect_type());
}

impl NodeInner {
    fn ensure_open(&self) -> OwtpResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(OwtpError::NodeClosed)
        } else {
            Ok(())
        }
    }

    fn online_peer(&self, pid: &str) -> Option<Arc<dyn Peer>> {
        let online = self.online.read().unwrap_or_else(|e| e.into_inner());
        online.get(pid).cloned()
    }

    /// The injected broker, or the AMQP connection for `config`'s broker
    /// and account.
    fn broker(&self, config: &ConnectConfig) -> OwtpResult<Arc<dyn MqBroker>> {
        if let Some(broker) = &self.broker {
            return Ok(Arc::clone(broker));
        }
        let key = format!(
            "{}|{}|{}|{}",
            config.address, config.enable_ssl, config.account, config.exchange
        );
        let broker = self
            .amqp
            .entry(key)
            .or_try_insert_with(|| AmqpBroker::new(config).map(Arc::new))?;
        Ok(Arc::clone(broker.value()) as Arc<dyn MqBroker>)
    }

    fn session_key(&self, pid: &str) -> Option<SessionKey> {
        self.peerstore
            .get(pid, SESSION_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
    }

    fn store_session_key(&self, pid: &str, key: &SessionKey) {
        match serde_json::to_value(key) {
            Ok(value) => self.peerstore.put(pid, SESSION_KEY, value),
            Err(e) => warn!("OWTP: failed to cache session key for {}: {}", pid, e),
        }
    }

    fn drop_session_key(&self, pid: &str) {
        if self.peerstore.get(pid, SESSION_KEY).is_some() {
            debug!("OWTP: discarding session key of {}", pid);
            self.peerstore.delete(pid, SESSION_KEY);
        }
    }

    fn fire(&self, slot: &RwLock<Option<PeerEventHandler>>, peer: Arc<dyn Peer>) {
        let handler = slot.read().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(handler) = handler {
            tokio::spawn(async move { handler(peer) });
        }
    }

    async fn join(&self, peer: Arc<dyn Peer>) -> OwtpResult<()> {
        let (ack, done) = oneshot::channel();
        self.events
            .send(Membership::Join(peer, ack))
            .map_err(|_| OwtpError::NodeClosed)?;
        done.await.map_err(|_| OwtpError::NodeClosed)
    }

    async fn on_join(&self, peer: Arc<dyn Peer>) {
        if !peer.is_connected() {
            debug!("OWTP: peer {} closed before joining", peer.pid());
            return;
        }
        let pid = peer.pid().to_string();
        let replaced = {
            let mut online = self.online.write().unwrap_or_else(|e| e.into_inner());
            online.insert(pid.clone(), Arc::clone(&peer))
        };
        if let Some(old) = replaced.filter(|old| !same_peer(old, &peer)) {
            debug!("OWTP: new connection from {} replaces the old one", pid);
            tokio::spawn(async move {
                let _ = old.close().await;
            });
        }

        if peer.is_host() || self.peerstore.peer_info(&pid).is_none() {
            self.peerstore.save_peer(&PeerInfo {
                pid: pid.clone(),
                is_host: peer.is_host(),
                config: peer.connect_config().clone(),
            });
        }

        if let Err(e) = peer.open_pipe().await {
            warn!("OWTP: failed to open pipe to {}: {}", pid, e);
            let _ = peer.close().await;
            return;
        }
        info!(
            "OWTP: peer {} connected over {} ({})",
            pid,
            peer.connect_config().connect_type,
            peer.remote_addr()
        );
        self.fire(&self.open_handler, peer);
    }

    fn on_leave(&self, peer: Arc<dyn Peer>) {
        let pid = peer.pid().to_string();
        let removed = {
            let mut online = self.online.write().unwrap_or_else(|e| e.into_inner());
            match online.get(&pid) {
                Some(current) if same_peer(current, &peer) => online.remove(&pid),
                _ => None,
            }
        };
        if removed.is_none() {
            return;
        }
        self.mux.reset_request_queue(&pid);
        info!("OWTP: peer {} disconnected", pid);
        self.fire(&self.close_handler, peer);
    }

    async fn listen(self: &Arc<Self>, config: ConnectConfig) -> OwtpResult<()> {
        self.ensure_open()?;
        let connect_type = config.connect_type;
        let mut listeners = self.listeners.lock().await;
        if listeners.contains_key(&connect_type) {
            return Err(OwtpError::AlreadyListening(connect_type));
        }

        let handler: Arc<dyn PeerHandler> = Arc::clone(self) as Arc<dyn PeerHandler>;
        let cert = Arc::clone(&self.cert);
        let listener: Arc<dyn Listener> = match connect_type {
            ConnectType::Ws => {
                Arc::new(SocketListener::bind(config, cert, self.timings, handler).await?)
            }
            ConnectType::Http => {
                Arc::new(HttpListener::bind(config, cert, self.timings, handler).await?)
            }
            ConnectType::Mq => Arc::new(
                MqListener::bind(config.clone(), cert, self.broker(&config)?, self.timings, handler)
                    .await?,
            ),
        };

        // HTTP requests are served inline and never yield peers
        if connect_type != ConnectType::Http {
            tokio::spawn(accept_loop(Arc::clone(self), Arc::clone(&listener)));
        }
        info!(
            "OWTP: node {} listening on {} {}",
            self.cert.pid(),
            connect_type,
            listener.local_addr()
        );
        listeners.insert(connect_type, listener);
        Ok(())
    }

    async fn connect(self: &Arc<Self>, pid: &str, config: ConnectConfig) -> OwtpResult<Arc<dyn Peer>> {
        self.ensure_open()?;
        if let Some(existing) = self.online_peer(pid) {
            if existing.is_connected() && existing.connect_config() == &config {
                if config.enable_key_agreement {
                    self.negotiate(&existing, ENCRYPT_TYPE_AES_GCM, false).await?;
                }
                return Ok(existing);
            }
            info!("OWTP: config of {} changed, reconnecting", pid);
            let _ = existing.close().await;
        }

        let handler: Arc<dyn PeerHandler> = Arc::clone(self) as Arc<dyn PeerHandler>;
        let cert = Arc::clone(&self.cert);
        let peer: Arc<dyn Peer> = match config.connect_type {
            ConnectType::Ws => {
                SocketPeer::dial(pid, config.clone(), cert, self.timings, handler).await?
            }
            ConnectType::Http => {
                HttpClientPeer::dial(pid, config.clone(), cert, self.timings, handler)?
            }
            ConnectType::Mq => {
                let broker = self.broker(&config)?;
                MqPeer::dial(pid, config.clone(), cert, broker, self.timings, handler).await?
            }
        };
        self.join(Arc::clone(&peer)).await?;

        if config.enable_key_agreement {
            self.negotiate(&peer, ENCRYPT_TYPE_AES_GCM, false).await?;
        }
        Ok(peer)
    }

    /// The online peer for `pid`, reconnecting to peers we dialed before.
    async fn resolve_peer(self: &Arc<Self>, pid: &str) -> OwtpResult<Arc<dyn Peer>> {
        self.ensure_open()?;
        if let Some(peer) = self.online_peer(pid).filter(|p| p.is_connected()) {
            return Ok(peer);
        }
        match self.peerstore.peer_info(pid) {
            Some(info) if info.is_host => {
                debug!("OWTP: reconnecting to {}", pid);
                self.connect(pid, info.config).await
            }
            _ => Err(OwtpError::PeerNotFound(pid.to_string())),
        }
    }

    async fn request(
        self: &Arc<Self>,
        pid: &str,
        method: &str,
        params: Value,
        resolver: Resolver,
    ) -> OwtpResult<()> {
        let peer = self.resolve_peer(pid).await?;
        if peer.connect_config().enable_key_agreement && self.session_key(pid).is_none() {
            self.negotiate(&peer, ENCRYPT_TYPE_AES_GCM, false).await?;
        }

        let Some(key) = self.session_key(pid) else {
            let packet = self.seal_request(&peer, method, params, None)?;
            return self.send_request(&peer, packet, resolver).await;
        };

        // An encrypted call the peer refuses with 402 renegotiates the key
        // and is sent once more before the caller sees an outcome.
        let packet = self.seal_request(&peer, method, params.clone(), Some(&key))?;
        let (tx, rx) = oneshot::channel();
        self.send_request(&peer, packet, Resolver::Sync(tx)).await?;
        let inner = Arc::clone(self);
        let method = method.to_string();
        tokio::spawn(async move {
            let response = outcome(rx).await;
            if response.status != StatusCode::SecretKeyInvalid.code() {
                resolver.resolve(response);
                return;
            }
            let response = inner
                .renegotiate_and_resend(&peer, &method, params, &key.id)
                .await;
            resolver.resolve(response);
        });
        Ok(())
    }

    fn seal_request(
        &self,
        peer: &Arc<dyn Peer>,
        method: &str,
        params: Value,
        key: Option<&SessionKey>,
    ) -> OwtpResult<DataPacket> {
        let mut packet = DataPacket::request(method, self.nonces.next(), params);
        peer.auth().encrypt_data_packet(&mut packet, key)?;
        peer.auth().generate_signature(&mut packet);
        Ok(packet)
    }

    async fn renegotiate_and_resend(
        &self,
        peer: &Arc<dyn Peer>,
        method: &str,
        params: Value,
        refused_key: &str,
    ) -> Response {
        let pid = peer.pid();
        debug!("OWTP: {} refused session key {} on {}", pid, refused_key, method);
        // A concurrent retry may already have replaced the refused key
        if self.session_key(pid).is_some_and(|k| k.id == refused_key) {
            self.drop_session_key(pid);
        }
        if let Err(e) = self.negotiate(peer, ENCRYPT_TYPE_AES_GCM, false).await {
            warn!("OWTP: renegotiation with {} failed: {}", pid, e);
            return Response::error(StatusCode::KeyAgreementFailed, e.to_string());
        }
        let key = self.session_key(pid);
        let packet = match self.seal_request(peer, method, params, key.as_ref()) {
            Ok(packet) => packet,
            Err(e) => return Response::error(StatusCode::InternalServerError, e.to_string()),
        };
        let (tx, rx) = oneshot::channel();
        if let Err(e) = self.send_request(peer, packet, Resolver::Sync(tx)).await {
            debug!("OWTP: resend to {} failed: {}", pid, e);
            return Response::from_status(StatusCode::NetworkDisconnected);
        }
        outcome(rx).await
    }

    async fn send_request(
        &self,
        peer: &Arc<dyn Peer>,
        packet: DataPacket,
        resolver: Resolver,
    ) -> OwtpResult<()> {
        let pid = peer.pid();
        let nonce = packet.nonce;
        self.mux.add_request(pid, nonce, &packet.method, resolver)?;
        if let Err(e) = peer.send(packet).await {
            if self.mux.remove_request(pid, nonce) {
                return Err(e);
            }
            // The disconnect already resolved the call
            debug!("OWTP: send to {} failed after resolution: {}", pid, e);
        }
        Ok(())
    }

    /// Run the key agreement round trip as initiator. Unless `force`, an
    /// already cached key is kept.
    async fn negotiate(
        &self,
        peer: &Arc<dyn Peer>,
        encrypt_type: &str,
        force: bool,
    ) -> OwtpResult<()> {
        let pid = peer.pid().to_string();
        let lock = Arc::clone(self.ka_locks.entry(pid.clone()).or_default().value());
        let _guard = lock.lock().await;
        if !force && self.session_key(&pid).is_some() {
            return Ok(());
        }

        let pending = peer.auth().init_key_agreement(encrypt_type)?;
        let mut packet = DataPacket::request(KEY_AGREEMENT_METHOD, self.nonces.next(), Value::Null);
        packet.secret = Some(pending.agreement().clone());
        peer.auth().generate_signature(&mut packet);

        let (tx, rx) = oneshot::channel();
        self.send_request(peer, packet, Resolver::Sync(tx)).await?;
        let response = outcome(rx).await;
        if !response.is_success() {
            return Err(OwtpError::KeyAgreementFailed(format!(
                "{} answered {}: {}",
                pid, response.status, response.msg
            )));
        }
        let answer: KeyAgreement = serde_json::from_value(response.result)
            .map_err(|e| OwtpError::KeyAgreementFailed(format!("malformed answer: {e}")))?;
        let key = peer.auth().response_key_agreement(&answer, pending)?;
        self.store_session_key(&pid, &key);
        info!("OWTP: session key {} established with {}", key.id, pid);
        Ok(())
    }

    /// Sign (and, with a key, encrypt) `response` to `request` and send it.
    async fn reply(
        &self,
        peer: &Arc<dyn Peer>,
        request: &DataPacket,
        response: Response,
        key: Option<&SessionKey>,
    ) {
        let mut packet = DataPacket::response_to(request, &response);
        if let Err(e) = peer.auth().encrypt_data_packet(&mut packet, key) {
            warn!("OWTP: failed to encrypt reply to {}: {}", peer.pid(), e);
            packet = DataPacket::response_to(
                request,
                &Response::error(StatusCode::InternalServerError, "reply encryption failed"),
            );
        }
        peer.auth().generate_signature(&mut packet);
        if let Err(e) = peer.send(packet).await {
            debug!("OWTP: reply to {} failed: {}", peer.pid(), e);
        }
    }

    async fn handle_request(&self, peer: Arc<dyn Peer>, mut packet: DataPacket) {
        let pid = peer.pid().to_string();
        if !self.mux.check_replay(&pid, packet.nonce, packet.timestamp) {
            warn!(
                "OWTP: stale or replayed packet {} from {} (t={})",
                packet.nonce, pid, packet.timestamp
            );
            let response = Response::from_status(StatusCode::ReplayAttack);
            self.reply(&peer, &packet, response, None).await;
            return;
        }
        if packet.method == KEY_AGREEMENT_METHOD {
            self.answer_key_agreement(&peer, packet).await;
            return;
        }

        let session = self.session_key(&pid);
        if let Some(marker) = packet.secret.as_ref().filter(|k| !k.key_id.is_empty()) {
            if !peer.auth().verify_key_agreement(marker, session.as_ref()) {
                debug!("OWTP: {} used unknown session key {}", pid, marker.key_id);
                let response = Response::from_status(StatusCode::SecretKeyInvalid);
                self.reply(&peer, &packet, response, None).await;
                return;
            }
        }
        if !peer.auth().verify_signature(&packet) {
            warn!("OWTP: bad signature from {} on {}", pid, packet.method);
            let response = Response::from_status(StatusCode::Unauthorized);
            self.reply(&peer, &packet, response, None).await;
            return;
        }

        let encrypted = packet.session_key_id().is_some();
        if let Err(e) = peer.auth().decrypt_data_packet(&mut packet, session.as_ref()) {
            warn!("OWTP: cannot decrypt {} from {}: {}", packet.method, pid, e);
            let response = Response::error(StatusCode::SecretKeyInvalid, e.to_string());
            self.reply(&peer, &packet, response, None).await;
            return;
        }

        let mut ctx = Context::new(pid.as_str(), &packet, Some(Arc::clone(&self.peerstore)));
        self.mux.serve_owtp(&pid, &mut ctx);
        let key = if encrypted { session.as_ref() } else { None };
        self.reply(&peer, &packet, ctx.resp, key).await;
    }

    async fn answer_key_agreement(&self, peer: &Arc<dyn Peer>, packet: DataPacket) {
        let pid = peer.pid().to_string();
        if !peer.auth().verify_signature(&packet) {
            warn!("OWTP: bad signature on key agreement from {}", pid);
            let response = Response::from_status(StatusCode::Unauthorized);
            self.reply(peer, &packet, response, None).await;
            return;
        }
        let Some(mut agreement) = packet.secret.clone() else {
            let response =
                Response::error(StatusCode::KeyAgreementFailed, "missing key agreement parameters");
            self.reply(peer, &packet, response, None).await;
            return;
        };
        let identity_matches = peer
            .auth()
            .remote_public_key()
            .map(|k| hex::encode(k.as_bytes()) == agreement.initiator_public_key)
            .unwrap_or(true);
        if !identity_matches {
            warn!("OWTP: key agreement from {} names another identity", pid);
            let response =
                Response::error(StatusCode::KeyAgreementFailed, "initiator identity mismatch");
            self.reply(peer, &packet, response, None).await;
            return;
        }

        match peer.auth().request_key_agreement(&mut agreement) {
            Ok(key) => {
                self.store_session_key(&pid, &key);
                info!("OWTP: session key {} agreed with {}", key.id, pid);
                let result = serde_json::to_value(&agreement).unwrap_or_default();
                let mut answer = DataPacket::response_to(&packet, &Response::success(result));
                answer.secret = Some(agreement);
                peer.auth().generate_signature(&mut answer);
                if let Err(e) = peer.send(answer).await {
                    debug!("OWTP: key agreement answer to {} failed: {}", pid, e);
                }
            }
            Err(e) => {
                warn!("OWTP: key agreement with {} failed: {}", pid, e);
                let response = Response::error(StatusCode::KeyAgreementFailed, e.to_string());
                self.reply(peer, &packet, response, None).await;
            }
        }
    }

    fn handle_response(&self, peer: Arc<dyn Peer>, mut packet: DataPacket) {
        let pid = peer.pid().to_string();
        // Unsigned responses are accepted
        if !packet.signature.is_empty() && !peer.auth().verify_signature(&packet) {
            warn!("OWTP: dropping response {} from {} with bad signature", packet.nonce, pid);
            return;
        }

        let session = self.session_key(&pid);
        let response = match peer.auth().decrypt_data_packet(&mut packet, session.as_ref()) {
            Ok(()) => serde_json::from_value::<Response>(packet.data.clone()).unwrap_or_else(|e| {
                Response::error(StatusCode::BadRequest, format!("malformed response: {e}"))
            }),
            Err(e) => {
                warn!("OWTP: cannot decrypt response from {}: {}", pid, e);
                self.drop_session_key(&pid);
                Response::error(StatusCode::SecretKeyInvalid, e.to_string())
            }
        };
        let mut ctx = Context::new(pid.as_str(), &packet, Some(Arc::clone(&self.peerstore)));
        ctx.resp = response;
        self.mux.serve_owtp(&pid, &mut ctx);
    }
}

#[async_trait]
impl PeerHandler for NodeInner {
    async fn on_packet(&self, peer: Arc<dyn Peer>, packet: DataPacket) {
        if packet.is_request() {
            self.handle_request(peer, packet).await;
        } else {
            self.handle_response(peer, packet);
        }
    }

    fn on_peer_closed(&self, peer: Arc<dyn Peer>) {
        let _ = self.events.send(Membership::Leave(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn quick_config() -> NodeConfig {
        NodeConfig {
            request_timeout_ms: 2_000,
            timeout_sweep_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_node_identity_from_private_key() {
        let seed = hex::encode([9u8; 32]);
        let node = OwtpNode::new(NodeConfig {
            private_key: seed.clone(),
            ..quick_config()
        })
        .unwrap();
        assert_eq!(node.node_id(), Certificate::new(Some([9u8; 32])).pid());
        node.close().await;

        assert!(OwtpNode::new(NodeConfig {
            private_key: "not-hex".to_string(),
            ..quick_config()
        })
        .is_err());
    }

    #[tokio::test]
    async fn test_call_unknown_peer() {
        let node = OwtpNode::new(quick_config()).unwrap();
        let err = node.call_sync("nobody", "echo", json!(null)).await.unwrap_err();
        assert!(matches!(err, OwtpError::PeerNotFound(_)));
        node.close().await;
    }

    #[tokio::test]
    async fn test_listen_once_per_transport() {
        let node = OwtpNode::new(quick_config()).unwrap();
        node.listen(ConnectConfig::new(ConnectType::Ws, "127.0.0.1:0"))
            .await
            .unwrap();
        let err = node
            .listen(ConnectConfig::new(ConnectType::Ws, "127.0.0.1:0"))
            .await
            .unwrap_err();
        assert!(matches!(err, OwtpError::AlreadyListening(ConnectType::Ws)));
        assert!(node.listen_addr(ConnectType::Ws).await.is_some());
        assert!(node.listen_addr(ConnectType::Http).await.is_none());
        node.close().await;
    }

    #[tokio::test]
    async fn test_mq_without_broker_dials_amqp() {
        let node = OwtpNode::new(quick_config()).unwrap();
        let mut config = ConnectConfig::new(ConnectType::Mq, "127.0.0.1:1");
        config.receive_queue = "wallet.server".to_string();
        let err = node.listen(config.clone()).await.unwrap_err();
        assert!(matches!(err, OwtpError::Mq(_)));
        assert!(node.listen_addr(ConnectType::Mq).await.is_none());

        // Same broker and account share one connection attempt
        node.inner.broker(&config).unwrap();
        node.inner.broker(&config).unwrap();
        assert_eq!(node.inner.amqp.len(), 1);
        config.account = "other".to_string();
        node.inner.broker(&config).unwrap();
        assert_eq!(node.inner.amqp.len(), 2);

        let err = node
            .listen(ConnectConfig::new(ConnectType::Mq, ""))
            .await
            .unwrap_err();
        assert!(matches!(err, OwtpError::Config(_)));
        node.close().await;
    }

    #[tokio::test]
    async fn test_closed_node_rejects_work() {
        let node = OwtpNode::new(quick_config()).unwrap();
        node.close().await;
        node.close().await;
        let err = node
            .listen(ConnectConfig::new(ConnectType::Ws, "127.0.0.1:0"))
            .await
            .unwrap_err();
        assert!(matches!(err, OwtpError::NodeClosed));
    }
}
