//! Message-queue transport.
//!
//! Packets travel as [`MqMessage`] bodies published to (`exchange`,
//! `send_queue`). Every message carries the sender's public key and the
//! queue replies should go to. A host peer consumes its own
//! `receive_queue`; a listener consumes the shared queue and splits it into
//! one inbound peer per sender.

use crate::auth::{derive_pid, parse_public_key, Authorization, Certificate, HEADER_PUBLIC_KEY};
use crate::listener::Listener;
use crate::peer::{dispatch, wait_closed, Peer, PeerHandler, TransportTimings};
use crate::transport::broker::{MqBroker, MqMessage};
use async_trait::async_trait;
use owtp_types::packet::{decode_packet, encode_packet};
use owtp_types::{ConnectConfig, ConnectType, DataPacket, OwtpError, OwtpResult};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{mpsc, watch};
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Header naming the queue the sender consumes.
pub const HEADER_REPLY_TO: &str = "reply-to";
/// Header distinguishing packets from heartbeats.
pub const HEADER_KIND: &str = "x-owtp-kind";

const KIND_PACKET: &str = "packet";
const KIND_HEARTBEAT: &str = "heartbeat";

struct Pipe {
    outbound: mpsc::Receiver<MqMessage>,
    inbound: mpsc::UnboundedReceiver<MqMessage>,
}

/// A peer reached through a message broker.
pub struct MqPeer {
    pid: String,
    is_host: bool,
    config: ConnectConfig,
    auth: Authorization,
    broker: Arc<dyn MqBroker>,
    /// Queue this side consumes, advertised as `reply-to`.
    reply_queue: String,
    timings: TransportTimings,
    handler: Arc<dyn PeerHandler>,
    me: Weak<MqPeer>,
    closed: AtomicBool,
    outbound: mpsc::Sender<MqMessage>,
    pipe: Mutex<Option<Pipe>>,
    shutdown: watch::Sender<bool>,
}

impl MqPeer {
    #[allow(clippy::too_many_arguments)]
    fn new(
        pid: String,
        is_host: bool,
        config: ConnectConfig,
        auth: Authorization,
        broker: Arc<dyn MqBroker>,
        reply_queue: String,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
        inbound: mpsc::UnboundedReceiver<MqMessage>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(config.write_buffer_size.max(1));
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            pid,
            is_host,
            config,
            auth,
            broker,
            reply_queue,
            timings,
            handler,
            me: me.clone(),
            closed: AtomicBool::new(false),
            outbound: tx,
            pipe: Mutex::new(Some(Pipe {
                outbound: rx,
                inbound,
            })),
            shutdown,
        })
    }

    /// Attach to the broker as the host side of a conversation with `pid`.
    pub async fn dial(
        pid: &str,
        config: ConnectConfig,
        cert: Arc<Certificate>,
        broker: Arc<dyn MqBroker>,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
    ) -> OwtpResult<Arc<Self>> {
        if pid.is_empty() {
            return Err(OwtpError::Config("MQ peers must be dialed by peer ID".into()));
        }
        if config.send_queue.is_empty() || config.receive_queue.is_empty() {
            return Err(OwtpError::Config(
                "MQ config needs send_queue and receive_queue".into(),
            ));
        }
        broker.authenticate(&config.account, &config.password).await?;
        let inbound = broker.consume(&config.receive_queue).await?;
        let auth = Authorization::new(cert, config.enable_signature);
        let reply_queue = config.receive_queue.clone();
        info!(
            "OWTP: attached to {} via queues {} / {}",
            pid, config.send_queue, config.receive_queue
        );
        Ok(Self::new(
            pid.to_string(),
            true,
            config,
            auth,
            broker,
            reply_queue,
            timings,
            handler,
            inbound,
        ))
    }

    fn message(&self, kind: &str, body: String) -> MqMessage {
        MqMessage {
            headers: HashMap::from([
                (
                    HEADER_PUBLIC_KEY.to_string(),
                    self.auth.certificate().public_key_hex(),
                ),
                (HEADER_REPLY_TO.to_string(), self.reply_queue.clone()),
                (HEADER_KIND.to_string(), kind.to_string()),
            ]),
            body,
        }
    }

    /// Accept `message` only if it was sent by this peer's identity.
    fn admit(&self, message: &MqMessage) -> bool {
        let Some(key) = message.header(HEADER_PUBLIC_KEY) else {
            return false;
        };
        let Ok(key) = parse_public_key(key) else {
            return false;
        };
        if derive_pid(&key) != self.pid {
            return false;
        }
        if self.auth.remote_public_key().is_none() {
            self.auth.set_remote_public_key(key);
        }
        true
    }
}

#[async_trait]
impl Peer for MqPeer {
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
        self.reply_queue.clone()
    }

    fn remote_addr(&self) -> String {
        self.config.send_queue.clone()
    }

    fn auth(&self) -> &Authorization {
        &self.auth
    }

    async fn send(&self, packet: DataPacket) -> OwtpResult<()> {
        if !self.is_connected() {
            return Err(OwtpError::Disconnected);
        }
        let body = String::from_utf8(encode_packet(&packet)?)
            .map_err(|e| OwtpError::Mq(e.to_string()))?;
        let message = self.message(KIND_PACKET, body);
        match timeout(self.timings.write_timeout, self.outbound.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(OwtpError::Disconnected),
            Err(_) => Err(OwtpError::Mq(format!("outbound queue of {} full", self.pid))),
        }
    }

    async fn open_pipe(&self) -> OwtpResult<()> {
        let pipe = self.pipe.lock().unwrap_or_else(|e| e.into_inner()).take();
        let (Some(pipe), Some(me)) = (pipe, self.me.upgrade()) else {
            return Ok(());
        };
        tokio::spawn(write_pump(
            Arc::clone(&me),
            pipe.outbound,
            self.shutdown.subscribe(),
        ));
        tokio::spawn(read_pump(me, pipe.inbound, self.shutdown.subscribe()));
        Ok(())
    }

    async fn close(&self) -> OwtpResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("OWTP: closing MQ peer {}", self.pid);
        let _ = self.shutdown.send(true);
        self.pipe.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(me) = self.me.upgrade() {
            self.handler.on_peer_closed(me);
        }
        Ok(())
    }
}

async fn write_pump(
    peer: Arc<MqPeer>,
    mut outbound: mpsc::Receiver<MqMessage>,
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
            _ = heartbeat.tick() => peer.message(KIND_HEARTBEAT, String::new()),
            _ = wait_closed(&mut shutdown) => break,
        };
        let publish = peer
            .broker
            .publish(&peer.config.exchange, &peer.config.send_queue, message);
        match timeout(peer.timings.write_timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("OWTP: publish to {} failed: {}", peer.config.send_queue, e);
                break;
            }
            Err(_) => {
                warn!("OWTP: publish to {} timed out", peer.config.send_queue);
                break;
            }
        }
    }
    let _ = peer.close().await;
}

async fn read_pump(
    peer: Arc<MqPeer>,
    mut inbound: mpsc::UnboundedReceiver<MqMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let received = tokio::select! {
            received = timeout(peer.timings.read_timeout, inbound.recv()) => received,
            _ = wait_closed(&mut shutdown) => break,
        };
        let message = match received {
            Err(_) => {
                warn!("OWTP: no message from {} within read deadline", peer.pid);
                break;
            }
            Ok(None) => break,
            Ok(Some(message)) => message,
        };
        if !peer.admit(&message) {
            warn!("OWTP: dropped message on {} from unexpected sender", peer.reply_queue);
            continue;
        }
        if message.header(HEADER_KIND) == Some(KIND_HEARTBEAT) {
            continue;
        }
        match decode_packet(message.body.as_bytes()) {
            Ok(packet) => dispatch(&peer.handler, Arc::clone(&peer) as Arc<dyn Peer>, packet),
            Err(e) => warn!("OWTP: undecodable message from {}: {}", peer.pid, e),
        }
    }
    let _ = peer.close().await;
}

/// Consumes a shared queue and yields one peer per sender.
pub struct MqListener {
    queue: String,
    incoming: tokio::sync::Mutex<mpsc::Receiver<Arc<dyn Peer>>>,
    shutdown: watch::Sender<bool>,
}

impl MqListener {
    pub async fn bind(
        config: ConnectConfig,
        cert: Arc<Certificate>,
        broker: Arc<dyn MqBroker>,
        timings: TransportTimings,
        handler: Arc<dyn PeerHandler>,
    ) -> OwtpResult<Self> {
        if config.enable_ssl {
            return Err(OwtpError::Unsupported("TLS on MQ listeners".into()));
        }
        broker.authenticate(&config.account, &config.password).await?;
        let consumer = broker.consume(&config.receive_queue).await?;
        let (tx, rx) = mpsc::channel(config.read_buffer_size.max(1));
        let (shutdown, _) = watch::channel(false);
        let queue = config.receive_queue.clone();

        info!("OWTP: MQ listener on queue {}", queue);
        tokio::spawn(route_loop(
            consumer,
            config,
            cert,
            broker,
            timings,
            handler,
            tx,
            shutdown.subscribe(),
        ));

        Ok(Self {
            queue,
            incoming: tokio::sync::Mutex::new(rx),
            shutdown,
        })
    }
}

#[async_trait]
impl Listener for MqListener {
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
        self.queue.clone()
    }

    fn connect_type(&self) -> ConnectType {
        ConnectType::Mq
    }
}

#[allow(clippy::too_many_arguments)]
async fn route_loop(
    mut consumer: mpsc::UnboundedReceiver<MqMessage>,
    config: ConnectConfig,
    cert: Arc<Certificate>,
    broker: Arc<dyn MqBroker>,
    timings: TransportTimings,
    handler: Arc<dyn PeerHandler>,
    incoming: mpsc::Sender<Arc<dyn Peer>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut routes: HashMap<String, mpsc::UnboundedSender<MqMessage>> = HashMap::new();
    loop {
        let message = tokio::select! {
            message = consumer.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = wait_closed(&mut shutdown) => break,
        };
        let Some(key) = message.header(HEADER_PUBLIC_KEY).map(str::to_string) else {
            warn!("OWTP: message on {} without sender identity", config.receive_queue);
            continue;
        };
        let remote_key = match parse_public_key(&key) {
            Ok(k) => k,
            Err(e) => {
                warn!("OWTP: bad sender key on {}: {}", config.receive_queue, e);
                continue;
            }
        };
        let pid = derive_pid(&remote_key);

        let message = match routes.get(&pid) {
            Some(route) => match route.send(message) {
                Ok(()) => continue,
                // The previous peer closed; the sender is back
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };
        let Some(reply_to) = message.header(HEADER_REPLY_TO).map(str::to_string) else {
            warn!("OWTP: message from {} without reply-to", pid);
            continue;
        };

        let (route, inbound) = mpsc::unbounded_channel();
        let _ = route.send(message);
        routes.insert(pid.clone(), route);

        let peer_config = ConnectConfig {
            send_queue: reply_to,
            ..config.clone()
        };
        let auth =
            Authorization::with_remote(Arc::clone(&cert), Some(remote_key), config.enable_signature);
        let peer = MqPeer::new(
            pid.clone(),
            false,
            peer_config,
            auth,
            Arc::clone(&broker),
            config.receive_queue.clone(),
            timings,
            Arc::clone(&handler),
            inbound,
        );
        debug!("OWTP: new MQ sender {} on {}", pid, config.receive_queue);
        if let Err(mpsc::error::SendError(peer)) = incoming.send(peer).await {
            let _ = peer.close().await;
            break;
        }
    }
    debug!("OWTP: MQ route loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::broker::MemoryBroker;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct Collect {
        packets: mpsc::UnboundedSender<(String, DataPacket)>,
    }

    #[async_trait]
    impl PeerHandler for Collect {
        async fn on_packet(&self, peer: Arc<dyn Peer>, packet: DataPacket) {
            let _ = self.packets.send((peer.pid().to_string(), packet));
        }

        fn on_peer_closed(&self, _peer: Arc<dyn Peer>) {}
    }

    fn fast_timings() -> TransportTimings {
        TransportTimings {
            heartbeat_interval: Duration::from_millis(50),
            read_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_millis(200),
            http_timeout: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn test_listener_yields_one_peer_per_sender() {
        let broker: Arc<dyn MqBroker> = Arc::new(MemoryBroker::new());
        let server_cert = Arc::new(Certificate::random());
        let client_cert = Arc::new(Certificate::random());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn PeerHandler> = Arc::new(Collect { packets: tx });

        let mut listen = ConnectConfig::new(ConnectType::Mq, "memory");
        listen.receive_queue = "server.in".to_string();
        let listener = MqListener::bind(
            listen,
            Arc::clone(&server_cert),
            Arc::clone(&broker),
            fast_timings(),
            Arc::clone(&handler),
        )
        .await
        .unwrap();

        let mut dial = ConnectConfig::new(ConnectType::Mq, "memory");
        dial.send_queue = "server.in".to_string();
        dial.receive_queue = "client.in".to_string();
        let client = MqPeer::dial(
            server_cert.pid(),
            dial,
            Arc::clone(&client_cert),
            Arc::clone(&broker),
            fast_timings(),
            Arc::clone(&handler),
        )
        .await
        .unwrap();
        client.open_pipe().await.unwrap();

        client
            .send(DataPacket::request("echo", 1, json!({"x": 1})))
            .await
            .unwrap();
        let inbound = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.pid(), client_cert.pid());
        assert!(!inbound.is_host());
        assert_eq!(inbound.connect_config().send_queue, "client.in");
        inbound.open_pipe().await.unwrap();

        let (from, packet) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, client_cert.pid());
        assert_eq!(packet.method, "echo");

        // A second packet is routed to the same peer
        client
            .send(DataPacket::request("echo", 2, json!({"x": 2})))
            .await
            .unwrap();
        let (_, packet) = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(packet.nonce, 2);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), listener.accept())
                .await
                .is_err()
        );

        client.close().await.unwrap();
        listener.close().await.unwrap();
        assert!(matches!(
            listener.accept().await,
            Err(OwtpError::ListenerClosed)
        ));
    }

    #[tokio::test]
    async fn test_dial_requires_queues() {
        let broker: Arc<dyn MqBroker> = Arc::new(MemoryBroker::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn PeerHandler> = Arc::new(Collect { packets: tx });
        let config = ConnectConfig::new(ConnectType::Mq, "memory");
        let err = MqPeer::dial(
            "somepeer",
            config,
            Arc::new(Certificate::random()),
            broker,
            fast_timings(),
            handler,
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, OwtpError::Config(_)));
    }
}
