//! Method routing and outbound request correlation.
//!
//! Inbound requests are routed to the handler registered for their method.
//! Outbound requests are queued per peer and nonce until exactly one of a
//! matching response, the timeout sweep or a disconnect flush resolves them.

use crate::peerstore::Peerstore;
use dashmap::DashMap;
use owtp_types::{DataPacket, PacketKind, Response, StatusCode};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Application handler for one method.
pub type HandlerFunc = Arc<dyn Fn(&mut Context) + Send + Sync>;

/// Callback receiving the outcome of an asynchronous call.
pub type ResponseCallback = Box<dyn FnOnce(Response) + Send>;

/// Prefix separating handler session values from reserved peerstore keys.
const SESSION_PREFIX: &str = "session.";

/// Per-packet dispatch context handed to handlers.
pub struct Context {
    pub peer_id: String,
    pub method: String,
    pub nonce: u64,
    pub kind: PacketKind,
    /// Decoded request params.
    pub params: Value,
    /// Response under construction for requests; the received response
    /// for responses.
    pub resp: Response,
    peerstore: Option<Arc<dyn Peerstore>>,
}

impl Context {
    /// Context for a decoded (plaintext) packet.
    pub fn new(
        peer_id: impl Into<String>,
        packet: &DataPacket,
        peerstore: Option<Arc<dyn Peerstore>>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            method: packet.method.clone(),
            nonce: packet.nonce,
            kind: packet.kind,
            params: if packet.is_request() {
                packet.data.clone()
            } else {
                Value::Null
            },
            resp: Response::default(),
            peerstore,
        }
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Set the response returned to the caller.
    pub fn response(&mut self, result: Value, status: u64, msg: impl Into<String>) {
        self.resp = Response::new(status, msg, result);
    }

    /// Read a value the application stored for this peer.
    pub fn session(&self, key: &str) -> Option<Value> {
        self.peerstore
            .as_ref()
            .and_then(|s| s.get(&self.peer_id, &format!("{SESSION_PREFIX}{key}")))
    }

    pub fn set_session(&self, key: &str, value: Value) {
        if let Some(store) = &self.peerstore {
            store.put(&self.peer_id, &format!("{SESSION_PREFIX}{key}"), value);
        }
    }

    pub fn delete_session(&self, key: &str) {
        if let Some(store) = &self.peerstore {
            store.delete(&self.peer_id, &format!("{SESSION_PREFIX}{key}"));
        }
    }
}

/// How an outstanding call is resolved.
pub enum Resolver {
    /// A caller blocked on the receiving end.
    Sync(oneshot::Sender<Response>),
    /// A callback fired from the task that resolves the call.
    Async(ResponseCallback),
}

impl Resolver {
    pub(crate) fn resolve(self, response: Response) {
        match self {
            Resolver::Sync(tx) => {
                let _ = tx.send(response);
            }
            Resolver::Async(callback) => callback(response),
        }
    }
}

struct RequestEntry {
    method: String,
    submitted: Instant,
    resolver: Resolver,
}

/// Rejects stale, duplicate or missing nonces per peer.
///
/// Packet timestamps have second resolution, so a packet is fresh while its
/// `t` is within the window, rounded up to whole seconds plus one, of the
/// local clock in either direction. A nonce is remembered for as long as a
/// packet carrying it could still pass as fresh.
#[derive(Debug)]
pub struct ReplayGuard {
    window_secs: i64,
    seen: DashMap<String, HashMap<u64, Instant>>,
}

impl ReplayGuard {
    pub fn new(window: Duration) -> Self {
        let window_secs = window.as_secs_f64().ceil() as i64 + 1;
        Self {
            window_secs,
            seen: DashMap::new(),
        }
    }

    fn retention(&self) -> Duration {
        Duration::from_secs(2 * self.window_secs as u64 + 1)
    }

    /// Whether a packet stamped `timestamp` is inside the window.
    pub fn is_fresh(&self, timestamp: i64) -> bool {
        (chrono::Utc::now().timestamp() - timestamp).abs() <= self.window_secs
    }

    /// Record `nonce` for `pid`; false if it is 0, stale or already seen.
    pub fn check(&self, pid: &str, nonce: u64, timestamp: i64) -> bool {
        if nonce == 0 || !self.is_fresh(timestamp) {
            return false;
        }
        let retention = self.retention();
        let mut seen = self.seen.entry(pid.to_string()).or_default();
        seen.retain(|_, at| at.elapsed() < retention);
        if seen.contains_key(&nonce) {
            return false;
        }
        seen.insert(nonce, Instant::now());
        true
    }

    /// Forget expired nonces and peers with none left. Returns how many
    /// peers are still tracked.
    pub fn prune(&self) -> usize {
        let retention = self.retention();
        self.seen.retain(|_, nonces| {
            nonces.retain(|_, at| at.elapsed() < retention);
            !nonces.is_empty()
        });
        self.seen.len()
    }
}

/// Per-node router and request queue.
pub struct ServeMux {
    handlers: RwLock<HashMap<String, HandlerFunc>>,
    requests: Mutex<HashMap<String, HashMap<u64, RequestEntry>>>,
    timeout: Duration,
    replay: ReplayGuard,
}

impl ServeMux {
    /// Requests older than `timeout` are resolved with `RequestTimeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            timeout,
            replay: ReplayGuard::new(timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Register the handler for `method`.
    ///
    /// # Panics
    ///
    /// Panics if `method` already has a handler.
    pub fn handle_func<F>(&self, method: &str, handler: F)
    where
        F: Fn(&mut Context) + Send + Sync + 'static,
    {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if handlers.contains_key(method) {
            panic!("owtp: multiple registrations for method '{method}'");
        }
        handlers.insert(method.to_string(), Arc::new(handler));
    }

    pub fn has_handler(&self, method: &str) -> bool {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.contains_key(method)
    }

    /// Record an inbound request nonce; false when the packet is stale or
    /// replayed.
    pub fn check_replay(&self, pid: &str, nonce: u64, timestamp: i64) -> bool {
        self.replay.check(pid, nonce, timestamp)
    }

    /// Queue an outstanding call.
    pub fn add_request(
        &self,
        pid: &str,
        nonce: u64,
        method: &str,
        resolver: Resolver,
    ) -> Result<(), owtp_types::OwtpError> {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let queue = requests.entry(pid.to_string()).or_default();
        if queue.contains_key(&nonce) {
            return Err(owtp_types::OwtpError::NonceExists {
                pid: pid.to_string(),
                nonce,
            });
        }
        queue.insert(
            nonce,
            RequestEntry {
                method: method.to_string(),
                submitted: Instant::now(),
                resolver,
            },
        );
        Ok(())
    }

    /// Remove a queued call without resolving it. Returns whether it was
    /// still queued.
    pub fn remove_request(&self, pid: &str, nonce: u64) -> bool {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let Some(queue) = requests.get_mut(pid) else {
            return false;
        };
        let removed = queue.remove(&nonce).is_some();
        if queue.is_empty() {
            requests.remove(pid);
        }
        removed
    }

    /// Resolve every call queued for `pid` with `NetworkDisconnected`.
    pub fn reset_request_queue(&self, pid: &str) -> usize {
        let queue = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            requests.remove(pid).unwrap_or_default()
        };
        let count = queue.len();
        if count > 0 {
            info!(pid, count, "OWTP: flushing pending requests of disconnected peer");
        }
        for (_, entry) in queue {
            entry
                .resolver
                .resolve(Response::from_status(StatusCode::NetworkDisconnected));
        }
        count
    }

    /// Number of calls queued for `pid`.
    pub fn pending_count(&self, pid: &str) -> usize {
        let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.get(pid).map(|q| q.len()).unwrap_or(0)
    }

    /// Dispatch a decoded packet.
    ///
    /// Requests run their handler inline and leave the result in
    /// `ctx.resp`. Responses resolve the matching queued call. A response
    /// whose method differs from the queued call is dropped and the call
    /// stays queued until it times out.
    pub fn serve_owtp(&self, pid: &str, ctx: &mut Context) {
        match ctx.kind {
            PacketKind::Request => self.serve_request(ctx),
            PacketKind::Response => self.serve_response(pid, ctx),
        }
    }

    fn serve_request(&self, ctx: &mut Context) {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&ctx.method).cloned()
        };
        let Some(handler) = handler else {
            debug!(method = %ctx.method, peer = %ctx.peer_id, "OWTP: method not found");
            ctx.resp = Response::error(
                StatusCode::NotFoundMethod,
                format!("can not find method '{}'", ctx.method),
            );
            return;
        };

        if catch_unwind(AssertUnwindSafe(|| handler(ctx))).is_err() {
            error!(method = %ctx.method, peer = %ctx.peer_id, "OWTP: handler panicked");
            ctx.resp = Response::error(
                StatusCode::InternalServerError,
                format!("handler for '{}' panicked", ctx.method),
            );
        }
    }

    fn serve_response(&self, pid: &str, ctx: &mut Context) {
        let entry = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            let Some(queue) = requests.get_mut(pid) else {
                debug!(pid, nonce = ctx.nonce, "OWTP: response for unknown request dropped");
                return;
            };
            match queue.get(&ctx.nonce) {
                None => {
                    debug!(pid, nonce = ctx.nonce, "OWTP: response for unknown request dropped");
                    return;
                }
                Some(entry) if entry.method != ctx.method => {
                    warn!(
                        pid,
                        nonce = ctx.nonce,
                        expected = %entry.method,
                        got = %ctx.method,
                        "OWTP: response method differs from request, dropped"
                    );
                    return;
                }
                Some(_) => {}
            }
            let entry = queue.remove(&ctx.nonce);
            if queue.is_empty() {
                requests.remove(pid);
            }
            entry
        };

        if let Some(entry) = entry {
            entry.resolver.resolve(ctx.resp.clone());
        }
    }

    /// Resolve every call older than the timeout. Returns how many expired.
    pub fn evict_expired(&self) -> usize {
        let expired: Vec<RequestEntry> = {
            let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            let mut expired = Vec::new();
            for queue in requests.values_mut() {
                let stale: Vec<u64> = queue
                    .iter()
                    .filter(|(_, entry)| entry.submitted.elapsed() >= self.timeout)
                    .map(|(nonce, _)| *nonce)
                    .collect();
                for nonce in stale {
                    if let Some(entry) = queue.remove(&nonce) {
                        expired.push(entry);
                    }
                }
            }
            requests.retain(|_, queue| !queue.is_empty());
            expired
        };

        let count = expired.len();
        for entry in expired {
            debug!(method = %entry.method, "OWTP: request timed out");
            entry
                .resolver
                .resolve(Response::from_status(StatusCode::RequestTimeout));
        }
        count
    }

    /// Run [`Self::evict_expired`] every `interval` until `shutdown` flips.
    pub fn spawn_timeout_sweep(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let mux = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        mux.evict_expired();
                        mux.replay.prune();
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("OWTP: timeout sweep stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request_ctx(method: &str, params: Value) -> Context {
        let packet = DataPacket::request(method, 1, params);
        Context::new("peer-a", &packet, None)
    }

    fn response_ctx(method: &str, nonce: u64, resp: Response) -> Context {
        let req = DataPacket::request(method, nonce, Value::Null);
        let packet = DataPacket::response_to(&req, &resp);
        let mut ctx = Context::new("peer-a", &packet, None);
        ctx.resp = resp;
        ctx
    }

    fn counting_callback(counter: &Arc<AtomicUsize>, seen: &Arc<Mutex<Vec<u64>>>) -> Resolver {
        let counter = Arc::clone(counter);
        let seen = Arc::clone(seen);
        Resolver::Async(Box::new(move |resp| {
            counter.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().push(resp.status);
        }))
    }

    #[test]
    fn test_request_dispatch() {
        let mux = ServeMux::new(Duration::from_secs(60));
        mux.handle_func("echo", |ctx| {
            let params = ctx.params().clone();
            ctx.response(params, 200, "success");
        });
        let mut ctx = request_ctx("echo", json!({"x": 1}));
        mux.serve_owtp("peer-a", &mut ctx);
        assert_eq!(ctx.resp.status, 200);
        assert_eq!(ctx.resp.result, json!({"x": 1}));
    }

    #[test]
    fn test_unknown_method() {
        let mux = ServeMux::new(Duration::from_secs(60));
        let called = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&called);
        mux.handle_func("echo", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        let mut ctx = request_ctx("doesNotExist", json!({}));
        mux.serve_owtp("peer-a", &mut ctx);
        assert_eq!(ctx.resp.status, 404);
        assert_eq!(called.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "multiple registrations")]
    fn test_duplicate_registration_panics() {
        let mux = ServeMux::new(Duration::from_secs(60));
        mux.handle_func("echo", |_| {});
        mux.handle_func("echo", |_| {});
    }

    #[test]
    fn test_handler_panic_becomes_internal_error() {
        let mux = ServeMux::new(Duration::from_secs(60));
        mux.handle_func("boom", |_| panic!("handler failure"));
        let mut ctx = request_ctx("boom", Value::Null);
        mux.serve_owtp("peer-a", &mut ctx);
        assert_eq!(ctx.resp.status, 500);
    }

    #[test]
    fn test_nonce_exists() {
        let mux = ServeMux::new(Duration::from_secs(60));
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        mux.add_request("peer-a", 5, "echo", Resolver::Sync(tx1)).unwrap();
        let err = mux
            .add_request("peer-a", 5, "echo", Resolver::Sync(tx2))
            .unwrap_err();
        assert!(matches!(err, owtp_types::OwtpError::NonceExists { nonce: 5, .. }));
        // Same nonce for another peer is fine
        let (tx3, _rx3) = oneshot::channel();
        mux.add_request("peer-b", 5, "echo", Resolver::Sync(tx3)).unwrap();
    }

    #[test]
    fn test_response_resolves_exactly_once() {
        let mux = ServeMux::new(Duration::from_millis(0));
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        mux.add_request("peer-a", 10, "echo", counting_callback(&counter, &seen))
            .unwrap();

        let mut ctx = response_ctx("echo", 10, Response::success(json!(1)));
        mux.serve_owtp("peer-a", &mut ctx);
        // Late duplicate response, expiry and disconnect flush are no-ops now
        let mut dup = response_ctx("echo", 10, Response::success(json!(2)));
        mux.serve_owtp("peer-a", &mut dup);
        assert_eq!(mux.evict_expired(), 0);
        assert_eq!(mux.reset_request_queue("peer-a"), 0);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![200]);
    }

    #[tokio::test]
    async fn test_sync_resolution() {
        let mux = ServeMux::new(Duration::from_secs(60));
        let (tx, rx) = oneshot::channel();
        mux.add_request("peer-a", 11, "echo", Resolver::Sync(tx)).unwrap();
        let mut ctx = response_ctx("echo", 11, Response::success(json!({"ok": true})));
        mux.serve_owtp("peer-a", &mut ctx);
        let resp = rx.await.unwrap();
        assert_eq!(resp.result, json!({"ok": true}));
        assert_eq!(mux.pending_count("peer-a"), 0);
    }

    #[test]
    fn test_method_mismatch_is_dropped_and_times_out() {
        let mux = ServeMux::new(Duration::from_millis(30));
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        mux.add_request("peer-a", 12, "getBalance", counting_callback(&counter, &seen))
            .unwrap();

        let mut ctx = response_ctx("getAddress", 12, Response::success(json!("x")));
        mux.serve_owtp("peer-a", &mut ctx);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(mux.pending_count("peer-a"), 1);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(mux.evict_expired(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(*seen.lock().unwrap(), vec![408]);
    }

    #[test]
    fn test_reset_flushes_with_disconnected() {
        let mux = ServeMux::new(Duration::from_secs(60));
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        for nonce in 1..=3 {
            mux.add_request("peer-a", nonce, "echo", counting_callback(&counter, &seen))
                .unwrap();
        }
        mux.add_request("peer-b", 1, "echo", counting_callback(&counter, &seen))
            .unwrap();

        assert_eq!(mux.reset_request_queue("peer-a"), 3);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(seen.lock().unwrap().iter().all(|s| *s == 430));
        assert_eq!(mux.pending_count("peer-b"), 1);
    }

    #[test]
    fn test_remove_request() {
        let mux = ServeMux::new(Duration::from_secs(60));
        let (tx, _rx) = oneshot::channel();
        mux.add_request("peer-a", 1, "echo", Resolver::Sync(tx)).unwrap();
        assert!(mux.remove_request("peer-a", 1));
        assert!(!mux.remove_request("peer-a", 1));
        assert_eq!(mux.evict_expired(), 0);
    }

    #[tokio::test]
    async fn test_timeout_sweep_bounds() {
        let timeout = Duration::from_millis(200);
        let sweep = Duration::from_millis(50);
        let mux = Arc::new(ServeMux::new(timeout));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _task = mux.spawn_timeout_sweep(sweep, shutdown_rx);

        let (tx, rx) = oneshot::channel();
        let started = Instant::now();
        mux.add_request("peer-a", 1, "echo", Resolver::Sync(tx)).unwrap();
        let resp = rx.await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(resp.status, 408);
        assert!(elapsed >= timeout, "resolved too early: {elapsed:?}");
        assert!(
            elapsed <= timeout + sweep + Duration::from_millis(100),
            "resolved too late: {elapsed:?}"
        );
    }

    #[test]
    fn test_replay_guard() {
        let now = chrono::Utc::now().timestamp();
        let guard = ReplayGuard::new(Duration::from_secs(60));
        assert!(!guard.check("peer-a", 0, now));
        assert!(guard.check("peer-a", 77, now));
        assert!(!guard.check("peer-a", 77, now));
        assert!(guard.check("peer-b", 77, now));
    }

    #[test]
    fn test_replay_guard_rejects_stale_timestamps() {
        let now = chrono::Utc::now().timestamp();
        let guard = ReplayGuard::new(Duration::from_millis(300));
        assert!(!guard.check("peer-a", 5, now - 3_600));
        assert!(!guard.check("peer-a", 6, now + 3_600));
        // One second of truncation on top of the rounded-up window
        assert!(guard.check("peer-a", 7, now - 1));
        assert!(!guard.check("peer-a", 8, now - 4));
        // A stale packet does not burn its nonce
        assert!(guard.check("peer-a", 5, now));
    }

    #[test]
    fn test_replay_guard_prune_drops_idle_peers() {
        let now = chrono::Utc::now().timestamp();
        let guard = ReplayGuard::new(Duration::from_secs(1));
        guard.check("peer-a", 1, now);
        guard.check("peer-b", 1, now);
        assert_eq!(guard.prune(), 2);
        guard.seen.alter_all(|_, mut nonces| {
            for at in nonces.values_mut() {
                *at = at.checked_sub(Duration::from_secs(60)).unwrap();
            }
            nonces
        });
        assert_eq!(guard.prune(), 0);
    }

    #[test]
    fn test_context_sessions() {
        let store: Arc<dyn Peerstore> = Arc::new(crate::peerstore::MemoryPeerstore::new());
        let packet = DataPacket::request("login", 1, Value::Null);
        let ctx = Context::new("peer-a", &packet, Some(Arc::clone(&store)));
        ctx.set_session("user", json!("alice"));
        assert_eq!(ctx.session("user"), Some(json!("alice")));
        // Stored under a namespaced key
        assert!(store.get("peer-a", "user").is_none());
        ctx.delete_session("user");
        assert!(ctx.session("user").is_none());
    }
}
