use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use modweave_protocol::{
    Envelope, IdAllocator, PayloadCodec, PromiseBody, PromiseStatus, WireError,
};

use crate::{
    ContextRole, DEFAULT_PROMISE_TIMEOUT, Error, HANDSHAKE_DEADLINE, HANDSHAKE_PING_INTERVAL,
    INIT_EVENT, Result,
};

/// The broadcast bus the three contexts share. Buffers are codec output;
/// nothing readable travels in the clear.
pub type BusSender = broadcast::Sender<Vec<u32>>;

/// Session settings exchanged during the init handshake.
pub type HandshakeSettings = Value;

pub fn broadcast_bus(capacity: usize) -> BusSender {
    broadcast::channel(capacity).0
}

type PromiseFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;
type PromiseHandler = Arc<dyn Fn(Value) -> PromiseFuture + Send + Sync>;
type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

type Settlement = std::result::Result<Value, WireError>;

struct Shared {
    role: ContextRole,
    signature: i32,
    codec: PayloadCodec,
    bus: BusSender,
    ids: Mutex<IdAllocator>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Settlement>>>,
    promise_handlers: Mutex<HashMap<String, PromiseHandler>>,
    message_handlers: Mutex<HashMap<String, MessageHandler>>,
    handshake_pong: Mutex<Option<oneshot::Sender<()>>>,
    handshake_ping: Mutex<Option<oneshot::Sender<Value>>>,
    /// Set once this context arms itself as a handshake acceptor; from
    /// then on every observed ping gets a pong, matching the original
    /// responder that keeps answering for late joiners.
    acceptor: AtomicBool,
}

/// One context's endpoint on the bus.
///
/// Fire-and-forget messages go out with [`EventHandler::send_message`];
/// correlated requests with [`EventHandler::send_promise`], which settles
/// exactly once: resolved, rejected, or timed out locally.
pub struct EventHandler {
    shared: Arc<Shared>,
    listen: JoinHandle<()>,
}

impl EventHandler {
    /// Binds a context role to the bus. The returned handler immediately
    /// listens; normal traffic should wait for the handshake.
    pub fn new(role: ContextRole, bus: BusSender, codec: PayloadCodec) -> Self {
        let shared = Arc::new(Shared {
            role,
            signature: role.signature(),
            codec,
            ids: Mutex::new(IdAllocator::new(role.id_range())),
            pending: Mutex::new(HashMap::new()),
            promise_handlers: Mutex::new(HashMap::new()),
            message_handlers: Mutex::new(HashMap::new()),
            handshake_pong: Mutex::new(None),
            handshake_ping: Mutex::new(None),
            acceptor: AtomicBool::new(false),
            bus,
        });
        let rx = shared.bus.subscribe();
        let listen = tokio::spawn(listen_loop(Arc::clone(&shared), rx));
        Self { shared, listen }
    }

    pub fn role(&self) -> ContextRole {
        self.shared.role
    }

    /// Registers the async responder for one promise kind. A handler
    /// error becomes a rejected-status reply, never a dropped envelope.
    pub fn on_promise<F, Fut>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let wrapped: PromiseHandler =
            Arc::new(move |data| Box::pin(handler(data)) as PromiseFuture);
        if let Ok(mut handlers) = self.shared.promise_handlers.lock() {
            handlers.insert(kind.into(), wrapped);
        }
    }

    /// Registers the listener for one fire-and-forget kind.
    pub fn on_message<F>(&self, kind: impl Into<String>, handler: F)
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if let Ok(mut handlers) = self.shared.message_handlers.lock() {
            handlers.insert(kind.into(), Arc::new(handler));
        }
    }

    pub fn send_message(&self, kind: impl Into<String>, data: Value) {
        self.shared
            .send_envelope(&Envelope::message(kind, data, self.shared.signature));
    }

    /// Correlated request with the default 30 s deadline.
    pub async fn send_promise(&self, kind: &str, data: Value) -> Result<Value> {
        self.send_promise_with_timeout(kind, data, Some(DEFAULT_PROMISE_TIMEOUT))
            .await
    }

    /// Correlated request. `None` waits indefinitely (user-gesture
    /// driven calls). On timeout the id returns to the pool and a late
    /// reply is dropped.
    pub async fn send_promise_with_timeout(
        &self,
        kind: &str,
        data: Value,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = {
            let Ok(mut ids) = self.shared.ids.lock() else {
                return Err(Error::BusClosed);
            };
            ids.next().ok_or(Error::IdsExhausted)?
        };
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, tx);
        }
        self.shared.send_envelope(&Envelope::promise(
            kind,
            PromiseBody::pending(id, data),
            self.shared.signature,
        ));

        let settled = match timeout {
            Some(deadline) => match tokio::time::timeout(deadline, rx).await {
                Ok(settled) => settled,
                Err(_) => {
                    self.shared.forget(id);
                    return Err(Error::timeout(kind));
                }
            },
            None => rx.await,
        };
        match settled {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(wire)) => Err(Error::Remote(wire)),
            Err(_) => Err(Error::BusClosed),
        }
    }

    /// Broadcasts an init ping once per second until a pong addressed to
    /// this role arrives. Fails after the handshake deadline.
    pub async fn handshake_initiate(&self, settings: HandshakeSettings) -> Result<()> {
        let (tx, mut rx) = oneshot::channel();
        if let Ok(mut slot) = self.shared.handshake_pong.lock() {
            *slot = Some(tx);
        }
        let ping = Envelope::message(
            INIT_EVENT,
            json!({"type": "ping", "from": self.shared.role.name(), "settings": settings}),
            self.shared.signature,
        );
        let deadline = tokio::time::Instant::now() + HANDSHAKE_DEADLINE;
        loop {
            self.shared.send_envelope(&ping);
            tokio::select! {
                observed = &mut rx => {
                    return observed.map_err(|_| Error::BusClosed);
                }
                _ = tokio::time::sleep(HANDSHAKE_PING_INTERVAL) => {
                    if tokio::time::Instant::now() >= deadline {
                        if let Ok(mut slot) = self.shared.handshake_pong.lock() {
                            slot.take();
                        }
                        return Err(Error::HandshakeFailed);
                    }
                }
            }
        }
    }

    /// Waits for an init ping, answering it (and every later ping) with
    /// a pong. Resolves to the initiator's session settings.
    pub async fn handshake_accept(&self) -> Result<HandshakeSettings> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut slot) = self.shared.handshake_ping.lock() {
            *slot = Some(tx);
        }
        self.shared.acceptor.store(true, Ordering::Release);
        let ping = rx.await.map_err(|_| Error::BusClosed)?;
        Ok(ping.get("settings").cloned().unwrap_or(Value::Null))
    }

    /// Correlation ids currently outstanding (test observability).
    pub fn outstanding_ids(&self) -> usize {
        self.shared
            .ids
            .lock()
            .map(|ids| ids.outstanding())
            .unwrap_or(0)
    }
}

impl Drop for EventHandler {
    fn drop(&mut self) {
        self.listen.abort();
    }
}

impl Shared {
    fn send_envelope(&self, envelope: &Envelope) {
        let payload = match serde_json::to_string(envelope) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(target: "modweave_bus::send", "unserializable envelope: {error}");
                return;
            }
        };
        let _ = self.bus.send(self.codec.encode(&payload));
    }

    /// Frees a timed-out id so a late reply finds nothing to settle.
    fn forget(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        if let Ok(mut ids) = self.ids.lock() {
            ids.release(id);
        }
    }

    fn settle(&self, id: u64, outcome: Settlement) {
        if !self.role.id_range().contains(id) {
            // Another role's exchange; the bus shows us everything.
            return;
        }
        let waiter = match self.pending.lock() {
            Ok(mut pending) => pending.remove(&id),
            Err(_) => None,
        };
        if let Ok(mut ids) = self.ids.lock() {
            ids.release(id);
        }
        match waiter {
            // The waiter may have given up between settle and delivery;
            // that is the timeout's race to lose, not an error.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => {
                debug!(
                    target: "modweave_bus::handler",
                    id,
                    role = self.role.name(),
                    "late reply for a freed id dropped"
                );
            }
        }
    }

    fn handle_init(self: &Arc<Self>, data: Value) {
        match data.get("type").and_then(Value::as_str) {
            Some("ping") => {
                if let Ok(mut slot) = self.handshake_ping.lock() {
                    if let Some(tx) = slot.take() {
                        let _ = tx.send(data.clone());
                    }
                }
                if self.acceptor.load(Ordering::Acquire) {
                    let to = data.get("from").cloned().unwrap_or(Value::Null);
                    self.send_envelope(&Envelope::message(
                        INIT_EVENT,
                        json!({"type": "pong", "from": self.role.name(), "to": to}),
                        self.signature,
                    ));
                }
            }
            Some("pong") => {
                let addressed_here = data.get("to").and_then(Value::as_str)
                    == Some(self.role.name());
                if !addressed_here {
                    return;
                }
                if let Ok(mut slot) = self.handshake_pong.lock() {
                    if let Some(tx) = slot.take() {
                        let _ = tx.send(());
                    }
                }
            }
            _ => debug!(target: "modweave_bus::handler", "malformed init event ignored"),
        }
    }

    fn handle_pending(self: &Arc<Self>, kind: String, body: PromiseBody) {
        let handler = match self.promise_handlers.lock() {
            Ok(handlers) => handlers.get(&kind).cloned(),
            Err(_) => None,
        };
        let Some(handler) = handler else {
            // Not this context's kind; some other participant answers.
            debug!(target: "modweave_bus::handler", kind = %kind, "no responder here");
            return;
        };
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let id = body.payload.id;
            let reply = match handler(body.payload.data).await {
                Ok(data) => PromiseBody::resolved(id, data),
                Err(error) => PromiseBody::rejected(
                    id,
                    WireError::new(error.to_string(), format!("{error:?}")),
                ),
            };
            shared.send_envelope(&Envelope::promise(kind, reply, shared.signature));
        });
    }

    fn dispatch(self: &Arc<Self>, buffer: Vec<u32>) {
        let payload = match self.codec.decode(&buffer) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(target: "modweave_bus::handler", "undecodable buffer ignored: {error}");
                return;
            }
        };
        let envelope: Envelope = match serde_json::from_str(&payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(target: "modweave_bus::handler", "unparsable envelope ignored: {error}");
                return;
            }
        };
        if envelope.signature == self.signature {
            return;
        }
        if envelope.kind == INIT_EVENT {
            self.handle_init(envelope.data.unwrap_or(Value::Null));
            return;
        }
        match envelope.promise {
            Some(body) => match body.status {
                PromiseStatus::Pending => self.handle_pending(envelope.kind, body),
                PromiseStatus::Resolved => {
                    self.settle(body.payload.id, Ok(body.data.unwrap_or(Value::Null)));
                }
                PromiseStatus::Rejected => {
                    self.settle(body.payload.id, Err(body.error.unwrap_or_default()));
                }
            },
            None => {
                let handler = match self.message_handlers.lock() {
                    Ok(handlers) => handlers.get(&envelope.kind).cloned(),
                    Err(_) => None,
                };
                match handler {
                    Some(handler) => handler(envelope.data.unwrap_or(Value::Null)),
                    None => {
                        debug!(target: "modweave_bus::handler", kind = %envelope.kind, "unhandled message")
                    }
                }
            }
        }
    }
}

async fn listen_loop(shared: Arc<Shared>, mut rx: broadcast::Receiver<Vec<u32>>) {
    loop {
        match rx.recv().await {
            Ok(buffer) => shared.dispatch(buffer),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(target: "modweave_bus::handler", missed, "bus receiver lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn codec() -> PayloadCodec {
        PayloadCodec::new("test-session", "pack-key")
    }

    fn pair() -> (EventHandler, EventHandler) {
        let bus = broadcast_bus(64);
        let controller = EventHandler::new(ContextRole::Controller, bus.clone(), codec());
        let relay = EventHandler::new(ContextRole::Relay, bus, codec());
        (controller, relay)
    }

    #[tokio::test]
    async fn promise_resolves_across_the_bus() {
        let (controller, relay) = pair();
        relay.on_promise("status", |data| async move {
            Ok(json!({"echo": data, "working": true}))
        });

        let reply = controller
            .send_promise("status", json!("hello"))
            .await
            .expect("resolved");
        assert_eq!(reply["echo"], "hello");
        assert_eq!(reply["working"], true);
        assert_eq!(controller.outstanding_ids(), 0);
    }

    #[tokio::test]
    async fn handler_error_becomes_a_remote_rejection() {
        let (controller, relay) = pair();
        relay.on_promise("explode", |_| async move {
            Err(anyhow::anyhow!("handler blew up"))
        });

        let err = controller
            .send_promise("explode", Value::Null)
            .await
            .expect_err("rejected");
        match err {
            Error::Remote(wire) => assert_eq!(wire.message, "handler blew up"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(controller.outstanding_ids(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_reaches_the_other_context() {
        let (controller, relay) = pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        relay.on_message("extract-mod", move |data| {
            assert_eq!(data, json!(42));
            seen.fetch_add(1, Ordering::SeqCst);
        });

        controller.send_message("extract-mod", json!(42));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn own_broadcasts_are_filtered_by_signature() {
        let bus = broadcast_bus(64);
        let relay_a = EventHandler::new(ContextRole::Relay, bus.clone(), codec());
        let relay_b = EventHandler::new(ContextRole::Relay, bus.clone(), codec());
        let agent = EventHandler::new(ContextRole::Agent, bus, codec());

        let relay_hits = Arc::new(AtomicUsize::new(0));
        let agent_hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&relay_hits);
        relay_b.on_message("ping", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::clone(&agent_hits);
        agent.on_message("ping", move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        relay_a.send_message("ping", Value::Null);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Same-role instances share a signature and drop the broadcast.
        assert_eq!(relay_hits.load(Ordering::SeqCst), 0);
        assert_eq!(agent_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_frees_the_id_and_drops_the_late_reply() {
        let (controller, relay) = pair();
        relay.on_promise("slow", |_| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(json!("too late"))
        });

        let err = controller
            .send_promise_with_timeout("slow", Value::Null, Some(Duration::from_millis(100)))
            .await
            .expect_err("timed out");
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(controller.outstanding_ids(), 0);

        // Let the late reply land; it must be dropped without settling
        // anything, and the id stays free.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(controller.outstanding_ids(), 0);

        relay.on_promise("fast", |_| async move { Ok(json!("ok")) });
        let reply = controller
            .send_promise("fast", Value::Null)
            .await
            .expect("reused id settles normally");
        assert_eq!(reply, json!("ok"));
    }

    #[tokio::test]
    async fn unanswered_kind_times_out_instead_of_misfiring() {
        let (controller, _relay) = pair();
        let err = controller
            .send_promise_with_timeout("nobody-home", Value::Null, Some(Duration::from_millis(80)))
            .await
            .expect_err("no responder");
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn handshake_completes_regardless_of_start_order() {
        let bus = broadcast_bus(64);
        let relay = EventHandler::new(ContextRole::Relay, bus.clone(), codec());
        let agent = EventHandler::new(ContextRole::Agent, bus, codec());

        // Initiator starts pinging before the acceptor is armed; the
        // 1 s re-broadcast covers the gap.
        let initiate = tokio::spawn(async move {
            relay
                .handshake_initiate(json!({"stealth": "strict"}))
                .await
                .expect("handshake");
            relay
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        let settings = agent.handshake_accept().await.expect("settings");
        assert_eq!(settings["stealth"], "strict");
        initiate.await.expect("join");
    }
}
