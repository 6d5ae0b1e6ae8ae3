//! Gateway event loop: admission control, data relay, teardown.
//!
//! A single spawned task owns the [`ConnectionRegistry`] and consumes every
//! session and backend event in arrival order. Session tasks and backend
//! transport tasks never touch the registry themselves; they talk to this
//! loop through channels, which is what makes the admission and teardown
//! logic race-free without a lock in sight.
//!
//! Because events interleave at every await point elsewhere, each handler
//! re-checks registry state instead of assuming it: a `Data` or `Closed`
//! event for a channel that was already torn down is dropped, a close for
//! an unknown session is a no-op, and an admission verdict whose session
//! vanished mid-handshake is discarded without mutating the registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use nodebridge_core::{close, BackendKind, ConnectionKind};

use crate::backend::{BackendEvent, BackendFactory};
use crate::registry::{ChannelKey, ConnectionRegistry, SessionEntry, SessionId};

/// Frames pushed from the gateway to a session task.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutput {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Verdict of the admission step.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Rejected { code: u16, reason: String },
}

/// One authenticated WebSocket session, fully typed at construction.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub site: String,
    pub experiment_id: String,
    pub node: String,
    pub user: String,
    pub kind: ConnectionKind,
}

impl SessionInfo {
    /// The registry channel this session subscribes to. Serial sessions
    /// share one channel per node; SSH sessions each get their own.
    pub fn channel_key(&self) -> ChannelKey {
        match self.kind.backend() {
            BackendKind::Serial => ChannelKey::Serial {
                node: self.node.clone(),
            },
            BackendKind::Ssh => ChannelKey::Ssh {
                node: self.node.clone(),
                session: self.id,
            },
        }
    }
}

/// Connection caps enforced at admission.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    /// Maximum concurrent serial sessions per node.
    pub max_node_sessions: usize,
    /// Maximum concurrent sessions per user, across all nodes.
    pub max_user_sessions: usize,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            max_node_sessions: 2,
            max_user_sessions: 10,
        }
    }
}

enum GatewayEvent {
    SessionOpen {
        info: SessionInfo,
        out: mpsc::UnboundedSender<SessionOutput>,
        reply: oneshot::Sender<Admission>,
    },
    SessionData {
        id: SessionId,
        data: Vec<u8>,
    },
    SessionClosed {
        id: SessionId,
    },
    Shutdown,
}

/// Cloneable handle session tasks use to talk to the gateway loop.
#[derive(Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<GatewayEvent>,
    next_id: Arc<AtomicU64>,
}

impl GatewayHandle {
    pub fn next_session_id(&self) -> SessionId {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Run the admission step for a freshly upgraded session. The reply
    /// channel doubles as the vanish signal: when the session task is gone
    /// before the verdict lands, the gateway skips registration entirely.
    pub async fn open_session(
        &self,
        info: SessionInfo,
        out: mpsc::UnboundedSender<SessionOutput>,
    ) -> Admission {
        let (reply_tx, reply_rx) = oneshot::channel();
        let event = GatewayEvent::SessionOpen {
            info,
            out,
            reply: reply_tx,
        };
        if self.tx.send(event).is_err() {
            return Admission::Rejected {
                code: close::GOING_AWAY,
                reason: "Server is restarting".to_string(),
            };
        }
        reply_rx.await.unwrap_or(Admission::Rejected {
            code: close::GOING_AWAY,
            reason: "Server is restarting".to_string(),
        })
    }

    /// Inbound payload from a session's WebSocket.
    pub fn session_data(&self, id: SessionId, data: Vec<u8>) {
        let _ = self.tx.send(GatewayEvent::SessionData { id, data });
    }

    /// The session's WebSocket closed, locally or remotely.
    pub fn session_closed(&self, id: SessionId) {
        let _ = self.tx.send(GatewayEvent::SessionClosed { id });
    }

    /// Close every tracked session and stop the event loop.
    pub fn shutdown(&self) {
        let _ = self.tx.send(GatewayEvent::Shutdown);
    }
}

/// The gateway composition root: registry + admission policy + backends.
pub struct Gateway {
    registry: ConnectionRegistry,
    policy: AdmissionPolicy,
    factory: Box<dyn BackendFactory>,
    backend_tx: mpsc::UnboundedSender<BackendEvent>,
}

impl Gateway {
    /// Spawn the event loop and return the handle used to feed it.
    pub fn spawn(policy: AdmissionPolicy, factory: Box<dyn BackendFactory>) -> GatewayHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let gateway = Gateway {
            registry: ConnectionRegistry::new(),
            policy,
            factory,
            backend_tx,
        };
        tokio::spawn(gateway.run(rx, backend_rx));
        GatewayHandle {
            tx,
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<GatewayEvent>,
        mut backend_events: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(GatewayEvent::SessionOpen { info, out, reply }) => {
                        self.on_session_open(info, out, reply);
                    }
                    Some(GatewayEvent::SessionData { id, data }) => self.on_session_data(id, data),
                    Some(GatewayEvent::SessionClosed { id }) => self.on_session_closed(id),
                    Some(GatewayEvent::Shutdown) | None => {
                        self.on_shutdown();
                        break;
                    }
                },
                Some(event) = backend_events.recv() => self.on_backend_event(event),
            }
        }
    }

    fn on_session_open(
        &mut self,
        info: SessionInfo,
        out: mpsc::UnboundedSender<SessionOutput>,
        reply: oneshot::Sender<Admission>,
    ) {
        let key = info.channel_key();

        // Per-node cap applies to shared serial channels only.
        if matches!(key, ChannelKey::Serial { .. })
            && self.registry.subscriber_count(&key) >= self.policy.max_node_sessions
        {
            info!(node = %info.node, user = %info.user, "max connections reached on node");
            let _ = reply.send(Admission::Rejected {
                code: close::NORMAL,
                reason: format!("Max number of connections reached on node {}", info.node),
            });
            return;
        }
        if self.registry.user_count(&info.user) >= self.policy.max_user_sessions {
            info!(node = %info.node, user = %info.user, "max connections reached for user");
            let _ = reply.send(Admission::Rejected {
                code: close::NORMAL,
                reason: format!("Max number of connections reached for user {}", info.user),
            });
            return;
        }

        // The session task gave up (client gone mid-handshake): leave the
        // registry untouched.
        if reply.send(Admission::Admitted).is_err() {
            debug!(node = %info.node, session = info.id, "session vanished before admission");
            return;
        }

        if !self.registry.has_backend(&key) {
            debug!(channel = %key, "opening backend connection");
            let backend = self.factory.create(&key, self.backend_tx.clone());
            self.registry.insert_backend(key.clone(), backend);
        }
        info!(
            channel = %key,
            session = info.id,
            user = %info.user,
            experiment = %info.experiment_id,
            site = %info.site,
            "session admitted"
        );
        self.registry.add_session(
            key,
            SessionEntry {
                id: info.id,
                user: info.user,
                binary: info.kind.is_binary(),
                out,
            },
        );
    }

    fn on_session_data(&mut self, id: SessionId, data: Vec<u8>) {
        let Some(key) = self.registry.key_of(id).cloned() else {
            debug!(session = id, "data from untracked session");
            return;
        };

        let ready = self
            .registry
            .backend(&key)
            .is_some_and(|backend| backend.is_ready());
        if ready {
            if let Some(backend) = self.registry.backend_mut(&key) {
                backend.send(&data);
            }
            return;
        }

        // Never buffered: the peer gets immediate feedback instead of
        // silent loss.
        debug!(channel = %key, "backend not ready, skipping message");
        let notice = format!(
            "No {} connection opened, cannot send message '{}'.\n",
            key.kind().transport_label(),
            String::from_utf8_lossy(&data).trim_end()
        );
        if let Some(entry) = self
            .registry
            .subscribers(&key)
            .iter()
            .find(|entry| entry.id == id)
        {
            let _ = entry.out.send(SessionOutput::Text(notice));
        }
    }

    fn on_session_closed(&mut self, id: SessionId) {
        let Some((key, _entry)) = self.registry.remove_session(id) else {
            debug!(session = id, "close for untracked session");
            return;
        };
        info!(channel = %key, session = id, "session removed");

        // Reference-counted teardown: last subscriber out stops the backend.
        if self.registry.subscriber_count(&key) == 0 {
            if let Some(mut backend) = self.registry.remove_backend(&key) {
                debug!(channel = %key, "closing backend connection");
                backend.stop();
            }
        }
    }

    fn on_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Ready { key } => {
                match self.registry.backend_mut(&key) {
                    Some(backend) => {
                        backend.set_ready(true);
                        info!(channel = %key, "backend connection ready");
                    }
                    // Torn down while the connect was in flight.
                    None => debug!(channel = %key, "ready for untracked backend"),
                }
            }
            BackendEvent::Data { key, payload } => self.relay(&key, payload),
            BackendEvent::Closed { key } => self.on_backend_closed(&key),
        }
    }

    /// Broadcast one backend chunk to every subscribed session.
    fn relay(&mut self, key: &ChannelKey, payload: Vec<u8>) {
        if !self.registry.has_backend(key) {
            debug!(channel = %key, "data for untracked backend");
            return;
        }
        for entry in self.registry.subscribers(key) {
            if entry.binary {
                let _ = entry.out.send(SessionOutput::Binary(payload.clone()));
            } else {
                match std::str::from_utf8(&payload) {
                    Ok(text) => {
                        let _ = entry.out.send(SessionOutput::Text(text.to_string()));
                    }
                    // Deliberate lossy-stream policy: undecodable chunks on
                    // a text relay are dropped, not surfaced.
                    Err(_) => debug!(channel = %key, "cannot decode data received from node"),
                }
            }
        }
    }

    fn on_backend_closed(&mut self, key: &ChannelKey) {
        let Some(backend) = self.registry.remove_backend(key) else {
            debug!(channel = %key, "close for untracked backend");
            return;
        };

        let (code, reason) = if backend.is_ready() {
            (close::NORMAL, "Connection closed".to_string())
        } else {
            warn!(channel = %key, "backend connection never became ready");
            (
                close::GOING_AWAY,
                format!("Cannot connect to node {}", key.node()),
            )
        };
        info!(channel = %key, "backend connection closed");
        for entry in self.registry.take_subscribers(key) {
            let _ = entry.out.send(SessionOutput::Close {
                code,
                reason: reason.clone(),
            });
        }
    }

    fn on_shutdown(&mut self) {
        info!("closing all websocket connections");
        for id in self.registry.session_ids() {
            if let Some((key, entry)) = self.registry.remove_session(id) {
                let _ = entry.out.send(SessionOutput::Close {
                    code: close::GOING_AWAY,
                    reason: "Server is restarting".to_string(),
                });
                if self.registry.subscriber_count(&key) == 0 {
                    if let Some(mut backend) = self.registry.remove_backend(&key) {
                        backend.stop();
                    }
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::timeout;

    /// Scripted backend: records sends/stops, emits nothing on its own.
    struct MockBackend {
        key: ChannelKey,
        ready: bool,
        log: Arc<Mutex<FactoryLog>>,
        events: mpsc::UnboundedSender<BackendEvent>,
    }

    impl Backend for MockBackend {
        fn is_ready(&self) -> bool {
            self.ready
        }
        fn set_ready(&mut self, ready: bool) {
            self.ready = ready;
            if ready {
                self.log.lock().unwrap().readies.push(self.key.clone());
            }
        }
        fn send(&mut self, payload: &[u8]) {
            self.log.lock().unwrap().sent.push(payload.to_vec());
        }
        fn stop(&mut self) {
            self.log.lock().unwrap().stops.push(self.key.clone());
            let _ = self.events.send(BackendEvent::Closed {
                key: self.key.clone(),
            });
        }
    }

    #[derive(Default)]
    struct FactoryLog {
        starts: Vec<ChannelKey>,
        readies: Vec<ChannelKey>,
        stops: Vec<ChannelKey>,
        sent: Vec<Vec<u8>>,
        events: Vec<mpsc::UnboundedSender<BackendEvent>>,
    }

    #[derive(Clone, Default)]
    struct MockFactory {
        log: Arc<Mutex<FactoryLog>>,
    }

    impl BackendFactory for MockFactory {
        fn create(
            &self,
            key: &ChannelKey,
            events: mpsc::UnboundedSender<BackendEvent>,
        ) -> Box<dyn Backend> {
            let mut log = self.log.lock().unwrap();
            log.starts.push(key.clone());
            log.events.push(events.clone());
            Box::new(MockBackend {
                key: key.clone(),
                ready: false,
                log: self.log.clone(),
                events,
            })
        }
    }

    impl MockFactory {
        fn starts(&self) -> Vec<ChannelKey> {
            self.log.lock().unwrap().starts.clone()
        }
        fn stops(&self) -> Vec<ChannelKey> {
            self.log.lock().unwrap().stops.clone()
        }
        fn sent(&self) -> Vec<Vec<u8>> {
            self.log.lock().unwrap().sent.clone()
        }
        fn ready_count(&self) -> usize {
            self.log.lock().unwrap().readies.len()
        }
        fn events_tx(&self, index: usize) -> mpsc::UnboundedSender<BackendEvent> {
            self.log.lock().unwrap().events[index].clone()
        }
    }

    fn session(id: SessionId, node: &str, user: &str, kind: ConnectionKind) -> SessionInfo {
        SessionInfo {
            id,
            site: "saclay".to_string(),
            experiment_id: "123".to_string(),
            node: node.to_string(),
            user: user.to_string(),
            kind,
        }
    }

    async fn open(
        handle: &GatewayHandle,
        info: SessionInfo,
    ) -> (Admission, mpsc::UnboundedReceiver<SessionOutput>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let admission = handle.open_session(info, out_tx).await;
        (admission, out_rx)
    }

    /// Poll until the condition holds; fire-and-forget gateway events have
    /// no completion signal to await.
    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within 1s");
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<SessionOutput>) -> SessionOutput {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session output")
            .expect("session output channel closed")
    }

    fn serial_key(node: &str) -> ChannelKey {
        ChannelKey::Serial {
            node: node.to_string(),
        }
    }

    #[tokio::test]
    async fn backend_is_shared_between_serial_sessions() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (a, _rx_a) = open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        let (b, _rx_b) = open(&handle, session(2, "m3-1", "bob", ConnectionKind::Serial)).await;

        assert_eq!(a, Admission::Admitted);
        assert_eq!(b, Admission::Admitted);
        // Second subscriber joins the existing backend connection.
        assert_eq!(factory.starts(), vec![serial_key("m3-1")]);

        handle.session_closed(1);
        // Re-admission on the same channel proves the close was processed.
        let (c, _rx_c) = open(&handle, session(3, "m3-1", "carol", ConnectionKind::Serial)).await;
        assert_eq!(c, Admission::Admitted);
        assert!(factory.stops().is_empty(), "backend stopped too early");

        handle.session_closed(2);
        handle.session_closed(3);
        wait_until(|| factory.stops().len() == 1).await;
        assert_eq!(factory.stops(), vec![serial_key("m3-1")]);
    }

    #[tokio::test]
    async fn node_cap_rejects_third_serial_session() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (a, _rx_a) = open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        let (b, _rx_b) = open(&handle, session(2, "m3-1", "bob", ConnectionKind::Serial)).await;
        let (c, _rx_c) = open(&handle, session(3, "m3-1", "carol", ConnectionKind::Serial)).await;

        assert_eq!(a, Admission::Admitted);
        assert_eq!(b, Admission::Admitted);
        match c {
            Admission::Rejected { code, .. } => assert_eq!(code, close::NORMAL),
            other => panic!("expected rejection, got {other:?}"),
        }
        // The rejected session never started a second backend.
        assert_eq!(factory.starts().len(), 1);

        // Carol was never admitted, so her close must not free a slot that
        // was never taken.
        handle.session_closed(3);
        let (d, _rx_d) = open(&handle, session(4, "m3-1", "dave", ConnectionKind::Serial)).await;
        assert!(matches!(d, Admission::Rejected { .. }));
    }

    #[tokio::test]
    async fn user_cap_rejects_eleventh_session() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        for i in 0..10u64 {
            let node = format!("m3-{i}");
            let (admission, _rx) =
                open(&handle, session(i + 1, &node, "alice", ConnectionKind::Ssh)).await;
            assert_eq!(admission, Admission::Admitted, "session {i} not admitted");
        }

        let (over, _rx) = open(&handle, session(11, "m3-42", "alice", ConnectionKind::Ssh)).await;
        match over {
            Admission::Rejected { code, .. } => assert_eq!(code, close::NORMAL),
            other => panic!("expected rejection, got {other:?}"),
        }

        // Closing one session frees exactly one slot.
        handle.session_closed(1);
        let (again, _rx) = open(&handle, session(12, "m3-42", "alice", ConnectionKind::Ssh)).await;
        assert_eq!(again, Admission::Admitted);
        let (still_over, _rx) =
            open(&handle, session(13, "m3-43", "alice", ConnectionKind::Ssh)).await;
        assert!(matches!(still_over, Admission::Rejected { .. }));
    }

    #[tokio::test]
    async fn ssh_sessions_are_not_node_capped_and_not_shared() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        for id in 1..=3u64 {
            let user = format!("user{id}");
            let (admission, _rx) =
                open(&handle, session(id, "a8-1", &user, ConnectionKind::Ssh)).await;
            assert_eq!(admission, Admission::Admitted);
        }
        // One private backend connection per SSH session.
        assert_eq!(factory.starts().len(), 3);
    }

    #[tokio::test]
    async fn connect_failure_closes_pending_subscriber() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (admission, mut rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        assert_eq!(admission, Admission::Admitted);

        // Backend reports failure without ever becoming ready.
        let events = factory.events_tx(0);
        events
            .send(BackendEvent::Closed {
                key: serial_key("m3-1"),
            })
            .unwrap();

        match recv(&mut rx).await {
            SessionOutput::Close { code, reason } => {
                assert_eq!(code, close::GOING_AWAY);
                assert!(reason.contains("m3-1"), "reason was {reason:?}");
            }
            other => panic!("expected close, got {other:?}"),
        }

        // The registry entry is gone: a new subscriber gets a fresh start.
        let (again, _rx) = open(&handle, session(2, "m3-1", "alice", ConnectionKind::Serial)).await;
        assert_eq!(again, Admission::Admitted);
        assert_eq!(factory.starts().len(), 2);
    }

    #[tokio::test]
    async fn ready_backend_close_reports_clean_disconnect() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_admission, mut rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        let events = factory.events_tx(0);
        let key = serial_key("m3-1");
        events.send(BackendEvent::Ready { key: key.clone() }).unwrap();
        events.send(BackendEvent::Closed { key }).unwrap();

        match recv(&mut rx).await {
            SessionOutput::Close { code, .. } => assert_eq!(code, close::NORMAL),
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn text_relay_decodes_per_chunk_and_drops_undecodable() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_admission, mut rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        let events = factory.events_tx(0);
        let key = serial_key("m3-1");
        events.send(BackendEvent::Ready { key: key.clone() }).unwrap();

        // Undecodable bytes vanish from a text relay.
        for byte in [0xAAu8, 0xBB] {
            events
                .send(BackendEvent::Data {
                    key: key.clone(),
                    payload: vec![byte],
                })
                .unwrap();
        }
        // A decodable run arrives one event per byte.
        for byte in b"Hello World" {
            events
                .send(BackendEvent::Data {
                    key: key.clone(),
                    payload: vec![*byte],
                })
                .unwrap();
        }

        let mut text = String::new();
        for _ in 0..11 {
            match recv(&mut rx).await {
                SessionOutput::Text(chunk) => text.push_str(&chunk),
                other => panic!("expected text, got {other:?}"),
            }
        }
        assert_eq!(text, "Hello World");
        assert!(rx.try_recv().is_err(), "undecodable bytes were forwarded");
    }

    #[tokio::test]
    async fn raw_relay_forwards_bytes_unmodified() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_admission, mut rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::SerialRaw)).await;
        let events = factory.events_tx(0);
        let key = serial_key("m3-1");
        events.send(BackendEvent::Ready { key: key.clone() }).unwrap();
        events
            .send(BackendEvent::Data {
                key,
                payload: vec![0xAA, 0xBB],
            })
            .unwrap();

        assert_eq!(recv(&mut rx).await, SessionOutput::Binary(vec![0xAA, 0xBB]));
    }

    #[tokio::test]
    async fn send_before_backend_ready_reports_back() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_admission, mut rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        handle.session_data(1, b"help\n".to_vec());

        match recv(&mut rx).await {
            SessionOutput::Text(notice) => {
                assert!(notice.contains("cannot send"), "notice was {notice:?}");
                assert!(notice.contains("help"), "notice was {notice:?}");
            }
            other => panic!("expected notice, got {other:?}"),
        }
        assert!(factory.sent().is_empty());
    }

    #[tokio::test]
    async fn session_data_reaches_ready_backend() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_admission, _rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        let events = factory.events_tx(0);
        events
            .send(BackendEvent::Ready {
                key: serial_key("m3-1"),
            })
            .unwrap();
        // Ready travels on the backend channel; wait for it before writing.
        wait_until(|| factory.ready_count() == 1).await;

        handle.session_data(1, b"reset\n".to_vec());
        wait_until(|| !factory.sent().is_empty()).await;
        assert_eq!(factory.sent(), vec![b"reset\n".to_vec()]);
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_a, mut rx_a) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        let (_b, mut rx_b) = open(&handle, session(2, "a8-1", "bob", ConnectionKind::Ssh)).await;

        handle.shutdown();

        for rx in [&mut rx_a, &mut rx_b] {
            match recv(rx).await {
                SessionOutput::Close { code, reason } => {
                    assert_eq!(code, close::GOING_AWAY);
                    assert!(reason.contains("restarting"), "reason was {reason:?}");
                }
                other => panic!("expected close, got {other:?}"),
            }
        }
        // Backends stop as their subscriber lists empty.
        assert_eq!(factory.stops().len(), 2);
    }

    #[tokio::test]
    async fn double_close_does_not_underflow() {
        let factory = MockFactory::default();
        let handle = Gateway::spawn(AdmissionPolicy::default(), Box::new(factory.clone()));

        let (_admission, _rx) =
            open(&handle, session(1, "m3-1", "alice", ConnectionKind::Serial)).await;
        handle.session_closed(1);
        handle.session_closed(1);

        // A fresh session for the same user is admitted: the counter did
        // not wrap below zero.
        let (again, _rx) = open(&handle, session(2, "m3-1", "alice", ConnectionKind::Serial)).await;
        assert_eq!(again, Admission::Admitted);
    }
}
