//! Correlated request/response RPC over the shared stream.
//!
//! Each call carries a `customTag` echoed by the venue. Untagged messages are
//! pushes and are re-published to session subscribers. When the stream drops,
//! every outstanding call fails with [`BrokerError::Disconnected`]. A call
//! issued after the drop was announced waits for the next session instead,
//! since its frame carries the new transport epoch. Stored
//! credentials are replayed on reconnect before [`SessionEvent::Ready`] is
//! announced.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};
use tradebridge_core::BrokerError;

use crate::subscribers::Subscribers;
use crate::transport::{StreamTransport, TransportEvent};

/// Pause before re-sending a login that failed for transport reasons while
/// the session stayed up.
const RELOGIN_RETRY: Duration = Duration::from_millis(500);

/// Venue login credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    #[serde(default)]
    pub app_name: Option<String>,
}

impl Credentials {
    fn to_arguments(&self) -> Value {
        json!({
            "userId": self.user,
            "password": self.password,
            "appName": self.app_name,
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("app_name", &self.app_name)
            .finish()
    }
}

/// Session-level notifications for components that keep server-side state
/// (stream subscriptions) alive across reconnects.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session is usable; re-issue any stream subscriptions.
    Ready,
    /// The session dropped. A `Ready` follows once it is re-established.
    Lost(String),
    /// An unsolicited venue message.
    Push(Arc<Value>),
}

/// Authentication state of the current session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionPhase {
    /// No session, or one that needs no login.
    Idle,
    /// Waiting for login (first login or replay after reconnect).
    Authenticating,
    Ready,
    /// The venue refused the credentials.
    Rejected(BrokerError),
}

type Reply = oneshot::Sender<Result<Value, BrokerError>>;

struct RpcState {
    /// Outstanding calls with the transport epoch their frame was stamped with.
    pending: HashMap<String, (u64, Reply)>,
    credentials: Option<Credentials>,
    connected: bool,
    /// Bumped on every new session so stale login tasks can step aside.
    generation: u64,
}

struct RpcInner {
    transport: StreamTransport,
    state: Mutex<RpcState>,
    next_tag: AtomicU64,
    phase: watch::Sender<SessionPhase>,
    sessions: Subscribers<SessionEvent>,
}

/// Clonable RPC handle.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<RpcInner>,
}

impl RpcClient {
    pub fn new(transport: StreamTransport) -> Self {
        let events = transport.subscribe();
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let inner = Arc::new(RpcInner {
            transport,
            state: Mutex::new(RpcState {
                pending: HashMap::new(),
                credentials: None,
                connected: false,
                generation: 0,
            }),
            next_tag: AtomicU64::new(1),
            phase,
            sessions: Subscribers::new(),
        });
        tokio::spawn(run_events(Arc::downgrade(&inner), events));
        Self { inner }
    }

    pub fn transport(&self) -> &StreamTransport {
        &self.inner.transport
    }

    /// Subscribe to session lifecycle and push messages. Joining a session
    /// that is already ready yields one `Ready` first, so subscribers never
    /// need to check [`is_ready`](Self::is_ready) themselves.
    pub fn sessions(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        // Ready is only ever announced under the state lock.
        let _state = self.inner.lock();
        let initial = self.is_ready().then_some(SessionEvent::Ready);
        self.inner.sessions.subscribe_with(initial)
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.phase.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.inner.phase.borrow(), SessionPhase::Ready)
    }

    /// Log in and remember the credentials for replay after reconnects.
    pub async fn login(&self, credentials: Credentials) -> Result<(), BrokerError> {
        let mut phase = self.inner.phase.subscribe();
        let start = {
            let mut state = self.inner.lock();
            state.credentials = Some(credentials.clone());
            self.inner.phase.send_replace(SessionPhase::Authenticating);
            state.connected.then_some(state.generation)
        };
        match start {
            Some(generation) => {
                tokio::spawn(authenticate(Arc::clone(&self.inner), credentials, generation));
            }
            None => self.inner.transport.connect(),
        }

        loop {
            match &*phase.borrow_and_update() {
                SessionPhase::Ready => return Ok(()),
                SessionPhase::Rejected(err) => return Err(err.clone()),
                _ => {}
            }
            if phase.changed().await.is_err() {
                return Err(BrokerError::Disconnected("rpc client stopped".to_string()));
            }
        }
    }

    /// Issue a correlated request. Waits while a login replay is running.
    pub async fn call(&self, command: &str, arguments: Value) -> Result<Value, BrokerError> {
        self.wait_authenticated().await?;
        self.inner.call_raw(command, arguments).await
    }

    /// Send an uncorrelated message such as a stream subscription.
    pub fn notify(&self, message: &Value) -> Result<(), BrokerError> {
        self.inner.transport.send(message).map(|_| ())
    }

    /// Number of requests awaiting a response.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    async fn wait_authenticated(&self) -> Result<(), BrokerError> {
        let mut phase = self.inner.phase.subscribe();
        loop {
            if *phase.borrow_and_update() != SessionPhase::Authenticating {
                return Ok(());
            }
            phase
                .changed()
                .await
                .map_err(|_| BrokerError::Disconnected("rpc client stopped".to_string()))?;
        }
    }
}

impl RpcState {
    /// Remove the calls whose frames were stamped before `epoch`.
    fn take_ended(&mut self, epoch: u64) -> Vec<Reply> {
        let (ended, live): (HashMap<_, _>, HashMap<_, _>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, (stamp, _))| *stamp < epoch);
        self.pending = live;
        ended.into_values().map(|(_, reply)| reply).collect()
    }
}

impl RpcInner {
    fn lock(&self) -> MutexGuard<'_, RpcState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn call_raw(&self, command: &str, arguments: Value) -> Result<Value, BrokerError> {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        let message = json!({
            "command": command,
            "arguments": arguments,
            "customTag": tag,
        });
        debug!(command, tag = %tag, "rpc request");
        {
            // Stamp and register under one lock so a rejection pass sees both or neither.
            let mut state = self.lock();
            let epoch = self.transport.send(&message)?;
            state.pending.insert(tag, (epoch, tx));
        }

        rx.await
            .unwrap_or_else(|_| Err(BrokerError::Disconnected("request dropped".to_string())))
    }

    fn on_connected(self: &Arc<Self>) {
        let login = {
            let mut state = self.lock();
            state.connected = true;
            state.generation += 1;
            match state.credentials.clone() {
                Some(credentials) => {
                    self.phase.send_replace(SessionPhase::Authenticating);
                    Some((credentials, state.generation))
                }
                None => {
                    self.phase.send_replace(SessionPhase::Ready);
                    self.sessions.publish(SessionEvent::Ready);
                    None
                }
            }
        };
        if let Some((credentials, generation)) = login {
            tokio::spawn(authenticate(Arc::clone(self), credentials, generation));
        }
    }

    fn on_disconnected(&self, reason: String) {
        let pending = {
            let mut state = self.lock();
            state.connected = false;
            let next = if state.credentials.is_some() {
                SessionPhase::Authenticating
            } else {
                SessionPhase::Idle
            };
            self.phase.send_replace(next);
            state.take_ended(self.transport.epoch())
        };
        if !pending.is_empty() {
            warn!(count = pending.len(), reason = %reason, "rejecting in-flight requests");
        }
        for reply in pending {
            let _ = reply.send(Err(BrokerError::Disconnected(reason.clone())));
        }
        self.sessions.publish(SessionEvent::Lost(reason));
    }

    /// Fail every call stamped before `epoch`.
    fn reject_pending(&self, err: BrokerError, epoch: u64) {
        let pending = self.lock().take_ended(epoch);
        for reply in pending {
            let _ = reply.send(Err(err.clone()));
        }
    }

    fn on_data(&self, value: Arc<Value>) {
        if let Some(tag) = value.get("customTag").and_then(Value::as_str) {
            match self.lock().pending.remove(tag) {
                Some((_, reply)) => {
                    let _ = reply.send(parse_response(&value));
                }
                None => debug!(tag, "response for unknown request dropped"),
            }
            return;
        }
        self.sessions.publish(SessionEvent::Push(value));
    }
}

async fn run_events(inner: Weak<RpcInner>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            TransportEvent::Connected => inner.on_connected(),
            TransportEvent::Disconnected(reason) => inner.on_disconnected(reason),
            TransportEvent::Exception(reason) => {
                let epoch = inner.transport.epoch();
                inner.reject_pending(BrokerError::Transport(reason), epoch);
            }
            TransportEvent::Data(value) => inner.on_data(value),
        }
    }
    if let Some(inner) = inner.upgrade() {
        inner.reject_pending(BrokerError::Disconnected("transport stopped".to_string()), u64::MAX);
    }
}

enum LoginOutcome {
    Done,
    Retry,
}

async fn authenticate(inner: Arc<RpcInner>, credentials: Credentials, generation: u64) {
    loop {
        let result = inner.call_raw("login", credentials.to_arguments()).await;
        let outcome = {
            let mut state = inner.lock();
            if state.generation != generation || !state.connected {
                // A newer session owns the login now.
                LoginOutcome::Done
            } else {
                match result {
                    Ok(_) => {
                        inner.phase.send_replace(SessionPhase::Ready);
                        info!(user = %credentials.user, "session authenticated");
                        inner.sessions.publish(SessionEvent::Ready);
                        LoginOutcome::Done
                    }
                    Err(err @ BrokerError::Protocol { .. }) => {
                        warn!(user = %credentials.user, error = %err, "login rejected");
                        state.credentials = None;
                        inner.phase.send_replace(SessionPhase::Rejected(err));
                        LoginOutcome::Done
                    }
                    Err(err) => {
                        warn!(error = %err, "login interrupted, retrying");
                        LoginOutcome::Retry
                    }
                }
            }
        };
        match outcome {
            LoginOutcome::Done => return,
            LoginOutcome::Retry => tokio::time::sleep(RELOGIN_RETRY).await,
        }
    }
}

/// Split a venue response into its payload or a protocol error.
pub fn parse_response(value: &Value) -> Result<Value, BrokerError> {
    match value.get("status").and_then(Value::as_bool) {
        Some(true) => Ok(value.get("returnData").cloned().unwrap_or(Value::Null)),
        Some(false) => {
            let code = match value.get("errorCode") {
                Some(Value::String(code)) => code.clone(),
                Some(Value::Null) | None => "UNKNOWN".to_string(),
                Some(other) => other.to_string(),
            };
            let message = value
                .get("errorDescr")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Err(BrokerError::Protocol { code, message })
        }
        None => Err(BrokerError::Serialization(
            "response carries no status field".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{loopback, LoopbackListener, LoopbackPeer};
    use crate::transport::TransportConfig;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn client() -> (RpcClient, LoopbackListener) {
        let (connector, listener) = loopback();
        let config = TransportConfig {
            url: "loopback".to_string(),
            ping_interval_ms: 60_000,
            reconnect_interval_ms: 10,
            max_backoff_ms: 50,
        };
        let transport = StreamTransport::new(Arc::new(connector), config);
        (RpcClient::new(transport), listener)
    }

    async fn accept(listener: &mut LoopbackListener) -> LoopbackPeer {
        timeout(WAIT, listener.accept()).await.unwrap().unwrap()
    }

    async fn request(peer: &mut LoopbackPeer) -> Value {
        timeout(WAIT, peer.recv_json()).await.unwrap().unwrap()
    }

    fn credentials() -> Credentials {
        Credentials {
            user: "demo".to_string(),
            password: "secret".to_string(),
            app_name: None,
        }
    }

    #[tokio::test]
    async fn test_responses_routed_by_tag() {
        let (rpc, mut listener) = client();
        let first = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getVersion", json!({})).await }
        });
        let mut peer = accept(&mut listener).await;
        let req_a = request(&mut peer).await;

        let second = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getServerTime", json!({})).await }
        });
        let req_b = request(&mut peer).await;
        assert_ne!(req_a["customTag"], req_b["customTag"]);

        peer.respond(&req_b, json!({"time": 42}));
        peer.respond(&req_a, json!({"version": "2.5"}));

        let a = timeout(WAIT, first).await.unwrap().unwrap().unwrap();
        let b = timeout(WAIT, second).await.unwrap().unwrap().unwrap();
        assert_eq!(a["version"], "2.5");
        assert_eq!(b["time"], 42);
        assert_eq!(rpc.pending(), 0);
    }

    #[tokio::test]
    async fn test_protocol_error_only_fails_that_call() {
        let (rpc, mut listener) = client();
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getSymbol", json!({"symbol": "NOPE"})).await }
        });
        let mut peer = accept(&mut listener).await;
        let req = request(&mut peer).await;
        peer.respond_error(&req, "BE115", "Symbol does not exist");

        let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
        assert_eq!(
            err,
            BrokerError::Protocol {
                code: "BE115".to_string(),
                message: "Symbol does not exist".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_disconnect_rejects_every_pending_call() {
        let (rpc, mut listener) = client();
        let mut calls = Vec::new();
        for i in 0..3 {
            let rpc = rpc.clone();
            calls.push(tokio::spawn(async move {
                rpc.call("getTrades", json!({ "n": i })).await
            }));
        }
        let mut peer = accept(&mut listener).await;
        for _ in 0..3 {
            request(&mut peer).await;
        }
        assert_eq!(rpc.pending(), 3);
        drop(peer);

        for call in calls {
            let result = timeout(WAIT, call).await.unwrap().unwrap();
            assert!(matches!(result, Err(BrokerError::Disconnected(_))));
        }
        assert_eq!(rpc.pending(), 0);
    }

    #[tokio::test]
    async fn test_call_after_disconnect_waits_for_next_session() {
        let (rpc, mut listener) = client();
        let mut sessions = rpc.sessions();
        rpc.transport().connect();
        let peer = accept(&mut listener).await;
        assert!(matches!(timeout(WAIT, sessions.recv()).await.unwrap(), Some(SessionEvent::Ready)));

        drop(peer);
        assert!(matches!(timeout(WAIT, sessions.recv()).await.unwrap(), Some(SessionEvent::Lost(_))));
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getVersion", json!({})).await }
        });

        let mut peer = accept(&mut listener).await;
        let req = request(&mut peer).await;
        assert_eq!(req["command"], "getVersion");
        peer.respond(&req, json!({"version": "2.5"}));
        let reply = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(reply["version"], "2.5");
        assert_eq!(rpc.pending(), 0);
    }

    #[tokio::test]
    async fn test_decode_error_rejects_only_earlier_calls() {
        let (rpc, mut listener) = client();
        let before = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getVersion", json!({})).await }
        });
        let mut peer = accept(&mut listener).await;
        request(&mut peer).await;

        peer.send_text("{not json");
        let err = timeout(WAIT, before).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Transport(_)));

        let after = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getServerTime", json!({})).await }
        });
        let req = request(&mut peer).await;
        assert_eq!(req["command"], "getServerTime");
        peer.respond(&req, json!({"time": 42}));
        assert_eq!(timeout(WAIT, after).await.unwrap().unwrap().unwrap()["time"], 42);
    }

    #[tokio::test]
    async fn test_pushes_are_forwarded_to_sessions() {
        let (rpc, mut listener) = client();
        let mut sessions = rpc.sessions();
        rpc.transport().connect();
        let peer = accept(&mut listener).await;

        assert!(matches!(
            timeout(WAIT, sessions.recv()).await.unwrap(),
            Some(SessionEvent::Ready)
        ));
        peer.send_json(&json!({"command": "quote", "data": {"symbol": "EURUSD"}}));
        match timeout(WAIT, sessions.recv()).await.unwrap() {
            Some(SessionEvent::Push(value)) => assert_eq!(value["data"]["symbol"], "EURUSD"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_late_session_subscriber_gets_single_ready() {
        let (rpc, mut listener) = client();
        let mut early = rpc.sessions();
        rpc.transport().connect();
        let _peer = accept(&mut listener).await;
        assert!(matches!(timeout(WAIT, early.recv()).await.unwrap(), Some(SessionEvent::Ready)));

        let mut late = rpc.sessions();
        assert!(matches!(late.try_recv(), Ok(SessionEvent::Ready)));
        assert!(late.try_recv().is_err());
        assert!(early.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_login_replayed_before_ready_after_reconnect() {
        let (rpc, mut listener) = client();
        let mut sessions = rpc.sessions();

        let login = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.login(credentials()).await }
        });
        let mut peer = accept(&mut listener).await;
        let req = request(&mut peer).await;
        assert_eq!(req["command"], "login");
        assert_eq!(req["arguments"]["userId"], "demo");
        peer.respond(&req, json!({"streamSessionId": "abc"}));
        timeout(WAIT, login).await.unwrap().unwrap().unwrap();
        assert!(rpc.is_ready());
        assert!(matches!(timeout(WAIT, sessions.recv()).await.unwrap(), Some(SessionEvent::Ready)));

        drop(peer);
        assert!(matches!(timeout(WAIT, sessions.recv()).await.unwrap(), Some(SessionEvent::Lost(_))));

        let mut peer = accept(&mut listener).await;
        let call = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.call("getMarginLevel", json!({})).await }
        });
        let replay = request(&mut peer).await;
        assert_eq!(replay["command"], "login");
        peer.respond(&replay, json!({}));
        assert!(matches!(timeout(WAIT, sessions.recv()).await.unwrap(), Some(SessionEvent::Ready)));

        let req = request(&mut peer).await;
        assert_eq!(req["command"], "getMarginLevel");
        peer.respond(&req, json!({"balance": 1000}));
        let margin = timeout(WAIT, call).await.unwrap().unwrap().unwrap();
        assert_eq!(margin["balance"], 1000);
    }

    #[tokio::test]
    async fn test_rejected_login_is_reported() {
        let (rpc, mut listener) = client();
        let login = tokio::spawn({
            let rpc = rpc.clone();
            async move { rpc.login(credentials()).await }
        });
        let mut peer = accept(&mut listener).await;
        let req = request(&mut peer).await;
        peer.respond_error(&req, "BE005", "userPasswordCheck: Invalid login or password");

        let err = timeout(WAIT, login).await.unwrap().unwrap().unwrap_err();
        assert!(matches!(err, BrokerError::Protocol { .. }));
        assert!(matches!(rpc.phase(), SessionPhase::Rejected(_)));
    }

    #[test]
    fn test_parse_response_numeric_error_code() {
        let err = parse_response(&json!({"status": false, "errorCode": 7})).unwrap_err();
        assert_eq!(
            err,
            BrokerError::Protocol {
                code: "7".to_string(),
                message: String::new()
            }
        );
    }
}
