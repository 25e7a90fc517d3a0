//! Remote relay — a controller in another process, talking to the broker
//! over its own WebSocket.
//!
//! Commands are correlated by id through a client-side [`PendingLedger`].
//! Administrative requests (register, create, list, status) are answered by
//! frames that are not commands; those are matched by single-use waiters
//! keyed on the expected frame types plus, where the broker echoes one, a
//! correlation value.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{ClientPurpose, CommandRelay};
use crate::config::ClientConfig;
use crate::error::{CommandFailure, RelayError, RoutingError, CONNECTION_CLOSED_CODE};
use crate::ledger::{new_command_id, NewPending, PendingLedger};
use crate::protocol::{frame_type, ChannelSummary, OutcomeFrame};

const OUTBOUND_QUEUE: usize = 64;
/// How long `close` waits for the close frame to flush.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// One outstanding administrative request.
struct Waiter {
    token: u64,
    expect: &'static [&'static str],
    /// `(field, value)` the reply must carry. A reply without the field
    /// still matches.
    key: Option<(&'static str, String)>,
    tx: oneshot::Sender<Value>,
}

impl Waiter {
    fn matches(&self, msg_type: &str, frame: &Value) -> bool {
        if !self.expect.contains(&msg_type) {
            return false;
        }
        match &self.key {
            None => true,
            Some((field, want)) => match frame.get(*field) {
                Some(Value::String(got)) => got == want,
                Some(Value::Null) | None => true,
                Some(_) => false,
            },
        }
    }
}

/// Cheap handle to a live socket: its outbound queue and waiter table.
#[derive(Clone)]
struct Link {
    outbox: mpsc::Sender<Message>,
    waiters: Arc<Mutex<Vec<Waiter>>>,
    alive: Arc<AtomicBool>,
    next_token: Arc<AtomicU64>,
}

impl Link {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    async fn send(&self, frame: &Value) -> Result<(), RelayError> {
        let text = serde_json::to_string(frame).map_err(|e| RelayError::Protocol(e.to_string()))?;
        self.outbox
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| RelayError::Connection("connection closed".into()))
    }

    /// Send `frame` and wait for the first reply of an expected type.
    async fn request(
        &self,
        frame: Value,
        expect: &'static [&'static str],
        key: Option<(&'static str, String)>,
        timeout: Duration,
    ) -> Result<Value, RelayError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.push(Waiter {
            token,
            expect,
            key,
            tx,
        });
        if !self.is_alive() {
            self.forget(token).await;
            return Err(RelayError::Connection("connection closed".into()));
        }
        if let Err(e) = self.send(&frame).await {
            self.forget(token).await;
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(RelayError::Connection(
                "connection closed before reply".into(),
            )),
            Err(_) => {
                self.forget(token).await;
                Err(RelayError::Timeout(format!(
                    "no {} within {}ms",
                    expect.join("/"),
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn forget(&self, token: u64) {
        self.waiters.lock().await.retain(|w| w.token != token);
    }
}

/// A connected socket with its reader and writer tasks.
struct Session {
    link: Link,
    client_id: Option<String>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Session {
    /// Connect the socket. Command outcomes go to `ledger` when given;
    /// throwaway sessions pass `None`.
    async fn open(
        url: &str,
        ledger: Option<PendingLedger>,
        connect_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let (ws, _response) =
            tokio::time::timeout(connect_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| RelayError::Timeout(format!("connecting to {url}")))?
                .map_err(|e| RelayError::Connection(format!("{url}: {e}")))?;
        let (mut sink, mut stream) = ws.split();
        let (outbox, mut outbox_rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

        let link = Link {
            outbox,
            waiters: Arc::new(Mutex::new(Vec::new())),
            alive: Arc::new(AtomicBool::new(true)),
            next_token: Arc::new(AtomicU64::new(1)),
        };

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbox_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let reader_link = link.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        route_inbound(&reader_link, ledger.as_ref(), text.as_str()).await;
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("Broker socket read error: {e}");
                        break;
                    }
                }
            }
            reader_link.alive.store(false, Ordering::Release);
            // Dropping the senders wakes every waiter with a closed error.
            reader_link.waiters.lock().await.clear();
            if let Some(ledger) = ledger {
                let failed = ledger.reject_all(&CommandFailure::connection_closed()).await;
                if failed > 0 {
                    warn!(failed, "Broker connection lost with commands in flight");
                }
            }
            info!("Broker connection closed");
        });

        Ok(Self {
            link,
            client_id: None,
            reader,
            writer,
        })
    }

    /// Registration handshake.
    async fn register(
        &mut self,
        purpose: ClientPurpose,
        channel_id: Option<&str>,
        timeout: Duration,
    ) -> Result<(), RelayError> {
        let mut frame = json!({
            "type": "register",
            "clientType": purpose.role().as_str(),
        });
        if let Some(cid) = channel_id {
            frame["channelId"] = json!(cid);
        }
        let reply = self
            .link
            .request(
                frame,
                &["registration_success", "registration_error"],
                None,
                timeout,
            )
            .await?;
        if frame_type(&reply) == "registration_error" {
            return Err(RelayError::Registration(
                reply["error"]
                    .as_str()
                    .unwrap_or("registration rejected")
                    .to_string(),
            ));
        }
        self.client_id = reply["clientId"].as_str().map(ToString::to_string);
        Ok(())
    }

    async fn close(mut self) {
        let _ = self.link.outbox.send(Message::Close(None)).await;
        let _ = tokio::time::timeout(CLOSE_GRACE, &mut self.writer).await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Dispatch one frame from the broker.
async fn route_inbound(link: &Link, ledger: Option<&PendingLedger>, text: &str) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Unparseable frame from broker: {e}");
            return;
        }
    };
    let msg_type = frame_type(&frame).to_string();

    match (msg_type.as_str(), ledger) {
        ("command_result" | "command_error", Some(ledger)) => {
            let outcome: OutcomeFrame = match serde_json::from_value(frame) {
                Ok(o) => o,
                Err(e) => {
                    warn!(msg_type = %msg_type, "Malformed command outcome: {e}");
                    return;
                }
            };
            let Some(command_id) = outcome.command_id().map(ToString::to_string) else {
                warn!(msg_type = %msg_type, "Command outcome without id dropped");
                return;
            };
            if msg_type == "command_result" {
                ledger.resolve(&command_id, outcome.result).await;
            } else {
                let failure = CommandFailure {
                    message: outcome.error_message(),
                    code: outcome.code,
                };
                ledger.reject(&command_id, failure).await;
            }
        }
        ("pong", _) => debug!("pong"),
        ("channel_created_broadcast", _) => {
            debug!(
                channel_id = frame["channelId"].as_str().unwrap_or(""),
                "Channel announced"
            );
        }
        _ => {
            let mut waiters = link.waiters.lock().await;
            match waiters.iter().position(|w| w.matches(&msg_type, &frame)) {
                Some(pos) => {
                    let waiter = waiters.remove(pos);
                    let _ = waiter.tx.send(frame);
                }
                None => debug!(msg_type = %msg_type, "Unsolicited frame ignored"),
            }
        }
    }
}

#[derive(Default)]
struct RemoteState {
    /// Purpose and channel of the last successful `connect`; reconnects
    /// re-register with these.
    target: Option<(ClientPurpose, Option<String>)>,
    session: Option<Session>,
}

/// Relay client that reaches the broker over the network.
pub struct RemoteRelay {
    config: ClientConfig,
    ledger: PendingLedger,
    state: Mutex<RemoteState>,
}

impl RemoteRelay {
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            ledger: PendingLedger::new("client"),
            state: Mutex::new(RemoteState::default()),
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.link.is_alive())
    }

    /// Client id assigned by the broker on the last registration.
    pub async fn client_id(&self) -> Option<String> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .and_then(|s| s.client_id.clone())
    }

    async fn open(
        &self,
        purpose: ClientPurpose,
        channel_id: Option<&str>,
        ledger: Option<PendingLedger>,
    ) -> Result<Session, RelayError> {
        let mut session =
            Session::open(&self.config.url, ledger, self.config.admin_timeout()).await?;
        if let Err(e) = session
            .register(purpose, channel_id, self.config.admin_timeout())
            .await
        {
            session.close().await;
            return Err(e);
        }
        Ok(session)
    }

    /// Live link for the connected target, reconnecting first if the socket
    /// dropped since the last call. The state lock is not held across the
    /// backoff, so `disconnect` can cut a reconnect short.
    async fn link(&self) -> Result<(Link, Option<String>), RelayError> {
        let (target, stale) = {
            let mut state = self.state.lock().await;
            let Some(target) = state.target.clone() else {
                return Err(RelayError::Connection("not connected".into()));
            };
            if let Some(session) = &state.session {
                if session.link.is_alive() {
                    return Ok((session.link.clone(), target.1));
                }
            }
            (target, state.session.take())
        };
        if let Some(stale) = stale {
            stale.close().await;
        }

        let session = self.reconnect(&target).await?;
        let mut state = self.state.lock().await;
        if state.target.as_ref() != Some(&target) {
            drop(state);
            drop(session);
            return Err(RelayError::Connection("disconnected while reconnecting".into()));
        }
        if let Some(current) = &state.session {
            if current.link.is_alive() {
                // A concurrent caller reconnected first. Aborting our reader
                // keeps it from failing the shared ledger on close.
                let link = current.link.clone();
                drop(state);
                drop(session);
                return Ok((link, target.1));
            }
        }
        let link = session.link.clone();
        state.session = Some(session);
        Ok((link, target.1))
    }

    async fn still_targeting(&self, target: &(ClientPurpose, Option<String>)) -> bool {
        self.state.lock().await.target.as_ref() == Some(target)
    }

    async fn reconnect(
        &self,
        target: &(ClientPurpose, Option<String>),
    ) -> Result<Session, RelayError> {
        let (purpose, channel_id) = target;
        let attempts = self.config.reconnect_attempts;
        let mut last_error = None;
        for attempt in 1..=attempts {
            let delay = self.config.reconnect_delay(attempt);
            info!(
                attempt,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting to broker"
            );
            tokio::time::sleep(delay).await;
            if !self.still_targeting(target).await {
                info!(attempt, "Reconnect abandoned after disconnect");
                return Err(RelayError::Connection("disconnected while reconnecting".into()));
            }
            match self
                .open(*purpose, channel_id.as_deref(), Some(self.ledger.clone()))
                .await
            {
                Ok(session) => {
                    info!(attempt, "Reconnected to broker");
                    return Ok(session);
                }
                // The broker answered and said no; retrying will not help.
                Err(e @ RelayError::Registration(_)) => return Err(e),
                Err(e) => {
                    warn!(attempt, "Reconnect failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(RelayError::Connection(match last_error {
            Some(e) => format!("gave up after {attempts} reconnect attempts: {e}"),
            None => "connection lost and reconnect is disabled".to_string(),
        }))
    }

    /// Link for an administrative request: the live session when connected,
    /// otherwise a throwaway listing connection the caller must close.
    async fn admin_link(&self) -> Result<(Link, Option<String>, Option<Session>), RelayError> {
        let connected = self.state.lock().await.target.is_some();
        if connected {
            let (link, channel_id) = self.link().await?;
            return Ok((link, channel_id, None));
        }
        let session = self.open(ClientPurpose::ListChannels, None, None).await?;
        Ok((session.link.clone(), None, Some(session)))
    }
}

#[async_trait]
impl CommandRelay for RemoteRelay {
    async fn connect(
        &self,
        purpose: ClientPurpose,
        channel_id: Option<&str>,
    ) -> Result<(), RelayError> {
        let channel_id = channel_id.filter(|c| !c.is_empty()).map(ToString::to_string);
        if purpose == ClientPurpose::Command && channel_id.is_none() {
            return Err(RoutingError::MissingChannelId.into());
        }

        let mut state = self.state.lock().await;
        state.target = None;
        if let Some(old) = state.session.take() {
            self.ledger.reject_all(&CommandFailure::connection_closed()).await;
            old.close().await;
        }

        let session = self
            .open(purpose, channel_id.as_deref(), Some(self.ledger.clone()))
            .await?;
        info!(
            url = %self.config.url,
            purpose = ?purpose,
            channel_id = channel_id.as_deref().unwrap_or("none"),
            client_id = session.client_id.as_deref().unwrap_or(""),
            "Connected to broker"
        );
        state.session = Some(session);
        state.target = Some((purpose, channel_id));
        Ok(())
    }

    async fn send_command(&self, command: &str, params: Value) -> Result<Value, RelayError> {
        let (link, channel_id) = self.link().await?;
        let channel_id = channel_id.ok_or(RoutingError::MissingChannelId)?;

        let command_id = new_command_id();
        let completion = self
            .ledger
            .create(
                NewPending {
                    command_id: command_id.clone(),
                    command: command.to_string(),
                    channel_id: Some(channel_id.clone()),
                    ..NewPending::default()
                },
                self.config.command_timeout(),
            )
            .await?;

        let frame = json!({
            "type": "send_command",
            "id": command_id,
            "channelId": channel_id,
            "command": command,
            "params": params,
        });
        let sent = if link.is_alive() {
            link.send(&frame).await
        } else {
            Err(RelayError::Connection("connection closed".into()))
        };
        if let Err(e) = sent {
            self.ledger
                .reject(
                    &command_id,
                    CommandFailure::with_code(e.to_string(), CONNECTION_CLOSED_CODE),
                )
                .await;
        } else {
            debug!(command_id = %command_id, command, channel_id = %channel_id, "Command sent");
        }
        completion.wait().await
    }

    async fn get_channels(&self) -> Result<Vec<ChannelSummary>, RelayError> {
        // Separate connection, so listing never takes a seat in a channel.
        let session = self.open(ClientPurpose::ListChannels, None, None).await?;
        let token = new_command_id();
        let reply = session
            .link
            .request(
                json!({"type": "get_channels", "id": token}),
                &["channels_list"],
                Some(("id", token)),
                self.config.admin_timeout(),
            )
            .await;
        session.close().await;

        let mut reply = reply?;
        serde_json::from_value(reply["channels"].take())
            .map_err(|e| RelayError::Protocol(format!("bad channels_list: {e}")))
    }

    async fn create_channel(&self, id: &str, name: Option<&str>) -> Result<(), RelayError> {
        let (link, _, throwaway) = self.admin_link().await?;
        let mut frame = json!({"type": "create_channel", "channelId": id});
        if let Some(name) = name {
            frame["channelName"] = json!(name);
        }
        let reply = link
            .request(
                frame,
                &["channel_created", "channel_creation_error"],
                Some(("channelId", id.to_string())),
                self.config.admin_timeout(),
            )
            .await;
        if let Some(session) = throwaway {
            session.close().await;
        }

        let reply = reply?;
        if frame_type(&reply) == "channel_creation_error" {
            return Err(RelayError::Command {
                message: reply["error"]
                    .as_str()
                    .unwrap_or("channel creation failed")
                    .to_string(),
                code: None,
            });
        }
        info!(channel_id = id, "Channel created");
        Ok(())
    }

    async fn is_worker_connected(&self) -> Result<bool, RelayError> {
        let (link, channel_id, throwaway) = self.admin_link().await?;
        let token = new_command_id();
        let mut frame = json!({"type": "check_figma_connection", "id": token});
        if let Some(cid) = &channel_id {
            frame["channelId"] = json!(cid);
        }
        let reply = link
            .request(
                frame,
                &["figma_connection_status"],
                Some(("id", token)),
                self.config.status_timeout(),
            )
            .await;
        if let Some(session) = throwaway {
            session.close().await;
        }
        Ok(reply?["connected"].as_bool().unwrap_or(false))
    }

    async fn disconnect(&self) {
        let session = {
            let mut state = self.state.lock().await;
            state.target = None;
            state.session.take()
        };
        let failed = self.ledger.reject_all(&CommandFailure::connection_closed()).await;
        if let Some(session) = session {
            session.close().await;
            info!(failed, "Disconnected from broker");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use super::*;
    use crate::broker::{ws, Broker};
    use tokio::net::TcpListener;

    async fn spawn_broker(command_timeout: Duration) -> (String, Broker) {
        let broker = Broker::new(command_timeout, 64);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let b = broker.clone();
        tokio::spawn(async move {
            ws::serve(listener, b, std::future::pending()).await.unwrap();
        });
        (format!("ws://{addr}"), broker)
    }

    fn client_config(url: &str) -> ClientConfig {
        ClientConfig {
            url: url.to_string(),
            command_timeout_ms: 2_000,
            admin_timeout_ms: 2_000,
            status_timeout_ms: 1_000,
            reconnect_attempts: 3,
            reconnect_base_delay_ms: 10,
        }
    }

    /// Fake plugin: registers as the channel's worker and answers every
    /// command with `reply`, or stays silent when `None`.
    async fn spawn_worker(url: &str, channel: &str, reply: Option<Value>) -> JoinHandle<()> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        let (mut tx, mut rx) = ws.split();
        let register = json!({"type": "register", "clientType": "figma", "channelId": channel});
        tx.send(Message::Text(register.to_string().into()))
            .await
            .unwrap();
        loop {
            let Some(Ok(Message::Text(text))) = rx.next().await else {
                panic!("worker socket closed during registration");
            };
            let frame: Value = serde_json::from_str(text.as_str()).unwrap();
            if frame["type"] == "registration_success" {
                break;
            }
        }
        tokio::spawn(async move {
            while let Some(Ok(msg)) = rx.next().await {
                let Message::Text(text) = msg else { continue };
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["type"] != "command" {
                    continue;
                }
                if let Some(result) = &reply {
                    let out = json!({"type": "command_result", "id": frame["id"], "result": result});
                    if tx.send(Message::Text(out.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
        })
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn command_round_trip() {
        let (url, broker) = spawn_broker(Duration::from_secs(30)).await;
        broker.create_channel("c1", None).await.unwrap();
        let _worker = spawn_worker(&url, "c1", Some(json!({"ok": true}))).await;

        let relay = RemoteRelay::new(client_config(&url));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();
        assert!(relay.client_id().await.is_some());
        assert!(relay.is_worker_connected().await.unwrap());

        let result = relay
            .send_command("ping_tool", json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert!(relay.ledger.is_empty().await);
        assert!(broker.ledger().is_empty().await);
        relay.disconnect().await;
    }

    #[tokio::test]
    async fn silent_worker_times_out() {
        let (url, broker) = spawn_broker(Duration::from_secs(30)).await;
        broker.create_channel("c1", None).await.unwrap();
        let _worker = spawn_worker(&url, "c1", None).await;

        let relay = RemoteRelay::new(ClientConfig {
            command_timeout_ms: 200,
            ..client_config(&url)
        });
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();

        let start = Instant::now();
        let err = relay.send_command("slow", Value::Null).await.unwrap_err();
        assert!(err.is_timeout(), "unexpected {err:?}");
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert!(relay.ledger.is_empty().await);
    }

    #[tokio::test]
    async fn broker_timeout_surfaces_as_timeout() {
        let (url, broker) = spawn_broker(Duration::from_millis(150)).await;
        broker.create_channel("c1", None).await.unwrap();
        let _worker = spawn_worker(&url, "c1", None).await;

        let relay = RemoteRelay::new(client_config(&url));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();
        let err = relay.send_command("slow", Value::Null).await.unwrap_err();
        assert!(err.is_timeout(), "unexpected {err:?}");
    }

    #[tokio::test]
    async fn missing_worker_fails_fast() {
        let (url, broker) = spawn_broker(Duration::from_secs(30)).await;
        broker.create_channel("c1", None).await.unwrap();

        let relay = RemoteRelay::new(client_config(&url));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();
        assert!(!relay.is_worker_connected().await.unwrap());

        let start = Instant::now();
        let err = relay.send_command("noop", Value::Null).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(err, RelayError::Routing(RoutingError::NoWorker("c1".into())));
        assert!(broker.ledger().is_empty().await);
    }

    #[tokio::test]
    async fn register_into_missing_channel_is_refused() {
        let (url, _broker) = spawn_broker(Duration::from_secs(30)).await;
        let relay = RemoteRelay::new(client_config(&url));
        let err = relay
            .connect(ClientPurpose::Command, Some("ghost"))
            .await
            .unwrap_err();
        match err {
            RelayError::Registration(msg) => assert!(msg.contains("ghost")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(!relay.is_connected().await);
    }

    #[tokio::test]
    async fn listing_uses_throwaway_connection() {
        let (url, broker) = spawn_broker(Duration::from_secs(30)).await;
        broker.create_channel("c1", Some("Main")).await.unwrap();

        let relay = RemoteRelay::new(client_config(&url));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();

        let channels = relay.get_channels().await.unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].name, "Main");
        assert_eq!(channels[0].controller_count, 1);
        assert_eq!(channels[0].worker_count, 0);

        eventually(|| {
            let broker = broker.clone();
            async move { broker.stats().await.connections == 1 }
        })
        .await;
    }

    #[tokio::test]
    async fn create_channel_without_session() {
        let (url, broker) = spawn_broker(Duration::from_secs(30)).await;
        let relay = RemoteRelay::new(client_config(&url));

        relay.create_channel("fresh", Some("Fresh")).await.unwrap();
        assert_eq!(broker.list_channels().await[0].name, "Fresh");

        let err = relay.create_channel("fresh", None).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_commands() {
        let (url, broker) = spawn_broker(Duration::from_secs(30)).await;
        broker.create_channel("c1", None).await.unwrap();
        let _worker = spawn_worker(&url, "c1", None).await;

        let relay = Arc::new(RemoteRelay::new(ClientConfig {
            command_timeout_ms: 10_000,
            ..client_config(&url)
        }));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();

        let caller = relay.clone();
        let call = tokio::spawn(async move { caller.send_command("slow", Value::Null).await });
        eventually(|| {
            let broker = broker.clone();
            async move { broker.ledger().len().await == 1 }
        })
        .await;

        relay.disconnect().await;
        relay.disconnect().await;
        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)), "unexpected {err:?}");
        assert!(!relay.is_connected().await);
    }

    #[tokio::test]
    async fn operations_need_connect() {
        let relay = RemoteRelay::new(client_config("ws://127.0.0.1:9"));
        let err = relay.send_command("noop", Value::Null).await.unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)));
        assert!(matches!(
            relay.connect(ClientPurpose::Command, None).await,
            Err(RelayError::Routing(RoutingError::MissingChannelId))
        ));
    }

    /// Broker stand-in that accepts any registration, answers status checks,
    /// and drops the first connection right after registering it.
    async fn flaky_broker() -> (String, Arc<AtomicUsize>, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        let acceptor = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(async move {
                    let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
                    while let Some(Ok(Message::Text(text))) = ws.next().await {
                        let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                        let reply = match frame["type"].as_str() {
                            Some("register") => {
                                json!({"type": "registration_success", "clientId": format!("c{n}")})
                            }
                            Some("check_figma_connection") => json!({
                                "type": "figma_connection_status",
                                "id": frame["id"],
                                "connected": true,
                                "workerCount": 1,
                            }),
                            _ => continue,
                        };
                        ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                        if n == 1 {
                            let _ = ws.close(None).await;
                            break;
                        }
                    }
                });
            }
        });
        (url, accepted, acceptor)
    }

    #[tokio::test]
    async fn reconnects_after_unexpected_close() {
        let (url, accepted, _acceptor) = flaky_broker().await;
        let relay = RemoteRelay::new(client_config(&url));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();
        assert_eq!(relay.client_id().await.as_deref(), Some("c1"));

        let relay = Arc::new(relay);
        eventually(|| {
            let relay = relay.clone();
            async move { !relay.is_connected().await }
        })
        .await;

        assert!(relay.is_worker_connected().await.unwrap());
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        assert_eq!(relay.client_id().await.as_deref(), Some("c2"));
    }

    #[tokio::test]
    async fn reconnect_gives_up_after_bounded_attempts() {
        let (url, _accepted, acceptor) = flaky_broker().await;
        let relay = Arc::new(RemoteRelay::new(client_config(&url)));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();
        acceptor.abort();
        eventually(|| {
            let relay = relay.clone();
            async move { !relay.is_connected().await }
        })
        .await;

        let err = relay.is_worker_connected().await.unwrap_err();
        match err {
            RelayError::Connection(msg) => assert!(msg.contains("3 reconnect attempts"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_does_not_wait_out_reconnect_backoff() {
        let (url, accepted, _acceptor) = flaky_broker().await;
        let relay = Arc::new(RemoteRelay::new(ClientConfig {
            reconnect_base_delay_ms: 1_000,
            ..client_config(&url)
        }));
        relay.connect(ClientPurpose::Command, Some("c1")).await.unwrap();
        eventually(|| {
            let relay = relay.clone();
            async move { !relay.is_connected().await }
        })
        .await;

        let caller = relay.clone();
        let call = tokio::spawn(async move { caller.is_worker_connected().await });
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = Instant::now();
        relay.disconnect().await;
        assert!(start.elapsed() < Duration::from_millis(500));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Connection(_)), "unexpected {err:?}");
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
        assert!(!relay.is_connected().await);
    }

    #[test]
    fn waiter_matching_respects_type_and_key() {
        let (tx, _rx) = oneshot::channel();
        let waiter = Waiter {
            token: 1,
            expect: &["channels_list"],
            key: Some(("id", "abc".into())),
            tx,
        };
        assert!(waiter.matches("channels_list", &json!({"id": "abc"})));
        assert!(waiter.matches("channels_list", &json!({"channels": []})));
        assert!(!waiter.matches("channels_list", &json!({"id": "other"})));
        assert!(!waiter.matches("pong", &json!({"id": "abc"})));
    }
}
