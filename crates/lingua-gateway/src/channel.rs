use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::connector::{Connector, Link};
use crate::error::TransportError;
use crate::stomp::{Command, Frame, Heartbeat};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Waiting to retry after `attempt` consecutive failures.
    Reconnecting { attempt: u32 },
    /// Gave up after exhausting the configured attempts.
    Failed,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub url: String,
    /// Heart-beat period offered to the broker in both directions.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub backoff: Backoff,
}

impl GatewayConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
            backoff: Backoff::default(),
        }
    }

    fn host(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_owned))
            .unwrap_or_else(|| "localhost".to_string())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new("ws://localhost:8081/chat/ws/websocket")
    }
}

/// A MESSAGE frame routed to the handler registered for `topic`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub body: String,
}

pub type Handler = mpsc::UnboundedSender<Delivery>;

/// Broker-side subscription id of a live topic subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(String);

impl SubscriptionToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

struct Route {
    handler: Handler,
    /// Set while the topic is subscribed on the live session.
    sub_id: Option<String>,
}

/// Everything the session task and the public handle both touch. Held
/// under one lock so a subscribe racing a reconnect is either replayed or
/// sent directly, never lost.
#[derive(Default)]
struct Registry {
    routes: HashMap<String, Route>,
    by_sub: HashMap<String, String>,
    next_sub: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    credential: Option<String>,
    /// Bumped on every connect/disconnect. A task whose generation no longer
    /// matches must not touch shared state.
    generation: u64,
}

impl Registry {
    fn activate(&mut self, topic: &str) -> Option<String> {
        let outbound = self.outbound.as_ref()?;
        self.next_sub += 1;
        let id = format!("sub-{}", self.next_sub);
        if outbound.send(Frame::subscribe(&id, topic).encode()).is_err() {
            return None;
        }
        self.by_sub.insert(id.clone(), topic.to_string());
        if let Some(route) = self.routes.get_mut(topic) {
            route.sub_id = Some(id.clone());
        }
        Some(id)
    }
}

struct ChannelInner {
    config: GatewayConfig,
    registry: Mutex<Registry>,
    state_tx: watch::Sender<ConnectionState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelInner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, generation: u64, state: ConnectionState) -> bool {
        let reg = self.registry();
        if reg.generation != generation {
            return false;
        }
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!("Transport state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
        true
    }

    /// Publishes the live session and replays every registered topic on it.
    /// Returns the number of topics restored, or `None` if superseded.
    fn install_session(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> Option<usize> {
        let mut reg = self.registry();
        if reg.generation != generation {
            return None;
        }
        reg.outbound = Some(outbound);
        let topics: Vec<String> = reg.routes.keys().cloned().collect();
        let restored = topics.iter().filter(|t| reg.activate(t).is_some()).count();
        self.state_tx.send_replace(ConnectionState::Connected);
        info!("Transport state -> Connected");
        Some(restored)
    }

    /// Forgets the live session. Returns whether one had been established.
    fn clear_session(&self, generation: u64) -> bool {
        let mut reg = self.registry();
        if reg.generation != generation {
            return false;
        }
        reg.by_sub.clear();
        for route in reg.routes.values_mut() {
            route.sub_id = None;
        }
        reg.outbound.take().is_some()
    }

    fn dispatch(&self, frame: Frame) -> Result<(), TransportError> {
        match frame.command {
            Command::Message => {
                let reg = self.registry();
                let topic = frame
                    .get("subscription")
                    .and_then(|id| reg.by_sub.get(id))
                    .cloned()
                    .or_else(|| frame.get("destination").map(str::to_owned));
                let Some(topic) = topic else {
                    warn!("MESSAGE frame without subscription or destination");
                    return Ok(());
                };
                match reg.routes.get(&topic) {
                    Some(route) => {
                        let delivery = Delivery {
                            topic,
                            body: frame.body,
                        };
                        if route.handler.send(delivery).is_err() {
                            debug!("Handler dropped, discarding message");
                        }
                    }
                    None => debug!("No route for {}, discarding message", topic),
                }
                Ok(())
            }
            Command::Error => Err(TransportError::Rejected(error_message(&frame))),
            other => {
                debug!("Ignoring {} frame", other);
                Ok(())
            }
        }
    }
}

fn error_message(frame: &Frame) -> String {
    frame
        .get("message")
        .map(str::to_owned)
        .unwrap_or_else(|| frame.body.clone())
}

/// Handle to the realtime transport. Cheap to clone; every clone drives the
/// same connection.
///
/// The channel owns a registry of topic handlers that survives reconnects:
/// every registered topic is re-subscribed whenever a session is
/// established. [`Channel::disconnect`] stops the connection task and
/// clears the registry.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    pub fn new(config: GatewayConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                registry: Mutex::new(Registry::default()),
                state_tx,
                task: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Starts the connection task. A no-op while one is already running.
    pub fn connect<C: Connector>(&self, connector: C, credential: impl Into<String>) {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            debug!("Transport already running, ignoring connect");
            return;
        }
        let generation = {
            let mut reg = self.inner.registry();
            reg.credential = Some(credential.into());
            reg.generation += 1;
            reg.generation
        };
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(run_connection_loop(inner, connector, generation)));
    }

    /// Stops the connection and clears all registered topics. Idempotent.
    pub fn disconnect(&self) {
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        {
            let mut reg = self.inner.registry();
            reg.generation += 1;
            if let Some(outbound) = reg.outbound.take() {
                let _ = outbound.send(Frame::disconnect().encode());
            }
            reg.routes.clear();
            reg.by_sub.clear();
            reg.credential = None;
            self.inner.state_tx.send_if_modified(|current| {
                if *current == ConnectionState::Disconnected {
                    return false;
                }
                info!("Transport state {:?} -> Disconnected", current);
                *current = ConnectionState::Disconnected;
                true
            });
        }
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Registers `handler` for `topic`. The topic is recorded even while
    /// disconnected and subscribed on the next session; in that case this
    /// returns `None`. Subscribing an already registered topic replaces its
    /// handler without a second broker subscription.
    pub fn subscribe(&self, topic: &str, handler: Handler) -> Option<SubscriptionToken> {
        let mut reg = self.inner.registry();
        match reg.routes.get_mut(topic) {
            Some(route) => {
                route.handler = handler;
                if let Some(id) = &route.sub_id {
                    return Some(SubscriptionToken(id.clone()));
                }
            }
            None => {
                reg.routes.insert(
                    topic.to_string(),
                    Route {
                        handler,
                        sub_id: None,
                    },
                );
            }
        }
        if reg.outbound.is_none() {
            warn!("Not connected, {} will be subscribed once a session is up", topic);
            return None;
        }
        debug!("Subscribing to {}", topic);
        reg.activate(topic).map(SubscriptionToken)
    }

    /// Removes `topic` from the registry. Returns whether it was registered.
    pub fn unsubscribe(&self, topic: &str) -> bool {
        let mut reg = self.inner.registry();
        let Some(route) = reg.routes.remove(topic) else {
            return false;
        };
        if let Some(id) = route.sub_id {
            reg.by_sub.remove(&id);
            if let Some(outbound) = &reg.outbound {
                let _ = outbound.send(Frame::unsubscribe(&id).encode());
            }
        }
        debug!("Unsubscribed from {}", topic);
        true
    }

    /// Sends a JSON payload to `destination`. Returns `false` without
    /// queueing when no session is live.
    pub fn publish(&self, destination: &str, payload: &str) -> bool {
        let reg = self.inner.registry();
        let Some(outbound) = &reg.outbound else {
            warn!("Not connected, dropping publish to {}", destination);
            return false;
        };
        let frame = Frame::send(destination, payload, reg.credential.as_deref());
        outbound.send(frame.encode()).is_ok()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Registered topics, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.inner.registry().routes.keys().cloned().collect();
        topics.sort();
        topics
    }
}

async fn run_connection_loop<C: Connector>(inner: Arc<ChannelInner>, connector: C, generation: u64) {
    let backoff = inner.config.backoff.clone();
    let mut attempt: u32 = 0;

    loop {
        let state = if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting { attempt }
        };
        if !inner.set_state(generation, state) {
            return;
        }

        let reason = match connector.connect().await {
            Ok(link) => run_session(&inner, link, generation).await,
            Err(e) => e,
        };
        if inner.clear_session(generation) {
            attempt = 0;
        }
        warn!("Transport session ended: {}", reason);

        attempt += 1;
        if backoff.exhausted(attempt) {
            warn!("Giving up after {} failed attempts", attempt - 1);
            inner.set_state(generation, ConnectionState::Failed);
            return;
        }
        if !inner.set_state(generation, ConnectionState::Reconnecting { attempt }) {
            return;
        }
        let delay = backoff.delay(attempt);
        debug!("Reconnecting in {:?} (attempt {})", delay, attempt);
        tokio::time::sleep(delay).await;
    }
}

/// Runs one STOMP session to completion and returns why it ended.
async fn run_session(inner: &ChannelInner, link: Link, generation: u64) -> TransportError {
    let Link {
        outgoing,
        mut incoming,
    } = link;
    let config = &inner.config;

    let credential = inner.registry().credential.clone().unwrap_or_default();
    let connect = Frame::connect(&config.host(), &credential, config.heartbeat);
    if outgoing.send(connect.encode()).is_err() {
        return TransportError::Closed;
    }

    let connected = match tokio::time::timeout(config.connect_timeout, await_connected(&mut incoming)).await {
        Ok(Ok(frame)) => frame,
        Ok(Err(e)) => return e,
        Err(_) => return TransportError::HandshakeTimeout,
    };
    let heartbeat = Heartbeat::negotiate(config.heartbeat, connected.get("heart-beat"));

    let Some(restored) = inner.install_session(generation, outgoing.clone()) else {
        return TransportError::Closed;
    };
    info!(
        "STOMP session up ({} topics restored, heart-beat {:?})",
        restored, heartbeat
    );

    let tick = [heartbeat.send_every, heartbeat.expect_every]
        .into_iter()
        .flatten()
        .min()
        .unwrap_or(config.heartbeat);
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            raw = incoming.recv() => {
                let Some(raw) = raw else {
                    return TransportError::Closed;
                };
                last_seen = Instant::now();
                match Frame::decode_all(&raw) {
                    Ok(frames) => {
                        for frame in frames {
                            if let Err(e) = inner.dispatch(frame) {
                                return e;
                            }
                        }
                    }
                    Err(e) => warn!("Dropping undecodable frame: {}", e),
                }
            }
            _ = ticker.tick() => {
                if let Some(every) = heartbeat.expect_every {
                    if last_seen.elapsed() >= every * 2 {
                        return TransportError::HeartbeatTimeout(2);
                    }
                }
                if heartbeat.send_every.is_some() && outgoing.send("\n".to_string()).is_err() {
                    return TransportError::Closed;
                }
            }
        }
    }
}

async fn await_connected(incoming: &mut mpsc::UnboundedReceiver<String>) -> Result<Frame, TransportError> {
    while let Some(raw) = incoming.recv().await {
        for frame in Frame::decode_all(&raw)? {
            match frame.command {
                Command::Connected => return Ok(frame),
                Command::Error => return Err(TransportError::Rejected(error_message(&frame))),
                other => debug!("Ignoring {} before CONNECTED", other),
            }
        }
    }
    Err(TransportError::Closed)
}
