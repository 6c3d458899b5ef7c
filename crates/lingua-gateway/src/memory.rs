//! In-process STOMP broker. Lets the transport and everything above it run
//! against a real session lifecycle without a network.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connector::{Connector, Link};
use crate::error::TransportError;
use crate::stomp::{Command, Frame};

struct Session {
    to_client: mpsc::UnboundedSender<String>,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct BrokerState {
    sessions: HashMap<u64, Session>,
    next_session: u64,
    next_message: u64,
    refuse: u32,
    connects: u32,
    published: Vec<Frame>,
    /// When set, CONNECT is answered with an ERROR frame.
    reject: Option<String>,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector {
            broker: self.clone(),
        }
    }

    /// Fails the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.lock().refuse = n;
    }

    /// Answers every CONNECT with an ERROR frame carrying `message`.
    pub fn reject_sessions(&self, message: Option<&str>) {
        self.lock().reject = message.map(str::to_owned);
    }

    /// Connect attempts seen so far, refused ones included.
    pub fn connect_count(&self) -> u32 {
        self.lock().connects
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Destinations subscribed across live sessions, sorted. A destination
    /// subscribed twice appears twice.
    pub fn subscriptions(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .lock()
            .sessions
            .values()
            .flat_map(|s| s.subscriptions.values().cloned())
            .collect();
        all.sort();
        all
    }

    /// SEND frames received, in arrival order.
    pub fn published(&self) -> Vec<Frame> {
        self.lock().published.clone()
    }

    /// Writes a MESSAGE frame to every subscription on `destination`.
    /// Returns how many were written.
    pub fn deliver(&self, destination: &str, body: &str) -> usize {
        let mut state = self.lock();
        let mut targets = Vec::new();
        for session in state.sessions.values() {
            for (id, dest) in &session.subscriptions {
                if dest == destination {
                    targets.push((session.to_client.clone(), id.clone()));
                }
            }
        }
        let mut written = 0;
        for (tx, sub_id) in targets {
            state.next_message += 1;
            let frame = Frame::new(Command::Message)
                .header("subscription", sub_id)
                .header("destination", destination)
                .header("message-id", state.next_message.to_string())
                .with_body(body);
            if tx.send(frame.encode()).is_ok() {
                written += 1;
            }
        }
        written
    }

    /// Severs every live session as if the network dropped.
    pub fn drop_connections(&self) {
        let sessions: Vec<Session> = self.lock().sessions.drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.task.abort();
        }
    }

    /// Polls `check` until it holds or `timeout` elapses.
    pub async fn wait_until(&self, timeout: Duration, check: impl Fn(&MemoryBroker) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if check(self) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn handle(&self, session_id: u64, frame: Frame) {
        let mut state = self.lock();
        match frame.command {
            Command::Connect | Command::Stomp => {
                let reply = match &state.reject {
                    Some(message) => Frame::new(Command::Error).header("message", message.clone()),
                    None => Frame::new(Command::Connected)
                        .header("version", "1.2")
                        .header("heart-beat", "0,0"),
                };
                if let Some(session) = state.sessions.get(&session_id) {
                    let _ = session.to_client.send(reply.encode());
                }
            }
            Command::Subscribe => {
                if let (Some(id), Some(dest), Some(session)) = (
                    frame.get("id").map(str::to_owned),
                    frame.get("destination").map(str::to_owned),
                    state.sessions.get_mut(&session_id),
                ) {
                    session.subscriptions.insert(id, dest);
                }
            }
            Command::Unsubscribe => {
                if let (Some(id), Some(session)) = (frame.get("id"), state.sessions.get_mut(&session_id)) {
                    session.subscriptions.remove(id);
                }
            }
            Command::Send => state.published.push(frame),
            Command::Disconnect => {
                state.sessions.remove(&session_id);
            }
            _ => {}
        }
    }
}

#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        let broker = self.broker.clone();
        let mut state = broker.lock();
        state.connects += 1;
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(TransportError::Connect("connection refused".into()));
        }

        let (client_tx, mut broker_rx) = mpsc::unbounded_channel::<String>();
        let (broker_tx, client_rx) = mpsc::unbounded_channel::<String>();
        state.next_session += 1;
        let session_id = state.next_session;

        let reader = broker.clone();
        let task = tokio::spawn(async move {
            while let Some(raw) = broker_rx.recv().await {
                let Ok(frames) = Frame::decode_all(&raw) else {
                    continue;
                };
                for frame in frames {
                    reader.handle(session_id, frame);
                }
            }
            reader.lock().sessions.remove(&session_id);
        });

        state.sessions.insert(
            session_id,
            Session {
                to_client: broker_tx,
                subscriptions: HashMap::new(),
                task,
            },
        );

        Ok(Link {
            outgoing: client_tx,
            incoming: client_rx,
        })
    }
}
