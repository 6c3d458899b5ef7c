//! The sync engine: owns the store and drives the channel and the backend.
//!
//! Single owner. Every mutation runs on `&mut self`; REST calls run as
//! spawned tasks that post their result back as an [`EngineEvent`]. The host
//! loops `next_event().await` then `handle(event)` and re-reads whatever the
//! returned [`Update`]s name.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use lingua_api::{ApiError, ChatBackend};
use lingua_gateway::{Channel, ConnectionState, Connector};
use lingua_types::events::{COMPOSE_DESTINATION, ComposeAction, PERSONAL_QUEUE, topic_conversation};
use lingua_types::{ConversationId, ConversationKind, CorrelationToken, Message, UserId, UserSummary};

use crate::config::SyncConfig;
use crate::cursor::{PageCursor, PageTicket};
use crate::error::SyncError;
use crate::normalize::{
    ConversationSummary, Draft, normalize_history, normalize_push, normalize_summary,
};
use crate::router::SubscriptionRouter;
use crate::store::{Conversation, ConversationStore, HistoryDirection, LiveOutcome, Placement};

/// A conversation-level REST action, echoed back with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreateDirect { user_id: UserId },
    CreateGroup { name: String, members: Vec<UserId>, locale: Option<String> },
    Rename { conversation_id: ConversationId, name: String },
    SetLocale { conversation_id: ConversationId, locale: String },
    AddMembers { conversation_id: ConversationId, members: Vec<UserId> },
}

impl Action {
    fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::Rename { conversation_id, .. }
            | Self::SetLocale { conversation_id, .. }
            | Self::AddMembers { conversation_id, .. } => Some(conversation_id),
            Self::CreateDirect { .. } | Self::CreateGroup { .. } => None,
        }
    }

    fn creates(&self) -> bool {
        matches!(self, Self::CreateDirect { .. } | Self::CreateGroup { .. })
    }

    /// Fills in what the action itself establishes when the server's result
    /// leaves it out.
    fn complete(&self, summary: &mut ConversationSummary) {
        match self {
            Self::CreateDirect { user_id } => push_participant(summary, user_id),
            Self::CreateGroup { name, members, locale } => {
                summary.kind = ConversationKind::Group;
                summary.display_name.get_or_insert_with(|| name.clone());
                if summary.locale.is_none() {
                    summary.locale = locale.clone();
                }
                for member in members {
                    push_participant(summary, member);
                }
            }
            Self::Rename { name, .. } => {
                summary.display_name.get_or_insert_with(|| name.clone());
            }
            Self::SetLocale { locale, .. } => {
                summary.locale.get_or_insert_with(|| locale.clone());
            }
            Self::AddMembers { members, .. } => {
                summary.kind = ConversationKind::Group;
                for member in members {
                    push_participant(summary, member);
                }
            }
        }
    }
}

fn push_participant(summary: &mut ConversationSummary, user_id: &UserId) {
    if !summary.participants.iter().any(|p| &p.user_id == user_id) {
        summary.participants.push(UserSummary {
            user_id: user_id.clone(),
            username: None,
            full_name: None,
            avatar_url: None,
        });
    }
}

/// Input to [`SyncEngine::handle`].
#[derive(Debug)]
pub enum EngineEvent {
    ConversationsFetched {
        ticket: PageTicket,
        result: Result<Vec<Value>, ApiError>,
    },
    HistoryFetched {
        conversation_id: ConversationId,
        ticket: PageTicket,
        result: Result<Vec<Value>, ApiError>,
    },
    /// Newest page refetched after a reconnect, merged without touching the
    /// history cursor.
    CatchUpFetched {
        conversation_id: ConversationId,
        result: Result<Vec<Value>, ApiError>,
    },
    ActionCompleted {
        action: Action,
        result: Result<Value, ApiError>,
    },
    Delivery(lingua_gateway::Delivery),
    Connection(ConnectionState),
    /// The oldest pending send ran out of echo window.
    PendingExpired,
}

/// What changed, for the UI to re-read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    ConversationsChanged,
    MessagesChanged {
        conversation_id: ConversationId,
        /// Entries added in front of what was shown, for scroll anchoring.
        prepended: usize,
    },
    ConnectionChanged(ConnectionState),
    /// A page fetch failed; `None` is the conversation list. Retryable.
    FetchFailed {
        conversation_id: Option<ConversationId>,
        error: String,
    },
    ConversationCreated(ConversationId),
    ActionFailed {
        action: Action,
        error: String,
    },
}

/// Result of [`SyncEngine::send`]. The pending message is in the store
/// either way; `published == false` means it was marked failed.
#[derive(Debug, Clone, PartialEq)]
pub struct SendReceipt {
    pub token: CorrelationToken,
    pub message: Message,
    pub published: bool,
}

pub struct SyncEngine<B: ChatBackend> {
    config: SyncConfig,
    backend: B,
    channel: Channel,
    store: ConversationStore,
    router: SubscriptionRouter,
    conversation_pages: PageCursor,
    open: Option<ConversationId>,
    has_connected: bool,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
    deliveries_tx: mpsc::UnboundedSender<lingua_gateway::Delivery>,
    deliveries_rx: mpsc::UnboundedReceiver<lingua_gateway::Delivery>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl<B: ChatBackend> SyncEngine<B> {
    pub fn new(config: SyncConfig, backend: B, channel: Channel, self_id: UserId) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (deliveries_tx, deliveries_rx) = mpsc::unbounded_channel();
        let state_rx = channel.watch_state();
        Self {
            store: ConversationStore::new(self_id, config.message_page_size, config.echo_window),
            router: SubscriptionRouter::new(config.recent_limit),
            conversation_pages: PageCursor::new(config.conversation_page_size),
            config,
            backend,
            channel,
            open: None,
            has_connected: false,
            events_tx,
            events_rx,
            deliveries_tx,
            deliveries_rx,
            state_rx,
        }
    }

    /// Another id the backend may file the signed-in user's messages under,
    /// typically the username when `self_id` is the user id.
    pub fn add_self_alias(&mut self, alias: UserId) {
        self.store.add_self_alias(alias);
    }

    // -- Read side --

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Conversations, most recently active first.
    pub fn conversations(&self) -> impl Iterator<Item = &Conversation> {
        self.store.conversations()
    }

    pub fn conversation(&self, id: &ConversationId) -> Option<&Conversation> {
        self.store.conversation(id)
    }

    pub fn open_conversation_id(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn conversation_pages(&self) -> &PageCursor {
        &self.conversation_pages
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.channel.state()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    // -- Connection --

    /// Starts the channel. The personal queue and the routed conversation
    /// topics are registered first so the session replays them.
    pub fn connect<C: Connector>(&mut self, connector: C, credential: impl Into<String>) {
        self.channel.subscribe(PERSONAL_QUEUE, self.deliveries_tx.clone());
        self.sync_subscriptions();
        self.channel.connect(connector, credential);
    }

    pub fn disconnect(&mut self) {
        self.channel.disconnect();
    }

    // -- Conversations --

    /// Requests the next conversation list page. `false` when one is already
    /// in flight or the list is exhausted.
    pub fn load_more_conversations(&mut self) -> bool {
        let Some(ticket) = self.conversation_pages.begin() else {
            debug!("Conversation page request skipped");
            return false;
        };
        debug!("Fetching conversation page {}", ticket.page);
        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = backend.list_conversations(ticket.page, ticket.size).await;
            let _ = tx.send(EngineEvent::ConversationsFetched { ticket, result });
        });
        true
    }

    /// Starts the list over from page 0. A fetch still in flight is ignored
    /// when it lands.
    pub fn refresh_conversations(&mut self) -> bool {
        self.conversation_pages.reset();
        self.load_more_conversations()
    }

    /// Makes `id` the open conversation: marks it read, loads its first
    /// history page if none is loaded, and keeps its topic subscribed.
    pub fn open_conversation(&mut self, id: &ConversationId) -> Result<(), SyncError> {
        self.store.mark_read(id)?;
        self.open = Some(id.clone());
        let loaded = self.store.conversation(id).is_some_and(|c| c.history().has_loaded());
        if !loaded {
            self.request_history(id);
        }
        self.sync_subscriptions();
        Ok(())
    }

    pub fn close_conversation(&mut self) {
        if self.open.take().is_some() {
            self.sync_subscriptions();
        }
    }

    /// Requests the next older history page. `false` when one is in flight
    /// or the history is exhausted.
    pub fn load_older_messages(&mut self, id: &ConversationId) -> Result<bool, SyncError> {
        if !self.store.contains(id) {
            return Err(SyncError::UnknownConversation(id.clone()));
        }
        Ok(self.request_history(id))
    }

    pub fn mark_read(&mut self, id: &ConversationId) -> Result<bool, SyncError> {
        self.store.mark_read(id)
    }

    /// Inserts the draft optimistically and publishes it.
    pub fn send(&mut self, id: &ConversationId, draft: Draft) -> Result<SendReceipt, SyncError> {
        let (token, mut message) = self.store.apply_optimistic_send(id, &draft, Utc::now())?;
        let action = ComposeAction {
            conversation_id: id.clone(),
            message_text: message.content_key().to_string(),
            kind: message.kind,
            correlation_id: Some(token),
        };
        let published = match serde_json::to_string(&action) {
            Ok(payload) => self.channel.publish(COMPOSE_DESTINATION, &payload),
            Err(e) => {
                warn!("Failed to encode compose action: {}", e);
                false
            }
        };
        if !published {
            warn!("Send to {} failed, keeping message {} as failed", id, token);
            self.store.mark_send_failed(token);
            message.delivery = lingua_types::Delivery::Failed;
        }
        self.sync_subscriptions();
        Ok(SendReceipt {
            token,
            message,
            published,
        })
    }

    // -- REST actions --

    pub fn create_direct(&mut self, user_id: &UserId) {
        let backend = self.backend.clone();
        let target = user_id.clone();
        self.spawn_action(Action::CreateDirect { user_id: user_id.clone() }, async move {
            backend.create_direct(&target).await
        });
    }

    pub fn create_group(&mut self, name: &str, members: &[UserId], locale: Option<&str>) {
        let backend = self.backend.clone();
        let action = Action::CreateGroup {
            name: name.to_string(),
            members: members.to_vec(),
            locale: locale.map(str::to_owned),
        };
        let (name, members, locale) = (name.to_string(), members.to_vec(), locale.map(str::to_owned));
        self.spawn_action(action, async move {
            backend.create_group(&name, &members, locale.as_deref()).await
        });
    }

    pub fn rename(&mut self, id: &ConversationId, name: &str) -> Result<(), SyncError> {
        self.require(id)?;
        let backend = self.backend.clone();
        let (target, new_name) = (id.clone(), name.to_string());
        let action = Action::Rename {
            conversation_id: id.clone(),
            name: name.to_string(),
        };
        self.spawn_action(action, async move { backend.rename(&target, &new_name).await });
        Ok(())
    }

    pub fn set_locale(&mut self, id: &ConversationId, locale: &str) -> Result<(), SyncError> {
        self.require(id)?;
        let backend = self.backend.clone();
        let (target, code) = (id.clone(), locale.to_string());
        let action = Action::SetLocale {
            conversation_id: id.clone(),
            locale: locale.to_string(),
        };
        self.spawn_action(action, async move { backend.set_locale(&target, &code).await });
        Ok(())
    }

    pub fn add_members(&mut self, id: &ConversationId, members: &[UserId]) -> Result<(), SyncError> {
        self.require(id)?;
        let backend = self.backend.clone();
        let (target, users) = (id.clone(), members.to_vec());
        let action = Action::AddMembers {
            conversation_id: id.clone(),
            members: members.to_vec(),
        };
        self.spawn_action(action, async move { backend.add_members(&target, &users).await });
        Ok(())
    }

    // -- Event loop --

    /// Waits for the next fetch result, delivery, connection change, or
    /// echo deadline.
    pub async fn next_event(&mut self) -> EngineEvent {
        let expiry = self
            .store
            .next_pending_expiry()
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or_default());
        tokio::select! {
            Some(event) = self.events_rx.recv() => event,
            Some(delivery) = self.deliveries_rx.recv() => EngineEvent::Delivery(delivery),
            Ok(()) = self.state_rx.changed() => {
                EngineEvent::Connection(self.state_rx.borrow_and_update().clone())
            }
            _ = sleep_for(expiry) => EngineEvent::PendingExpired,
        }
    }

    pub fn handle(&mut self, event: EngineEvent) -> Vec<Update> {
        match event {
            EngineEvent::ConversationsFetched { ticket, result } => self.on_conversations(ticket, result),
            EngineEvent::HistoryFetched {
                conversation_id,
                ticket,
                result,
            } => self.on_history(conversation_id, ticket, result),
            EngineEvent::CatchUpFetched { conversation_id, result } => self.on_catch_up(conversation_id, result),
            EngineEvent::ActionCompleted { action, result } => self.on_action(action, result),
            EngineEvent::Delivery(delivery) => self.on_delivery(delivery),
            EngineEvent::Connection(state) => self.on_connection(state),
            EngineEvent::PendingExpired => self.on_pending_expired(),
        }
    }

    /// `next_event` then `handle`.
    pub async fn process_next(&mut self) -> Vec<Update> {
        let event = self.next_event().await;
        self.handle(event)
    }

    // -- Handlers --

    fn on_conversations(&mut self, ticket: PageTicket, result: Result<Vec<Value>, ApiError>) -> Vec<Update> {
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                if !self.conversation_pages.fail(ticket) {
                    return Vec::new();
                }
                warn!("Conversation page {} failed: {}", ticket.page, e);
                return vec![Update::FetchFailed {
                    conversation_id: None,
                    error: e.to_string(),
                }];
            }
        };
        if !self.conversation_pages.complete(ticket, raw.len()) {
            debug!("Dropping stale conversation page {}", ticket.page);
            return Vec::new();
        }

        let now = Utc::now();
        let summaries: Vec<ConversationSummary> = raw
            .iter()
            .filter_map(|item| match normalize_summary(item, now) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("Dropping conversation list item: {}", e);
                    None
                }
            })
            .collect();
        let created = self.store.apply_conversation_page(summaries, ticket.page == 0);
        info!(
            "Conversation page {}: {} items, {} new, exhausted={}",
            ticket.page,
            raw.len(),
            created,
            self.conversation_pages.is_exhausted()
        );
        self.sync_subscriptions();
        vec![Update::ConversationsChanged]
    }

    fn on_history(
        &mut self,
        conversation_id: ConversationId,
        ticket: PageTicket,
        result: Result<Vec<Value>, ApiError>,
    ) -> Vec<Update> {
        let Some(cursor) = self.store.history_mut(&conversation_id) else {
            return Vec::new();
        };
        let raw = match result {
            Ok(raw) => raw,
            Err(e) => {
                if !cursor.fail(ticket) {
                    return Vec::new();
                }
                warn!("History page {} of {} failed: {}", ticket.page, conversation_id, e);
                return vec![Update::FetchFailed {
                    conversation_id: Some(conversation_id),
                    error: e.to_string(),
                }];
            }
        };
        if !cursor.complete(ticket, raw.len()) {
            return Vec::new();
        }

        let direction = if ticket.page == 0 {
            HistoryDirection::Initial
        } else {
            HistoryDirection::Older
        };
        self.merge_history(conversation_id, &raw, direction)
    }

    fn on_catch_up(&mut self, conversation_id: ConversationId, result: Result<Vec<Value>, ApiError>) -> Vec<Update> {
        match result {
            Ok(raw) => self.merge_history(conversation_id, &raw, HistoryDirection::CatchUp),
            Err(e) => {
                warn!("Catch-up fetch for {} failed: {}", conversation_id, e);
                vec![Update::FetchFailed {
                    conversation_id: Some(conversation_id),
                    error: e.to_string(),
                }]
            }
        }
    }

    fn merge_history(&mut self, conversation_id: ConversationId, raw: &[Value], direction: HistoryDirection) -> Vec<Update> {
        let now = Utc::now();
        // Pages arrive newest first.
        let messages: Vec<Message> = raw
            .iter()
            .rev()
            .filter_map(|item| match normalize_history(item, &conversation_id, now) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Dropping history record in {}: {}", conversation_id, e);
                    None
                }
            })
            .collect();

        match self.store.apply_history_page(&conversation_id, messages, direction, now) {
            Ok(outcome) => {
                if outcome.arrived > 0 {
                    info!("{} message(s) arrived in {} while disconnected", outcome.arrived, conversation_id);
                    if self.open.as_ref() == Some(&conversation_id) {
                        let _ = self.store.mark_read(&conversation_id);
                    }
                    self.sync_subscriptions();
                }
                vec![
                Update::MessagesChanged {
                    conversation_id,
                    prepended: outcome.prepended,
                },
                Update::ConversationsChanged,
                ]
            }
            Err(e) => {
                warn!("History merge failed: {}", e);
                Vec::new()
            }
        }
    }

    fn on_action(&mut self, action: Action, result: Result<Value, ApiError>) -> Vec<Update> {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                warn!("{:?} failed: {}", action, e);
                return vec![Update::ActionFailed {
                    action,
                    error: e.to_string(),
                }];
            }
        };

        let mut summary = match (normalize_summary(&value, Utc::now()), action.conversation_id()) {
            (Ok(summary), _) => summary,
            (Err(_), Some(id)) => ConversationSummary::new(id.clone()),
            (Err(e), None) => {
                warn!("{:?} returned no usable conversation: {}", action, e);
                return vec![Update::ActionFailed {
                    action,
                    error: e.to_string(),
                }];
            }
        };
        action.complete(&mut summary);

        let id = summary.id.clone();
        let placement = if action.creates() { Placement::Top } else { Placement::Keep };
        let created = self.store.merge_summary(summary, placement);
        self.sync_subscriptions();

        let mut updates = vec![Update::ConversationsChanged];
        if action.creates() || created {
            info!("Conversation {} available", id);
            updates.push(Update::ConversationCreated(id));
        }
        updates
    }

    fn on_delivery(&mut self, delivery: lingua_gateway::Delivery) -> Vec<Update> {
        let raw: Value = match serde_json::from_str(&delivery.body) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Dropping undecodable delivery on {}: {}", delivery.topic, e);
                return Vec::new();
            }
        };
        let topic_conversation = topic_conversation(&delivery.topic);
        let update = match normalize_push(&raw, topic_conversation.as_ref()) {
            Ok(update) => update,
            Err(e) => {
                warn!("Dropping delivery on {}: {}", delivery.topic, e);
                return Vec::new();
            }
        };

        let conversation_id = update.conversation_id.clone();
        let outcome = match self.store.apply_live_event(&conversation_id, update, Utc::now()) {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("Dropping live event for {}: {}", conversation_id, e);
                return Vec::new();
            }
        };
        debug!("Live event in {}: {:?}", conversation_id, outcome);

        match outcome {
            LiveOutcome::Unchanged => Vec::new(),
            LiveOutcome::Merged => vec![
                Update::MessagesChanged {
                    conversation_id,
                    prepended: 0,
                },
                Update::ConversationsChanged,
            ],
            LiveOutcome::Inserted | LiveOutcome::Reconciled(_) => {
                if self.open.as_ref() == Some(&conversation_id) {
                    let _ = self.store.mark_read(&conversation_id);
                }
                self.sync_subscriptions();
                vec![
                    Update::MessagesChanged {
                        conversation_id,
                        prepended: 0,
                    },
                    Update::ConversationsChanged,
                ]
            }
        }
    }

    fn on_connection(&mut self, state: ConnectionState) -> Vec<Update> {
        if state == ConnectionState::Connected {
            if self.has_connected {
                self.catch_up();
            }
            self.has_connected = true;
        }
        vec![Update::ConnectionChanged(state)]
    }

    fn on_pending_expired(&mut self) -> Vec<Update> {
        self.store
            .expire_pending(Utc::now())
            .into_iter()
            .map(|conversation_id| {
                warn!(
                    "Send in {} not echoed within {:?}, marked failed",
                    conversation_id, self.config.echo_window
                );
                Update::MessagesChanged {
                    conversation_id,
                    prepended: 0,
                }
            })
            .collect()
    }

    // -- Internals --

    fn require(&self, id: &ConversationId) -> Result<(), SyncError> {
        if self.store.contains(id) {
            Ok(())
        } else {
            Err(SyncError::UnknownConversation(id.clone()))
        }
    }

    fn request_history(&mut self, id: &ConversationId) -> bool {
        let Some(ticket) = self.store.history_mut(id).and_then(|cursor| cursor.begin()) else {
            debug!("History request for {} skipped", id);
            return false;
        };
        debug!("Fetching history page {} of {}", ticket.page, id);
        let backend = self.backend.clone();
        let tx = self.events_tx.clone();
        let conversation_id = id.clone();
        tokio::spawn(async move {
            let result = backend.list_messages(&conversation_id, ticket.page, ticket.size).await;
            let _ = tx.send(EngineEvent::HistoryFetched {
                conversation_id,
                ticket,
                result,
            });
        });
        true
    }

    /// Refetches the newest page of every routed conversation with loaded
    /// history, covering whatever was pushed while the channel was down.
    fn catch_up(&mut self) {
        let desired = self.router.desired(self.store.order(), self.open.as_ref());
        let targets: Vec<ConversationId> = desired
            .iter()
            .filter_map(|topic| topic_conversation(topic))
            .filter(|id| self.store.conversation(id).is_some_and(|c| c.history().has_loaded()))
            .collect();
        for conversation_id in targets {
            debug!("Catching up {} after reconnect", conversation_id);
            let backend = self.backend.clone();
            let tx = self.events_tx.clone();
            let size = self.config.message_page_size;
            tokio::spawn(async move {
                let result = backend.list_messages(&conversation_id, 0, size).await;
                let _ = tx.send(EngineEvent::CatchUpFetched { conversation_id, result });
            });
        }
    }

    fn spawn_action<F>(&self, action: Action, call: F)
    where
        F: Future<Output = Result<Value, ApiError>> + Send + 'static,
    {
        debug!("Starting {:?}", action);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let result = call.await;
            let _ = tx.send(EngineEvent::ActionCompleted { action, result });
        });
    }

    fn sync_subscriptions(&mut self) {
        let desired = self.router.desired(self.store.order(), self.open.as_ref());
        let delta = self.router.plan(&desired, &self.channel.topics());
        if delta.is_empty() {
            return;
        }
        for topic in &delta.unsubscribe {
            self.channel.unsubscribe(topic);
        }
        for topic in &delta.subscribe {
            self.channel.subscribe(topic, self.deliveries_tx.clone());
        }
        debug!(
            "Subscriptions: +{} -{}",
            delta.subscribe.len(),
            delta.unsubscribe.len()
        );
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
