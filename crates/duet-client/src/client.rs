//! `ChatClient`: the facade a UI talks to.
//!
//! Outbound: `submit` → sequencing → cache + store → reliability → relay.
//! Inbound: relay → ack → ordering → cache + store → display callback.
//!
//! Every background piece shares one cancellation token. Failures surface
//! as data (message status, presence, connection state), never as panics
//! across the UI boundary.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use dashmap::DashSet;
use duet_core::cache::MessageCache;
use duet_core::config::Config;
use duet_core::db::DatabaseError;
use duet_core::ids::{MessageIdGenerator, conversation_id, node_id_for};
use duet_core::message::{BROADCAST_RECEIVER, ChatMessage, MessageStatus};
use duet_core::protocol::{Command, ServerMessage};
use duet_core::store::MessageStore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connection::{
    ConnectionError, ConnectionEvent, ConnectionHandle, ConnectionState, RelayConnection,
};
use crate::envelope::Envelope;
use crate::error::ClientError;
use crate::ordering::{DisplayCallback, OrderingService};
use crate::reliability::{DeliveryUpdate, MessageTransport, ReliabilityService};
use crate::sequencing::{SequenceListener, SequencingError, SequencingService};

const EVENT_CHANNEL_CAPACITY: usize = 256;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Store writes, applied in order by a single task.
#[derive(Debug)]
enum PersistOp {
    Save(ChatMessage),
    Status(i64, MessageStatus),
    Read(i64),
}

async fn persist_writer(
    store: Arc<dyn MessageStore>,
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            op = rx.recv() => match op {
                Some(op) => apply(store.as_ref(), op).await,
                None => break,
            },
            () = stop.cancelled() => {
                while let Ok(op) = rx.try_recv() {
                    apply(store.as_ref(), op).await;
                }
                break;
            }
        }
    }
    debug!("Persist writer stopped");
}

async fn apply(store: &dyn MessageStore, op: PersistOp) {
    let result = match &op {
        PersistOp::Save(message) => store.persist(message).await.map(|_| ()),
        PersistOp::Status(id, status) => store.update_status(*id, *status).await,
        PersistOp::Read(id) => store.mark_read(*id).await,
    };
    match result {
        Ok(()) | Err(DatabaseError::NotFound(_)) => {}
        Err(e) => warn!(error = %e, ?op, "Store write failed"),
    }
}

#[derive(Default)]
struct PresenceState {
    users: BTreeSet<String>,
    refreshed: Option<Instant>,
    requested: Option<Instant>,
}

/// Cached online-user list, minus ourselves.
struct Presence {
    me: String,
    state: RwLock<PresenceState>,
}

impl Presence {
    fn new(me: String) -> Self {
        Self {
            me,
            state: RwLock::new(PresenceState::default()),
        }
    }

    fn replace(&self, users: Vec<String>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.users = users.into_iter().filter(|u| *u != self.me).collect();
        state.refreshed = Some(Instant::now());
    }

    fn remove(&self, user: &str) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .remove(user);
    }

    fn is_online(&self, user: &str) -> bool {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .contains(user)
    }

    fn snapshot(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .users
            .iter()
            .cloned()
            .collect()
    }

    /// True at most once per `max_age` while the list is stale.
    fn claim_refresh(&self, max_age: Duration) -> bool {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let fresh = |at: Option<Instant>| at.is_some_and(|t| t.elapsed() <= max_age);
        if fresh(state.refreshed) || fresh(state.requested) {
            return false;
        }
        state.requested = Some(Instant::now());
        true
    }
}

/// Sends chat envelopes as `PRIVATE` lines.
struct RelayTransport {
    connection: ConnectionHandle,
}

impl MessageTransport for RelayTransport {
    fn send(&self, message: &ChatMessage) -> Result<(), ConnectionError> {
        let content = Envelope::chat(message)
            .encode()
            .map_err(duet_core::Error::from)?;
        self.connection.send(Command::Private {
            receiver: message.receiver.clone(),
            content,
        })
    }
}

/// Takes freshly sequenced messages through cache, store and delivery.
struct SendPipeline {
    cache: Arc<MessageCache>,
    persist: mpsc::UnboundedSender<PersistOp>,
    reliability: ReliabilityService,
    presence: Arc<Presence>,
}

impl SequenceListener for SendPipeline {
    fn on_sequenced(&self, message: ChatMessage) {
        self.cache.add_message(&message);
        let _ = self.persist.send(PersistOp::Save(message.clone()));
        if self.presence.is_online(&message.receiver) {
            self.reliability.send_reliable(message);
        } else {
            info!(receiver = %message.receiver, id = message.id, "Receiver offline, queueing");
            let receiver = message.receiver.clone();
            self.reliability.add_offline_message(&receiver, message);
        }
    }

    fn on_error(&self, mut message: ChatMessage, error: SequencingError) {
        warn!(receiver = %message.receiver, error = %error, "Message not sequenced");
        message.status = MessageStatus::Failed;
        self.cache.add_message(&message);
    }
}

/// Relay timestamps are naive local time.
fn relay_time(timestamp: NaiveDateTime) -> DateTime<Utc> {
    Local
        .from_local_datetime(&timestamp)
        .earliest()
        .map_or_else(Utc::now, |t| t.with_timezone(&Utc))
}

/// Dispatches connection events into the delivery services.
struct Inbound {
    me: String,
    ids: Arc<MessageIdGenerator>,
    connection: ConnectionHandle,
    ordering: Arc<OrderingService>,
    reliability: ReliabilityService,
    presence: Arc<Presence>,
}

impl Inbound {
    async fn run(self, mut events: mpsc::Receiver<ConnectionEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                ConnectionEvent::Connected => info!("Connected to relay"),
                ConnectionEvent::Disconnected => warn!("Disconnected from relay"),
                ConnectionEvent::Message(message) => self.handle(message),
            }
        }
        debug!("Inbound loop stopped");
    }

    fn handle(&self, message: ServerMessage) {
        match message {
            ServerMessage::Users(users) => {
                self.presence.replace(users);
                self.drain_offline();
            }
            ServerMessage::Private {
                sender,
                receiver,
                content,
                timestamp,
            } => self.on_private(sender, receiver, content, timestamp),
            ServerMessage::Broadcast {
                sender,
                content,
                timestamp,
            } => {
                let mut message = ChatMessage::new(
                    self.ids.generate(""),
                    sender,
                    BROADCAST_RECEIVER,
                    content,
                    relay_time(timestamp),
                );
                message.status = MessageStatus::Delivered;
                self.ordering.add_message(message);
            }
            ServerMessage::Error(reason) => {
                if let Some(user) = offline_user(&reason) {
                    self.presence.remove(user);
                    self.reliability.park_pending_for(user);
                } else {
                    warn!(%reason, "Relay reported an error");
                }
            }
            ServerMessage::LoginSuccess | ServerMessage::HeartbeatAck => {}
        }
    }

    fn on_private(
        &self,
        sender: String,
        receiver: String,
        content: String,
        timestamp: NaiveDateTime,
    ) {
        match Envelope::decode(&content) {
            Some(Envelope::Ack { id }) => {
                self.reliability.acknowledge(id);
            }
            Some(Envelope::Chat {
                id,
                seq,
                sent_at,
                text,
            }) => {
                // Ack before ordering; a resend gets acked again.
                match Envelope::ack(id).encode() {
                    Ok(ack) => {
                        if let Err(e) = self.connection.send(Command::Private {
                            receiver: sender.clone(),
                            content: ack,
                        }) {
                            debug!(id, error = %e, "Could not send ack");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to encode ack"),
                }
                let mut message = ChatMessage::new(id, sender, receiver, text, sent_at);
                message.sequence_number = seq;
                message.status = MessageStatus::Delivered;
                self.ordering.add_message(message);
            }
            None => {
                let conversation = conversation_id(&sender, &receiver);
                let mut message = ChatMessage::new(
                    self.ids.generate(&conversation),
                    sender,
                    receiver,
                    content,
                    relay_time(timestamp),
                );
                message.status = MessageStatus::Delivered;
                self.ordering.add_message(message);
            }
        }
    }

    fn drain_offline(&self) {
        for user in self.presence.snapshot() {
            let queued = self.reliability.get_and_clear_offline_messages(&user);
            if queued.is_empty() {
                continue;
            }
            info!(user = %user, count = queued.len(), "Peer online, sending queued messages");
            for message in queued {
                self.reliability.send_reliable(message);
            }
        }
        debug!(me = %self.me, "Presence updated");
    }
}

fn offline_user(reason: &str) -> Option<&str> {
    reason
        .strip_prefix("user ")
        .and_then(|rest| rest.strip_suffix(" is offline"))
}

async fn apply_delivery_updates(
    mut updates: broadcast::Receiver<DeliveryUpdate>,
    cache: Arc<MessageCache>,
    persist: mpsc::UnboundedSender<PersistOp>,
    cancel: CancellationToken,
) {
    loop {
        let update = tokio::select! {
            () = cancel.cancelled() => break,
            update = updates.recv() => update,
        };
        match update {
            Ok(update) => {
                cache.update_delivery(update.message_id, update.status);
                let _ = persist.send(PersistOp::Status(update.message_id, update.status));
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Delivery updates lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Client-side chat engine.
pub struct ChatClient {
    username: String,
    config: Config,
    connection: ConnectionHandle,
    cache: Arc<MessageCache>,
    store: Arc<dyn MessageStore>,
    sequencing: SequencingService,
    ordering: Arc<OrderingService>,
    reliability: ReliabilityService,
    presence: Arc<Presence>,
    current_peer: RwLock<Option<String>>,
    seeded: DashSet<String>,
    persist: mpsc::UnboundedSender<PersistOp>,
    persist_stop: CancellationToken,
    persist_task: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    /// Start every background service and begin connecting to the relay.
    ///
    /// `on_display` runs on a background task for each message ready to
    /// show, in conversation order.
    pub fn start(
        config: Config,
        store: Arc<dyn MessageStore>,
        on_display: DisplayCallback,
    ) -> Result<Self, ClientError> {
        let username = config
            .client
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or(ClientError::MissingUsername)?;
        let node_id = config
            .client
            .node_id
            .unwrap_or_else(|| node_id_for(&username));
        let ids = Arc::new(MessageIdGenerator::new(node_id)?);
        let cache = Arc::new(MessageCache::new(&config.cache));
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let mut tasks = Vec::new();

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (connection, connection_task) =
            RelayConnection::spawn(&config.client, username.clone(), events_tx, cancel.clone());
        tasks.push(connection_task);

        let reliability = ReliabilityService::new(
            Arc::new(RelayTransport {
                connection: connection.clone(),
            }),
            &config.reliability,
        );
        let presence = Arc::new(Presence::new(username.clone()));

        let (persist, persist_rx) = mpsc::unbounded_channel();
        let persist_stop = CancellationToken::new();
        let persist_task = tokio::spawn(persist_writer(
            Arc::clone(&store),
            persist_rx,
            persist_stop.clone(),
        ));

        let sequencing = SequencingService::start(
            Arc::clone(&ids),
            Arc::new(SendPipeline {
                cache: Arc::clone(&cache),
                persist: persist.clone(),
                reliability: reliability.clone(),
                presence: Arc::clone(&presence),
            }),
            &config.sequencing,
            &tracker,
            cancel.clone(),
        );

        let display: DisplayCallback = {
            let cache = Arc::clone(&cache);
            let persist = persist.clone();
            Arc::new(move |message: ChatMessage| {
                cache.add_message(&message);
                if !message.is_broadcast() {
                    let _ = persist.send(PersistOp::Save(message.clone()));
                }
                on_display(message);
            })
        };
        let ordering = Arc::new(OrderingService::new(&config.ordering, display));
        tasks.push(ordering.start(cancel.clone()));
        tasks.push(cache.spawn_sweeper(config.cache.sweep_interval(), cancel.clone()));
        tasks.push(reliability.spawn_cleanup(cancel.clone()));

        tracker.spawn(
            Inbound {
                me: username.clone(),
                ids,
                connection: connection.clone(),
                ordering: Arc::clone(&ordering),
                reliability: reliability.clone(),
                presence: Arc::clone(&presence),
            }
            .run(events_rx, cancel.clone()),
        );
        tracker.spawn(apply_delivery_updates(
            reliability.subscribe(),
            Arc::clone(&cache),
            persist.clone(),
            cancel.clone(),
        ));

        info!(user = %username, server = %config.client.server_addr, "Chat client started");
        Ok(Self {
            username,
            config,
            connection,
            cache,
            store,
            sequencing,
            ordering,
            reliability,
            presence,
            current_peer: RwLock::new(None),
            seeded: DashSet::new(),
            persist,
            persist_stop,
            persist_task: Mutex::new(Some(persist_task)),
            cancel,
            tracker,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Start a reliable, sequenced send. `receiver == "all"` broadcasts.
    pub async fn submit(&self, receiver: &str, content: &str) -> Result<(), ClientError> {
        if receiver == BROADCAST_RECEIVER {
            self.connection
                .send(Command::Broadcast(content.to_owned()))?;
            return Ok(());
        }

        let conversation = conversation_id(&self.username, receiver);
        self.ensure_seeded(&conversation).await;
        match self
            .sequencing
            .sequence(&self.username, receiver, content, Utc::now())
        {
            Ok(()) => Ok(()),
            Err(SequencingError::QueueFull) => {
                warn!(%receiver, "Sequencer saturated, sending unsequenced");
                self.connection.send(Command::Private {
                    receiver: receiver.to_owned(),
                    content: content.to_owned(),
                })?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resume numbering above whatever this user already sent.
    async fn ensure_seeded(&self, conversation: &str) {
        if self.seeded.contains(conversation) {
            return;
        }
        match self.store.last_sequence(conversation, &self.username).await {
            Ok(Some(last)) => self.sequencing.seed_sequence(conversation, last),
            Ok(None) => {}
            Err(e) => warn!(conversation_id = conversation, error = %e, "Could not read last sequence"),
        }
        self.seeded.insert(conversation.to_owned());
    }

    /// Cached presence. A stale copy triggers a background `GET_USERS`.
    pub fn online_users(&self) -> Vec<String> {
        if self.presence.claim_refresh(self.config.client.presence_refresh()) {
            if let Err(e) = self.connection.send(Command::GetUsers) {
                debug!(error = %e, "Presence refresh skipped");
            }
        }
        self.presence.snapshot()
    }

    /// Switch the active conversation, flushing its reorder buffer.
    pub fn set_current_peer(&self, peer: &str) {
        let previous = self
            .current_peer
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(peer.to_owned());
        if let Some(previous) = previous.filter(|p| p != peer) {
            self.ordering
                .flush_conversation(&conversation_id(&self.username, &previous));
        }
        self.ordering
            .flush_conversation(&conversation_id(&self.username, peer));
    }

    pub fn current_peer(&self) -> Option<String> {
        self.current_peer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Recent history with `peer`, newest first. Store failures read as empty.
    pub async fn load_conversation(&self, peer: &str) -> Vec<ChatMessage> {
        let conversation = conversation_id(&self.username, peer);
        if let Some(messages) = self.cache.get_conversation(&conversation) {
            return messages;
        }

        let messages = match self
            .store
            .load_history(&conversation, self.config.cache.max_per_conversation)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                warn!(conversation_id = %conversation, error = %e, "History unavailable");
                return Vec::new();
            }
        };
        self.cache.put(&conversation, messages.clone());
        self.ensure_seeded(&conversation).await;
        messages
    }

    /// Messages in the conversation newer than `since`, from the cache.
    pub fn messages_since(&self, peer: &str, since: DateTime<Utc>) -> Option<Vec<ChatMessage>> {
        self.cache
            .get_since(&conversation_id(&self.username, peer), since)
    }

    pub fn mark_read(&self, message_id: i64) {
        self.cache.update_status(message_id, true);
        let _ = self.persist.send(PersistOp::Read(message_id));
    }

    pub fn subscribe_delivery(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.reliability.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), ClientError> {
        Ok(self.connection.wait_connected(timeout).await?)
    }

    pub const fn reliability(&self) -> &ReliabilityService {
        &self.reliability
    }

    pub fn cache(&self) -> &MessageCache {
        &self.cache
    }

    /// Log out, stop every background service and wait for them.
    pub async fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        info!(user = %self.username, "Chat client shutting down");
        self.cancel.cancel();
        let pending = self.reliability.shutdown();
        if pending > 0 {
            info!(pending, "Abandoned unacknowledged messages");
        }

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        self.tracker.close();
        let join_all = async {
            for task in tasks {
                let _ = task.await;
            }
            self.tracker.wait().await;
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
            warn!("Background tasks did not stop in time");
        }

        // Producers are gone; let the writer drain what is queued.
        self.persist_stop.cancel();
        let writer = self
            .persist_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(writer) = writer {
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer).await;
        }
        debug!(cache = ?self.cache.stats(), "Chat client stopped");
    }
}
