//! Realtime multi-device synchronization.
//!
//! Every websocket connection registers with the [`RealtimeSyncHub`] and gets
//! a bounded outbound queue. Chat frames are admitted synchronously (ownership
//! check, rate limit, a place in the session's turn queue in receipt order)
//! and the turn itself runs on a spawned task. The user message is stored when
//! the turn starts; the reply goes back to the originating connection while
//! durable events fan out to every other device on the same session.
//!
//! Delivery is at-least-once. Durable frames carry a stable message id and each
//! connection remembers the ids it has already been sent, so replays after a
//! reconnect never repeat a frame on the same connection.

mod dedup;
mod merge;
mod protocol;
mod rate_limit;

pub use dedup::RecentIds;
pub use merge::{ActivePointer, MergeDecision, resolve};
pub use protocol::{
    ChatFrame, DetailsFrame, InboundMessage, OutboundMessage, UnsyncedMessage,
};
pub use rate_limit::{RateLimitState, SessionRateLimiter};

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::auth::TokenService;
use crate::config::{HubConfig, RateLimitConfig};
use crate::conversation::{
    ConversationEngine, DUPLICATE_TEXT, ErrorCode, ErrorReply, TurnRequest, TurnResponse,
    UNAVAILABLE_TEXT,
};
use crate::search::{ProductDetails, SearchError};
use crate::session::{Message, Session, SessionStore, TurnTicket, session_created_ms};

const SESSION_EXPIRED_TEXT: &str =
    "Your session has expired, so we started a new one. Please send your message again.";
const RATE_LIMITED_TEXT: &str = "You're sending messages too quickly. Please wait a moment.";
const BAD_REQUEST_TEXT: &str = "That message could not be understood.";
const EMPTY_MESSAGE_TEXT: &str = "Please type a message.";
const DETAILS_FAILED_TEXT: &str = "Product details are unavailable right now.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Parameters of a new connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    /// Timestamp of the last message the device received.
    pub last_seen: Option<i64>,
}

/// Result of admitting a chat frame.
#[derive(Debug)]
pub enum Admission {
    Accepted(AcceptedTurn),
    /// Answered without running a turn.
    Rejected(TurnResponse),
    /// Message id seen before; nothing to do.
    Duplicate,
}

#[derive(Debug)]
pub struct AcceptedTurn {
    pub request: TurnRequest,
    pub session_token: Option<String>,
    /// Queue position taken at admission.
    pub ticket: TurnTicket,
}

enum Resolution {
    Use(Session),
    /// Ownership check failed; a new session replaces the requested one.
    Replaced(Session),
    Unavailable,
}

enum Push {
    Sent,
    Duplicate,
    Dropped,
}

struct Connection {
    tx: mpsc::Sender<OutboundMessage>,
    user_id: Option<String>,
    session_id: Option<String>,
    sent: RecentIds,
    received: RecentIds,
}

impl Connection {
    fn push(&mut self, message: OutboundMessage) -> Push {
        if let Some(id) = message.durable_id()
            && !self.sent.insert(id)
        {
            return Push::Duplicate;
        }
        match self.tx.try_send(message) {
            Ok(()) => Push::Sent,
            Err(_) => Push::Dropped,
        }
    }
}

pub struct RealtimeSyncHub {
    engine: Arc<ConversationEngine>,
    tokens: Arc<TokenService>,
    limiter: SessionRateLimiter,
    config: HubConfig,
    next_id: AtomicU64,
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    /// Active session per user.
    pointers: Mutex<HashMap<String, ActivePointer>>,
}

impl fmt::Debug for RealtimeSyncHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeSyncHub")
            .field("config", &self.config)
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

impl RealtimeSyncHub {
    pub fn new(
        engine: Arc<ConversationEngine>,
        tokens: Arc<TokenService>,
        rate_limit: &RateLimitConfig,
        config: HubConfig,
    ) -> Self {
        Self {
            engine,
            tokens,
            limiter: SessionRateLimiter::new(rate_limit),
            config,
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            pointers: Mutex::new(HashMap::new()),
        }
    }

    pub fn engine(&self) -> &ConversationEngine {
        &self.engine
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    fn sessions(&self) -> &SessionStore {
        self.engine.sessions()
    }

    fn lock_connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pointers(&self) -> MutexGuard<'_, HashMap<String, ActivePointer>> {
        self.pointers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connection_count(&self) -> usize {
        self.lock_connections().len()
    }

    /// Register a connection. Messages persisted after `last_seen` are queued
    /// before the connection becomes visible to live fan-out.
    pub fn connect(&self, params: ConnectParams) -> (ConnectionId, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut connections = self.lock_connections();

        let session_id = params
            .session_id
            .filter(|s| self.may_access(s, params.user_id.as_deref()));
        let replay = match (&session_id, params.last_seen) {
            (Some(session_id), Some(last_seen)) => self.sessions().messages_since(session_id, last_seen),
            _ => Vec::new(),
        };

        let (tx, rx) = mpsc::channel(self.config.outbound_queue.max(1) + replay.len());
        let mut connection = Connection {
            tx,
            user_id: params.user_id,
            session_id,
            sent: RecentIds::new(self.config.dedup_capacity),
            received: RecentIds::new(self.config.dedup_capacity),
        };
        if let Some(session_id) = connection.session_id.clone() {
            for message in &replay {
                connection.push(OutboundMessage::replay(&session_id, message));
            }
        }

        info!(
            connection = %id,
            user_id = connection.user_id.as_deref().unwrap_or("anonymous"),
            session_id = connection.session_id.as_deref().unwrap_or(""),
            replayed = replay.len(),
            "Connection registered"
        );
        connections.insert(id, connection);
        (id, rx)
    }

    pub fn disconnect(&self, id: ConnectionId) {
        if self.lock_connections().remove(&id).is_some() {
            info!(connection = %id, "Connection closed");
        }
    }

    /// Handle one raw inbound frame.
    pub fn handle_frame(self: &Arc<Self>, origin: ConnectionId, text: &str) {
        match serde_json::from_str::<InboundMessage>(text) {
            Ok(message) => self.handle_inbound(origin, message),
            Err(e) => {
                debug!(connection = %origin, error = %e, "Malformed frame");
                let reply = self.detached_error(origin, ErrorCode::BadRequest, BAD_REQUEST_TEXT);
                self.send_to(origin, OutboundMessage::Error(reply));
            }
        }
    }

    pub fn handle_inbound(self: &Arc<Self>, origin: ConnectionId, message: InboundMessage) {
        match message {
            InboundMessage::Chat(frame) => match self.admit_chat(Some(origin), frame) {
                Admission::Accepted(turn) => {
                    let hub = Arc::clone(self);
                    tokio::spawn(async move {
                        hub.run_turn(Some(origin), turn).await;
                    });
                }
                Admission::Rejected(response) => {
                    self.send_to(origin, response.into());
                }
                Admission::Duplicate => {}
            },
            InboundMessage::ProductDetails(frame) => {
                let hub = Arc::clone(self);
                tokio::spawn(async move {
                    let reply = match hub.product_details(&frame).await {
                        Ok(details) => OutboundMessage::ProductDetails {
                            page_token: frame.page_token,
                            details,
                        },
                        Err(e) => {
                            warn!(error = %e, "Product details failed");
                            OutboundMessage::Error(hub.detached_error(
                                origin,
                                ErrorCode::SearchFailed,
                                DETAILS_FAILED_TEXT,
                            ))
                        }
                    };
                    hub.send_to(origin, reply);
                });
            }
            InboundMessage::SyncSession {
                session_id,
                unsynced_messages,
                has_history,
            } => self.sync_session(origin, &session_id, unsynced_messages, has_history),
            InboundMessage::SyncPreferences { preferences } => {
                self.sync_to_user_devices(origin, OutboundMessage::PreferencesUpdated { preferences });
            }
            InboundMessage::SyncSavedSearch { search } => {
                self.sync_to_user_devices(origin, OutboundMessage::SavedSearchUpdated { search });
            }
            InboundMessage::Resume {
                session_id,
                last_seen,
            } => self.resume(origin, &session_id, last_seen),
            InboundMessage::Ping => {
                self.send_to(origin, OutboundMessage::Pong);
            }
        }
    }

    /// Validate a chat frame and queue its turn.
    ///
    /// Runs synchronously so turns are queued in receipt order.
    #[instrument(skip(self, frame), fields(session_id = frame.session_id.as_deref().unwrap_or("")))]
    pub fn admit_chat(&self, origin: Option<ConnectionId>, frame: ChatFrame) -> Admission {
        let max = self.engine.max_searches();
        let user_id = self.resolve_user(origin, frame.access_token.as_deref());

        let text = frame.message.trim().to_string();
        if text.is_empty() {
            let session_id = frame.session_id.clone().unwrap_or_default();
            return Admission::Rejected(TurnResponse::Error(ErrorReply::detached(
                ErrorCode::BadRequest,
                EMPTY_MESSAGE_TEXT,
                &session_id,
                max,
            )));
        }

        if let (Some(origin), Some(message_id)) = (origin, frame.message_id.as_deref())
            && self
                .lock_connections()
                .get(&origin)
                .is_some_and(|c| c.received.contains(message_id))
        {
            debug!(message_id, "Duplicate inbound message dropped");
            return Admission::Duplicate;
        }

        let session = match self.resolve_session(&frame, user_id.as_deref()) {
            Resolution::Use(session) => session,
            Resolution::Unavailable => {
                return Admission::Rejected(TurnResponse::Error(ErrorReply::detached(
                    ErrorCode::Unavailable,
                    "Sessions are unavailable right now. Please try again.",
                    frame.session_id.as_deref().unwrap_or_default(),
                    max,
                )));
            }
            Resolution::Replaced(fresh) => {
                warn!(
                    rejected = frame.session_id.as_deref().unwrap_or(""),
                    session_id = %fresh.id,
                    "Session ownership check failed, started a new session"
                );
                self.subscribe(origin, &fresh.id);
                let mut response = TurnResponse::Error(ErrorReply::new(
                    ErrorCode::SessionExpired,
                    SESSION_EXPIRED_TEXT,
                    &fresh,
                    max,
                ));
                response.set_session_token(self.session_token(&fresh.id, user_id.as_deref()));
                return Admission::Rejected(response);
            }
        };

        if let Err(state) = self.limiter.check(&session.id) {
            info!(session_id = %session.id, retry_after = state.retry_after, "Turn rate limited");
            return Admission::Rejected(TurnResponse::Error(
                ErrorReply::new(ErrorCode::RateLimited, RATE_LIMITED_TEXT, &session, max)
                    .with_retry_after(state.retry_after),
            ));
        }

        let ticket = match self.sessions().enqueue_turn(&session.id) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(error = %e, "Failed to queue turn");
                return Admission::Rejected(TurnResponse::Error(ErrorReply::detached(
                    ErrorCode::SessionExpired,
                    SESSION_EXPIRED_TEXT,
                    &session.id,
                    max,
                )));
            }
        };

        if let Some(origin) = origin {
            let mut connections = self.lock_connections();
            if let Some(connection) = connections.get_mut(&origin) {
                if let Some(message_id) = &frame.message_id {
                    connection.received.insert(message_id);
                }
                connection.session_id = Some(session.id.clone());
            }
        }
        if let Some(user_id) = &user_id {
            self.lock_pointers()
                .entry(user_id.clone())
                .or_insert_with(|| ActivePointer::new(session.id.clone(), false, true));
        }

        Admission::Accepted(AcceptedTurn {
            session_token: self.session_token(&session.id, user_id.as_deref()),
            ticket,
            request: TurnRequest {
                session_id: session.id,
                text,
                locale: frame.locale(),
                message_id: frame.message_id,
                new_search: frame.new_search,
                client_category: frame.current_category,
                user_id,
            },
        })
    }

    /// Run an admitted turn, fan out its messages and reply to the origin.
    ///
    /// The turn completes and persists even when the origin has gone away.
    /// Returns `None` when the user message had already been stored.
    pub async fn run_turn(
        &self,
        origin: Option<ConnectionId>,
        turn: AcceptedTurn,
    ) -> Option<TurnResponse> {
        let session_id = turn.request.session_id.clone();
        let outcome = self
            .engine
            .process_queued(turn.ticket, turn.request, |stored| {
                self.fan_out(
                    &session_id,
                    &OutboundMessage::UserMessageSync {
                        session_id: session_id.clone(),
                        message: stored.as_synced(),
                    },
                    origin,
                );
            })
            .await;
        if outcome.duplicate {
            debug!(session_id = %session_id, "Duplicate message, turn dropped");
            return None;
        }

        let mut response = outcome.response;
        response.set_session_token(turn.session_token);

        if let Some(message) = outcome.assistant_message {
            self.fan_out(
                &session_id,
                &OutboundMessage::AssistantMessageSync {
                    session_id: session_id.clone(),
                    message: message.as_synced(),
                },
                origin,
            );
        }
        if let Some(origin) = origin
            && !self.send_to(origin, response.clone().into())
        {
            debug!(connection = %origin, session_id = %session_id, "Origin gone, reply dropped");
        }
        Some(response)
    }

    /// Request/response chat used by the HTTP surface.
    ///
    /// The turn runs on its own task, so it completes and persists even if the
    /// caller stops waiting.
    pub async fn chat(self: &Arc<Self>, frame: ChatFrame) -> TurnResponse {
        let session_id = frame.session_id.clone().unwrap_or_default();
        let duplicate = |session_id: &str| {
            TurnResponse::Error(ErrorReply::detached(
                ErrorCode::BadRequest,
                DUPLICATE_TEXT,
                session_id,
                self.engine.max_searches(),
            ))
        };
        match self.admit_chat(None, frame) {
            Admission::Accepted(turn) => {
                let session_id = turn.request.session_id.clone();
                let hub = Arc::clone(self);
                match tokio::spawn(async move { hub.run_turn(None, turn).await }).await {
                    Ok(Some(response)) => response,
                    Ok(None) => duplicate(&session_id),
                    Err(e) => {
                        warn!(error = %e, session_id = %session_id, "Turn task failed");
                        TurnResponse::Error(ErrorReply::detached(
                            ErrorCode::Unavailable,
                            UNAVAILABLE_TEXT,
                            &session_id,
                            self.engine.max_searches(),
                        ))
                    }
                }
            }
            Admission::Rejected(response) => response,
            Admission::Duplicate => duplicate(&session_id),
        }
    }

    pub async fn product_details(&self, frame: &DetailsFrame) -> Result<ProductDetails, SearchError> {
        self.engine
            .search()
            .product_details(&frame.page_token, &frame.locale())
            .await
    }

    /// Periodic housekeeping.
    pub fn cleanup(&self) {
        self.limiter.purge();
        let sessions = self.sessions();
        self.lock_pointers()
            .retain(|_, pointer| sessions.exists(&pointer.session_id));
    }

    fn resolve_user(&self, origin: Option<ConnectionId>, access_token: Option<&str>) -> Option<String> {
        let known = origin.and_then(|id| {
            self.lock_connections()
                .get(&id)
                .and_then(|c| c.user_id.clone())
        });
        let Some(token) = access_token.filter(|t| !t.is_empty()) else {
            return known;
        };
        match self.tokens.verify_access_token(token) {
            Ok(ctx) => {
                if let Some(origin) = origin
                    && let Some(connection) = self.lock_connections().get_mut(&origin)
                {
                    connection.user_id = Some(ctx.user_id.clone());
                }
                Some(ctx.user_id)
            }
            Err(e) => {
                debug!(error = %e, "Access token rejected");
                known
            }
        }
    }

    /// The session a chat frame may act on, or a fresh replacement when the
    /// caller fails the ownership check.
    fn resolve_session(&self, frame: &ChatFrame, user_id: Option<&str>) -> Resolution {
        let sessions = self.sessions();
        let owner = user_id.map(ToString::to_string);
        let fresh = |replaced: bool| match sessions.create(owner.clone()) {
            Ok(session) if replaced => Resolution::Replaced(session),
            Ok(session) => Resolution::Use(session),
            Err(e) => {
                warn!(error = %e, "Failed to create session");
                Resolution::Unavailable
            }
        };

        let Some(id) = frame
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return fresh(false);
        };

        let token_ok = match frame.session_token.as_deref().filter(|t| !t.is_empty()) {
            Some(token) => self.tokens.verify_session_token(token, id, user_id).is_ok(),
            None => true,
        };
        if !token_ok {
            return fresh(true);
        }

        match sessions.get(id) {
            Some(session) if !session.is_accessible_by(user_id) => fresh(true),
            Some(session) if session.owner.is_none() && owner.is_some() => sessions
                .update(id, |s| {
                    s.owner.clone_from(&owner);
                    s.clone()
                })
                .map_or(Resolution::Unavailable, Resolution::Use),
            Some(session) => Resolution::Use(session),
            // Well-formed ids outlive a restart; anything else gets a new id.
            None if session_created_ms(id).is_some() => sessions
                .get_or_create(id, owner.clone())
                .map_or(Resolution::Unavailable, |(s, _)| Resolution::Use(s)),
            None => fresh(false),
        }
    }

    fn may_access(&self, session_id: &str, user_id: Option<&str>) -> bool {
        self.sessions()
            .get(session_id)
            .is_some_and(|s| s.is_accessible_by(user_id))
    }

    fn session_token(&self, session_id: &str, user_id: Option<&str>) -> Option<String> {
        let user_id = user_id?;
        match self.tokens.issue_session_token(session_id, user_id) {
            Ok(token) => Some(token),
            Err(e) => {
                warn!(error = %e, "Failed to sign session token");
                None
            }
        }
    }

    fn subscribe(&self, origin: Option<ConnectionId>, session_id: &str) {
        if let Some(origin) = origin
            && let Some(connection) = self.lock_connections().get_mut(&origin)
        {
            connection.session_id = Some(session_id.to_string());
        }
    }

    fn connection_user(&self, id: ConnectionId) -> Option<String> {
        self.lock_connections().get(&id).and_then(|c| c.user_id.clone())
    }

    fn detached_error(&self, origin: ConnectionId, code: ErrorCode, text: &str) -> ErrorReply {
        let session_id = self
            .lock_connections()
            .get(&origin)
            .and_then(|c| c.session_id.clone())
            .unwrap_or_default();
        ErrorReply::detached(code, text, &session_id, self.engine.max_searches())
    }

    /// Queue a frame for one connection. `false` if it is gone or was dropped.
    pub fn send_to(&self, id: ConnectionId, message: OutboundMessage) -> bool {
        let mut connections = self.lock_connections();
        let Some(connection) = connections.get_mut(&id) else {
            return false;
        };
        match connection.push(message) {
            Push::Sent | Push::Duplicate => true,
            Push::Dropped => {
                connections.remove(&id);
                warn!(connection = %id, "Outbound queue full or closed, connection dropped");
                false
            }
        }
    }

    /// Deliver to every connection matching `target`; full or closed peers are dropped.
    fn broadcast(
        &self,
        message: &OutboundMessage,
        target: impl Fn(ConnectionId, &Connection) -> bool,
    ) -> usize {
        let mut connections = self.lock_connections();
        let mut delivered = 0;
        let mut dropped = Vec::new();
        for (id, connection) in connections.iter_mut() {
            if !target(*id, connection) {
                continue;
            }
            match connection.push(message.clone()) {
                Push::Sent => delivered += 1,
                Push::Duplicate => {}
                Push::Dropped => dropped.push(*id),
            }
        }
        for id in dropped {
            connections.remove(&id);
            warn!(connection = %id, "Outbound queue full or closed, connection dropped");
        }
        delivered
    }

    /// Deliver to every connection on `session_id` except `origin`.
    fn fan_out(&self, session_id: &str, message: &OutboundMessage, origin: Option<ConnectionId>) -> usize {
        self.broadcast(message, |id, c| {
            Some(id) != origin && c.session_id.as_deref() == Some(session_id)
        })
    }

    fn sync_to_user_devices(&self, origin: ConnectionId, message: OutboundMessage) {
        let Some(user_id) = self.connection_user(origin) else {
            debug!(connection = %origin, "Sync from anonymous connection ignored");
            return;
        };
        let delivered = self.broadcast(&message, |id, c| {
            id != origin && c.user_id.as_deref() == Some(user_id.as_str())
        });
        debug!(user_id = %user_id, delivered, "User state synced");
    }

    fn resume(&self, origin: ConnectionId, session_id: &str, last_seen: i64) {
        let user_id = self.connection_user(origin);
        if !self.may_access(session_id, user_id.as_deref()) {
            let reply = self.detached_error(origin, ErrorCode::SessionExpired, SESSION_EXPIRED_TEXT);
            self.send_to(origin, OutboundMessage::Error(reply));
            return;
        }

        // Held across the read so no live frame overtakes the replay.
        let mut connections = self.lock_connections();
        let replay = self.sessions().messages_since(session_id, last_seen);
        let Some(connection) = connections.get_mut(&origin) else {
            return;
        };
        connection.session_id = Some(session_id.to_string());
        for message in &replay {
            if let Push::Dropped = connection.push(OutboundMessage::replay(session_id, message)) {
                connections.remove(&origin);
                warn!(connection = %origin, "Replay overflowed outbound queue, connection dropped");
                return;
            }
        }
        debug!(connection = %origin, session_id, replayed = replay.len(), "Session resumed");
    }

    /// Store a device's unsynced messages and converge the user's devices on one session.
    fn sync_session(
        &self,
        origin: ConnectionId,
        session_id: &str,
        unsynced: Vec<UnsyncedMessage>,
        has_history: bool,
    ) {
        let user_id = self.connection_user(origin);
        let sessions = self.sessions();

        match sessions.get(session_id) {
            Some(session) if !session.is_accessible_by(user_id.as_deref()) => {
                let reply = self.detached_error(origin, ErrorCode::SessionExpired, SESSION_EXPIRED_TEXT);
                self.send_to(origin, OutboundMessage::Error(reply));
                return;
            }
            Some(_) => {}
            None if !unsynced.is_empty() && session_created_ms(session_id).is_some() => {
                if let Err(e) = sessions.get_or_create(session_id, user_id.clone()) {
                    warn!(error = %e, "Failed to restore session for sync");
                    return;
                }
            }
            None => {}
        }

        let had_unsynced = !unsynced.is_empty();
        for item in unsynced {
            match sessions.append(session_id, Message::user(item.message_id, item.content)) {
                Ok(Some(stored)) => {
                    self.fan_out(
                        session_id,
                        &OutboundMessage::UserMessageSync {
                            session_id: session_id.to_string(),
                            message: stored.as_synced(),
                        },
                        Some(origin),
                    );
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Failed to store unsynced message"),
            }
        }

        let Some(user_id) = user_id else {
            self.subscribe(Some(origin), session_id);
            return;
        };

        let stored_history = |id: &str| !sessions.messages(id).is_empty();
        let reported = ActivePointer::new(
            session_id,
            had_unsynced,
            has_history || stored_history(session_id),
        );

        let mut pointers = self.lock_pointers();
        let current = pointers.get(&user_id).cloned().map(|mut p| {
            p.has_history |= stored_history(&p.session_id);
            p.has_unsynced = false;
            p
        });

        match resolve(current.as_ref(), &reported) {
            MergeDecision::Adopt => {
                pointers.insert(
                    user_id.clone(),
                    ActivePointer {
                        has_unsynced: false,
                        ..reported
                    },
                );
                drop(pointers);
                self.subscribe(Some(origin), session_id);

                let Some(previous) = current.filter(|p| p.session_id != session_id) else {
                    return;
                };
                info!(user_id = %user_id, from = %previous.session_id, to = %session_id, "Active session changed");
                let changed = OutboundMessage::SessionChanged {
                    session_id: session_id.to_string(),
                    previous_session_id: Some(previous.session_id),
                    session_token: self.session_token(session_id, Some(&user_id)),
                };
                let mut connections = self.lock_connections();
                let mut dropped = Vec::new();
                for (id, connection) in connections.iter_mut() {
                    if *id == origin || connection.user_id.as_deref() != Some(user_id.as_str()) {
                        continue;
                    }
                    connection.session_id = Some(session_id.to_string());
                    if let Push::Dropped = connection.push(changed.clone()) {
                        dropped.push(*id);
                    }
                }
                for id in dropped {
                    connections.remove(&id);
                }
            }
            MergeDecision::Keep => {
                drop(pointers);
                let Some(current) = current else {
                    return;
                };
                if current.session_id == session_id {
                    self.subscribe(Some(origin), session_id);
                    return;
                }
                debug!(user_id = %user_id, kept = %current.session_id, reported = %session_id, "Reported session not adopted");
                self.subscribe(Some(origin), &current.session_id);
                self.send_to(
                    origin,
                    OutboundMessage::SessionChanged {
                        session_token: self.session_token(&current.session_id, Some(&user_id)),
                        session_id: current.session_id,
                        previous_session_id: Some(session_id.to_string()),
                    },
                );
            }
        }
    }

    /// The session a user's devices are converging on.
    pub fn active_session(&self, user_id: &str) -> Option<String> {
        self.lock_pointers().get(user_id).map(|p| p.session_id.clone())
    }
}
