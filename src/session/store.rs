//! Shared, TTL-bounded session storage.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::record::{Message, Session, new_session_id};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(String),

    #[error("session store lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct SessionState {
    session: Session,
    messages: VecDeque<Message>,
    /// Every id ever appended, including ones evicted from the window.
    seen_ids: HashSet<String>,
    last_timestamp: i64,
}

/// One session plus its locks.
///
/// `state` linearizes record updates. `turn_tail` is the completion signal of
/// the most recently queued turn; each new turn waits on it.
#[derive(Debug)]
struct SessionSlot {
    state: Mutex<SessionState>,
    turn_tail: Mutex<Option<oneshot::Receiver<()>>>,
}

/// A place in a session's turn queue, taken synchronously.
///
/// Turns run in the order their tickets were issued. A ticket dropped before
/// [`TurnTicket::ready`] completes still waits for its predecessor before
/// letting the next turn through.
#[derive(Debug)]
pub struct TurnTicket {
    prev: Option<oneshot::Receiver<()>>,
    done: Option<oneshot::Sender<()>>,
}

impl TurnTicket {
    /// Wait until every earlier turn has finished.
    pub async fn ready(mut self) -> TurnGuard {
        if let Some(prev) = self.prev.as_mut() {
            // A dropped sender also means the previous turn is over.
            let _ = prev.await;
        }
        self.prev = None;
        TurnGuard {
            _done: self.done.take(),
        }
    }
}

impl Drop for TurnTicket {
    fn drop(&mut self) {
        let Some(done) = self.done.take() else {
            return;
        };
        match (self.prev.take(), tokio::runtime::Handle::try_current()) {
            (Some(prev), Ok(handle)) => {
                handle.spawn(async move {
                    let _ = prev.await;
                    drop(done);
                });
            }
            _ => drop(done),
        }
    }
}

/// Exclusive turn on a session; dropping it admits the next ticket.
#[derive(Debug)]
pub struct TurnGuard {
    _done: Option<oneshot::Sender<()>>,
}

/// Thread-safe store for sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    inner: Arc<SessionStoreInner>,
}

#[derive(Debug)]
struct SessionStoreInner {
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
    ttl: Duration,
    max_messages: usize,
}

impl SessionStore {
    #[must_use]
    pub fn new(ttl: Duration, max_messages: usize) -> Self {
        Self {
            inner: Arc::new(SessionStoreInner {
                sessions: RwLock::new(HashMap::new()),
                ttl,
                max_messages: max_messages.max(1),
            }),
        }
    }

    fn chrono_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.inner.ttl).unwrap_or_else(|_| chrono::Duration::days(365))
    }

    /// Live slot for `id`; an expired slot is evicted and reported missing.
    fn slot(&self, id: &str) -> Option<Arc<SessionSlot>> {
        let slot = self.inner.sessions.read().ok()?.get(id).cloned()?;
        let expired = slot.state.lock().ok()?.session.is_expired();
        if expired {
            self.evict(id);
            return None;
        }
        Some(slot)
    }

    fn evict(&self, id: &str) {
        if let Ok(mut sessions) = self.inner.sessions.write() {
            sessions.remove(id);
        }
    }

    /// Create a session with a fresh id.
    pub fn create(&self, owner: Option<String>) -> Result<Session, SessionError> {
        self.create_with_id(new_session_id(), owner)
    }

    /// Create (or replace) a session under a caller-chosen id.
    pub fn create_with_id(
        &self,
        id: impl Into<String>,
        owner: Option<String>,
    ) -> Result<Session, SessionError> {
        let id = id.into();
        let session = Session::new(id.clone(), owner, self.chrono_ttl());
        let slot = Arc::new(SessionSlot {
            state: Mutex::new(SessionState {
                session: session.clone(),
                messages: VecDeque::new(),
                seen_ids: HashSet::new(),
                last_timestamp: 0,
            }),
            turn_tail: Mutex::new(None),
        });
        self.inner
            .sessions
            .write()
            .map_err(|_| SessionError::Poisoned)?
            .insert(id.clone(), slot);
        debug!(session_id = %id, "Session created");
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        let slot = self.slot(id)?;
        let state = slot.state.lock().ok()?;
        Some(state.session.clone())
    }

    pub fn exists(&self, id: &str) -> bool {
        self.slot(id).is_some()
    }

    /// Existing session, or a new one under `id`. The flag is `true` when created.
    pub fn get_or_create(
        &self,
        id: &str,
        owner: Option<String>,
    ) -> Result<(Session, bool), SessionError> {
        if let Some(session) = self.get(id) {
            return Ok((session, false));
        }
        Ok((self.create_with_id(id, owner)?, true))
    }

    /// Apply `f` to the session record under its lock and refresh expiry.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Session) -> R) -> Result<R, SessionError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut state = slot.state.lock().map_err(|_| SessionError::Poisoned)?;
        let result = f(&mut state.session);
        let now = Utc::now();
        state.session.updated_at = now;
        state.session.expires_at = now + self.chrono_ttl();
        Ok(result)
    }

    /// Append a message; returns the stored copy, or `None` if the id was seen before.
    ///
    /// The store assigns a timestamp strictly greater than the previous one and
    /// keeps only the last `max_messages` entries.
    pub fn append(&self, id: &str, mut message: Message) -> Result<Option<Message>, SessionError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let mut state = slot.state.lock().map_err(|_| SessionError::Poisoned)?;

        if !state.seen_ids.insert(message.id.clone()) {
            debug!(session_id = %id, message_id = %message.id, "Duplicate message ignored");
            return Ok(None);
        }

        let now = Utc::now();
        message.timestamp = now.timestamp_millis().max(state.last_timestamp + 1);
        state.last_timestamp = message.timestamp;
        state.messages.push_back(message.clone());
        while state.messages.len() > self.inner.max_messages {
            state.messages.pop_front();
        }

        state.session.message_count += 1;
        state.session.updated_at = now;
        state.session.expires_at = now + self.chrono_ttl();
        Ok(Some(message))
    }

    /// Retained history, oldest first.
    pub fn messages(&self, id: &str) -> Vec<Message> {
        self.slot(id)
            .and_then(|slot| {
                let state = slot.state.lock().ok()?;
                Some(state.messages.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Messages with a timestamp strictly after `since`, oldest first.
    pub fn messages_since(&self, id: &str, since: i64) -> Vec<Message> {
        self.slot(id)
            .and_then(|slot| {
                let state = slot.state.lock().ok()?;
                Some(
                    state
                        .messages
                        .iter()
                        .filter(|m| m.timestamp > since)
                        .cloned()
                        .collect(),
                )
            })
            .unwrap_or_default()
    }

    /// The last `n` retained messages, oldest first.
    pub fn recent_messages(&self, id: &str, n: usize) -> Vec<Message> {
        let all = self.messages(id);
        let skip = all.len().saturating_sub(n);
        all.into_iter().skip(skip).collect()
    }

    /// Remove a session and its history.
    pub fn clear(&self, id: &str) -> bool {
        self.inner
            .sessions
            .write()
            .is_ok_and(|mut sessions| sessions.remove(id).is_some())
    }

    /// Queue a turn on the session. The queue position is fixed on return.
    pub fn enqueue_turn(&self, id: &str) -> Result<TurnTicket, SessionError> {
        let slot = self
            .slot(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        let (done, tail) = oneshot::channel();
        let prev = slot
            .turn_tail
            .lock()
            .map_err(|_| SessionError::Poisoned)?
            .replace(tail);
        Ok(TurnTicket {
            prev,
            done: Some(done),
        })
    }

    /// Acquire the session's turn lock. Waiters are served in FIFO order.
    pub async fn turn_lock(&self, id: &str) -> Result<TurnGuard, SessionError> {
        Ok(self.enqueue_turn(id)?.ready().await)
    }

    /// Drop expired sessions. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let Ok(mut sessions) = self.inner.sessions.write() else {
            return 0;
        };
        let before = sessions.len();
        sessions.retain(|_, slot| {
            slot.state
                .lock()
                .map(|state| !state.session.is_expired())
                .unwrap_or(false)
        });
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Expired sessions cleaned up");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MessageRole;
    use crate::session::SessionStatus;

    fn store() -> SessionStore {
        SessionStore::new(Duration::from_secs(3600), 4)
    }

    #[test]
    fn test_session_store() {
        let store = store();
        assert!(store.is_empty());

        let session = store.create(Some("u1".into())).unwrap();
        assert_eq!(store.len(), 1);
        assert!(session.id.starts_with("sess_"));

        let retrieved = store.get(&session.id).unwrap();
        assert_eq!(retrieved.owner.as_deref(), Some("u1"));

        assert!(store.clear(&session.id));
        assert!(store.is_empty());
        assert!(!store.clear(&session.id));
    }

    #[test]
    fn test_get_or_create() {
        let store = store();
        let (s, created) = store.get_or_create("sess_1_abc", None).unwrap();
        assert!(created);
        let (again, created) = store.get_or_create("sess_1_abc", None).unwrap();
        assert!(!created);
        assert_eq!(s.id, again.id);
    }

    #[test]
    fn test_append_is_idempotent_by_id() {
        let store = store();
        let s = store.create(None).unwrap();
        let first = store
            .append(&s.id, Message::user(Some("m1".into()), "hello"))
            .unwrap();
        assert!(first.is_some());
        let replay = store
            .append(&s.id, Message::user(Some("m1".into()), "hello"))
            .unwrap();
        assert!(replay.is_none());
        assert_eq!(store.messages(&s.id).len(), 1);
        assert_eq!(store.get(&s.id).unwrap().message_count, 1);
    }

    #[test]
    fn test_timestamps_strictly_increase_and_window_slides() {
        let store = store();
        let s = store.create(None).unwrap();
        for i in 0..6 {
            store
                .append(&s.id, Message::user(Some(format!("m{i}")), format!("msg {i}")))
                .unwrap();
        }
        let messages = store.messages(&s.id);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].id, "m2");
        assert!(messages.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(store.get(&s.id).unwrap().message_count, 6);

        // Evicted ids are still refused.
        let again = store.append(&s.id, Message::user(Some("m0".into()), "msg 0"));
        assert!(again.unwrap().is_none());
    }

    #[test]
    fn test_messages_since() {
        let store = store();
        let s = store.create(None).unwrap();
        let a = store
            .append(&s.id, Message::user(None, "a"))
            .unwrap()
            .unwrap();
        store.append(&s.id, Message::user(None, "b")).unwrap();
        store
            .append(&s.id, Message::assistant("c", None))
            .unwrap();
        let since = store.messages_since(&s.id, a.timestamp);
        let contents: Vec<&str> = since.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["b", "c"]);
        assert_eq!(since[1].role, MessageRole::Assistant);
        assert!(store.messages_since("sess_missing_x", 0).is_empty());
    }

    #[test]
    fn test_update_is_applied_and_missing_session_errors() {
        let store = store();
        let s = store.create(None).unwrap();
        let count = store
            .update(&s.id, |session| {
                session.search_count += 1;
                session.status = SessionStatus::InProgress;
                session.search_count
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.get(&s.id).unwrap().status, SessionStatus::InProgress);
        assert!(matches!(
            store.update("nope", |_| ()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[test]
    fn test_expired_sessions_are_invisible_and_cleaned() {
        let store = SessionStore::new(Duration::ZERO, 10);
        let s = store.create(None).unwrap();
        assert!(store.get(&s.id).is_none());

        let store = SessionStore::new(Duration::ZERO, 10);
        store.create(None).unwrap();
        store.create(None).unwrap();
        assert_eq!(store.cleanup_expired(), 2);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_turn_lock_serializes_in_fifo_order() {
        let store = store();
        let s = store.create(None).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = store.turn_lock(&s.id).await.unwrap();
        let mut handles = Vec::new();
        for i in 0..3 {
            let store = store.clone();
            let id = s.id.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _turn = store.turn_lock(&id).await.unwrap();
                order.lock().unwrap().push(i);
            }));
            // Let each waiter enqueue before the next one.
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        drop(guard);
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_turn_order_is_fixed_at_enqueue() {
        let store = store();
        let s = store.create(None).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        // Tickets are taken in order 0..3 but awaited in reverse.
        let tickets: Vec<_> = (0..3).map(|_| store.enqueue_turn(&s.id).unwrap()).collect();
        let mut handles = Vec::new();
        for (i, ticket) in tickets.into_iter().enumerate().rev() {
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let _turn = ticket.ready().await;
                order.lock().unwrap().push(i);
                tokio::time::sleep(Duration::from_millis(5)).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_dropped_ticket_keeps_the_queue_moving_in_order() {
        let store = store();
        let s = store.create(None).unwrap();

        let first = store.turn_lock(&s.id).await.unwrap();
        let abandoned = store.enqueue_turn(&s.id).unwrap();
        let last = store.enqueue_turn(&s.id).unwrap();
        drop(abandoned);

        let waiter = tokio::spawn(last.ready());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("queue released")
            .unwrap();
        assert!(store.enqueue_turn("sess_missing_x").is_err());
    }
}
