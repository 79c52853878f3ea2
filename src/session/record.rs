//! Session and message records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::llm::MessageRole;
use crate::search::{Locale, ProductCard, SearchType};

/// Lifecycle of the session's current search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    InProgress,
    Completed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

/// Product the conversation last focused on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastProduct {
    pub name: String,
    pub price: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub locale: Locale,
    /// Messages ever appended (not the retained window).
    pub message_count: u32,
    pub search_count: u32,
    pub category: Option<String>,
    pub status: SessionStatus,
    pub last_product: Option<LastProduct>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Authenticated user that owns this session.
    pub owner: Option<String>,
}

impl Session {
    pub(crate) fn new(id: String, owner: Option<String>, ttl: chrono::Duration) -> Self {
        let now = Utc::now();
        Self {
            id,
            locale: Locale::default(),
            message_count: 0,
            search_count: 0,
            category: None,
            status: SessionStatus::Idle,
            last_product: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            owner,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Whether `user` may act on this session.
    ///
    /// Anonymous sessions are open; owned sessions require the same user.
    pub fn is_accessible_by(&self, user: Option<&str>) -> bool {
        match (&self.owner, user) {
            (None, _) => true,
            (Some(owner), Some(user)) => owner == user,
            (Some(_), None) => false,
        }
    }
}

/// Which device produced a message, relative to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageOrigin {
    #[default]
    Local,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    #[default]
    Sent,
    Failed,
}

/// Structured attachment of an assistant message.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quick_replies: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<ProductCard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_type: Option<SearchType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<MessagePayload>,
    /// Unix millis, assigned by the store on append.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default)]
    pub origin: MessageOrigin,
    #[serde(default)]
    pub status: DeliveryStatus,
}

impl Message {
    /// A user message; a fresh id is generated when the client sent none.
    pub fn user(id: Option<String>, content: impl Into<String>) -> Self {
        Self {
            id: id
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(new_message_id),
            role: MessageRole::User,
            content: content.into(),
            payload: None,
            timestamp: 0,
            origin: MessageOrigin::Local,
            status: DeliveryStatus::Sent,
        }
    }

    pub fn assistant(content: impl Into<String>, payload: Option<MessagePayload>) -> Self {
        Self {
            id: new_message_id(),
            role: MessageRole::Assistant,
            content: content.into(),
            payload,
            timestamp: 0,
            origin: MessageOrigin::Local,
            status: DeliveryStatus::Sent,
        }
    }

    /// Copy of this message as seen by another device.
    #[must_use]
    pub fn as_synced(&self) -> Self {
        Self {
            origin: MessageOrigin::Synced,
            ..self.clone()
        }
    }
}

pub fn new_message_id() -> String {
    format!("msg_{}", Uuid::new_v4().simple())
}

/// `sess_<unix-millis>_<random hex>`.
pub fn new_session_id() -> String {
    let random = Uuid::new_v4().simple().to_string();
    format!("sess_{}_{}", Utc::now().timestamp_millis(), &random[..12])
}

/// Creation instant embedded in a session id.
pub fn session_created_ms(id: &str) -> Option<i64> {
    let rest = id.strip_prefix("sess_")?;
    let (millis, random) = rest.split_once('_')?;
    if random.is_empty() {
        return None;
    }
    millis.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_embeds_creation_time() {
        let before = Utc::now().timestamp_millis();
        let id = new_session_id();
        let after = Utc::now().timestamp_millis();
        let ts = session_created_ms(&id).unwrap();
        assert!(ts >= before && ts <= after);
        assert_ne!(id, new_session_id());
    }

    #[test]
    fn test_session_created_ms_rejects_foreign_ids() {
        assert_eq!(session_created_ms("sess_1700000000000_ab12"), Some(1_700_000_000_000));
        assert_eq!(session_created_ms("sess_abc_12"), None);
        assert_eq!(session_created_ms("sess_1700000000000_"), None);
        assert_eq!(session_created_ms("3f1c-uuid"), None);
    }

    #[test]
    fn test_ownership() {
        let mut s = Session::new("sess_1_a".into(), None, chrono::Duration::hours(1));
        assert!(s.is_accessible_by(None));
        assert!(s.is_accessible_by(Some("u1")));
        s.owner = Some("u1".into());
        assert!(s.is_accessible_by(Some("u1")));
        assert!(!s.is_accessible_by(Some("u2")));
        assert!(!s.is_accessible_by(None));
    }

    #[test]
    fn test_user_message_keeps_client_id() {
        assert_eq!(Message::user(Some("m-1".into()), "hi").id, "m-1");
        assert!(Message::user(Some("  ".into()), "hi").id.starts_with("msg_"));
        let synced = Message::user(None, "hi").as_synced();
        assert_eq!(synced.origin, MessageOrigin::Synced);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&SessionStatus::InProgress).unwrap(),
            "\"in_progress\""
        );
    }
}
