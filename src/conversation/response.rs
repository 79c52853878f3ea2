//! Turn responses sent back to clients.

use serde::{Deserialize, Serialize};

use crate::search::{ProductCard, SearchType};
use crate::session::{Session, SessionStatus};

/// Search progress shown alongside every reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchState {
    pub status: SessionStatus,
    pub category: Option<String>,
    pub can_continue: bool,
    pub search_count: u32,
    pub max_searches: u32,
}

impl SearchState {
    pub fn of(session: &Session, max_searches: u32) -> Self {
        Self {
            status: session.status,
            category: session.category.clone(),
            can_continue: session.search_count < max_searches,
            search_count: session.search_count,
            max_searches,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SearchLimit,
    RateLimited,
    SessionExpired,
    BadRequest,
    Unavailable,
    SearchFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueReply {
    pub output: String,
    pub quick_replies: Vec<String>,
    pub session_id: String,
    pub message_count: u32,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub search_state: SearchState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchReply {
    pub output: String,
    pub products: Vec<ProductCard>,
    pub search_type: SearchType,
    pub session_id: String,
    pub message_count: u32,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub search_state: SearchState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub output: String,
    pub code: ErrorCode,
    pub session_id: String,
    pub message_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    pub search_state: SearchState,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, output: impl Into<String>, session: &Session, max_searches: u32) -> Self {
        Self {
            output: output.into(),
            code,
            session_id: session.id.clone(),
            message_count: session.message_count,
            retry_after: None,
            session_token: None,
            search_state: SearchState::of(session, max_searches),
        }
    }

    /// Error for a request that has no usable session record.
    pub fn detached(code: ErrorCode, output: impl Into<String>, session_id: &str, max_searches: u32) -> Self {
        Self {
            output: output.into(),
            code,
            session_id: session_id.to_string(),
            message_count: 0,
            retry_after: None,
            session_token: None,
            search_state: SearchState {
                status: SessionStatus::Idle,
                category: None,
                can_continue: true,
                search_count: 0,
                max_searches,
            },
        }
    }

    #[must_use]
    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }
}

/// Reply to one chat turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnResponse {
    Dialogue(DialogueReply),
    Search(SearchReply),
    Error(ErrorReply),
}

impl TurnResponse {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Dialogue(r) => &r.session_id,
            Self::Search(r) => &r.session_id,
            Self::Error(r) => &r.session_id,
        }
    }

    /// Id of the persisted assistant message, if any.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            Self::Dialogue(r) => Some(&r.message_id),
            Self::Search(r) => Some(&r.message_id),
            Self::Error(_) => None,
        }
    }

    pub fn search_state(&self) -> &SearchState {
        match self {
            Self::Dialogue(r) => &r.search_state,
            Self::Search(r) => &r.search_state,
            Self::Error(r) => &r.search_state,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Error(r) => Some(r.code),
            _ => None,
        }
    }

    pub fn set_session_token(&mut self, token: Option<String>) {
        match self {
            Self::Dialogue(r) => r.session_token = token,
            Self::Search(r) => r.session_token = token,
            Self::Error(r) => r.session_token = token,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_wire_shape() {
        let reply = TurnResponse::Error(
            ErrorReply::detached(ErrorCode::RateLimited, "Slow down", "sess_1_a", 10)
                .with_retry_after(12),
        );
        let v = serde_json::to_value(&reply).unwrap();
        assert_eq!(v["type"], "error");
        assert_eq!(v["code"], "rate_limited");
        assert_eq!(v["retry_after"], 12);
        assert_eq!(v["search_state"]["status"], "idle");
        assert!(v.get("session_token").is_none());
        assert_eq!(reply.message_id(), None);
    }

    #[test]
    fn test_dialogue_round_trip() {
        let reply = TurnResponse::Dialogue(DialogueReply {
            output: "Hi".into(),
            quick_replies: vec!["Yes".into()],
            session_id: "sess_1_a".into(),
            message_count: 2,
            message_id: "msg_1".into(),
            session_token: Some("tok".into()),
            search_state: SearchState {
                status: SessionStatus::Completed,
                category: Some("electronics".into()),
                can_continue: true,
                search_count: 1,
                max_searches: 10,
            },
        });
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"type\":\"dialogue\""));
        let back: TurnResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reply);
    }
}
