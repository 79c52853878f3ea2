//! Wire frames exchanged over the realtime connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conversation::{DialogueReply, ErrorReply, SearchReply, TurnResponse};
use crate::search::{Locale, ProductDetails};
use crate::session::Message;

/// A chat turn, shared by the websocket frame and `POST /api/chat`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatFrame {
    #[serde(default)]
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub new_search: bool,
    #[serde(default)]
    pub current_category: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub session_token: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

impl ChatFrame {
    /// Locale override carried by the frame, if any field is set.
    pub fn locale(&self) -> Option<Locale> {
        locale_from(
            self.country.as_deref(),
            self.language.as_deref(),
            self.currency.as_deref(),
        )
    }
}

pub(crate) fn locale_from(
    country: Option<&str>,
    language: Option<&str>,
    currency: Option<&str>,
) -> Option<Locale> {
    let pick = |v: Option<&str>| v.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string);
    let (country, language, currency) = (pick(country), pick(language), pick(currency));
    if country.is_none() && language.is_none() && currency.is_none() {
        return None;
    }
    let defaults = Locale::default();
    Some(Locale {
        country: country.map_or(defaults.country, |c| c.to_lowercase()),
        language: language.map_or(defaults.language, |l| l.to_lowercase()),
        currency: currency.map_or(defaults.currency, |c| c.to_uppercase()),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailsFrame {
    pub page_token: String,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

impl DetailsFrame {
    pub fn locale(&self) -> Locale {
        locale_from(self.country.as_deref(), self.language.as_deref(), None).unwrap_or_default()
    }
}

/// A user message a device holds locally but never delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsyncedMessage {
    #[serde(default)]
    pub message_id: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "chat")]
    Chat(ChatFrame),
    #[serde(rename = "product-details")]
    ProductDetails(DetailsFrame),
    #[serde(rename = "sync_session")]
    SyncSession {
        session_id: String,
        #[serde(default)]
        unsynced_messages: Vec<UnsyncedMessage>,
        /// The device has loaded this session's history.
        #[serde(default)]
        has_history: bool,
    },
    #[serde(rename = "sync_preferences")]
    SyncPreferences { preferences: Value },
    #[serde(rename = "sync_saved_search")]
    SyncSavedSearch { search: Value },
    #[serde(rename = "resume")]
    Resume { session_id: String, last_seen: i64 },
    #[serde(rename = "ping")]
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    Dialogue(DialogueReply),
    Search(SearchReply),
    Error(ErrorReply),
    UserMessageSync {
        session_id: String,
        message: Message,
    },
    AssistantMessageSync {
        session_id: String,
        message: Message,
    },
    SessionChanged {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },
    PreferencesUpdated {
        preferences: Value,
    },
    SavedSearchUpdated {
        search: Value,
    },
    ProductDetails {
        page_token: String,
        details: ProductDetails,
    },
    Pong,
}

impl OutboundMessage {
    /// Stable id of a durable event; transient frames have none.
    pub fn durable_id(&self) -> Option<&str> {
        match self {
            Self::Dialogue(r) => Some(&r.message_id),
            Self::Search(r) => Some(&r.message_id),
            Self::UserMessageSync { message, .. } | Self::AssistantMessageSync { message, .. } => {
                Some(&message.id)
            }
            Self::Error(_)
            | Self::SessionChanged { .. }
            | Self::PreferencesUpdated { .. }
            | Self::SavedSearchUpdated { .. }
            | Self::ProductDetails { .. }
            | Self::Pong => None,
        }
    }

    /// Replay frame for a persisted message.
    pub fn replay(session_id: &str, message: &Message) -> Self {
        let session_id = session_id.to_string();
        let message = message.as_synced();
        match message.role {
            crate::llm::MessageRole::User => Self::UserMessageSync {
                session_id,
                message,
            },
            crate::llm::MessageRole::Assistant => Self::AssistantMessageSync {
                session_id,
                message,
            },
        }
    }
}

impl From<TurnResponse> for OutboundMessage {
    fn from(response: TurnResponse) -> Self {
        match response {
            TurnResponse::Dialogue(r) => Self::Dialogue(r),
            TurnResponse::Search(r) => Self::Search(r),
            TurnResponse::Error(r) => Self::Error(r),
        }
    }
}
