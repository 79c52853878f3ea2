//! Session state and transcript storage.
//!
//! - [`Session`]: per-conversation record (locale, counters, search status, owner)
//! - [`Message`]: one transcript entry with a store-assigned timestamp
//! - [`SessionStore`]: shared TTL-bounded store with per-session locking
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use convo_search::session::{Message, SessionStore};
//!
//! let store = SessionStore::new(Duration::from_secs(3600), 50);
//! let session = store.create(None).unwrap();
//! store.append(&session.id, Message::user(None, "Hello!")).unwrap();
//!
//! assert_eq!(store.messages(&session.id).len(), 1);
//! ```

mod record;
mod store;

pub use record::{
    DeliveryStatus, LastProduct, Message, MessageOrigin, MessagePayload, Session, SessionStatus,
    new_message_id, new_session_id, session_created_ms,
};
pub use store::{SessionError, SessionStore, TurnGuard, TurnTicket};
