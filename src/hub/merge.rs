//! Which session a user's devices should converge on.

use crate::session::session_created_ms;

/// A session pointer as known for one user (or reported by one device).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivePointer {
    pub session_id: String,
    pub created_ms: i64,
    /// Some device holds messages for it that the server has not stored.
    pub has_unsynced: bool,
    /// The session has a transcript (stored or loaded on a device).
    pub has_history: bool,
}

impl ActivePointer {
    pub fn new(session_id: impl Into<String>, has_unsynced: bool, has_history: bool) -> Self {
        let session_id = session_id.into();
        Self {
            created_ms: session_created_ms(&session_id).unwrap_or(0),
            session_id,
            has_unsynced,
            has_history: has_history || has_unsynced,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// The user's current pointer stands.
    Keep,
    /// Switch the user to the reported session.
    Adopt,
}

/// Resolve a reported pointer against the user's current one.
///
/// The newer session wins unless the older one has unsynced messages, and a
/// bare pointer never displaces a session with history.
pub fn resolve(current: Option<&ActivePointer>, reported: &ActivePointer) -> MergeDecision {
    let Some(current) = current else {
        return MergeDecision::Adopt;
    };
    if current.session_id == reported.session_id {
        return MergeDecision::Keep;
    }

    let reported_is_newer = reported.created_ms > current.created_ms;
    let (older, newer) = if reported_is_newer {
        (current, reported)
    } else {
        (reported, current)
    };

    let older_wins = (older.has_history && !newer.has_history) || older.has_unsynced;
    let reported_wins = if older_wins {
        !reported_is_newer
    } else {
        reported_is_newer
    };

    if reported_wins {
        MergeDecision::Adopt
    } else {
        MergeDecision::Keep
    }
}
