//! Conversational product search
//!
//! A chat service that decides turn by turn whether to answer from the model
//! or ground the answer in live product search, and keeps every device of a
//! user in sync over WebSockets.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP + WebSocket surface
//! - **Conversation**: per-turn orchestration over sessions, model and search
//! - **Sync hub**: connection registry, fan-out, replay and session merging
//!
//! # Modules
//!
//! - [`conversation`]: the turn pipeline
//! - [`grounding`]: whether a turn needs live product data
//! - [`search`]: product search providers and result shaping
//! - [`llm`]: generative model drivers
//! - [`hub`]: realtime sync between devices
//! - [`session`]: session state and transcripts
//! - [`credentials`]: API key rotation
//! - [`cache`]: key-value store with expiry
//! - [`semantic`]: embeddings and similarity
//! - [`auth`]: tokens and sign-in
//! - [`history`]: search history persistence

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::implicit_hasher)]
#![allow(clippy::assigning_clones)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::default_trait_access)]
#![allow(clippy::unused_async)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod grounding;
pub mod history;
pub mod hub;
pub mod llm;
pub mod search;
pub mod semantic;
pub mod server;
pub mod session;
pub mod telemetry;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use auth::{IdentityProvider, TokenService};
use cache::MemoryKvStore;
use config::AppConfig;
use history::HistoryStore;
use hub::RealtimeSyncHub;
use session::SessionStore;

/// Application state shared across all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Realtime hub; owns the conversation engine.
    pub hub: Arc<RealtimeSyncHub>,
    /// Session store for conversation management.
    pub sessions: SessionStore,
    pub tokens: Arc<TokenService>,
    /// Sign-in backend.
    pub identity: Arc<dyn IdentityProvider>,
    pub history: Arc<dyn HistoryStore>,
    pub cache: Arc<MemoryKvStore>,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}
