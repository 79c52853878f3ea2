//! Turn processing.
//!
//! [`ConversationEngine::process_turn`] runs one conversational turn end to
//! end: session preparation, grounding decision, the generative call (with
//! one credential rotation on quota or transient failure), reply parsing and,
//! for search directives, the product search itself.

mod prompt;
mod response;

pub use response::{
    DialogueReply, ErrorCode, ErrorReply, SearchReply, SearchState, TurnResponse,
};

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::cache::KvStore;
use crate::config::AppConfig;
use crate::credentials::CredentialRotator;
use crate::grounding::GroundingDecisionEngine;
use crate::history::{HistoryStore, SearchRecord};
use crate::llm::{
    AssistantReply, ChatMessage, GenerationRequest, GenerativeProvider, LlmError, MessageRole,
    SearchDirective,
};
use crate::search::{Locale, SearchOrchestrator};
use crate::semantic::SemanticIndex;
use crate::session::{
    LastProduct, Message, MessagePayload, Session, SessionStatus, SessionStore, TurnTicket,
};

pub(crate) const UNAVAILABLE_TEXT: &str =
    "Sorry, I'm temporarily unavailable. Please try again in a moment.";
const SEARCH_LIMIT_TEXT: &str =
    "You've reached the search limit for this session. Start a new session to keep searching.";
const SEARCH_FAILED_TEXT: &str =
    "I couldn't reach the product catalogue right now. Please try again in a moment.";
const SESSION_EXPIRED_TEXT: &str = "This session has expired. Please start a new one.";
pub(crate) const DUPLICATE_TEXT: &str = "This message was already received.";

/// One inbound chat turn. The engine stores the user message once the turn
/// holds the session.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub text: String,
    /// Client-chosen id of the user message; a fresh one is assigned when absent.
    pub message_id: Option<String>,
    pub locale: Option<Locale>,
    /// Reset category and search status before this turn.
    pub new_search: bool,
    pub client_category: Option<String>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub response: TurnResponse,
    /// User message stored by this turn.
    pub user_message: Option<Message>,
    /// Assistant message persisted by this turn, for fan-out to other devices.
    pub assistant_message: Option<Message>,
    /// The user message id was already stored; nothing ran.
    pub duplicate: bool,
}

impl TurnOutcome {
    fn error(reply: ErrorReply) -> Self {
        Self {
            response: TurnResponse::Error(reply),
            user_message: None,
            assistant_message: None,
            duplicate: false,
        }
    }

    fn reply(response: TurnResponse, assistant_message: Message) -> Self {
        Self {
            response,
            user_message: None,
            assistant_message: Some(assistant_message),
            duplicate: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub max_searches: u32,
    pub context_window: usize,
    pub categories: Vec<String>,
    pub category_threshold: f32,
    pub generative_cache_ttl: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_searches: config.session.max_searches,
            context_window: config.session.context_window,
            categories: config.embedding.categories.clone(),
            category_threshold: config.embedding.category_threshold,
            generative_cache_ttl: Duration::from_secs(config.generative.cache_ttl_secs),
        }
    }
}

/// Collaborators of the engine.
#[derive(Debug, Clone)]
pub struct EngineDeps {
    pub sessions: SessionStore,
    pub generative: Arc<dyn GenerativeProvider>,
    pub credentials: Arc<CredentialRotator>,
    pub grounding: Arc<GroundingDecisionEngine>,
    pub index: Arc<SemanticIndex>,
    pub search: Arc<SearchOrchestrator>,
    pub cache: Arc<dyn KvStore>,
    pub history: Arc<dyn HistoryStore>,
}

#[derive(Debug)]
pub struct ConversationEngine {
    deps: EngineDeps,
    settings: EngineSettings,
}

impl ConversationEngine {
    pub fn new(deps: EngineDeps, settings: EngineSettings) -> Self {
        Self { deps, settings }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.deps.sessions
    }

    pub fn search(&self) -> &SearchOrchestrator {
        &self.deps.search
    }

    pub fn max_searches(&self) -> u32 {
        self.settings.max_searches
    }

    fn expired(&self, session_id: &str) -> TurnOutcome {
        TurnOutcome::error(ErrorReply::detached(
            ErrorCode::SessionExpired,
            SESSION_EXPIRED_TEXT,
            session_id,
            self.settings.max_searches,
        ))
    }

    /// Queue and run one turn on its session.
    pub async fn process_turn(&self, request: TurnRequest) -> TurnOutcome {
        match self.deps.sessions.enqueue_turn(&request.session_id) {
            Ok(ticket) => self.process_queued(ticket, request, |_| {}).await,
            Err(_) => self.expired(&request.session_id),
        }
    }

    /// Run a turn once `ticket` is served.
    ///
    /// The user message is stored inside the turn and handed to
    /// `on_user_message` before generation starts, so a session's transcript
    /// always reads user, assistant, user, assistant in queue order.
    #[instrument(skip_all, fields(session_id = %request.session_id))]
    pub async fn process_queued(
        &self,
        ticket: TurnTicket,
        request: TurnRequest,
        on_user_message: impl FnOnce(&Message) + Send,
    ) -> TurnOutcome {
        let _turn = ticket.ready().await;
        let id = request.session_id.as_str();

        let message = Message::user(request.message_id.clone(), request.text.clone());
        let user = match self.deps.sessions.append(id, message) {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                debug!("Duplicate user message, turn skipped");
                let mut outcome = TurnOutcome::error(ErrorReply::detached(
                    ErrorCode::BadRequest,
                    DUPLICATE_TEXT,
                    id,
                    self.settings.max_searches,
                ));
                outcome.duplicate = true;
                return outcome;
            }
            Err(_) => return self.expired(id),
        };
        on_user_message(&user);

        let mut outcome = self.run_turn(&request, &user).await;
        outcome.user_message = Some(user);
        outcome
    }

    async fn run_turn(&self, request: &TurnRequest, user: &Message) -> TurnOutcome {
        let max = self.settings.max_searches;
        let id = request.session_id.as_str();
        let Some(session) = self.prepare_session(request).await else {
            return self.expired(id);
        };

        // Context ends at this turn's own message.
        let mut history = self
            .deps
            .sessions
            .recent_messages(id, self.settings.context_window);
        if let Some(own) = history.iter().rposition(|m| m.id == user.id) {
            history.truncate(own + 1);
        }
        let mut messages = prompt::context_window(&history, self.settings.context_window);
        if messages
            .last()
            .is_none_or(|m| m.role != MessageRole::User || m.content != request.text)
        {
            messages.push(ChatMessage::user(request.text.clone()));
        }
        let earlier_turns = prompt::previous_user_turns(&history);

        let decision = self
            .deps
            .grounding
            .decide(&request.text, &earlier_turns, session.category.as_deref())
            .await;

        let generation = GenerationRequest {
            system: prompt::system_prompt(&session, max.saturating_sub(session.search_count)),
            messages,
            grounded: decision.ground,
            json_reply: true,
        };

        let raw = match self.generate_cached(&generation).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Generative backend unavailable");
                return TurnOutcome::error(ErrorReply::new(
                    ErrorCode::Unavailable,
                    UNAVAILABLE_TEXT,
                    &session,
                    max,
                ));
            }
        };

        match AssistantReply::parse(&raw) {
            AssistantReply::Dialogue {
                output,
                quick_replies,
            } => self.finish_dialogue(&session, output, quick_replies),
            AssistantReply::Search(directive) => {
                self.run_search(request, session, directive).await
            }
        }
    }

    /// Apply locale, `new_search` and category detection.
    async fn prepare_session(&self, request: &TurnRequest) -> Option<Session> {
        let id = request.session_id.as_str();
        let session = self
            .deps
            .sessions
            .update(id, |s| {
                if let Some(locale) = &request.locale {
                    s.locale = locale.clone();
                }
                if request.new_search {
                    s.category = None;
                    s.status = SessionStatus::Idle;
                }
                s.clone()
            })
            .ok()?;

        if session.category.is_some() {
            return Some(session);
        }
        let category = match self.detect_category(&request.text).await {
            Some(detected) => Some(detected),
            None => request
                .client_category
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(ToString::to_string),
        };
        match category {
            Some(category) => self
                .deps
                .sessions
                .update(id, |s| {
                    s.category = Some(category);
                    s.clone()
                })
                .ok(),
            None => Some(session),
        }
    }

    /// Nearest configured category label at or above the threshold.
    async fn detect_category(&self, text: &str) -> Option<String> {
        let category = self
            .deps
            .index
            .find_similar_key(text, &self.settings.categories, self.settings.category_threshold)
            .await;
        if let Some(category) = &category {
            debug!(category = %category, "Category detected");
        }
        category
    }

    fn finish_dialogue(
        &self,
        session: &Session,
        output: String,
        quick_replies: Vec<String>,
    ) -> TurnOutcome {
        let payload = (!quick_replies.is_empty()).then(|| MessagePayload {
            quick_replies: quick_replies.clone(),
            ..MessagePayload::default()
        });
        let stored = self.persist_assistant(&session.id, Message::assistant(output.clone(), payload));
        let session = self.deps.sessions.get(&session.id).unwrap_or_else(|| session.clone());

        TurnOutcome::reply(
            TurnResponse::Dialogue(DialogueReply {
                output,
                quick_replies,
                session_id: session.id.clone(),
                message_count: session.message_count,
                message_id: stored.id.clone(),
                session_token: None,
                search_state: SearchState::of(&session, self.settings.max_searches),
            }),
            stored,
        )
    }

    async fn run_search(
        &self,
        request: &TurnRequest,
        session: Session,
        directive: SearchDirective,
    ) -> TurnOutcome {
        let max = self.settings.max_searches;
        let id = session.id.clone();

        if session.search_count >= max {
            info!(search_count = session.search_count, max, "Search limit reached");
            return TurnOutcome::error(ErrorReply::new(
                ErrorCode::SearchLimit,
                SEARCH_LIMIT_TEXT,
                &session,
                max,
            ));
        }

        let previous_status = session.status;
        let category = directive.category.clone().or_else(|| session.category.clone());
        if self
            .deps
            .sessions
            .update(&id, |s| s.status = SessionStatus::InProgress)
            .is_err()
        {
            return TurnOutcome::error(ErrorReply::detached(
                ErrorCode::SessionExpired,
                SESSION_EXPIRED_TEXT,
                &id,
                max,
            ));
        }

        let phrase = self.translate(&directive.search_phrase, &session.locale).await;
        let cards = match self
            .deps
            .search
            .search(
                &phrase,
                directive.search_type,
                &session.locale,
                directive.price_range,
            )
            .await
        {
            Ok(cards) => cards,
            Err(e) => {
                warn!(error = %e, query = %phrase, "Product search failed");
                let restored = self
                    .deps
                    .sessions
                    .update(&id, |s| {
                        s.status = previous_status;
                        s.clone()
                    })
                    .unwrap_or(session);
                return TurnOutcome::error(ErrorReply::new(
                    ErrorCode::SearchFailed,
                    SEARCH_FAILED_TEXT,
                    &restored,
                    max,
                ));
            }
        };

        if let Err(e) = self.deps.sessions.update(&id, |s| {
            s.search_count = (s.search_count + 1).min(max);
            s.status = SessionStatus::Completed;
            s.category.clone_from(&category);
            if let Some(first) = cards.first() {
                s.last_product = Some(LastProduct {
                    name: first.name.clone(),
                    price: first.price.clone(),
                });
            }
        }) {
            warn!(error = %e, "Session vanished before search results were recorded");
        }

        let output = match (directive.output.is_empty(), cards.is_empty()) {
            (_, true) => "I couldn't find products matching that. Could you describe it differently?"
                .to_string(),
            (true, false) => "Here are some options I found.".to_string(),
            (false, false) => directive.output.clone(),
        };
        let stored = self.persist_assistant(
            &id,
            Message::assistant(
                output.clone(),
                Some(MessagePayload {
                    products: cards.clone(),
                    search_type: Some(directive.search_type),
                    ..MessagePayload::default()
                }),
            ),
        );

        self.record_history(SearchRecord {
            id: Uuid::new_v4(),
            session_id: id.clone(),
            user_id: request.user_id.clone(),
            query: phrase,
            search_type: directive.search_type,
            category,
            country: session.locale.country.clone(),
            result_count: cards.len(),
            created_at: Utc::now(),
        });

        let session = self.deps.sessions.get(&id).unwrap_or(session);
        TurnOutcome::reply(
            TurnResponse::Search(SearchReply {
                output,
                products: cards,
                search_type: directive.search_type,
                session_id: id,
                message_count: session.message_count,
                message_id: stored.id.clone(),
                session_token: None,
                search_state: SearchState::of(&session, max),
            }),
            stored,
        )
    }

    /// Append an assistant message. A vanished session still yields the message.
    fn persist_assistant(&self, session_id: &str, message: Message) -> Message {
        match self.deps.sessions.append(session_id, message.clone()) {
            Ok(Some(stored)) => stored,
            Ok(None) => message,
            Err(e) => {
                warn!(session_id, error = %e, "Failed to persist assistant message");
                message
            }
        }
    }

    fn record_history(&self, record: SearchRecord) {
        let history = Arc::clone(&self.deps.history);
        tokio::spawn(async move {
            if let Err(e) = history.record(record).await {
                warn!(error = %e, "Failed to record search history");
            }
        });
    }

    /// Canonical (English) search phrase; falls back to the original.
    async fn translate(&self, phrase: &str, locale: &Locale) -> String {
        let language = locale.language.to_lowercase();
        if language.is_empty() || language.starts_with("en") {
            return phrase.to_string();
        }

        let key = format!("translate:{language}:{}", phrase.trim().to_lowercase());
        match self.deps.cache.get(&key).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Translation cache unavailable"),
        }

        let request = GenerationRequest {
            system: prompt::translation_prompt(),
            messages: vec![ChatMessage::user(phrase)],
            grounded: false,
            json_reply: false,
        };
        let translated = match self.generate(&request).await {
            Ok(text) => text
                .lines()
                .next()
                .unwrap_or_default()
                .trim()
                .trim_matches(['"', '\''])
                .to_string(),
            Err(e) => {
                warn!(error = %e, "Translation failed, searching with original phrase");
                return phrase.to_string();
            }
        };
        if translated.is_empty() {
            return phrase.to_string();
        }

        if let Err(e) = self
            .deps
            .cache
            .set(&key, translated.clone(), Some(self.settings.generative_cache_ttl))
            .await
        {
            warn!(error = %e, "Failed to cache translation");
        }
        translated
    }

    /// Ungrounded replies are cached by their full prompt.
    async fn generate_cached(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        if request.grounded {
            return self.generate(request).await;
        }

        let key = generation_cache_key(request);
        match self.deps.cache.get(&key).await {
            Ok(Some(cached)) => {
                debug!("Generative cache hit");
                return Ok(cached);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Generative cache unavailable"),
        }

        let reply = self.generate(request).await?;
        if let Err(e) = self
            .deps
            .cache
            .set(&key, reply.clone(), Some(self.settings.generative_cache_ttl))
            .await
        {
            warn!(error = %e, "Failed to cache generative reply");
        }
        Ok(reply)
    }

    /// Call the backend, rotating to the next credential once on a retryable error.
    async fn generate(&self, request: &GenerationRequest) -> Result<String, LlmError> {
        let mut rotated = false;
        loop {
            let credential = self
                .deps
                .credentials
                .next()
                .await
                .ok_or(LlmError::NoCredentials)?;

            let started = Instant::now();
            let result = self.deps.generative.generate(request, &credential.key).await;
            let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.deps
                .credentials
                .record_usage(credential.index, result.is_ok(), latency)
                .await;

            match result {
                Ok(text) => return Ok(text),
                Err(e) if e.is_retryable() && !rotated => {
                    warn!(
                        key_index = credential.index,
                        quota = e.is_quota(),
                        error = %e,
                        "Generative call failed, rotating credential"
                    );
                    rotated = true;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn generation_cache_key(request: &GenerationRequest) -> String {
    let mut hasher = DefaultHasher::new();
    request.system.hash(&mut hasher);
    for m in &request.messages {
        (m.role == MessageRole::User).hash(&mut hasher);
        m.content.hash(&mut hasher);
    }
    format!("generative:{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::llm::LlmError;
    use crate::testing::{Harness, dialogue_json, search_json};

    fn user_turn(session_id: &str, text: &str) -> TurnRequest {
        TurnRequest {
            session_id: session_id.to_string(),
            text: text.to_string(),
            ..TurnRequest::default()
        }
    }

    #[tokio::test]
    async fn test_dialogue_turn_persists_assistant_message() {
        let h = Harness::new(&["g0"], &["s0"]);
        h.llm.push(Ok(dialogue_json("What is your budget?", &["Under $50", "Any"])));
        let s = h.engine.sessions().create(None).unwrap();

        let outcome = h.engine.process_turn(user_turn(&s.id, "I need a gift")).await;
        let TurnResponse::Dialogue(reply) = &outcome.response else {
            panic!("expected dialogue, got {:?}", outcome.response);
        };
        assert_eq!(reply.quick_replies, vec!["Under $50", "Any"]);
        assert_eq!(reply.message_count, 2);
        let stored = outcome.assistant_message.unwrap();
        assert_eq!(stored.id, reply.message_id);
        assert_eq!(h.engine.sessions().messages(&s.id).len(), 2);
    }

    #[tokio::test]
    async fn test_search_turn_updates_session() {
        let h = Harness::new(&["g0"], &["s0"]);
        h.llm.push(Ok(search_json("running shoes", "parameters", Some("sports"))));
        let s = h.engine.sessions().create(Some("u1".into())).unwrap();

        let mut request = user_turn(&s.id, "running shoes under 100");
        request.user_id = Some("u1".into());
        let outcome = h.engine.process_turn(request).await;
        let TurnResponse::Search(reply) = &outcome.response else {
            panic!("expected search, got {:?}", outcome.response);
        };
        assert!(!reply.products.is_empty());
        assert_eq!(reply.search_state.search_count, 1);
        assert_eq!(reply.search_state.status, SessionStatus::Completed);

        let session = h.engine.sessions().get(&s.id).unwrap();
        assert_eq!(session.category.as_deref(), Some("sports"));
        assert_eq!(
            session.last_product.unwrap().name,
            reply.products[0].name
        );

        // History is recorded off the turn path.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let recent = h.history.recent("u1", 5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].query, "running shoes");
    }

    #[tokio::test]
    async fn test_search_limit_returns_error_without_incrementing() {
        let h = Harness::new(&["g0"], &["s0"]);
        let s = h.engine.sessions().create(None).unwrap();
        let max = h.engine.max_searches();
        h.engine
            .sessions()
            .update(&s.id, |s| {
                s.search_count = max;
                s.status = SessionStatus::Completed;
            })
            .unwrap();
        h.llm.push(Ok(search_json("laptop", "category", None)));

        let outcome = h.engine.process_turn(user_turn(&s.id, "show me laptops")).await;
        let TurnResponse::Error(reply) = &outcome.response else {
            panic!("expected error, got {:?}", outcome.response);
        };
        assert_eq!(reply.code, ErrorCode::SearchLimit);
        assert!(!reply.search_state.can_continue);
        assert_eq!(reply.search_state.search_count, max);

        let session = h.engine.sessions().get(&s.id).unwrap();
        assert_eq!(session.search_count, max);
        assert_eq!(session.status, SessionStatus::Completed);
        assert_eq!(h.search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quota_error_rotates_credential_once() {
        let h = Harness::new(&["g0", "g1"], &["s0"]);
        h.llm.push(Err(LlmError::Quota {
            status: 429,
            message: "exhausted".into(),
        }));
        h.llm.push(Ok(dialogue_json("Hello again", &[])));
        let s = h.engine.sessions().create(None).unwrap();

        let outcome = h.engine.process_turn(user_turn(&s.id, "hello")).await;
        assert!(matches!(outcome.response, TurnResponse::Dialogue(_)));
        assert_eq!(h.llm.keys(), vec!["g0", "g1"]);
        let (k0, k1) = (
            h.generative_credentials.stats(0).await,
            h.generative_credentials.stats(1).await,
        );
        assert_eq!((k0.usage, k0.failure), (1, 1));
        assert_eq!((k1.usage, k1.success), (1, 1));
    }

    #[tokio::test]
    async fn test_second_failure_yields_unavailable() {
        let h = Harness::new(&["g0", "g1"], &["s0"]);
        h.llm.push(Err(LlmError::Timeout));
        h.llm.push(Err(LlmError::Timeout));
        h.llm.push(Ok(dialogue_json("never reached", &[])));
        let s = h.engine.sessions().create(None).unwrap();

        let outcome = h.engine.process_turn(user_turn(&s.id, "hello")).await;
        assert_eq!(outcome.response.error_code(), Some(ErrorCode::Unavailable));
        assert!(outcome.response.search_state().can_continue);
        assert!(outcome.assistant_message.is_none());
        assert_eq!(h.llm.keys().len(), 2);
    }

    #[tokio::test]
    async fn test_unparseable_reply_falls_back_to_dialogue() {
        let h = Harness::new(&["g0"], &["s0"]);
        h.llm.push(Ok("Sure! What colour would you like?".into()));
        let s = h.engine.sessions().create(None).unwrap();

        let outcome = h.engine.process_turn(user_turn(&s.id, "a hat")).await;
        let TurnResponse::Dialogue(reply) = outcome.response else {
            panic!("expected dialogue");
        };
        assert_eq!(reply.output, "Sure! What colour would you like?");
        assert!(reply.quick_replies.is_empty());
    }

    #[tokio::test]
    async fn test_failed_search_restores_status() {
        let h = Harness::new(&["g0"], &["s0"]);
        h.search.fail.store(true, Ordering::SeqCst);
        h.llm.push(Ok(search_json("tv", "exact", None)));
        let s = h.engine.sessions().create(None).unwrap();

        let outcome = h.engine.process_turn(user_turn(&s.id, "that tv")).await;
        assert_eq!(outcome.response.error_code(), Some(ErrorCode::SearchFailed));
        let session = h.engine.sessions().get(&s.id).unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.search_count, 0);
    }

    #[tokio::test]
    async fn test_non_english_phrase_is_translated() {
        let h = Harness::new(&["g0"], &["s0"]);
        h.llm.push(Ok(search_json("laufschuhe", "parameters", None)));
        h.llm.push(Ok("running shoes".into()));
        let s = h.engine.sessions().create(None).unwrap();

        let mut request = user_turn(&s.id, "ich suche laufschuhe");
        request.locale = Some(Locale {
            country: "de".into(),
            language: "de".into(),
            currency: "EUR".into(),
        });
        let outcome = h.engine.process_turn(request).await;
        assert!(matches!(outcome.response, TurnResponse::Search(_)));
        assert_eq!(h.search.queries(), vec!["running shoes"]);
    }

    #[tokio::test]
    async fn test_new_search_resets_category_and_status_but_not_counter() {
        let h = Harness::new(&["g0"], &["s0"]);
        let s = h.engine.sessions().create(None).unwrap();
        h.engine
            .sessions()
            .update(&s.id, |s| {
                s.category = Some("books".into());
                s.status = SessionStatus::Completed;
                s.search_count = 2;
            })
            .unwrap();
        h.llm.push(Ok(dialogue_json("What next?", &[])));

        let mut request = user_turn(&s.id, "something else");
        request.new_search = true;
        request.client_category = Some("garden".into());
        h.engine.process_turn(request).await;

        let session = h.engine.sessions().get(&s.id).unwrap();
        assert_eq!(session.status, SessionStatus::Idle);
        assert_eq!(session.search_count, 2);
        assert_eq!(session.category.as_deref(), Some("garden"));
    }

    #[tokio::test]
    async fn test_turn_stores_user_message_once_per_id() {
        let h = Harness::new(&["g0"], &["s0"]);
        h.llm.push(Ok(dialogue_json("Hi!", &[])));
        let s = h.engine.sessions().create(None).unwrap();

        let mut request = user_turn(&s.id, "hello");
        request.message_id = Some("client-7".into());
        let outcome = h.engine.process_turn(request.clone()).await;
        assert!(!outcome.duplicate);
        assert_eq!(outcome.user_message.unwrap().id, "client-7");

        let replay = h.engine.process_turn(request).await;
        assert!(replay.duplicate);
        assert_eq!(replay.response.error_code(), Some(ErrorCode::BadRequest));
        assert_eq!(h.llm.keys().len(), 1);

        let roles: Vec<MessageRole> = h
            .engine
            .sessions()
            .messages(&s.id)
            .into_iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);
    }

    #[tokio::test]
    async fn test_missing_session_is_expired_error() {
        let h = Harness::new(&["g0"], &["s0"]);
        let outcome = h
            .engine
            .process_turn(TurnRequest {
                session_id: "sess_1_gone".into(),
                text: "hi".into(),
                ..TurnRequest::default()
            })
            .await;
        assert_eq!(outcome.response.error_code(), Some(ErrorCode::SessionExpired));
    }

    #[test]
    fn test_generation_cache_key_depends_on_context() {
        let a = GenerationRequest {
            system: "s".into(),
            messages: vec![ChatMessage::user("hi")],
            grounded: false,
            json_reply: true,
        };
        let mut b = a.clone();
        assert_eq!(generation_cache_key(&a), generation_cache_key(&b));
        b.messages.push(ChatMessage::assistant("hello"));
        assert_ne!(generation_cache_key(&a), generation_cache_key(&b));
    }
}
