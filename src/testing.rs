//! Fakes and a wired service graph for unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::auth::TokenService;
use crate::cache::{KvStore, MemoryKvStore};
use crate::config::{GroundingConfig, HubConfig, RateLimitConfig, SearchConfig, SecurityConfig};
use crate::conversation::{ConversationEngine, EngineDeps, EngineSettings};
use crate::credentials::CredentialRotator;
use crate::grounding::GroundingDecisionEngine;
use crate::history::MemoryHistoryStore;
use crate::hub::RealtimeSyncHub;
use crate::llm::{GenerationRequest, GenerativeProvider, LlmError};
use crate::search::{
    Locale, ProductDetails, ProductSearchProvider, RawProduct, SearchError, SearchOrchestrator,
    SearchRequest,
};
use crate::semantic::SemanticIndex;
use crate::semantic::testing::KeywordEmbedder;
use crate::session::SessionStore;

pub fn dialogue_json(output: &str, quick_replies: &[&str]) -> String {
    json!({ "type": "dialogue", "output": output, "quick_replies": quick_replies }).to_string()
}

pub fn search_json(phrase: &str, search_type: &str, category: Option<&str>) -> String {
    json!({
        "type": "search",
        "output": format!("Searching for {phrase}"),
        "search_phrase": phrase,
        "search_type": search_type,
        "category": category,
    })
    .to_string()
}

/// Replays queued outcomes, then a default dialogue.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    keys: Mutex<Vec<String>>,
    contexts: Mutex<Vec<Vec<String>>>,
    pub delay: Mutex<Option<Duration>>,
}

impl ScriptedLlm {
    pub fn push(&self, outcome: Result<String, LlmError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn keys(&self) -> Vec<String> {
        self.keys.lock().unwrap().clone()
    }

    /// Message contents of every generation request, in call order.
    pub fn contexts(&self) -> Vec<Vec<String>> {
        self.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerativeProvider for ScriptedLlm {
    async fn generate(&self, request: &GenerationRequest, api_key: &str) -> Result<String, LlmError> {
        self.keys.lock().unwrap().push(api_key.to_string());
        self.contexts
            .lock()
            .unwrap()
            .push(request.messages.iter().map(|m| m.content.clone()).collect());
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        next.unwrap_or_else(|| {
            let last = request
                .messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default();
            Ok(dialogue_json(&format!("You said: {last}"), &[]))
        })
    }
}

#[derive(Debug, Default)]
pub struct FakeSearch {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
    queries: Mutex<Vec<String>>,
}

impl FakeSearch {
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

fn raw(title: &str, price: f64, rating: f32, reviews: u64, token: &str) -> RawProduct {
    RawProduct {
        title: Some(title.to_string()),
        price: Some(format!("${price:.2}")),
        extracted_price: Some(price),
        link: Some(format!("https://shop.example/{token}")),
        thumbnail: Some(format!("https://img.example/{token}.jpg")),
        rating: Some(rating),
        reviews: Some(reviews),
        page_token: Some(token.to_string()),
        ..RawProduct::default()
    }
}

#[async_trait]
impl ProductSearchProvider for FakeSearch {
    async fn search(
        &self,
        request: &SearchRequest,
        _api_key: &str,
    ) -> Result<Vec<RawProduct>, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.lock().unwrap().push(request.query.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(SearchError::Client {
                status: 400,
                message: "bad query".into(),
            });
        }
        Ok(vec![
            raw("Acme Running Shoes", 79.0, 4.6, 320, "tok-shoes"),
            raw("Acme Laptop", 899.0, 4.2, 1500, "tok-laptop"),
            raw("Acme Television", 499.0, 3.9, 80, "tok-tv"),
        ])
    }

    async fn details(
        &self,
        page_token: &str,
        _locale: &Locale,
        _api_key: &str,
    ) -> Result<ProductDetails, SearchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if page_token == "missing" {
            return Err(SearchError::NotFound);
        }
        Ok(ProductDetails {
            title: format!("Details {page_token}"),
            price: "$10.00".into(),
            ..ProductDetails::default()
        })
    }
}

pub fn keyword_embedder() -> KeywordEmbedder {
    KeywordEmbedder::new(vec![
        vec!["electronics", "tv", "television", "laptop", "laptops"],
        vec!["sports", "running", "shoes", "sneakers"],
        vec!["samsung", "apple", "sony", "brand"],
        vec!["latest", "newest", "new"],
    ])
}

/// Engine wired to fakes over an in-memory store.
#[derive(Debug)]
pub struct Harness {
    pub engine: Arc<ConversationEngine>,
    pub llm: Arc<ScriptedLlm>,
    pub search: Arc<FakeSearch>,
    pub history: Arc<MemoryHistoryStore>,
    pub generative_credentials: Arc<CredentialRotator>,
    pub sessions: SessionStore,
}

impl Harness {
    pub fn new(generative_keys: &[&str], search_keys: &[&str]) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let index = Arc::new(SemanticIndex::new(
            Arc::new(keyword_embedder()),
            Duration::from_secs(60),
            1000,
        ));
        let keys = |k: &[&str]| k.iter().map(ToString::to_string).collect::<Vec<_>>();
        let generative_credentials = Arc::new(CredentialRotator::new(
            "generative",
            keys(generative_keys),
            Arc::clone(&store),
        ));
        let search_credentials = Arc::new(CredentialRotator::new(
            "search",
            keys(search_keys),
            Arc::clone(&store),
        ));

        let llm = Arc::new(ScriptedLlm::default());
        let search = Arc::new(FakeSearch::default());
        let history = Arc::new(MemoryHistoryStore::default());
        let sessions = SessionStore::new(Duration::from_secs(3600), 50);

        let orchestrator = Arc::new(SearchOrchestrator::new(
            Arc::clone(&search) as Arc<dyn ProductSearchProvider>,
            search_credentials,
            Arc::clone(&index),
            Arc::clone(&store),
            SearchConfig {
                base_backoff_ms: 1,
                ..SearchConfig::default()
            },
        ));
        let grounding = Arc::new(GroundingDecisionEngine::new(
            Arc::clone(&index),
            GroundingConfig::default(),
        ));

        let engine = Arc::new(ConversationEngine::new(
            EngineDeps {
                sessions: sessions.clone(),
                generative: Arc::clone(&llm) as Arc<dyn GenerativeProvider>,
                credentials: Arc::clone(&generative_credentials),
                grounding,
                index,
                search: orchestrator,
                cache: store,
                history: Arc::clone(&history) as Arc<dyn crate::history::HistoryStore>,
            },
            EngineSettings {
                max_searches: 3,
                context_window: 6,
                categories: vec!["electronics".into(), "sports".into()],
                category_threshold: 0.55,
                generative_cache_ttl: Duration::from_secs(60),
            },
        ));

        Self {
            engine,
            llm,
            search,
            history,
            generative_credentials,
            sessions,
        }
    }
}

impl Harness {
    /// A hub over this harness's engine.
    pub fn hub(&self, rate_limit: RateLimitConfig, config: HubConfig) -> Arc<RealtimeSyncHub> {
        Arc::new(RealtimeSyncHub::new(
            Arc::clone(&self.engine),
            Arc::new(TokenService::new(&SecurityConfig::default())),
            &rate_limit,
            config,
        ))
    }
}

pub fn no_rate_limit() -> RateLimitConfig {
    RateLimitConfig {
        enabled: false,
        ..RateLimitConfig::default()
    }
}
