//! Layered service configuration.
//!
//! Priority: CLI flag > CLI env var > `CONVO_` environment > config file > defaults.

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Enable per-session rate limiting
    #[arg(long, env = "RATE_LIMIT_ENABLED")]
    pub rate_limit_enabled: Option<bool>,

    /// Postgres URL for search history (in-memory when unset)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub generative: GenerativeConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub grounding: GroundingConfig,
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    pub jwt_secret: String,
    pub access_token_ttl_secs: u64,
    pub session_token_ttl_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
            access_token_ttl_secs: 7 * 24 * 60 * 60,
            session_token_ttl_secs: 30 * 24 * 60 * 60,
        }
    }
}

/// API key pools, one per external service.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub generative: Vec<String>,
    #[serde(default)]
    pub search: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerativeConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout_secs: u64,
    pub cache_ttl_secs: u64,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model: "gemini-2.0-flash".to_string(),
            temperature: 0.4,
            max_output_tokens: 1024,
            timeout_secs: 30,
            cache_ttl_secs: 3600,
        }
    }
}

/// Result caps per search type. All values are clamped to [`HARD_RESULT_CAP`].
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct ResultCaps {
    pub exact: usize,
    pub parameters: usize,
    pub category: usize,
    pub default: usize,
}

/// Upper bound on product cards returned by any search.
pub const HARD_RESULT_CAP: usize = 10;

impl Default for ResultCaps {
    fn default() -> Self {
        Self {
            exact: 3,
            parameters: 5,
            category: 8,
            default: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SearchConfig {
    pub base_url: String,
    pub engine: String,
    pub details_engine: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub caps: ResultCaps,
    pub cache_ttl_secs: u64,
    pub detail_cache_ttl_secs: u64,
    pub semantic_cache_threshold: f32,
    pub dedupe_threshold: f32,
    pub top_rated_rating: f32,
    pub top_rated_min_reviews: u64,
    pub popular_reviews: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://serpapi.com".to_string(),
            engine: "google_shopping".to_string(),
            details_engine: "google_immersive_product".to_string(),
            timeout_secs: 20,
            max_retries: 2,
            base_backoff_ms: 500,
            caps: ResultCaps::default(),
            cache_ttl_secs: 1800,
            detail_cache_ttl_secs: 3600,
            semantic_cache_threshold: 0.92,
            dedupe_threshold: 0.95,
            top_rated_rating: 4.5,
            top_rated_min_reviews: 50,
            popular_reviews: 1000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    pub ttl_secs: u64,
    pub max_messages: usize,
    pub max_searches: u32,
    pub context_window: usize,
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            max_messages: 50,
            max_searches: 10,
            context_window: 6,
            cleanup_interval_secs: 300,
        }
    }
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Weights of the four grounding signals.
#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct GroundingWeights {
    pub freshness: f32,
    pub specific_model: f32,
    pub topic_drift: f32,
    pub category: f32,
}

impl Default for GroundingWeights {
    fn default() -> Self {
        Self {
            freshness: 0.35,
            specific_model: 0.3,
            topic_drift: 0.15,
            category: 0.2,
        }
    }
}

/// Reference phrases the grounding signals are measured against.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GroundingConcepts {
    pub brand: String,
    pub generic_product: String,
    pub freshness: String,
    pub specific_model: String,
    pub electronics: String,
    pub category: String,
}

impl Default for GroundingConcepts {
    fn default() -> Self {
        Self {
            brand: "brand manufacturer company name like Samsung Apple Sony Nike LG Bosch".to_string(),
            generic_product: "generic product type like phone laptop shoes chair blender"
                .to_string(),
            freshness: "latest newest just released new model this year current price deals today"
                .to_string(),
            specific_model: "specific model number version generation like iPhone 15 Pro Galaxy S24 Ultra"
                .to_string(),
            electronics: "electronics gadgets smartphones laptops televisions cameras headphones"
                .to_string(),
            category: "shopping for products in a store category".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GroundingConfig {
    pub brand_query_confidence: f32,
    pub brand_max_words: usize,
    pub brand_similarity_threshold: f32,
    pub weights: GroundingWeights,
    pub decision_threshold: f32,
    pub drift_window: usize,
    pub drift_threshold: f32,
    pub electronics_threshold: f32,
    pub electronics_score: f32,
    pub category_threshold: f32,
    pub category_score: f32,
    pub concepts: GroundingConcepts,
}

impl Default for GroundingConfig {
    fn default() -> Self {
        Self {
            brand_query_confidence: 0.9,
            brand_max_words: 3,
            brand_similarity_threshold: 0.5,
            weights: GroundingWeights::default(),
            decision_threshold: 0.45,
            drift_window: 3,
            drift_threshold: 0.4,
            electronics_threshold: 0.6,
            electronics_score: 0.9,
            category_threshold: 0.4,
            category_score: 0.5,
            concepts: GroundingConcepts::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: 10,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HubConfig {
    pub outbound_queue: usize,
    pub dedup_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            outbound_queue: 64,
            dedup_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub cache_ttl_secs: u64,
    pub cache_capacity: usize,
    pub category_threshold: f32,
    pub categories: Vec<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 24 * 60 * 60,
            cache_capacity: 10_000,
            category_threshold: 0.55,
            categories: [
                "electronics",
                "fashion",
                "home and kitchen",
                "beauty",
                "sports and outdoors",
                "toys and games",
                "automotive",
                "books",
                "groceries",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub token_url: String,
    pub userinfo_url: String,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub database_url: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from_args(std::env::args())
    }

    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;

        let mut builder = Config::builder()
            .set_default("server.port", 3000)?
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.request_timeout_secs", 90)?
            .set_default("security.jwt_secret", "change-me")?
            .set_default("security.access_token_ttl_secs", 7 * 24 * 60 * 60)?
            .set_default("security.session_token_ttl_secs", 30 * 24 * 60 * 60)?
            .set_default("rate_limit.enabled", true)?
            .set_default("rate_limit.max_requests", 10)?
            .set_default("rate_limit.window_secs", 60)?;

        // Explicit file wins, otherwise ./config.yaml when present.
        if let Some(path) = &cli.config {
            builder = builder.add_source(File::with_name(path));
        } else if Path::new("config.yaml").exists() {
            builder = builder.add_source(File::with_name("config.yaml"));
        }

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", port)?;
        }
        if let Some(enabled) = cli.rate_limit_enabled {
            builder = builder.set_override("rate_limit.enabled", enabled)?;
        }
        if let Some(url) = cli.database_url {
            builder = builder.set_override("persistence.database_url", url)?;
        }

        // E.g. CONVO_SERVER__PORT=8000, CONVO_CREDENTIALS__SEARCH=key1,key2
        builder = builder.add_source(
            Environment::with_prefix("CONVO")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("credentials.generative")
                .with_list_parse_key("credentials.search")
                .with_list_parse_key("server.allowed_origins")
                .with_list_parse_key("embedding.categories")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
