//! Product search: canonical types, the provider seam and the orchestrator.

pub mod orchestrator;
pub mod serpapi;

pub use orchestrator::SearchOrchestrator;
pub use serpapi::SerpApiProvider;

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How specific the user's request is. Drives the result cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    /// A named product ("iPhone 15 Pro 256GB").
    Exact,
    /// A product type with constraints ("waterproof hiking boots under 150").
    Parameters,
    /// A broad category ("kitchen gadgets").
    Category,
    #[default]
    Default,
}

impl SearchType {
    /// Lenient parse; unknown values map to [`SearchType::Default`].
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Self::Exact,
            "parameters" | "parameter" => Self::Parameters,
            "category" => Self::Category,
            _ => Self::Default,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Parameters => "parameters",
            Self::Category => "category",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locale {
    pub country: String,
    pub language: String,
    pub currency: String,
}

impl Default for Locale {
    fn default() -> Self {
        Self {
            country: "us".to_string(),
            language: "en".to_string(),
            currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl PriceRange {
    pub fn is_unbounded(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn contains(&self, price: f64) -> bool {
        self.min.is_none_or(|min| price >= min) && self.max.is_none_or(|max| price <= max)
    }
}

/// A search result as returned by the provider, before shaping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawProduct {
    pub title: Option<String>,
    pub price: Option<String>,
    pub extracted_price: Option<f64>,
    pub old_price: Option<String>,
    pub link: Option<String>,
    pub thumbnail: Option<String>,
    pub source: Option<String>,
    pub rating: Option<f32>,
    pub reviews: Option<u64>,
    /// Free-text annotations ("was: $199", "Free delivery").
    pub extensions: Vec<String>,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Badge {
    TopRated,
    Popular,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductCard {
    pub name: String,
    pub price: String,
    pub price_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_price: Option<String>,
    pub link: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<Badge>,
    /// Continuation token for [`SearchOrchestrator::product_details`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviews: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Specification {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Offer {
    pub merchant: String,
    pub price: String,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingBucket {
    pub stars: u8,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductDetails {
    pub title: String,
    pub price: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    pub images: Vec<String>,
    pub specifications: Vec<Specification>,
    pub offers: Vec<Offer>,
    pub rating_breakdown: Vec<RatingBucket>,
}

/// Parameters of one product search call.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub search_type: SearchType,
    pub locale: Locale,
    pub price_range: PriceRange,
}

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("search quota exhausted: {0}")]
    Quota(String),

    #[error("search request timed out")]
    Timeout,

    #[error("search server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("search request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("search transport error: {0}")]
    Transport(String),

    #[error("unexpected search response: {0}")]
    Decode(String),

    #[error("product not found")]
    NotFound,

    #[error("no search credentials configured")]
    NoCredentials,
}

impl SearchError {
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Quota(_))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Quota(_) | Self::Timeout | Self::Server { .. } | Self::Transport(_)
        )
    }
}

impl From<reqwest::Error> for SearchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// A product search backend.
#[async_trait::async_trait]
pub trait ProductSearchProvider: Send + Sync + std::fmt::Debug {
    async fn search(
        &self,
        request: &SearchRequest,
        api_key: &str,
    ) -> Result<Vec<RawProduct>, SearchError>;

    async fn details(
        &self,
        page_token: &str,
        locale: &Locale,
        api_key: &str,
    ) -> Result<ProductDetails, SearchError>;
}

static PRICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d.,\s]*").expect("price regex is valid"));

/// Parse a display price ("$1,299.99", "1.299,00 €", "£45") into a number.
///
/// When both separators appear the later one is the decimal mark; a lone
/// comma followed by exactly two digits is treated as decimal.
#[must_use]
pub fn parse_price(text: &str) -> Option<f64> {
    let digits: String = PRICE_RE
        .find(text)?
        .as_str()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    let digits = digits.trim_end_matches(['.', ',']);

    let normalized = match (digits.rfind('.'), digits.rfind(',')) {
        (Some(dot), Some(comma)) if comma > dot => digits.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => digits.replace(',', ""),
        (None, Some(comma)) if digits.len() - comma == 3 && digits.matches(',').count() == 1 => {
            digits.replace(',', ".")
        }
        (None, Some(_)) => digits.replace(',', ""),
        _ => digits.to_string(),
    };
    normalized.parse().ok()
}
