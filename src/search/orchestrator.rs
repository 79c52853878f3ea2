//! Search orchestration: retries, credential rotation, caching and shaping.

use std::future::Future;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use super::{
    Badge, Locale, PriceRange, ProductCard, ProductDetails, ProductSearchProvider, RawProduct,
    SearchError, SearchRequest, SearchType, parse_price,
};
use crate::cache::{self, KvStore};
use crate::config::{HARD_RESULT_CAP, SearchConfig};
use crate::credentials::CredentialRotator;
use crate::semantic::SemanticIndex;

static WAS_PRICE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bwas:?\s*([$€£¥]?\s?\d[\d.,]*(?:\s?[$€£¥])?)").expect("was-price regex is valid")
});

/// Runs product searches against a [`ProductSearchProvider`].
pub struct SearchOrchestrator {
    provider: Arc<dyn ProductSearchProvider>,
    credentials: Arc<CredentialRotator>,
    index: Arc<SemanticIndex>,
    cache: Arc<dyn KvStore>,
    config: SearchConfig,
}

impl std::fmt::Debug for SearchOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchOrchestrator")
            .field("provider", &self.provider)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl SearchOrchestrator {
    pub fn new(
        provider: Arc<dyn ProductSearchProvider>,
        credentials: Arc<CredentialRotator>,
        index: Arc<SemanticIndex>,
        cache: Arc<dyn KvStore>,
        config: SearchConfig,
    ) -> Self {
        Self {
            provider,
            credentials,
            index,
            cache,
            config,
        }
    }

    /// Search, shape and cache product cards for `query`.
    #[instrument(skip(self, locale), fields(country = %locale.country))]
    pub async fn search(
        &self,
        query: &str,
        search_type: SearchType,
        locale: &Locale,
        price_range: PriceRange,
    ) -> Result<Vec<ProductCard>, SearchError> {
        let normalized = normalize_query(query);
        let scope = cache_scope(locale, search_type, price_range);

        if let Some(cards) = self.cached_results(&scope, &normalized).await {
            return Ok(cards);
        }

        let request = SearchRequest {
            query: query.trim().to_string(),
            search_type,
            locale: locale.clone(),
            price_range,
        };
        let request = &request;
        let raw = self
            .with_retry("search", |key| async move {
                self.provider.search(request, &key).await
            })
            .await?;

        let total = raw.len();
        let cards = self.shape(raw, search_type, price_range).await;
        info!(
            total,
            returned = cards.len(),
            search_type = search_type.as_str(),
            "Search completed"
        );

        if !cards.is_empty() {
            let ttl = Some(Duration::from_secs(self.config.cache_ttl_secs));
            let key = format!("{scope}{normalized}");
            if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &cards, ttl).await {
                warn!(error = %e, "Failed to cache search results");
            }
        }
        Ok(cards)
    }

    /// Full details for a card's continuation token.
    #[instrument(skip(self, locale))]
    pub async fn product_details(
        &self,
        page_token: &str,
        locale: &Locale,
    ) -> Result<ProductDetails, SearchError> {
        let key = format!("details:{}:{}:{page_token}", locale.country, locale.language);
        match cache::get_json::<ProductDetails>(self.cache.as_ref(), &key).await {
            Ok(Some(details)) => {
                debug!("Product details cache hit");
                return Ok(details);
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Details cache read failed"),
        }

        let details = self
            .with_retry("details", |api_key| async move {
                self.provider.details(page_token, locale, &api_key).await
            })
            .await?;

        let ttl = Some(Duration::from_secs(self.config.detail_cache_ttl_secs));
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &details, ttl).await {
            warn!(error = %e, "Failed to cache product details");
        }
        Ok(details)
    }

    /// Exact or semantically similar cached query within the same scope.
    async fn cached_results(&self, scope: &str, query: &str) -> Option<Vec<ProductCard>> {
        let queries: Vec<String> = match self.cache.keys(scope).await {
            Ok(keys) => keys
                .into_iter()
                .filter_map(|k| k.strip_prefix(scope).map(ToString::to_string))
                .collect(),
            Err(e) => {
                warn!(error = %e, "Search cache unavailable");
                return None;
            }
        };
        let matched = self
            .index
            .find_similar_key(query, &queries, self.config.semantic_cache_threshold)
            .await?;

        match cache::get_json::<Vec<ProductCard>>(self.cache.as_ref(), &format!("{scope}{matched}"))
            .await
        {
            Ok(Some(cards)) => {
                info!(query, matched = %matched, "Search cache hit");
                Some(cards)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "Search cache read failed");
                None
            }
        }
    }

    /// Call `op` with a fresh credential per attempt, backing off on retryable errors.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, SearchError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, SearchError>>,
    {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;
        loop {
            let credential = self
                .credentials
                .next()
                .await
                .ok_or(SearchError::NoCredentials)?;

            let started = Instant::now();
            let result = call(credential.key.clone()).await;
            let latency = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.credentials
                .record_usage(credential.index, result.is_ok(), latency)
                .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                    let delay = self.config.base_backoff_ms.saturating_mul(1 << attempt.min(16));
                    warn!(
                        op,
                        attempt = attempt + 1,
                        key_index = credential.index,
                        quota = e.is_quota(),
                        delay_ms = delay,
                        error = %e,
                        "Search provider call failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn shape(
        &self,
        raw: Vec<RawProduct>,
        search_type: SearchType,
        price_range: PriceRange,
    ) -> Vec<ProductCard> {
        let mut cards: Vec<ProductCard> = raw
            .into_iter()
            .filter_map(|p| self.to_card(p))
            .filter(|c| {
                price_range.is_unbounded() || c.price_value.is_some_and(|v| price_range.contains(v))
            })
            .collect();

        if search_type == SearchType::Category {
            cards.sort_by(|a, b| popularity(b).total_cmp(&popularity(a)));
        }

        let mut cards = self
            .index
            .dedupe(cards, |c| c.name.clone(), self.config.dedupe_threshold)
            .await;
        cards.truncate(self.cap(search_type));
        cards
    }

    fn cap(&self, search_type: SearchType) -> usize {
        let caps = &self.config.caps;
        let cap = match search_type {
            SearchType::Exact => caps.exact,
            SearchType::Parameters => caps.parameters,
            SearchType::Category => caps.category,
            SearchType::Default => caps.default,
        };
        cap.min(HARD_RESULT_CAP)
    }

    fn to_card(&self, p: RawProduct) -> Option<ProductCard> {
        let name = p.title.filter(|t| !t.trim().is_empty())?;
        let mut price = p.price.unwrap_or_default();
        // "$80.00 was: $120.00" carries both the current and the previous price.
        let inline_was = WAS_PRICE_RE.captures(&price).and_then(|c| {
            let whole = c.get(0)?;
            Some((whole.start(), c[1].trim().to_string()))
        });
        let inline_old = inline_was.map(|(start, old)| {
            price = price[..start].trim().to_string();
            old
        });
        let price_value = p.extracted_price.or_else(|| parse_price(&price));
        let old_price = p.old_price.or(inline_old).or_else(|| {
            p.extensions.iter().find_map(|ext| {
                WAS_PRICE_RE
                    .captures(ext)
                    .map(|c| c[1].trim().to_string())
            })
        });

        Some(ProductCard {
            badge: self.badge(p.rating, p.reviews),
            name,
            price,
            price_value,
            old_price,
            link: p.link.unwrap_or_default(),
            image: p.thumbnail.unwrap_or_default(),
            page_token: p.page_token,
            source: p.source,
            rating: p.rating,
            reviews: p.reviews,
        })
    }

    fn badge(&self, rating: Option<f32>, reviews: Option<u64>) -> Option<Badge> {
        let reviews = reviews.unwrap_or(0);
        if rating.is_some_and(|r| r >= self.config.top_rated_rating)
            && reviews >= self.config.top_rated_min_reviews
        {
            Some(Badge::TopRated)
        } else if reviews >= self.config.popular_reviews {
            Some(Badge::Popular)
        } else {
            None
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn popularity(card: &ProductCard) -> f64 {
    f64::from(card.rating.unwrap_or(0.0)) * card.reviews.unwrap_or(0) as f64
}

fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn cache_scope(locale: &Locale, search_type: SearchType, range: PriceRange) -> String {
    let bound = |b: Option<f64>| b.map_or_else(|| "_".to_string(), |v| format!("{v}"));
    format!(
        "search:{}:{}:{}:{}-{}:",
        locale.country.to_lowercase(),
        locale.language.to_lowercase(),
        search_type.as_str(),
        bound(range.min),
        bound(range.max),
    )
}
