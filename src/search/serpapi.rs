//! SerpAPI-style product search client.
//!
//! `google_shopping` for result lists, `google_immersive_product` for the
//! detail view behind a result's page token.

use serde_json::Value;
use tracing::debug;

use super::{
    Locale, Offer, ProductDetails, ProductSearchProvider, RatingBucket, RawProduct, SearchError,
    SearchRequest, Specification,
};
use crate::config::SearchConfig;

#[derive(Clone)]
pub struct SerpApiProvider {
    http: reqwest::Client,
    base_url: String,
    engine: String,
    details_engine: String,
}

impl std::fmt::Debug for SerpApiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerpApiProvider")
            .field("base_url", &self.base_url)
            .field("engine", &self.engine)
            .finish_non_exhaustive()
    }
}

impl SerpApiProvider {
    pub fn new(config: &SearchConfig) -> Result<Self, SearchError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SearchError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            engine: config.engine.clone(),
            details_engine: config.details_engine.clone(),
        })
    }

    async fn get(&self, params: &[(&str, &str)]) -> Result<Value, SearchError> {
        let resp = self
            .http
            .get(format!("{}/search.json", self.base_url))
            .query(params)
            .send()
            .await?;

        let status = resp.status();
        let body: Value = match resp.json().await {
            Ok(v) => v,
            Err(e) if status.is_success() => return Err(e.into()),
            Err(_) => Value::Null,
        };
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        if status.as_u16() == 429 || is_quota_message(&message) {
            return Err(SearchError::Quota(message));
        }
        if status.is_server_error() {
            return Err(SearchError::Server {
                status: status.as_u16(),
                message,
            });
        }
        if !status.is_success() {
            return Err(SearchError::Client {
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("run out of searches") || lower.contains("rate limit")
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[allow(clippy::cast_possible_truncation)]
fn raw_product(v: &Value) -> RawProduct {
    RawProduct {
        title: str_field(v, "title"),
        price: str_field(v, "price"),
        extracted_price: v.get("extracted_price").and_then(Value::as_f64),
        old_price: str_field(v, "old_price"),
        link: str_field(v, "product_link").or_else(|| str_field(v, "link")),
        thumbnail: str_field(v, "thumbnail"),
        source: str_field(v, "source"),
        rating: v.get("rating").and_then(Value::as_f64).map(|r| r as f32),
        reviews: v.get("reviews").and_then(Value::as_u64),
        extensions: v
            .get("extensions")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        page_token: str_field(v, "immersive_product_page_token")
            .or_else(|| str_field(v, "product_id")),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn details_from(v: &Value) -> Option<ProductDetails> {
    let p = v.get("product_results")?;
    let title = str_field(p, "title")?;

    let offers: Vec<Offer> = p
        .get("stores")
        .and_then(Value::as_array)
        .map(|stores| {
            stores
                .iter()
                .filter_map(|s| {
                    Some(Offer {
                        merchant: str_field(s, "name")?,
                        price: str_field(s, "price").unwrap_or_default(),
                        link: str_field(s, "link").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let price = str_field(p, "price")
        .or_else(|| offers.first().map(|o| o.price.clone()))
        .unwrap_or_default();

    let images = p
        .get("thumbnails")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default();

    let specifications = p
        .get("about_the_product")
        .and_then(|a| a.get("features"))
        .or_else(|| p.get("specifications"))
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|s| {
                    Some(Specification {
                        name: str_field(s, "title").or_else(|| str_field(s, "name"))?,
                        value: str_field(s, "value").unwrap_or_default(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let rating_breakdown = p
        .get("ratings")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(|r| {
                    Some(RatingBucket {
                        stars: u8::try_from(r.get("stars")?.as_u64()?).ok()?,
                        count: r.get("amount")?.as_u64()?,
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(ProductDetails {
        title,
        price,
        rating: p.get("rating").and_then(Value::as_f64).map(|r| r as f32),
        images,
        specifications,
        offers,
        rating_breakdown,
    })
}

#[async_trait::async_trait]
impl ProductSearchProvider for SerpApiProvider {
    async fn search(
        &self,
        request: &SearchRequest,
        api_key: &str,
    ) -> Result<Vec<RawProduct>, SearchError> {
        debug!(query = %request.query, country = %request.locale.country, "shopping search");
        let body = self
            .get(&[
                ("engine", self.engine.as_str()),
                ("q", request.query.as_str()),
                ("gl", request.locale.country.as_str()),
                ("hl", request.locale.language.as_str()),
                ("api_key", api_key),
            ])
            .await?;

        Ok(body
            .get("shopping_results")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().map(raw_product).collect())
            .unwrap_or_default())
    }

    async fn details(
        &self,
        page_token: &str,
        locale: &Locale,
        api_key: &str,
    ) -> Result<ProductDetails, SearchError> {
        let body = self
            .get(&[
                ("engine", self.details_engine.as_str()),
                ("page_token", page_token),
                ("gl", locale.country.as_str()),
                ("hl", locale.language.as_str()),
                ("api_key", api_key),
            ])
            .await?;
        details_from(&body).ok_or(SearchError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_raw_product_mapping() {
        let v = json!({
            "title": "Trail Runner 3",
            "price": "$89.99",
            "extracted_price": 89.99,
            "product_link": "https://shop.example/p/1",
            "link": "https://other.example",
            "thumbnail": "https://img.example/1.jpg",
            "source": "Example Shop",
            "rating": 4.6,
            "reviews": 1200,
            "extensions": ["was: $119.99", "Free delivery"],
            "immersive_product_page_token": "tok-1"
        });
        let p = raw_product(&v);
        assert_eq!(p.title.as_deref(), Some("Trail Runner 3"));
        assert_eq!(p.link.as_deref(), Some("https://shop.example/p/1"));
        assert_eq!(p.reviews, Some(1200));
        assert_eq!(p.extensions.len(), 2);
        assert_eq!(p.page_token.as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_details_mapping() {
        let v = json!({
            "product_results": {
                "title": "Trail Runner 3",
                "rating": 4.5,
                "thumbnails": ["a.jpg", "b.jpg"],
                "stores": [
                    { "name": "Shop A", "price": "$89.99", "link": "https://a.example" },
                    { "price": "$95.00" }
                ],
                "about_the_product": { "features": [{ "title": "Weight", "value": "260 g" }] },
                "ratings": [{ "stars": 5, "amount": 800 }, { "stars": 1, "amount": 20 }]
            }
        });
        let d = details_from(&v).unwrap();
        assert_eq!(d.price, "$89.99");
        assert_eq!(d.offers.len(), 1);
        assert_eq!(d.images.len(), 2);
        assert_eq!(d.specifications[0].value, "260 g");
        assert_eq!(d.rating_breakdown[0], RatingBucket { stars: 5, count: 800 });
    }

    #[test]
    fn test_details_missing() {
        assert!(details_from(&json!({ "error": "nope" })).is_none());
    }

    #[test]
    fn test_quota_message() {
        assert!(is_quota_message("Your account has run out of searches."));
        assert!(!is_quota_message("Invalid API key."));
    }
}
