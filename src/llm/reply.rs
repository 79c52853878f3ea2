//! Structured assistant replies.
//!
//! The model is asked for a single JSON object tagged by `type`. Models wrap
//! JSON in code fences or prose often enough that parsing is lenient: the
//! first `{` to the last `}` is tried, and anything unusable becomes a plain
//! dialogue carrying the raw text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::search::{PriceRange, SearchType};

/// Search instruction emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchDirective {
    /// Text shown to the user alongside the results.
    pub output: String,
    pub search_phrase: String,
    pub search_type: SearchType,
    pub category: Option<String>,
    pub price_range: PriceRange,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssistantReply {
    Dialogue {
        output: String,
        quick_replies: Vec<String>,
    },
    Search(SearchDirective),
}

impl AssistantReply {
    /// Parse raw model output. Never fails.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        extract_object(raw)
            .and_then(|v| Self::from_value(&v))
            .unwrap_or_else(|| Self::Dialogue {
                output: raw.trim().to_string(),
                quick_replies: Vec::new(),
            })
    }

    pub fn is_search(&self) -> bool {
        matches!(self, Self::Search(_))
    }

    fn from_value(v: &Value) -> Option<Self> {
        let output = v
            .get("output")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        match v.get("type").and_then(Value::as_str) {
            Some("search") => {
                let search_phrase = v
                    .get("search_phrase")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())?
                    .to_string();
                Some(Self::Search(SearchDirective {
                    output,
                    search_phrase,
                    search_type: v
                        .get("search_type")
                        .and_then(Value::as_str)
                        .map(SearchType::parse)
                        .unwrap_or_default(),
                    category: v
                        .get("category")
                        .and_then(Value::as_str)
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(ToString::to_string),
                    price_range: PriceRange {
                        min: v.get("min_price").and_then(number),
                        max: v.get("max_price").and_then(number),
                    },
                }))
            }
            Some("dialogue") | None if !output.is_empty() => {
                let quick_replies = v
                    .get("quick_replies")
                    .and_then(Value::as_array)
                    .map(|arr| {
                        arr.iter()
                            .filter_map(Value::as_str)
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(ToString::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                Some(Self::Dialogue {
                    output,
                    quick_replies,
                })
            }
            _ => None,
        }
    }
}

/// Accept `120`, `"120"` or `"$120"`.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => crate::search::parse_price(s),
        _ => None,
    }
    .filter(|n| n.is_finite() && *n >= 0.0)
}

fn extract_object(raw: &str) -> Option<Value> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str::<Value>(&raw[start..=end])
        .ok()
        .filter(Value::is_object)
}
