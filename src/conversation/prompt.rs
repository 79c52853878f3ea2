//! Prompt assembly.

use std::fmt::Write as _;

use crate::llm::{ChatMessage, MessageRole};
use crate::session::{Message, Session};

const REPLY_CONTRACT: &str = r#"Reply with exactly one JSON object and nothing else.
To keep talking with the user:
{"type":"dialogue","output":"<your reply>","quick_replies":["<short option>", "..."]}
When you know enough to look up products:
{"type":"search","output":"<one sentence telling the user you are searching>","search_phrase":"<concise product query>","search_type":"exact|parameters|category","category":"<category>","min_price":<number or null>,"max_price":<number or null>}
Use "exact" for a specific named product, "parameters" for a product type with constraints, "category" for broad browsing.
Offer at most 4 quick replies."#;

/// System prompt for one turn.
pub fn system_prompt(session: &Session, searches_left: u32) -> String {
    let mut prompt = String::from(
        "You are a friendly shopping assistant. Ask short clarifying questions until the request \
         is specific enough, then search for products.\n",
    );
    let locale = &session.locale;
    let _ = writeln!(
        prompt,
        "The user shops in country '{}', speaks language '{}' and pays in {}. Always answer in that language.",
        locale.country, locale.language, locale.currency
    );
    if let Some(category) = &session.category {
        let _ = writeln!(prompt, "Current shopping category: {category}.");
    }
    if let Some(product) = &session.last_product {
        let _ = writeln!(
            prompt,
            "The product discussed last was \"{}\" at {}.",
            product.name, product.price
        );
    }
    if searches_left == 0 {
        prompt.push_str("No product searches remain in this session; do not emit a search.\n");
    } else {
        let _ = writeln!(prompt, "Product searches remaining: {searches_left}.");
    }
    prompt.push('\n');
    prompt.push_str(REPLY_CONTRACT);
    prompt
}

/// Chat messages for the last `window` transcript entries.
///
/// Assistant entries are replayed as plain text; product payloads are summarized.
pub fn context_window(history: &[Message], window: usize) -> Vec<ChatMessage> {
    let skip = history.len().saturating_sub(window);
    history[skip..]
        .iter()
        .map(|m| {
            let mut content = m.content.clone();
            if let Some(payload) = &m.payload
                && !payload.products.is_empty()
            {
                let names: Vec<&str> = payload
                    .products
                    .iter()
                    .take(3)
                    .map(|p| p.name.as_str())
                    .collect();
                let _ = write!(content, " [showed {} products: {}]", payload.products.len(), names.join(", "));
            }
            ChatMessage {
                role: m.role,
                content,
            }
        })
        .collect()
}

/// Earlier user turns (excluding the final, current one).
pub fn previous_user_turns(history: &[Message]) -> Vec<String> {
    let mut turns: Vec<String> = history
        .iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content.clone())
        .collect();
    turns.pop();
    turns
}

pub fn translation_prompt() -> String {
    "Translate the following product search phrase into English. Keep brand names and model \
     numbers unchanged. Reply with the translated phrase only, without quotes."
        .to_string()
}
