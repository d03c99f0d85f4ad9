//! Strict `@agent` mention extraction. Only an explicit signal counts: a
//! structured `mentioned_agent_id` or an `@id` at the very start of the text.

use std::sync::LazyLock;

use parley_core::{Message, Payload};
use regex::Regex;

/// Longest accepted agent reference.
pub const MAX_MENTION_LEN: usize = 50;

static LEADING_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^@([a-zA-Z0-9_\-\x{4e00}-\x{9fa5}]+)(?:\s|$)").unwrap());

static AGENT_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-\x{4e00}-\x{9fa5}]+$").unwrap());

pub fn is_valid_agent_ref(candidate: &str) -> bool {
    candidate.chars().count() <= MAX_MENTION_LEN && AGENT_REF.is_match(candidate)
}

/// `@id` at the start of the trimmed text, followed by whitespace or the end.
pub fn parse_leading_mention(text: &str) -> Option<&str> {
    let caps = LEADING_MENTION.captures(text.trim())?;
    let id = caps.get(1)?.as_str();
    is_valid_agent_ref(id).then_some(id)
}

fn structured(value: Option<&str>) -> Option<String> {
    let id = value?.trim();
    is_valid_agent_ref(id).then(|| id.to_owned())
}

/// Checks metadata, then the payload field, then the leading `@` in the text.
pub fn extract_mention(msg: &Message) -> Option<String> {
    if let Some(id) = structured(msg.metadata.mentioned_agent_id.as_deref()) {
        return Some(id);
    }
    if let Some(id) = structured(msg.payload.get_str("mentioned_agent_id")) {
        return Some(id);
    }
    let text = match &msg.payload {
        Payload::Text(text) => text.as_str(),
        other => other.get_str("text")?,
    };
    parse_leading_mention(text).map(str::to_owned)
}
