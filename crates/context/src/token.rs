//! Token estimation utilities.
//!
//! Uses a script-aware character heuristic rather than a real tokenizer
//! (too expensive to ship, and the exact tokenizer varies by provider):
//! CJK-script characters cost ~1 token per 1.5 characters, everything else
//! ~1 token per 4 characters. Accurate within ~10% for BPE tokenizers on
//! typical business text, which is all the budget engine needs — tests
//! assert proportionality bands, never exact counts.

use opsdesk_core::message::{ContentPart, ThreadMessage};

/// Per-message structural overhead (role framing, delimiters) in tokens.
pub const MESSAGE_OVERHEAD: usize = 4;

/// Flat token charge for an image part.
pub const IMAGE_TOKENS: usize = 500;

/// Framing overhead for a tool call / tool result part.
const TOOL_CALL_OVERHEAD: usize = 10;
const TOOL_RESULT_OVERHEAD: usize = 8;

/// Characters per token for JSON-like payloads (denser than prose).
const JSON_CHARS_PER_TOKEN: f64 = 3.0;

/// Estimate the token count for a string.
///
/// CJK characters ≈ 1 token per 1.5 chars; all others ≈ 1 token per 4.
/// Rounds up; empty input is zero.
pub fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let (mut cjk, mut other) = (0usize, 0usize);
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    (cjk as f64 / 1.5 + other as f64 / 4.0).ceil() as usize
}

/// Estimate tokens for a JSON-like payload: serialize and divide by 3.
///
/// Never fails — if serialization errors, falls back to the display form's
/// character length at the prose ratio.
pub fn estimate_json_tokens(value: &serde_json::Value) -> usize {
    match serde_json::to_string(value) {
        Ok(s) => (s.chars().count() as f64 / JSON_CHARS_PER_TOKEN).ceil() as usize,
        Err(_) => estimate_tokens(&value.to_string()),
    }
}

/// Estimate tokens for one structured content part.
pub fn estimate_part_tokens(part: &ContentPart) -> usize {
    match part {
        ContentPart::Text { text } => estimate_tokens(text),
        ContentPart::Image { .. } => IMAGE_TOKENS,
        ContentPart::ToolCall { name, arguments, .. } => {
            TOOL_CALL_OVERHEAD + estimate_tokens(name) + estimate_json_tokens(arguments)
        }
        ContentPart::ToolResult { output, .. } => {
            TOOL_RESULT_OVERHEAD + estimate_json_tokens(output)
        }
    }
}

/// Estimate tokens for a single message including per-message overhead.
pub fn estimate_message_tokens(message: &ThreadMessage) -> usize {
    MESSAGE_OVERHEAD
        + estimate_tokens(&message.content)
        + message.parts.iter().map(estimate_part_tokens).sum::<usize>()
        + message
            .tool_calls
            .iter()
            .map(|tc| TOOL_CALL_OVERHEAD + estimate_tokens(&tc.name) + (tc.arguments.chars().count() as f64 / JSON_CHARS_PER_TOKEN).ceil() as usize)
            .sum::<usize>()
}

/// Estimate tokens for a slice of messages.
pub fn estimate_messages_tokens(messages: &[ThreadMessage]) -> usize {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Whether a character belongs to a CJK script.
///
/// Covers the CJK Unified Ideograph blocks, kana, hangul, fullwidth forms,
/// and CJK punctuation.
fn is_cjk(c: char) -> bool {
    matches!(u32::from(c),
        0x1100..=0x11FF      // Hangul Jamo
        | 0x3000..=0x303F    // CJK punctuation
        | 0x3040..=0x30FF    // Hiragana, Katakana
        | 0x3400..=0x4DBF    // CJK Extension A
        | 0x4E00..=0x9FFF    // CJK Unified Ideographs
        | 0xAC00..=0xD7AF    // Hangul Syllables
        | 0xF900..=0xFAFF    // CJK Compatibility Ideographs
        | 0xFF00..=0xFFEF    // Fullwidth forms
        | 0x20000..=0x2A6DF  // CJK Extension B
    )
}
