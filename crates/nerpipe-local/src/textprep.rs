//! Token normalisation and word segmentation.
//!
//! Offsets produced here count Unicode code points relative to the input snippet,
//! added onto the snippet's own (byte-based) offset.

use nerpipe_core::{Snippet, Token};
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Punctuation stripped from either end of a token before lookup.
pub fn is_token_delimiter(b: u8) -> bool {
    matches!(
        b,
        b'(' | b')' | b'{' | b'}' | b'[' | b']' | b'"' | b'\'' | b':' | b';' | b',' | b'.' | b'?' | b'!'
    )
}

fn is_whitespace_segment(segment: &str) -> bool {
    segment.as_bytes().first().is_some_and(|b| *b <= 0x20)
}

/// Normalise one token string.
///
/// Returns `(normalised, sentence_end, leading_offset_delta)`. At most one leading and one
/// trailing delimiter are stripped; a trailing delimiter marks the end of a sentence.
/// Single-byte tokens normalise to the empty string.
pub fn normalise_string(s: &str) -> (String, bool, usize) {
    let bytes = s.as_bytes();
    match bytes.len() {
        0 => return (String::new(), false, 0),
        1 => return (String::new(), is_token_delimiter(bytes[0]), 0),
        _ => {}
    }

    let mut body = s;
    let mut delta = 0;
    let mut sentence_end = false;
    if is_token_delimiter(bytes[0]) {
        body = &body[1..];
        delta = 1;
    }
    if body.as_bytes().last().is_some_and(|b| is_token_delimiter(*b)) {
        body = &body[..body.len() - 1];
        sentence_end = true;
    }

    let normalised = body.nfkc().collect::<String>().to_lowercase();
    (normalised, sentence_end, delta)
}

/// Normalise a token in place and report whether it ends a sentence.
pub fn normalise_snippet(snippet: &mut Snippet) -> bool {
    let (normalised, sentence_end, delta) = normalise_string(&snippet.text);
    snippet.text = normalised.clone();
    snippet.normalised_text = normalised;
    snippet.offset += delta;
    sentence_end
}

/// Split a snippet into tokens using UAX #29 word boundaries.
///
/// With `exact_match`, consecutive non-whitespace segments are glued together so that
/// `apple-pie` stays one token; otherwise every non-whitespace segment is its own token.
pub fn tokenize(snippet: &Snippet, exact_match: bool, mut on_token: impl FnMut(Token)) {
    let mut local = 0usize;
    let mut pending = String::new();
    let mut pending_start = 0usize;

    for segment in snippet.text.split_word_bounds() {
        let width = segment.chars().count();
        if is_whitespace_segment(segment) {
            if !pending.is_empty() {
                let text = std::mem::take(&mut pending);
                on_token(Snippet::new(text, snippet.offset + pending_start, &snippet.xpath));
            }
        } else if exact_match {
            if pending.is_empty() {
                pending_start = local;
            }
            pending.push_str(segment);
        } else {
            on_token(Snippet::new(segment, snippet.offset + local, &snippet.xpath));
        }
        local += width;
    }

    if !pending.is_empty() {
        on_token(Snippet::new(pending, snippet.offset + pending_start, &snippet.xpath));
    }
}

/// The cache key a phrase is stored under: its normalised tokens joined by single spaces.
///
/// This is the same text the dictionary recogniser builds for a compound snippet.
pub fn lookup_key(phrase: &str, exact_match: bool) -> String {
    let mut parts = Vec::new();
    tokenize(&Snippet::new(phrase, 0, ""), exact_match, |mut token| {
        normalise_snippet(&mut token);
        if !token.text.is_empty() {
            parts.push(token.text);
        }
    });
    parts.join(" ")
}
