//! Tokenization shared by the `$match` translator, the planner's
//! post-filter, and the in-memory search index.
//!
//! Rules are simple and deterministic:
//! - split on non-alphanumeric characters;
//! - split camelCase boundaries (ArchivalUnit → archival + unit);
//! - lowercase everything, drop one-character tokens.
//!
//! Fuzzy tolerance is prefix-based: a query token matches a document token
//! it equals or is a prefix of (minimum three characters), so "budget"
//! finds "budgetary".

pub(crate) fn tokenize(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_was_lower = false;

    for c in text.chars() {
        if c.is_alphanumeric() {
            if c.is_uppercase() && prev_was_lower && !current.is_empty() {
                push_token(&mut tokens, &mut current);
            }
            let lc = c.to_lowercase().next().unwrap_or(c);
            if current.len() < 64 {
                current.push(lc);
            }
            prev_was_lower = lc.is_lowercase();
            continue;
        }
        if !current.is_empty() {
            push_token(&mut tokens, &mut current);
        }
        prev_was_lower = false;
    }
    if !current.is_empty() {
        push_token(&mut tokens, &mut current);
    }
    tokens
}

fn push_token(tokens: &mut Vec<String>, current: &mut String) {
    const MIN_TOKEN_LEN: usize = 2;
    if current.len() >= MIN_TOKEN_LEN {
        tokens.push(std::mem::take(current));
    } else {
        current.clear();
    }
}

/// One query token against one document token.
pub(crate) fn token_matches(query: &str, doc: &str) -> bool {
    if query == doc {
        return true;
    }
    query.len() >= 3 && doc.starts_with(query)
}

/// Every query token must occur somewhere in the document tokens.
pub(crate) fn all_tokens_match(query_tokens: &[String], doc_tokens: &[String]) -> bool {
    !query_tokens.is_empty()
        && query_tokens
            .iter()
            .all(|q| doc_tokens.iter().any(|d| token_matches(q, d)))
}
