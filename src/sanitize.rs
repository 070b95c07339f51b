//! Query sanitization applied before any cache or network access.

use std::sync::LazyLock;

use regex::Regex;

/// Longest accepted query, in characters, after trimming.
pub const MAX_QUERY_CHARS: usize = 200;

/// Letters, digits, whitespace and `- , . ' " ( ) : ? ! [ ]`.
/// Brackets carry PubMed field tags such as `[Author]`.
static SAFE_QUERY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^[a-zA-Z0-9\s\-,.'"():?!\[\]]+$"#).expect("static whitelist pattern")
});

/// Injection signatures checked independently of the whitelist.
static INJECTION_SIGNATURES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i);\s*(DROP|DELETE|INSERT|UPDATE|SELECT)",
        r"&&|\|\|",
        r"(?i)<script",
        r"(?i)javascript:",
        r"\$\(",
        r"`",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static injection pattern"))
    .collect()
});

/// Why a query was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueryRejection {
    #[error("query is empty")]
    Empty,
    #[error("query is {0} characters, limit is {MAX_QUERY_CHARS}")]
    TooLong(usize),
    #[error("query contains characters outside the whitelist")]
    UnsafeCharacters,
    #[error("query matches an injection signature")]
    InjectionSignature,
}

/// Validate a raw query, returning the trimmed query or the reason it was refused.
pub fn check_query(raw: &str) -> Result<String, QueryRejection> {
    let query = raw.trim();
    if query.is_empty() {
        return Err(QueryRejection::Empty);
    }

    let len = query.chars().count();
    if len > MAX_QUERY_CHARS {
        return Err(QueryRejection::TooLong(len));
    }

    if !SAFE_QUERY.is_match(query) {
        return Err(QueryRejection::UnsafeCharacters);
    }

    if INJECTION_SIGNATURES.iter().any(|re| re.is_match(query)) {
        return Err(QueryRejection::InjectionSignature);
    }

    Ok(query.to_string())
}

/// Sanitize a raw query. Rejections are logged and yield `None`.
pub fn sanitize_query(raw: &str) -> Option<String> {
    match check_query(raw) {
        Ok(query) => {
            tracing::debug!("Query sanitized: {}", truncate_for_log(&query));
            Some(query)
        }
        Err(QueryRejection::InjectionSignature) => {
            tracing::error!("Potential injection attempt rejected: {}", truncate_for_log(raw));
            None
        }
        Err(reason) => {
            tracing::warn!("Query rejected ({}): {}", reason, truncate_for_log(raw));
            None
        }
    }
}

/// First 50 characters of a query, for log lines.
pub fn truncate_for_log(query: &str) -> String {
    let mut chars = query.chars();
    let head: String = chars.by_ref().take(50).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
