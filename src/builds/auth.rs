//! Bearer-token checks for the realtime endpoint.

use std::collections::HashSet;

use axum::http::{HeaderMap, header};
use subtle::ConstantTimeEq;

/// Decides whether a bearer token may open a realtime connection.
pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> bool;
}

/// A fixed set of accepted tokens. An empty set rejects everything.
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: HashSet<String>,
}

impl StaticTokens {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.is_empty())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenValidator for StaticTokens {
    fn validate(&self, token: &str) -> bool {
        if token.is_empty() {
            return false;
        }
        // Compare against every entry so timing does not reveal which one matched.
        self.tokens
            .iter()
            .fold(false, |found, t| found | bool::from(t.as_bytes().ct_eq(token.as_bytes())))
    }
}

/// Token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_static_tokens_accept_known_token() {
        let tokens = StaticTokens::new(["alpha", "beta"]);
        assert!(tokens.validate("alpha"));
        assert!(tokens.validate("beta"));
        assert!(!tokens.validate("gamma"));
        assert!(!tokens.validate("alph"));
        assert!(!tokens.validate(""));
    }

    #[test]
    fn test_empty_token_set_rejects_everything() {
        let tokens = StaticTokens::new(Vec::<String>::new());
        assert!(tokens.is_empty());
        assert!(!tokens.validate("anything"));

        let blanks = StaticTokens::new([""]);
        assert!(blanks.is_empty());
        assert!(!blanks.validate(""));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
