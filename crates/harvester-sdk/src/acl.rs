//! Document access tokens.
//!
//! Repository connectors that take ACLs from the job specification (rather
//! than from the source itself) attach a single deny token naming the
//! default authority, but only when at least one allow token exists. A
//! document with no allow tokens therefore also carries no deny tokens.
//!
//! Tokens are also packed into version descriptors so an ACL change forces
//! re-ingestion.

use serde::{Deserialize, Serialize};

/// Deny token attached on behalf of the default authority.
pub const DEFAULT_AUTHORITY_DENY_TOKEN: &str = "DEAD_AUTHORITY";

const SEPARATOR: char = '+';
const ESCAPE: char = '\\';

/// Allow and deny tokens for one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokens {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

/// Deny tokens that accompany spec-provided `allow` tokens.
///
/// Empty when `allow` is empty.
#[must_use]
pub fn deny_tokens_for(allow: &[String]) -> Vec<String> {
    if allow.is_empty() {
        Vec::new()
    } else {
        vec![DEFAULT_AUTHORITY_DENY_TOKEN.to_string()]
    }
}

impl AccessTokens {
    /// Tokens for a document secured only by spec-provided allow tokens.
    #[must_use]
    pub fn from_allow(allow: Vec<String>) -> Self {
        let deny = deny_tokens_for(&allow);
        Self { allow, deny }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Encode as `allow+allow+...++deny+...`, escaping separators, for use
    /// inside a version descriptor.
    #[must_use]
    pub fn pack(&self) -> String {
        let mut out = String::new();
        for token in &self.allow {
            pack_token(&mut out, token);
        }
        out.push(SEPARATOR);
        for token in &self.deny {
            pack_token(&mut out, token);
        }
        out
    }

    /// Inverse of [`AccessTokens::pack`]. Returns `None` on a truncated or
    /// unterminated encoding.
    #[must_use]
    pub fn unpack(packed: &str) -> Option<Self> {
        let mut tokens = Self::default();
        let mut in_deny = false;
        let mut current = String::new();
        let mut chars = packed.chars();
        let mut token_open = false;
        while let Some(c) = chars.next() {
            match c {
                ESCAPE => {
                    current.push(chars.next()?);
                    token_open = true;
                }
                SEPARATOR if token_open => {
                    let token = std::mem::take(&mut current);
                    if in_deny {
                        tokens.deny.push(token);
                    } else {
                        tokens.allow.push(token);
                    }
                    token_open = false;
                }
                SEPARATOR if !in_deny => in_deny = true,
                SEPARATOR => return None,
                other => {
                    current.push(other);
                    token_open = true;
                }
            }
        }
        if token_open || !in_deny {
            return None;
        }
        Some(tokens)
    }
}

fn pack_token(out: &mut String, token: &str) {
    for c in token.chars() {
        if c == SEPARATOR || c == ESCAPE {
            out.push(ESCAPE);
        }
        out.push(c);
    }
    out.push(SEPARATOR);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn deny_token_only_with_allow_tokens() {
        assert!(deny_tokens_for(&[]).is_empty());
        assert_eq!(
            deny_tokens_for(&strings(&["group-a"])),
            [DEFAULT_AUTHORITY_DENY_TOKEN]
        );
    }

    #[test]
    fn from_allow_without_tokens_is_fully_open() {
        let tokens = AccessTokens::from_allow(Vec::new());
        assert!(tokens.is_empty());
    }

    #[test]
    fn pack_unpack_preserves_tokens_with_separators() {
        let tokens = AccessTokens::from_allow(strings(&["a+b", r"c\d", "e"]));
        let packed = tokens.pack();
        assert_eq!(AccessTokens::unpack(&packed), Some(tokens));
    }

    #[test]
    fn empty_tokens_pack_to_single_separator() {
        let packed = AccessTokens::default().pack();
        assert_eq!(packed, "+");
        assert_eq!(AccessTokens::unpack(&packed), Some(AccessTokens::default()));
    }

    #[test]
    fn unpack_rejects_truncated_input() {
        assert_eq!(AccessTokens::unpack("a+"), None);
        assert_eq!(AccessTokens::unpack("a+b"), None);
        assert_eq!(AccessTokens::unpack("a\\"), None);
    }
}
