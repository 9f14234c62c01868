//! Reversible substitution of detected literals.
//!
//! Each session keeps a bidirectional map `literal ⇄ placeholder`. Secrets
//! become `REDACTED_<32 hex>`, PII becomes a `<uuid>` in angle brackets;
//! both forms are fixed-length and detectable by prefix, so the response
//! path can scan for candidates without knowing the map's contents. A valid
//! placeholder is never a substring of another (fixed length, unique
//! suffix), and allocation re-rolls if a candidate already occurs in the
//! session text.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::crypto::{self, SessionCrypto};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanOrigin {
    Secret,
    Pii,
}

/// `REDACTED_` + 32 hex chars.
pub const SECRET_PLACEHOLDER_LEN: usize = 9 + 32;
/// `<` + hyphenated uuid + `>`.
pub const PII_PLACEHOLDER_LEN: usize = 1 + 36 + 1;
/// Upper bound used by the streaming tail buffer.
pub const MAX_PLACEHOLDER_LEN: usize = SECRET_PLACEHOLDER_LEN;

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"REDACTED_[0-9a-f]{32}",
        "|",
        r"<[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}>",
    ))
    .expect("placeholder pattern")
});

// subtype and discovered_at are audit metadata; nothing on the hot path
// reads them back.
struct StoredEntry {
    encrypted_literal: Vec<u8>,
    origin: SpanOrigin,
    #[allow(dead_code)]
    subtype: String,
    #[allow(dead_code)]
    discovered_at: DateTime<Utc>,
}

#[derive(Default)]
struct StoreInner {
    /// literal -> placeholder, for reuse on repeated literals.
    forward: HashMap<String, String>,
    /// placeholder -> entry, literal encrypted at rest.
    entries: HashMap<String, StoredEntry>,
}

/// Per-session substitution store. Writes happen in the redact steps, reads
/// in the unredact step; the mutex sections are short.
pub struct SubstitutionStore {
    session_id: String,
    crypto: Arc<SessionCrypto>,
    inner: Mutex<StoreInner>,
}

impl SubstitutionStore {
    pub fn new(session_id: impl Into<String>, crypto: Arc<SessionCrypto>) -> Self {
        SubstitutionStore {
            session_id: session_id.into(),
            crypto,
            inner: Mutex::new(StoreInner::default()),
        }
    }

    /// Get the placeholder for a literal, allocating one if this literal is
    /// new. `context` is the text being redacted; a freshly rolled
    /// placeholder that already occurs there is rejected and re-rolled.
    pub fn get_or_insert(
        &self,
        literal: &str,
        origin: SpanOrigin,
        subtype: &str,
        context: &str,
    ) -> String {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.forward.get(literal) {
            return existing.clone();
        }

        let placeholder = loop {
            let candidate = match origin {
                SpanOrigin::Secret => format!("REDACTED_{}", Uuid::new_v4().simple()),
                SpanOrigin::Pii => format!("<{}>", Uuid::new_v4()),
            };
            if !context.contains(&candidate) && !inner.entries.contains_key(&candidate) {
                break candidate;
            }
        };

        let encrypted_literal = match self.crypto.encrypt(literal.as_bytes(), &self.session_id) {
            Ok(ct) => ct,
            Err(e) => {
                // Redaction must not fail open; an unencryptable literal is
                // still mapped, just without at-rest protection.
                tracing::warn!("literal encryption failed, storing plaintext: {e}");
                literal.as_bytes().to_vec()
            }
        };

        inner
            .forward
            .insert(literal.to_string(), placeholder.clone());
        inner.entries.insert(
            placeholder.clone(),
            StoredEntry {
                encrypted_literal,
                origin,
                subtype: subtype.to_string(),
                discovered_at: Utc::now(),
            },
        );
        placeholder
    }

    /// Decrypt the literal behind a placeholder, if known to this session.
    pub fn resolve(&self, placeholder: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        let entry = inner.entries.get(placeholder)?;
        match self.crypto.decrypt(&entry.encrypted_literal, &self.session_id) {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            // Plaintext fallback from a failed encrypt.
            Err(_) => String::from_utf8(entry.encrypted_literal.clone()).ok(),
        }
    }

    /// Replace every known placeholder in `text` with its literal.
    /// Unknown placeholders (not in this session) pass through untouched.
    /// Returns the rewritten text and how many replacements were made.
    pub fn unredact_text(&self, text: &str) -> (String, usize) {
        if !text.contains("REDACTED_") && !text.contains('<') {
            return (text.to_string(), 0);
        }
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut count = 0;
        for m in PLACEHOLDER_RE.find_iter(text) {
            out.push_str(&text[last..m.start()]);
            match self.resolve(m.as_str()) {
                Some(literal) => {
                    out.push_str(&literal);
                    count += 1;
                }
                None => out.push_str(m.as_str()),
            }
            last = m.end();
        }
        out.push_str(&text[last..]);
        (out, count)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_by_origin(&self, origin: SpanOrigin) -> usize {
        self.inner
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|e| e.origin == origin)
            .count()
    }

    /// Wipe entries and the session key. Literal ciphertext is zeroed; the
    /// forward map's plaintext keys are dropped with the map.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().unwrap();
        for entry in inner.entries.values_mut() {
            crypto::wipe(&mut entry.encrypted_literal);
        }
        inner.entries.clear();
        inner.forward.clear();
        self.crypto.cleanup_session(&self.session_id);
    }
}

/// Byte ranges in `text` occupied by placeholder-shaped tokens. Later
/// detectors must not fire inside these: a digit run inside a placeholder
/// is not a phone number, and rewriting it would corrupt the token.
pub fn placeholder_ranges(text: &str) -> Vec<(usize, usize)> {
    PLACEHOLDER_RE
        .find_iter(text)
        .map(|m| (m.start(), m.end()))
        .collect()
}

/// Length of the longest suffix of `text` that could still grow into a
/// placeholder once more bytes arrive. The streaming unredact step holds
/// exactly this many bytes back, so a placeholder split across chunk
/// boundaries is never missed. Bounded by `MAX_PLACEHOLDER_LEN - 1`.
pub fn held_back_len(text: &str) -> usize {
    let max = MAX_PLACEHOLDER_LEN.saturating_sub(1);
    let bytes = text.as_bytes();
    let window = max.min(bytes.len());
    for offset in (1..=window).rev() {
        let start = bytes.len() - offset;
        if !text.is_char_boundary(start) {
            continue;
        }
        if could_be_placeholder_prefix(&text[start..]) {
            return offset;
        }
    }
    0
}

fn could_be_placeholder_prefix(s: &str) -> bool {
    could_be_secret_prefix(s) || could_be_pii_prefix(s)
}

fn could_be_secret_prefix(s: &str) -> bool {
    if s.len() >= SECRET_PLACEHOLDER_LEN {
        return false;
    }
    const PREFIX: &str = "REDACTED_";
    let head = s.len().min(PREFIX.len());
    if s.as_bytes()[..head] != PREFIX.as_bytes()[..head] {
        return false;
    }
    s.as_bytes()[head..]
        .iter()
        .all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

fn could_be_pii_prefix(s: &str) -> bool {
    if s.len() >= PII_PLACEHOLDER_LEN {
        return false;
    }
    let bytes = s.as_bytes();
    if bytes[0] != b'<' {
        return false;
    }
    for (i, &b) in bytes[1..].iter().enumerate() {
        let ok = if matches!(i, 8 | 13 | 18 | 23) {
            b == b'-'
        } else {
            matches!(b, b'0'..=b'9' | b'a'..=b'f')
        };
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SubstitutionStore {
        SubstitutionStore::new("test-session", Arc::new(SessionCrypto::new()))
    }

    #[test]
    fn placeholder_shapes() {
        let store = store();
        let secret = store.get_or_insert("hunter2hunter2", SpanOrigin::Secret, "github_token", "");
        assert_eq!(secret.len(), SECRET_PLACEHOLDER_LEN);
        assert!(secret.starts_with("REDACTED_"));

        let pii = store.get_or_insert("jo@example.com", SpanOrigin::Pii, "email", "");
        assert_eq!(pii.len(), PII_PLACEHOLDER_LEN);
        assert!(pii.starts_with('<') && pii.ends_with('>'));
    }

    #[test]
    fn repeated_literal_reuses_placeholder() {
        let store = store();
        let a = store.get_or_insert("same-value", SpanOrigin::Secret, "t", "");
        let b = store.get_or_insert("same-value", SpanOrigin::Secret, "t", "");
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn resolve_round_trips() {
        let store = store();
        let p = store.get_or_insert("the-literal", SpanOrigin::Secret, "t", "");
        assert_eq!(store.resolve(&p).as_deref(), Some("the-literal"));
    }

    #[test]
    fn unredact_replaces_known_and_skips_unknown() {
        let store = store();
        let p = store.get_or_insert("literal-a", SpanOrigin::Secret, "t", "");
        let foreign = format!("REDACTED_{}", Uuid::new_v4().simple());
        let text = format!("x {p} y {foreign} z");
        let (out, count) = store.unredact_text(&text);
        assert_eq!(out, format!("x literal-a y {foreign} z"));
        assert_eq!(count, 1);
    }

    #[test]
    fn unredact_is_idempotent() {
        let store = store();
        let p = store.get_or_insert("literal-a", SpanOrigin::Secret, "t", "");
        let text = format!("before {p} after");
        let (once, _) = store.unredact_text(&text);
        let (twice, count) = store.unredact_text(&once);
        assert_eq!(once, twice);
        assert_eq!(count, 0);
    }

    #[test]
    fn cleanup_forgets_everything() {
        let store = store();
        let p = store.get_or_insert("literal-a", SpanOrigin::Secret, "t", "");
        store.cleanup();
        assert!(store.resolve(&p).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn held_back_covers_partial_secret_placeholder() {
        assert_eq!(held_back_len("hello RED"), 3);
        assert_eq!(held_back_len("hello REDACTED_"), 9);
        assert_eq!(held_back_len("hello REDACTED_0123abcd"), 17);
        // A complete placeholder is not a prefix anymore.
        let full = format!("REDACTED_{}", "0".repeat(32));
        assert_eq!(held_back_len(&full), 0);
    }

    #[test]
    fn held_back_covers_partial_pii_placeholder() {
        assert_eq!(held_back_len("x <0123abcd-012"), 13);
        assert_eq!(held_back_len("x <not a uuid"), 0);
        assert_eq!(held_back_len("plain text with no markers"), 0);
    }

    #[test]
    fn held_back_is_bounded() {
        let long = "R".repeat(500);
        assert!(held_back_len(&long) < MAX_PLACEHOLDER_LEN);
    }
}
