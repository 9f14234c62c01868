//! PII detection.
//!
//! Entity recognition is behind the `PiiRecognizer` trait so a model-backed
//! recognizer can be dropped in; the shipped implementation is a compiled
//! regex analyzer with Luhn validation for card numbers.

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PiiKind {
    Email,
    Phone,
    CreditCard,
    Ssn,
    IpAddress,
}

impl PiiKind {
    pub fn label(&self) -> &'static str {
        match self {
            PiiKind::Email => "email",
            PiiKind::Phone => "phone",
            PiiKind::CreditCard => "credit_card",
            PiiKind::Ssn => "ssn",
            PiiKind::IpAddress => "ip_address",
        }
    }
}

/// A typed entity span over one text part.
#[derive(Debug, Clone, PartialEq)]
pub struct PiiSpan {
    pub kind: PiiKind,
    pub start: usize,
    pub end: usize,
    pub value: String,
}

pub trait PiiRecognizer: Send + Sync {
    fn recognize(&self, text: &str) -> Vec<PiiSpan>;
}

static PII_PATTERNS: Lazy<Vec<(PiiKind, Regex)>> = Lazy::new(|| {
    let defs: &[(PiiKind, &str)] = &[
        (
            PiiKind::Email,
            r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}",
        ),
        (PiiKind::Phone, r"\+\d{1,3}[-.\s]?\d[\d\-.\s]{6,14}\d"),
        (
            PiiKind::Phone,
            r"(?:\+?1[-.\s]?)?\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}",
        ),
        (
            PiiKind::CreditCard,
            r"\b(?:4\d{3}|5[1-5]\d{2}|3[47]\d{2}|6(?:011|5\d{2}))[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{1,4}\b",
        ),
        (PiiKind::Ssn, r"\b\d{3}-\d{2}-\d{4}\b"),
        (
            PiiKind::IpAddress,
            r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d\d?)\b",
        ),
    ];
    defs.iter()
        .map(|(kind, pattern)| (*kind, Regex::new(pattern).expect("builtin PII pattern")))
        .collect()
});

#[derive(Default)]
pub struct RegexRecognizer;

impl PiiRecognizer for RegexRecognizer {
    fn recognize(&self, text: &str) -> Vec<PiiSpan> {
        let mut spans = Vec::new();
        for (kind, regex) in PII_PATTERNS.iter() {
            for m in regex.find_iter(text) {
                if *kind == PiiKind::CreditCard && !luhn_valid(m.as_str()) {
                    continue;
                }
                spans.push(PiiSpan {
                    kind: *kind,
                    start: m.start(),
                    end: m.end(),
                    value: m.as_str().to_string(),
                });
            }
        }

        // Longest-match-first, drop overlaps.
        spans.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        let mut deduped: Vec<PiiSpan> = Vec::new();
        for span in spans {
            if deduped
                .iter()
                .any(|d| span.start < d.end && span.end > d.start)
            {
                continue;
            }
            deduped.push(span);
        }
        deduped
    }
}

fn luhn_valid(raw: &str) -> bool {
    let digits: Vec<u32> = raw.chars().filter_map(|c| c.to_digit(10)).collect();
    if digits.len() < 13 || digits.len() > 19 {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognize(text: &str) -> Vec<PiiSpan> {
        RegexRecognizer.recognize(text)
    }

    #[test]
    fn email_detected() {
        let input = ["Contact john", "@", "example.com for details"].join("");
        let spans = recognize(&input);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PiiKind::Email);
    }

    #[test]
    fn phone_detected() {
        let spans = recognize("Call me at (555) 123-4567");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PiiKind::Phone);
    }

    #[test]
    fn ssn_detected() {
        let spans = recognize("SSN: 123-45-6789");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PiiKind::Ssn);
    }

    #[test]
    fn valid_card_detected_invalid_skipped() {
        // 4242... passes Luhn, 4242...1 does not.
        let valid = recognize("card 4242 4242 4242 4242");
        assert_eq!(valid.len(), 1);
        assert_eq!(valid[0].kind, PiiKind::CreditCard);

        let invalid = recognize("card 4242 4242 4242 4241");
        assert!(invalid.iter().all(|s| s.kind != PiiKind::CreditCard));
    }

    #[test]
    fn ip_address_detected() {
        let spans = recognize("server at 192.168.1.100 responded");
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].kind, PiiKind::IpAddress);
    }

    #[test]
    fn overlap_keeps_longest() {
        // The +country-code phone pattern and the US pattern both match;
        // only one span must survive.
        let spans = recognize("+1 555 123 4567");
        assert_eq!(spans.len(), 1);
    }
}
