//! The secret-redaction request step.
//!
//! Scans every text part with the compiled signature set, widens matches to
//! full tokens, and substitutes session placeholders in place. This step is
//! fatal: if it fails, the request aborts before any byte reaches the
//! upstream.

use crate::errors::GatewayError;
use crate::pipeline::{Outcome, PipelineContext, PipelineStep};
use crate::signatures::{extend_boundaries, SecretFinder};
use crate::substitution::SpanOrigin;
use crate::types::{GatewayRequest, Part};

pub struct SecretRedact;

impl PipelineStep for SecretRedact {
    fn name(&self) -> &'static str {
        "secret-redact"
    }

    fn fatal(&self) -> bool {
        true
    }

    fn run(
        &self,
        mut request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError> {
        let mut redacted = 0usize;

        if let Some(system) = request.system.take() {
            let (out, n) = redact_text(&system, ctx);
            redacted += n;
            request.system = Some(out);
        }
        for message in &mut request.messages {
            for part in &mut message.parts {
                if let Part::Text { text } = part {
                    let (out, n) = redact_text(text, ctx);
                    redacted += n;
                    *text = out;
                }
            }
        }

        if redacted > 0 {
            tracing::info!(count = redacted, "redacted secrets from request");
        }
        ctx.secrets_redacted += redacted;
        Ok(Outcome::Continue(request))
    }
}

/// Redact one text part. Matches are replaced back-to-front so earlier
/// spans stay valid; each distinct literal gets one alert.
fn redact_text(text: &str, ctx: &mut PipelineContext) -> (String, usize) {
    let matches = SecretFinder::global().find_in_string(text);
    if matches.is_empty() {
        return (text.to_string(), 0);
    }

    // Widen to full tokens, then drop overlaps introduced by widening.
    let mut spans: Vec<(usize, usize, String)> = Vec::new();
    for m in matches {
        let (start, end) = extend_boundaries(text, m.start, m.end);
        if spans.iter().any(|(s, e, _)| start < *e && end > *s) {
            continue;
        }
        tracing::debug!(service = %m.service, subtype = %m.subtype, "secret match");
        spans.push((start, end, m.subtype));
    }
    spans.sort_by(|a, b| b.0.cmp(&a.0));

    let mut out = text.to_string();
    let mut count = 0;
    for (start, end, subtype) in spans {
        let literal = &text[start..end];
        let placeholder = ctx
            .store
            .get_or_insert(literal, SpanOrigin::Secret, &subtype, text);
        out.replace_range(start..end, &placeholder);
        count += 1;
        ctx.add_alert(
            "codegate-secrets",
            None,
            Some(subtype.clone()),
            Some("critical".to_string()),
        );
    }
    (out, count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{chat_request, context};
    use crate::pipeline::RequestPipeline;
    use crate::pipeline::Verdict;

    fn gh_token() -> String {
        ["ghp_", "aBcDeFgHiJkLmNoPqRsTuVwXyZ0123456789"].join("")
    }

    #[test]
    fn secret_replaced_with_placeholder() {
        let token = gh_token();
        let pipeline = RequestPipeline::new(vec![Box::new(SecretRedact)]);
        let mut ctx = context(false);
        let request = chat_request(&format!("Here's my API key: {token}. Can you help?"));

        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!("expected forward");
        };
        let text = out.messages[0].flat_text();
        assert!(!text.contains(&token), "literal must not survive");
        assert!(text.contains("REDACTED_"));
        assert_eq!(ctx.secrets_redacted, 1);
        assert_eq!(ctx.alerts.len(), 1);
    }

    #[test]
    fn same_secret_twice_uses_one_placeholder() {
        let token = gh_token();
        let pipeline = RequestPipeline::new(vec![Box::new(SecretRedact)]);
        let mut ctx = context(false);
        let request = chat_request(&format!("{token} and again {token}"));

        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!("expected forward");
        };
        let text = out.messages[0].flat_text();
        let placeholder = &text[text.find("REDACTED_").unwrap()..][..41];
        assert_eq!(text.matches(placeholder).count(), 2);
        assert_eq!(ctx.store.len(), 1);
    }

    #[test]
    fn redact_is_idempotent() {
        let token = gh_token();
        let pipeline = RequestPipeline::new(vec![Box::new(SecretRedact)]);
        let mut ctx = context(false);

        let Verdict::Forward(once) = pipeline
            .run(chat_request(&format!("key: {token}")), &mut ctx)
            .unwrap()
        else {
            panic!()
        };
        let Verdict::Forward(twice) = pipeline.run(once.clone(), &mut ctx).unwrap() else {
            panic!()
        };
        assert_eq!(once.messages[0].flat_text(), twice.messages[0].flat_text());
    }

    #[test]
    fn system_prompt_is_scanned_too() {
        let token = gh_token();
        let pipeline = RequestPipeline::new(vec![Box::new(SecretRedact)]);
        let mut ctx = context(false);
        let mut request = chat_request("hello");
        request.system = Some(format!("context: {token}"));

        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!()
        };
        assert!(!out.system.unwrap().contains(&token));
    }

    #[test]
    fn clean_text_untouched() {
        let pipeline = RequestPipeline::new(vec![Box::new(SecretRedact)]);
        let mut ctx = context(false);
        let request = chat_request("no secrets here, just code review please");
        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!()
        };
        assert_eq!(out.messages[0].flat_text(), "no secrets here, just code review please");
        assert_eq!(ctx.secrets_redacted, 0);
    }
}
