//! The PII-redaction request step. Same substitution mechanics as the
//! secret step, driven by recognizer spans instead of signatures. Spans
//! that overlap an already-redacted secret placeholder cannot occur; the
//! secret step runs first and placeholders contain no PII-shaped text.

use std::sync::Arc;

use crate::errors::GatewayError;
use crate::pii::PiiRecognizer;
use crate::pipeline::{Outcome, PipelineContext, PipelineStep};
use crate::substitution::SpanOrigin;
use crate::types::{GatewayRequest, Part};

pub struct PiiRedact {
    recognizer: Arc<dyn PiiRecognizer>,
}

impl PiiRedact {
    pub fn new(recognizer: Arc<dyn PiiRecognizer>) -> Self {
        PiiRedact { recognizer }
    }
}

impl PipelineStep for PiiRedact {
    fn name(&self) -> &'static str {
        "codegate-pii"
    }

    fn run(
        &self,
        mut request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError> {
        let mut redacted = 0usize;
        for message in &mut request.messages {
            for part in &mut message.parts {
                if let Part::Text { text } = part {
                    let (out, n) = self.redact_text(text, ctx);
                    redacted += n;
                    *text = out;
                }
            }
        }
        if redacted > 0 {
            tracing::info!(count = redacted, "redacted PII from request");
        }
        ctx.pii_redacted += redacted;
        Ok(Outcome::Continue(request))
    }
}

impl PiiRedact {
    fn redact_text(&self, text: &str, ctx: &mut PipelineContext) -> (String, usize) {
        let mut spans = self.recognizer.recognize(text);
        if spans.is_empty() {
            return (text.to_string(), 0);
        }
        // A span inside an existing placeholder is recognizer noise;
        // rewriting it would corrupt the token.
        let masked = crate::substitution::placeholder_ranges(text);
        spans.retain(|span| {
            !masked
                .iter()
                .any(|(start, end)| span.start < *end && span.end > *start)
        });
        spans.sort_by(|a, b| b.start.cmp(&a.start));

        let mut out = text.to_string();
        let mut count = 0;
        for span in spans {
            let placeholder =
                ctx.store
                    .get_or_insert(&span.value, SpanOrigin::Pii, span.kind.label(), text);
            out.replace_range(span.start..span.end, &placeholder);
            count += 1;
            ctx.add_alert(
                "codegate-pii",
                None,
                Some(span.kind.label().to_string()),
                Some("critical".to_string()),
            );
        }
        (out, count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pii::RegexRecognizer;
    use crate::pipeline::test_support::{chat_request, context};
    use crate::pipeline::{RequestPipeline, Verdict};

    fn pipeline() -> RequestPipeline {
        RequestPipeline::new(vec![Box::new(PiiRedact::new(Arc::new(RegexRecognizer)))])
    }

    #[test]
    fn email_becomes_uuid_placeholder() {
        let email = ["jane", "@", "example.com"].join("");
        let mut ctx = context(false);
        let request = chat_request(&format!("mail me at {email} please"));

        let Verdict::Forward(out) = pipeline().run(request, &mut ctx).unwrap() else {
            panic!()
        };
        let text = out.messages[0].flat_text();
        assert!(!text.contains(&email));
        assert!(text.contains('<') && text.contains('>'));
        assert_eq!(ctx.pii_redacted, 1);
    }

    #[test]
    fn multiple_kinds_in_one_message() {
        let mut ctx = context(false);
        let email = ["a", "@", "b.com"].join("");
        let request = chat_request(&format!("email {email}, ssn 123-45-6789"));

        let Verdict::Forward(out) = pipeline().run(request, &mut ctx).unwrap() else {
            panic!()
        };
        let text = out.messages[0].flat_text();
        assert!(!text.contains("123-45-6789"));
        assert!(!text.contains(&email));
        assert_eq!(ctx.pii_redacted, 2);
        assert_eq!(ctx.store.count_by_origin(SpanOrigin::Pii), 2);
    }

    #[test]
    fn digit_runs_inside_placeholders_left_alone() {
        // A secret placeholder whose hex happens to contain a phone-shaped
        // digit run must survive the PII pass untouched.
        let placeholder = format!("REDACTED_0123456789{}", "a".repeat(22));
        let mut ctx = context(false);
        let request = chat_request(&format!("token {placeholder} end"));

        let Verdict::Forward(out) = pipeline().run(request, &mut ctx).unwrap() else {
            panic!()
        };
        assert!(out.messages[0].flat_text().contains(&placeholder));
        assert_eq!(ctx.pii_redacted, 0);
    }

    #[test]
    fn placeholder_reversible_through_store() {
        let email = ["jane", "@", "example.com"].join("");
        let mut ctx = context(false);
        let request = chat_request(&format!("contact: {email}"));
        let Verdict::Forward(out) = pipeline().run(request, &mut ctx).unwrap() else {
            panic!()
        };
        let (restored, n) = ctx.store.unredact_text(&out.messages[0].flat_text());
        assert_eq!(restored, format!("contact: {email}"));
        assert_eq!(n, 1);
    }
}
