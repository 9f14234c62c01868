//! System-prompt injection: workspace custom instructions first, then the
//! redaction safety preamble when placeholders went out in this request.
//! FIM and plain completions are left untouched, their prompts are not
//! conversational.

use crate::errors::GatewayError;
use crate::pipeline::{Outcome, PipelineContext, PipelineStep};
use crate::types::{GatewayRequest, RequestKind};

/// Tells the model how to treat placeholder tokens it will see in the
/// conversation. The unredact step depends on these coming back verbatim.
const REDACTION_PREAMBLE: &str = "Some values in this conversation were replaced with opaque \
placeholders of the form REDACTED_<id> or <uuid>. Treat them as the literal values they stand \
for and repeat them back exactly as written; never invent, alter or expand a placeholder.";

pub struct SystemPromptInject;

impl PipelineStep for SystemPromptInject {
    fn name(&self) -> &'static str {
        "codegate-system-prompt"
    }

    fn run(
        &self,
        mut request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError> {
        if !matches!(request.kind, RequestKind::Chat) {
            return Ok(Outcome::Continue(request));
        }

        let mut sections: Vec<String> = Vec::new();
        if let Some(instructions) = &ctx.workspace.custom_instructions {
            if !instructions.trim().is_empty() {
                sections.push(instructions.trim().to_string());
            }
        }
        if ctx.redaction_count() > 0 {
            sections.push(REDACTION_PREAMBLE.to_string());
        }
        if sections.is_empty() {
            return Ok(Outcome::Continue(request));
        }

        let injected = sections.join("\n\n");
        request.system = Some(match request.system.take() {
            Some(existing) => format!("{injected}\n\n{existing}"),
            None => injected,
        });
        Ok(Outcome::Continue(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::test_support::{chat_request, context};
    use crate::pipeline::{RequestPipeline, Verdict};
    use crate::substitution::SpanOrigin;

    #[test]
    fn custom_instructions_prepended() {
        let mut ctx = context(false);
        ctx.workspace.custom_instructions = Some("Always answer in Spanish.".into());
        let mut request = chat_request("hola");
        request.system = Some("base prompt".into());

        let pipeline = RequestPipeline::new(vec![Box::new(SystemPromptInject)]);
        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!()
        };
        let system = out.system.unwrap();
        assert!(system.starts_with("Always answer in Spanish."));
        assert!(system.ends_with("base prompt"));
    }

    #[test]
    fn preamble_only_when_redactions_happened() {
        let mut ctx = context(false);
        let pipeline = RequestPipeline::new(vec![Box::new(SystemPromptInject)]);

        let Verdict::Forward(clean) = pipeline.run(chat_request("hi"), &mut ctx).unwrap() else {
            panic!()
        };
        assert!(clean.system.is_none());

        ctx.store
            .get_or_insert("tok", SpanOrigin::Secret, "github_token", "");
        ctx.secrets_redacted = 1;
        let Verdict::Forward(redacted) = pipeline.run(chat_request("hi"), &mut ctx).unwrap()
        else {
            panic!()
        };
        assert!(redacted.system.unwrap().contains("REDACTED_<id>"));
    }

    #[test]
    fn fim_requests_untouched() {
        let mut ctx = context(false);
        ctx.workspace.custom_instructions = Some("instructions".into());
        ctx.secrets_redacted = 1;
        let mut request = chat_request("<|fim_prefix|>fn x(<|fim_suffix|>)<|fim_middle|>");
        request.kind = RequestKind::Fim;

        let pipeline = RequestPipeline::new(vec![Box::new(SystemPromptInject)]);
        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!()
        };
        assert!(out.system.is_none());
    }
}
