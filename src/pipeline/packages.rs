//! The malicious-package check.
//!
//! Every package the extractor surfaced is resolved against the vector
//! index; bad statuses become alerts. When the user is *asking about* a
//! malicious package (a free-text mention), the pipeline short-circuits
//! with a synthetic reply instead of consulting the model at all.

use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::GatewayError;
use crate::extract::{self, PackageLocation};
use crate::pipeline::{Outcome, PipelineContext, PipelineStep};
use crate::storage::{PackageIndex, PackageMatch, PackageStatus};
use crate::types::{GatewayRequest, LocalReply};

const BLOCK_HEADER: &str =
    "CodeGate detected one or more malicious, deprecated or archived packages.";

pub struct MaliciousPackageCheck {
    index: Arc<PackageIndex>,
}

impl MaliciousPackageCheck {
    pub fn new(index: Arc<PackageIndex>) -> Self {
        MaliciousPackageCheck { index }
    }
}

impl PipelineStep for MaliciousPackageCheck {
    fn name(&self) -> &'static str {
        "codegate-context-retriever"
    }

    fn run(
        &self,
        request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError> {
        if self.index.is_empty() {
            return Ok(Outcome::Continue(request));
        }

        let mut flagged: Vec<PackageMatch> = Vec::new();
        let mut seen = HashSet::new();
        let mut asked_about_malicious = false;

        // Imports and manifest entries collected by the extract step.
        for package in &ctx.packages {
            if let Some(hit) = self.index.lookup(&package.name, package.ecosystem) {
                if hit.record.status != PackageStatus::Ok
                    && seen.insert((hit.record.ecosystem, hit.record.name.clone()))
                {
                    flagged.push(hit);
                }
            }
        }

        // Free-text mentions in the trailing user messages; these mark the
        // request as an information request about the package. Code blocks
        // are stripped first so imports do not count as mentions.
        let user_block = extract::strip_code_blocks(&request.latest_user_block());
        for candidate in extract::free_text_candidates(&user_block) {
            if candidate.location != PackageLocation::FreeText {
                continue;
            }
            if let Some(hit) = self.index.lookup(&candidate.name, None) {
                if hit.record.status != PackageStatus::Ok {
                    if hit.record.status == PackageStatus::Malicious {
                        asked_about_malicious = true;
                    }
                    if seen.insert((hit.record.ecosystem, hit.record.name.clone())) {
                        flagged.push(hit);
                    }
                }
            }
        }

        if flagged.is_empty() {
            return Ok(Outcome::Continue(request));
        }

        for hit in &flagged {
            ctx.add_alert(
                self.name(),
                None,
                Some(hit.record.name.clone()),
                Some(format!("{}_package", hit.record.status.as_str())),
            );
        }

        if asked_about_malicious {
            let reply = LocalReply {
                content: render_block_reply(&flagged),
                step_name: self.name().to_string(),
                model: request.model.clone(),
            };
            return Ok(Outcome::ReplyNow(reply));
        }

        Ok(Outcome::Continue(request))
    }
}

fn render_block_reply(flagged: &[PackageMatch]) -> String {
    let mut out = String::from(BLOCK_HEADER);
    out.push_str("\n\n");
    for hit in flagged {
        let ecosystem = hit.record.ecosystem.as_str();
        // Prefer the record's own advisory link when the import carried one.
        let url = hit.record.advisory_url.clone().unwrap_or_else(|| {
            format!(
                "https://www.insight.stacklok.com/report/{}/{}?utm_source=codegate",
                ecosystem,
                url_encode(&hit.record.name)
            )
        });
        out.push_str(&format!(
            "- **{}** ({}): {}, see {}\n",
            hit.record.name,
            ecosystem,
            hit.record.status.as_str(),
            url
        ));
    }
    out
}

/// Percent-encode everything outside the URL-safe set.
fn url_encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::Ecosystem;
    use crate::pipeline::test_support::{chat_request, context};
    use crate::pipeline::{CodeSnippetExtract, RequestPipeline, Verdict};

    fn seeded_index() -> Arc<PackageIndex> {
        let mut index = PackageIndex::in_memory(0.85);
        index
            .insert(Ecosystem::Pypi, "invokehttp", PackageStatus::Malicious, None)
            .unwrap();
        index
            .insert(Ecosystem::Npm, "left-pad", PackageStatus::Deprecated, None)
            .unwrap();
        index
            .insert(Ecosystem::Pypi, "requests", PackageStatus::Ok, None)
            .unwrap();
        Arc::new(index)
    }

    fn pipeline(index: Arc<PackageIndex>) -> RequestPipeline {
        RequestPipeline::new(vec![
            Box::new(CodeSnippetExtract),
            Box::new(MaliciousPackageCheck::new(index)),
        ])
    }

    #[test]
    fn asking_about_malicious_package_blocks() {
        let mut ctx = context(false);
        let request = chat_request("Is it safe to use invokehttp?");
        let verdict = pipeline(seeded_index()).run(request, &mut ctx).unwrap();

        let Verdict::Reply(reply) = verdict else {
            panic!("expected policy short-circuit");
        };
        assert!(reply.content.contains(BLOCK_HEADER));
        assert!(reply.content.contains(
            "https://www.insight.stacklok.com/report/pypi/invokehttp?utm_source=codegate"
        ));
        assert_eq!(ctx.alerts.len(), 1);
    }

    #[test]
    fn import_of_malicious_package_alerts_but_continues() {
        let mut ctx = context(false);
        let request = chat_request("review\n```python\nimport invokehttp\n```");
        let verdict = pipeline(seeded_index()).run(request, &mut ctx).unwrap();

        assert!(matches!(verdict, Verdict::Forward(_)));
        assert_eq!(ctx.alerts.len(), 1);
        assert!(ctx.alerts[0]
            .trigger_category
            .as_deref()
            .unwrap()
            .contains("malicious"));
    }

    #[test]
    fn deprecated_mention_alerts_without_block() {
        let mut ctx = context(false);
        let request = chat_request("should I keep using left-pad in production?");
        let verdict = pipeline(seeded_index()).run(request, &mut ctx).unwrap();

        assert!(matches!(verdict, Verdict::Forward(_)));
        assert_eq!(ctx.alerts.len(), 1);
    }

    #[test]
    fn healthy_packages_pass_silently() {
        let mut ctx = context(false);
        let request = chat_request("how do I use requests for retries?");
        let verdict = pipeline(seeded_index()).run(request, &mut ctx).unwrap();

        assert!(matches!(verdict, Verdict::Forward(_)));
        assert!(ctx.alerts.is_empty());
    }

    #[test]
    fn url_encoding_escapes_specials() {
        assert_eq!(url_encode("simple-name"), "simple-name");
        assert_eq!(url_encode("a/b c"), "a%2Fb%20c");
        assert_eq!(url_encode("@scope/pkg"), "%40scope%2Fpkg");
    }

    #[test]
    fn empty_index_is_a_noop() {
        let mut ctx = context(false);
        let index = Arc::new(PackageIndex::in_memory(0.85));
        let request = chat_request("Is it safe to use invokehttp?");
        let verdict = pipeline(index).run(request, &mut ctx).unwrap();
        assert!(matches!(verdict, Verdict::Forward(_)));
    }
}
