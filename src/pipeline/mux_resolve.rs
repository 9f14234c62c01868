//! The routing step: pins the concrete `(provider endpoint, model)` for
//! the upstream call.
//!
//! Requests on the `/v1/mux` entry are routed by the active workspace's
//! rules; requests on a provider prefix go straight to that provider's
//! endpoint with their model untouched.

use std::sync::Arc;

use crate::errors::GatewayError;
use crate::extract;
use crate::mux::{CompiledRules, ModelRoute, MuxInput};
use crate::pipeline::{Outcome, PipelineContext, PipelineStep};
use crate::providers::EndpointRegistry;
use crate::types::GatewayRequest;

pub struct MuxResolve {
    endpoints: Arc<EndpointRegistry>,
}

impl MuxResolve {
    pub fn new(endpoints: Arc<EndpointRegistry>) -> Self {
        MuxResolve { endpoints }
    }
}

impl PipelineStep for MuxResolve {
    fn name(&self) -> &'static str {
        "mux-resolve"
    }

    fn run(
        &self,
        mut request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError> {
        if !ctx.mux_requested {
            let endpoint = self
                .endpoints
                .get_by_name(ctx.provider.as_str())
                .ok_or_else(|| {
                    GatewayError::Route(format!("unknown provider: {}", ctx.provider.as_str()))
                })?;
            ctx.route = Some(ModelRoute {
                endpoint,
                model: request.model.clone(),
            });
            return Ok(Outcome::Continue(request));
        }

        // Rules were captured with the workspace snapshot at entry.
        let compiled = CompiledRules::compile(&ctx.workspace.mux_rules);
        let filenames = collect_filenames(&request);
        let input = MuxInput {
            kind: request.kind,
            filenames: &filenames,
        };
        let Some(rule) = compiled.first_match(&input) else {
            return Ok(Outcome::Fail(GatewayError::Route(format!(
                "no mux rule matches in workspace {}",
                ctx.workspace.name
            ))));
        };
        let endpoint = self
            .endpoints
            .get_by_id(&rule.provider_endpoint_id)
            .or_else(|| self.endpoints.get_by_name(&rule.provider_endpoint_id))
            .ok_or_else(|| {
                GatewayError::Route(format!(
                    "mux rule references unknown endpoint {}",
                    rule.provider_endpoint_id
                ))
            })?;

        // The model the client sent is irrelevant on the mux entry; the
        // rule decides.
        request.model = rule.model_name.clone();
        tracing::info!(
            endpoint = %endpoint.name,
            model = %request.model,
            "mux routed request"
        );
        ctx.route = Some(ModelRoute {
            endpoint,
            model: rule.model_name.clone(),
        });
        Ok(Outcome::Continue(request))
    }
}

fn collect_filenames(request: &GatewayRequest) -> Vec<String> {
    let mut out = Vec::new();
    for message in &request.messages {
        out.extend(extract::extract_filenames(&message.flat_text()));
    }
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::{MuxMatcherType, MuxRule};
    use crate::pipeline::test_support::{chat_request, context};
    use crate::pipeline::{RequestPipeline, Verdict};
    use crate::providers::{ProviderEndpoint, ProviderKind};

    fn registry_with_ollama() -> (Arc<EndpointRegistry>, String) {
        let registry = Arc::new(EndpointRegistry::new());
        let endpoint =
            ProviderEndpoint::named("ollama", ProviderKind::Ollama, "http://localhost:11434");
        let id = endpoint.id.clone();
        registry.upsert(endpoint);
        (registry, id)
    }

    #[test]
    fn direct_request_routes_to_entry_provider() {
        let (registry, _) = registry_with_ollama();
        let pipeline = RequestPipeline::new(vec![Box::new(MuxResolve::new(registry))]);
        let mut ctx = context(false);

        let Verdict::Forward(out) = pipeline.run(chat_request("hi"), &mut ctx).unwrap() else {
            panic!()
        };
        let route = ctx.route.unwrap();
        assert_eq!(route.endpoint.kind, ProviderKind::Ollama);
        // Model untouched on the direct path.
        assert_eq!(out.model, "test-model");
    }

    #[test]
    fn mux_catch_all_rewrites_model() {
        let (registry, endpoint_id) = registry_with_ollama();
        let pipeline = RequestPipeline::new(vec![Box::new(MuxResolve::new(registry))]);
        let mut ctx = context(true);
        ctx.workspace.mux_rules = vec![MuxRule::new(
            endpoint_id,
            "qwen2.5-coder:1.5b",
            MuxMatcherType::CatchAll,
            "",
        )];

        let Verdict::Forward(out) = pipeline.run(chat_request("hi"), &mut ctx).unwrap() else {
            panic!()
        };
        assert_eq!(out.model, "qwen2.5-coder:1.5b");
        assert_eq!(ctx.route.unwrap().model, "qwen2.5-coder:1.5b");
    }

    #[test]
    fn no_matching_rule_is_a_route_error() {
        let (registry, endpoint_id) = registry_with_ollama();
        let pipeline = RequestPipeline::new(vec![Box::new(MuxResolve::new(registry))]);
        let mut ctx = context(true);
        ctx.workspace.mux_rules = vec![MuxRule::new(
            endpoint_id,
            "m",
            MuxMatcherType::RequestTypeMatch,
            "fim",
        )];

        let err = pipeline.run(chat_request("hi"), &mut ctx).unwrap_err();
        assert!(matches!(err, GatewayError::Route(_)));
    }

    #[test]
    fn filename_rule_sees_code_block_headers() {
        let (registry, endpoint_id) = registry_with_ollama();
        let pipeline = RequestPipeline::new(vec![Box::new(MuxResolve::new(registry))]);
        let mut ctx = context(true);
        ctx.workspace.mux_rules = vec![MuxRule::new(
            endpoint_id,
            "py-model",
            MuxMatcherType::FilenameMatch,
            ".py",
        )];

        let request = chat_request("```python app/main.py\nprint(1)\n```");
        let Verdict::Forward(out) = pipeline.run(request, &mut ctx).unwrap() else {
            panic!()
        };
        assert_eq!(out.model, "py-model");
    }
}
