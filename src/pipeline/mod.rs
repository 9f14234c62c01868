//! The request/response pipeline engine.
//!
//! Request steps run in a fixed order over the common request shape; each
//! returns an `Outcome` and the driver is a plain match. Side effects
//! (alerts, snippet collection, substitution-map writes) go through the
//! `PipelineContext`. Response steps live in [`output`] and run as a pull
//! pipeline over stream chunks.

pub mod mux_resolve;
pub mod output;
pub mod packages;
pub mod pii_step;
pub mod secrets;
pub mod system_prompt;

use std::sync::Arc;
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::extract::{self, CodeSnippet, ExtractedPackage};
use crate::mux::ModelRoute;
use crate::providers::ProviderKind;
use crate::session::Session;
use crate::storage::AlertRecord;
use crate::substitution::SubstitutionStore;
use crate::types::{GatewayRequest, LocalReply};
use crate::workspaces::Workspace;

/// What a request step decided.
pub enum Outcome {
    /// Proceed with the (possibly mutated) request.
    Continue(GatewayRequest),
    /// Skip the upstream entirely and stream this reply back.
    ReplyNow(LocalReply),
    /// Translate to a client-visible error.
    Fail(GatewayError),
}

/// Shared state for one request's trip through the pipeline. The workspace
/// and session are snapshots captured at entry; an activation that lands
/// mid-request does not retarget this request.
pub struct PipelineContext {
    pub prompt_id: String,
    pub provider: ProviderKind,
    pub workspace: Workspace,
    pub session: Session,
    pub store: Arc<SubstitutionStore>,
    /// Request arrived on the `/v1/mux` entry and wants rule routing.
    pub mux_requested: bool,
    pub snippets: Vec<CodeSnippet>,
    pub packages: Vec<ExtractedPackage>,
    pub alerts: Vec<AlertRecord>,
    pub secrets_redacted: usize,
    pub pii_redacted: usize,
    pub route: Option<ModelRoute>,
}

impl PipelineContext {
    pub fn new(
        provider: ProviderKind,
        workspace: Workspace,
        session: Session,
        store: Arc<SubstitutionStore>,
        mux_requested: bool,
    ) -> Self {
        PipelineContext {
            prompt_id: Uuid::new_v4().to_string(),
            provider,
            workspace,
            session,
            store,
            mux_requested,
            snippets: Vec::new(),
            packages: Vec::new(),
            alerts: Vec::new(),
            secrets_redacted: 0,
            pii_redacted: 0,
            route: None,
        }
    }

    pub fn add_alert(
        &mut self,
        trigger_type: &str,
        code_snippet: Option<String>,
        trigger_string: Option<String>,
        trigger_category: Option<String>,
    ) {
        match AlertRecord::new(
            &self.prompt_id,
            trigger_type,
            code_snippet,
            trigger_string,
            trigger_category,
        ) {
            Some(alert) => self.alerts.push(alert),
            None => {
                tracing::warn!("alert without code snippet or trigger string, not created")
            }
        }
    }

    pub fn redaction_count(&self) -> usize {
        self.secrets_redacted + self.pii_redacted
    }
}

pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;

    /// A fatal step aborts the request on failure instead of passing the
    /// unmutated value along. Secret redaction must never fail open.
    fn fatal(&self) -> bool {
        false
    }

    fn run(
        &self,
        request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError>;
}

/// Terminal result of the request pipeline.
#[derive(Debug)]
pub enum Verdict {
    Forward(GatewayRequest),
    Reply(LocalReply),
}

pub struct RequestPipeline {
    steps: Vec<Box<dyn PipelineStep>>,
}

impl RequestPipeline {
    pub fn new(steps: Vec<Box<dyn PipelineStep>>) -> Self {
        RequestPipeline { steps }
    }

    /// Drive every step in order. Step failure is local unless the step is
    /// fatal: the error is logged, an alert is recorded, and the request
    /// continues unmutated.
    pub fn run(
        &self,
        mut request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Verdict, GatewayError> {
        for step in &self.steps {
            let before = request.clone();
            match step.run(request, ctx) {
                Ok(Outcome::Continue(next)) => request = next,
                Ok(Outcome::ReplyNow(reply)) => {
                    tracing::info!(step = step.name(), "pipeline short-circuited");
                    return Ok(Verdict::Reply(reply));
                }
                Ok(Outcome::Fail(err)) => return Err(err),
                Err(err) if step.fatal() => {
                    tracing::error!(step = step.name(), "fatal step failed: {err}");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(step = step.name(), "step failed, continuing: {err}");
                    ctx.add_alert(
                        step.name(),
                        None,
                        Some(format!("step failure: {err}")),
                        Some("info".to_string()),
                    );
                    request = before;
                }
            }
        }
        Ok(Verdict::Forward(request))
    }
}

/// The code-snippet extraction step: walks messages, parses fenced blocks
/// and file tags, collects imports and manifest entries for the package
/// check.
pub struct CodeSnippetExtract;

impl PipelineStep for CodeSnippetExtract {
    fn name(&self) -> &'static str {
        "code-snippet-extract"
    }

    fn run(
        &self,
        request: GatewayRequest,
        ctx: &mut PipelineContext,
    ) -> Result<Outcome, GatewayError> {
        for message in &request.messages {
            let text = message.flat_text();
            for snippet in extract::extract_snippets(&text) {
                if let Some(language) = &snippet.language {
                    ctx.packages
                        .extend(extract::extract_imports(language, &snippet.code));
                }
                if let Some(filepath) = &snippet.filepath {
                    ctx.packages
                        .extend(extract::extract_manifest(filepath, &snippet.code));
                }
                ctx.snippets.push(snippet);
            }
        }
        Ok(Outcome::Continue(request))
    }
}
