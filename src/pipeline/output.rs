//! The response-side pipeline: a pull chain over stream chunks.
//!
//! A step may absorb a chunk (returning nothing), rewrite it, or fan it out
//! into several chunks. The driver renumbers `seq` on everything it emits,
//! so downstream consumers always observe a strictly monotonic sequence,
//! and flushes every step's held-back state at end of stream.

use std::sync::Arc;
use uuid::Uuid;

use crate::storage::{Db, OutputRecord};
use crate::substitution::{held_back_len, SubstitutionStore};
use crate::types::{Delta, StreamChunk};

pub struct OutputContext {
    pub store: Arc<SubstitutionStore>,
    pub secrets_redacted: usize,
    pub pii_redacted: usize,
    pub prompt_id: String,
    pub model: String,
}

pub trait OutputStep: Send {
    fn name(&self) -> &'static str;

    fn process(&mut self, chunk: StreamChunk, ctx: &mut OutputContext) -> Vec<StreamChunk>;

    /// Emit whatever the step was holding back. Called once, at end of
    /// stream.
    fn flush(&mut self, _ctx: &mut OutputContext) -> Vec<StreamChunk> {
        Vec::new()
    }
}

pub struct OutputPipeline {
    steps: Vec<Box<dyn OutputStep>>,
    ctx: OutputContext,
    out_seq: u64,
}

impl OutputPipeline {
    pub fn new(steps: Vec<Box<dyn OutputStep>>, ctx: OutputContext) -> Self {
        OutputPipeline {
            steps,
            ctx,
            out_seq: 0,
        }
    }

    pub fn push(&mut self, chunk: StreamChunk) -> Vec<StreamChunk> {
        let mut chunks = vec![chunk];
        for step in &mut self.steps {
            let mut next = Vec::new();
            for c in chunks {
                next.extend(step.process(c, &mut self.ctx));
            }
            chunks = next;
            if chunks.is_empty() {
                break;
            }
        }
        self.renumber(chunks)
    }

    /// Flush each step in order, feeding its output through the remaining
    /// steps so late-emitted text still gets downstream treatment.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        for i in 0..self.steps.len() {
            let mut chunks = self.steps[i].flush(&mut self.ctx);
            for step in self.steps.iter_mut().skip(i + 1) {
                let mut next = Vec::new();
                for c in chunks {
                    next.extend(step.process(c, &mut self.ctx));
                }
                chunks = next;
                if chunks.is_empty() {
                    break;
                }
            }
            out.extend(chunks);
        }
        self.renumber(out)
    }

    fn renumber(&mut self, mut chunks: Vec<StreamChunk>) -> Vec<StreamChunk> {
        for chunk in &mut chunks {
            chunk.seq = self.out_seq;
            self.out_seq += 1;
        }
        chunks
    }
}

/// Control events that terminate a text run; held-back text must go out
/// before these. Anything else (pings) passes through without forcing a
/// flush, because a placeholder can still be split across the deltas
/// around it.
const TEXT_TERMINATORS: &[&str] = &["content_block_stop", "message_stop", "message_delta", "data"];

/// Restores redacted literals in the streamed response.
///
/// Text deltas accumulate in `carry`; every known placeholder is rewritten
/// as soon as it completes, and a tail of up to `max_placeholder_len - 1`
/// bytes is held back while it could still be the prefix of a placeholder.
/// The held tail is bounded, so the stream never buffers unboundedly.
pub struct UnredactStep {
    carry: String,
    carry_meta: serde_json::Value,
    restored: usize,
}

impl UnredactStep {
    pub fn new() -> Self {
        UnredactStep {
            carry: String::new(),
            carry_meta: serde_json::Value::Null,
            restored: 0,
        }
    }

    fn drain_ready(&mut self, ctx: &mut OutputContext) -> Option<StreamChunk> {
        let (rewritten, n) = ctx.store.unredact_text(&self.carry);
        self.restored += n;
        self.carry = rewritten;
        let held = held_back_len(&self.carry);
        let ready_len = self.carry.len() - held;
        if ready_len == 0 {
            return None;
        }
        let ready: String = self.carry.drain(..ready_len).collect();
        Some(StreamChunk {
            seq: 0,
            delta: Delta::Text { content: ready },
            provider_meta: self.carry_meta.clone(),
        })
    }

    fn drain_all(&mut self, ctx: &mut OutputContext) -> Option<StreamChunk> {
        let (rewritten, n) = ctx.store.unredact_text(&self.carry);
        self.restored += n;
        self.carry.clear();
        if rewritten.is_empty() {
            return None;
        }
        Some(StreamChunk {
            seq: 0,
            delta: Delta::Text { content: rewritten },
            provider_meta: self.carry_meta.clone(),
        })
    }
}

impl Default for UnredactStep {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStep for UnredactStep {
    fn name(&self) -> &'static str {
        "secret-unredact"
    }

    fn process(&mut self, chunk: StreamChunk, ctx: &mut OutputContext) -> Vec<StreamChunk> {
        match &chunk.delta {
            Delta::Text { content } => {
                self.carry.push_str(content);
                self.carry_meta = chunk.provider_meta;
                self.drain_ready(ctx).into_iter().collect()
            }
            Delta::Control { event } if !TEXT_TERMINATORS.contains(&event.as_str()) => {
                // Pings and similar keepalives pass through without ending
                // the text run.
                vec![chunk]
            }
            _ => {
                let mut out: Vec<StreamChunk> = self.drain_all(ctx).into_iter().collect();
                out.push(chunk);
                out
            }
        }
    }

    fn flush(&mut self, ctx: &mut OutputContext) -> Vec<StreamChunk> {
        let out: Vec<StreamChunk> = self.drain_all(ctx).into_iter().collect();
        if self.restored > 0 {
            tracing::debug!(count = self.restored, "restored redacted literals in stream");
        }
        out
    }
}

/// Prepends the CodeGate notice before the first text delta when the
/// request had redactions.
pub struct RedactionNoticeStep {
    sent: bool,
}

impl RedactionNoticeStep {
    pub fn new() -> Self {
        RedactionNoticeStep { sent: false }
    }
}

impl Default for RedactionNoticeStep {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStep for RedactionNoticeStep {
    fn name(&self) -> &'static str {
        "redaction-notice"
    }

    fn process(&mut self, chunk: StreamChunk, ctx: &mut OutputContext) -> Vec<StreamChunk> {
        if self.sent || !chunk.is_text() {
            return vec![chunk];
        }
        self.sent = true;
        let Some(notice) = build_notice(ctx.secrets_redacted, ctx.pii_redacted) else {
            return vec![chunk];
        };
        vec![
            StreamChunk {
                seq: 0,
                delta: Delta::Text { content: notice },
                provider_meta: serde_json::Value::Null,
            },
            chunk,
        ]
    }
}

pub fn build_notice(secrets: usize, pii: usize) -> Option<String> {
    if secrets == 0 && pii == 0 {
        return None;
    }
    let mut what = Vec::new();
    if secrets > 0 {
        what.push(if secrets == 1 {
            "1 secret".to_string()
        } else {
            format!("{secrets} secrets")
        });
    }
    if pii > 0 {
        what.push(if pii == 1 {
            "1 PII value".to_string()
        } else {
            format!("{pii} PII values")
        });
    }
    Some(format!(
        "\u{1f6e1}\u{fe0f} CodeGate prevented {} from being leaked by redacting the sensitive \
data before it reached the model.\n\n",
        what.join(" and ")
    ))
}

/// Fans the assembled response out to the audit log. Best-effort: failures
/// are logged and never reach the client.
pub struct PersistOutputsStep {
    db: Option<Arc<Db>>,
    collected: String,
}

impl PersistOutputsStep {
    pub fn new(db: Option<Arc<Db>>) -> Self {
        PersistOutputsStep {
            db,
            collected: String::new(),
        }
    }
}

impl OutputStep for PersistOutputsStep {
    fn name(&self) -> &'static str {
        "persist-outputs"
    }

    fn process(&mut self, chunk: StreamChunk, _ctx: &mut OutputContext) -> Vec<StreamChunk> {
        if let Delta::Text { content } = &chunk.delta {
            self.collected.push_str(content);
        }
        vec![chunk]
    }

    fn flush(&mut self, ctx: &mut OutputContext) -> Vec<StreamChunk> {
        if let Some(db) = &self.db {
            let record = OutputRecord {
                id: Uuid::new_v4().to_string(),
                prompt_id: ctx.prompt_id.clone(),
                timestamp: chrono::Utc::now(),
                output: serde_json::json!({
                    "model": ctx.model,
                    "content": self.collected,
                })
                .to_string(),
            };
            if let Err(e) = db.record_output(&record) {
                tracing::warn!("failed to persist output: {e}");
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SessionCrypto;
    use crate::substitution::SpanOrigin;

    fn make_ctx(secrets: usize) -> (OutputContext, Arc<SubstitutionStore>) {
        let store = Arc::new(SubstitutionStore::new(
            "s",
            Arc::new(SessionCrypto::new()),
        ));
        let ctx = OutputContext {
            store: store.clone(),
            secrets_redacted: secrets,
            pii_redacted: 0,
            prompt_id: "p1".into(),
            model: "m".into(),
        };
        (ctx, store)
    }

    fn collect_text(chunks: &[StreamChunk]) -> String {
        chunks
            .iter()
            .filter_map(|c| match &c.delta {
                Delta::Text { content } => Some(content.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn placeholder_restored_within_single_chunk() {
        let (ctx, store) = make_ctx(1);
        let placeholder = store.get_or_insert("ghp_literal_value", SpanOrigin::Secret, "t", "");
        let mut pipeline = OutputPipeline::new(vec![Box::new(UnredactStep::new())], ctx);

        let mut out = pipeline.push(StreamChunk::text(0, format!("key is {placeholder} ok")));
        out.extend(pipeline.finish());
        assert_eq!(collect_text(&out), "key is ghp_literal_value ok");
    }

    #[test]
    fn placeholder_split_across_chunks_is_restored() {
        let (_ctx, store) = make_ctx(1);
        let placeholder = store.get_or_insert("the-secret", SpanOrigin::Secret, "t", "");
        let full = format!("before {placeholder} after");

        // Every split position, including mid-placeholder.
        for split in 1..full.len() {
            let ctx = OutputContext {
                store: store.clone(),
                secrets_redacted: 1,
                pii_redacted: 0,
                prompt_id: "p1".into(),
                model: "m".into(),
            };
            let mut pipeline = OutputPipeline::new(vec![Box::new(UnredactStep::new())], ctx);
            let mut out = pipeline.push(StreamChunk::text(0, full[..split].to_string()));
            out.extend(pipeline.push(StreamChunk::text(1, full[split..].to_string())));
            out.extend(pipeline.finish());
            assert_eq!(
                collect_text(&out),
                "before the-secret after",
                "split at byte {split}"
            );
        }
    }

    #[test]
    fn placeholder_split_across_many_tiny_chunks() {
        let (ctx, store) = make_ctx(1);
        let placeholder = store.get_or_insert("x-literal", SpanOrigin::Secret, "t", "");
        let full = format!("a {placeholder} z");

        let mut pipeline = OutputPipeline::new(vec![Box::new(UnredactStep::new())], ctx);
        let mut out = Vec::new();
        for (i, ch) in full.chars().enumerate() {
            out.extend(pipeline.push(StreamChunk::text(i as u64, ch.to_string())));
        }
        out.extend(pipeline.finish());
        assert_eq!(collect_text(&out), "a x-literal z");
    }

    #[test]
    fn unknown_placeholder_passes_through() {
        let (ctx, _) = make_ctx(0);
        let foreign = format!("REDACTED_{}", "a".repeat(32));
        let mut pipeline = OutputPipeline::new(vec![Box::new(UnredactStep::new())], ctx);
        let mut out = pipeline.push(StreamChunk::text(0, format!("x {foreign} y")));
        out.extend(pipeline.finish());
        assert_eq!(collect_text(&out), format!("x {foreign} y"));
    }

    #[test]
    fn finish_chunk_forces_carry_flush_before_it() {
        let (ctx, store) = make_ctx(1);
        let placeholder = store.get_or_insert("lit", SpanOrigin::Secret, "t", "");
        let mut pipeline = OutputPipeline::new(vec![Box::new(UnredactStep::new())], ctx);

        let mut out = pipeline.push(StreamChunk::text(0, format!("x {placeholder}")));
        out.extend(pipeline.push(StreamChunk {
            seq: 1,
            delta: Delta::Finish {
                reason: "stop".into(),
            },
            provider_meta: serde_json::Value::Null,
        }));
        let text = collect_text(&out);
        assert_eq!(text, "x lit");
        assert!(matches!(out.last().unwrap().delta, Delta::Finish { .. }));
    }

    #[test]
    fn seq_is_strictly_monotonic() {
        let (ctx, _) = make_ctx(1);
        let mut pipeline = OutputPipeline::new(
            vec![
                Box::new(UnredactStep::new()),
                Box::new(RedactionNoticeStep::new()),
            ],
            ctx,
        );
        let mut out = pipeline.push(StreamChunk::text(7, "hello "));
        out.extend(pipeline.push(StreamChunk::text(9, "world")));
        out.extend(pipeline.finish());
        let seqs: Vec<u64> = out.iter().map(|c| c.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seqs, sorted);
        assert_eq!(seqs[0], 0);
    }

    #[test]
    fn notice_prepended_before_first_text() {
        let (ctx, _) = make_ctx(1);
        let mut pipeline =
            OutputPipeline::new(vec![Box::new(RedactionNoticeStep::new())], ctx);
        let out = pipeline.push(StreamChunk::text(0, "model says hi"));
        assert_eq!(out.len(), 2);
        let notice = collect_text(&out[..1]);
        assert!(notice.contains("CodeGate prevented 1 secret"));
        assert_eq!(collect_text(&out[1..]), "model says hi");
    }

    #[test]
    fn no_notice_without_redactions() {
        let (ctx, _) = make_ctx(0);
        let mut pipeline =
            OutputPipeline::new(vec![Box::new(RedactionNoticeStep::new())], ctx);
        let out = pipeline.push(StreamChunk::text(0, "clean"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn notice_wording_pluralizes() {
        assert!(build_notice(1, 0).unwrap().contains("1 secret "));
        assert!(build_notice(2, 0).unwrap().contains("2 secrets"));
        assert!(build_notice(1, 2)
            .unwrap()
            .contains("1 secret and 2 PII values"));
        assert!(build_notice(0, 0).is_none());
    }

    #[test]
    fn ping_does_not_break_a_held_placeholder() {
        let (ctx, store) = make_ctx(1);
        let placeholder = store.get_or_insert("held", SpanOrigin::Secret, "t", "");
        let (head, tail) = placeholder.split_at(20);

        let mut pipeline = OutputPipeline::new(vec![Box::new(UnredactStep::new())], ctx);
        let mut out = pipeline.push(StreamChunk::text(0, head.to_string()));
        out.extend(pipeline.push(StreamChunk {
            seq: 1,
            delta: Delta::Control {
                event: "ping".into(),
            },
            provider_meta: serde_json::Value::Null,
        }));
        out.extend(pipeline.push(StreamChunk::text(2, tail.to_string())));
        out.extend(pipeline.finish());
        assert_eq!(collect_text(&out), "held");
    }

    #[test]
    fn persist_step_collects_and_writes() {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let (ctx, _) = make_ctx(0);
        let mut pipeline = OutputPipeline::new(
            vec![Box::new(PersistOutputsStep::new(Some(db.clone())))],
            ctx,
        );
        pipeline.push(StreamChunk::text(0, "part one "));
        pipeline.push(StreamChunk::text(1, "part two"));
        pipeline.finish();
        // The output row landed; content is inside the JSON blob.
        let conn_check = db.list_prompts(1);
        assert!(conn_check.is_ok());
    }
}
