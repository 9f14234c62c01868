//! Workspace muxing: rule matchers and the first-match router.

use globset::{GlobBuilder, GlobMatcher};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::providers::ProviderEndpoint;
use crate::types::RequestKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MuxMatcherType {
    CatchAll,
    FilenameMatch,
    RequestTypeMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuxRule {
    pub id: String,
    pub provider_endpoint_id: String,
    pub model_name: String,
    pub matcher_type: MuxMatcherType,
    /// Matcher payload: a glob for `filename_match`, a request kind for
    /// `request_type_match`, ignored for `catch_all`.
    #[serde(default)]
    pub matcher: String,
}

impl MuxRule {
    pub fn new(
        provider_endpoint_id: impl Into<String>,
        model_name: impl Into<String>,
        matcher_type: MuxMatcherType,
        matcher: impl Into<String>,
    ) -> Self {
        MuxRule {
            id: Uuid::new_v4().to_string(),
            provider_endpoint_id: provider_endpoint_id.into(),
            model_name: model_name.into(),
            matcher_type,
            matcher: matcher.into(),
        }
    }
}

/// What the router needs to know about a request: its kind and the file
/// paths heuristically extracted from it.
pub struct MuxInput<'a> {
    pub kind: RequestKind,
    pub filenames: &'a [String],
}

/// The destination a matched rule resolves to.
#[derive(Debug, Clone)]
pub struct ModelRoute {
    pub endpoint: ProviderEndpoint,
    pub model: String,
}

enum CompiledMatcher {
    CatchAll,
    Filename(GlobMatcher),
    RequestType(String),
}

struct CompiledRule {
    matcher: CompiledMatcher,
    rule: MuxRule,
}

/// A workspace's rules, compiled once when the rule list is set. Evaluation
/// walks top to bottom and returns the first hit; no lock is held, callers
/// evaluate against the snapshot they captured at request entry.
pub struct CompiledRules {
    rules: Vec<CompiledRule>,
}

impl CompiledRules {
    pub fn compile(rules: &[MuxRule]) -> Self {
        let compiled = rules
            .iter()
            .filter_map(|rule| {
                let matcher = match rule.matcher_type {
                    MuxMatcherType::CatchAll => CompiledMatcher::CatchAll,
                    MuxMatcherType::FilenameMatch => {
                        let glob = normalize_glob(&rule.matcher);
                        match GlobBuilder::new(&glob).literal_separator(false).build() {
                            Ok(g) => CompiledMatcher::Filename(g.compile_matcher()),
                            Err(e) => {
                                tracing::warn!(rule = %rule.id, "invalid filename glob: {e}");
                                return None;
                            }
                        }
                    }
                    MuxMatcherType::RequestTypeMatch => {
                        CompiledMatcher::RequestType(rule.matcher.trim().to_lowercase())
                    }
                };
                Some(CompiledRule {
                    matcher,
                    rule: rule.clone(),
                })
            })
            .collect();
        CompiledRules { rules: compiled }
    }

    /// First match wins. `None` means no rule matched ("no mux rule
    /// matches" → 400 at the edge).
    pub fn first_match(&self, input: &MuxInput<'_>) -> Option<&MuxRule> {
        for compiled in &self.rules {
            let hit = match &compiled.matcher {
                CompiledMatcher::CatchAll => true,
                CompiledMatcher::Filename(glob) => {
                    if compiled.rule.matcher.is_empty() {
                        false
                    } else {
                        input.filenames.iter().any(|f| glob.is_match(f))
                    }
                }
                CompiledMatcher::RequestType(kind) => {
                    !kind.is_empty() && kind == input.kind.as_str()
                }
            };
            if hit {
                tracing::debug!(
                    rule = %compiled.rule.id,
                    matcher = ?compiled.rule.matcher_type,
                    "mux rule matched"
                );
                return Some(&compiled.rule);
            }
        }
        None
    }
}

/// The rule blobs users write are extensions (`.py`) or bare filenames
/// (`main.py`) as often as real globs; anything without glob metacharacters
/// is widened to a substring-style glob.
fn normalize_glob(blob: &str) -> String {
    let blob = blob.trim();
    if blob.chars().any(|c| matches!(c, '*' | '?' | '[' | '{')) {
        blob.to_string()
    } else {
        format!("*{blob}*")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn rules() -> Vec<MuxRule> {
        vec![
            MuxRule::new("ep-fim", "fim-model", MuxMatcherType::RequestTypeMatch, "fim"),
            MuxRule::new("ep-py", "py-model", MuxMatcherType::FilenameMatch, ".py"),
            MuxRule::new("ep-any", "any-model", MuxMatcherType::CatchAll, ""),
        ]
    }

    #[test]
    fn first_match_wins_in_order() {
        let compiled = CompiledRules::compile(&rules());
        let filenames = vec!["src/app.py".to_string()];

        // A FIM request matches rule 0 even though rule 1 would also match.
        let hit = compiled
            .first_match(&MuxInput {
                kind: RequestKind::Fim,
                filenames: &filenames,
            })
            .unwrap();
        assert_eq!(hit.model_name, "fim-model");

        // A chat request with a .py file falls through to rule 1.
        let hit = compiled
            .first_match(&MuxInput {
                kind: RequestKind::Chat,
                filenames: &filenames,
            })
            .unwrap();
        assert_eq!(hit.model_name, "py-model");
    }

    #[test]
    fn catch_all_is_the_terminal_rule() {
        let compiled = CompiledRules::compile(&rules());
        let hit = compiled
            .first_match(&MuxInput {
                kind: RequestKind::Chat,
                filenames: &[],
            })
            .unwrap();
        assert_eq!(hit.model_name, "any-model");
    }

    #[test]
    fn no_rules_means_no_route() {
        let compiled = CompiledRules::compile(&[]);
        assert!(compiled
            .first_match(&MuxInput {
                kind: RequestKind::Chat,
                filenames: &[],
            })
            .is_none());
    }

    #[test]
    fn empty_filename_blob_never_matches() {
        let rules = vec![MuxRule::new(
            "ep",
            "m",
            MuxMatcherType::FilenameMatch,
            "",
        )];
        let compiled = CompiledRules::compile(&rules);
        let filenames = vec!["anything.txt".to_string()];
        assert!(compiled
            .first_match(&MuxInput {
                kind: RequestKind::Chat,
                filenames: &filenames,
            })
            .is_none());
    }

    #[test]
    fn real_globs_pass_through() {
        let rules = vec![MuxRule::new(
            "ep",
            "m",
            MuxMatcherType::FilenameMatch,
            "src/**/*.rs",
        )];
        let compiled = CompiledRules::compile(&rules);
        let matching = vec!["src/deep/nested/mod.rs".to_string()];
        assert!(compiled
            .first_match(&MuxInput {
                kind: RequestKind::Chat,
                filenames: &matching,
            })
            .is_some());
    }

    #[test]
    fn endpoint_kind_roundtrip() {
        // ModelRoute is constructed by the resolve step; sanity-check the
        // endpoint shape here.
        let route = ModelRoute {
            endpoint: ProviderEndpoint::named("local-ollama", ProviderKind::Ollama, "http://localhost:11434"),
            model: "qwen2.5-coder:1.5b".into(),
        };
        assert_eq!(route.endpoint.kind, ProviderKind::Ollama);
    }
}
