//! Extraction of code snippets, import identifiers, and file paths from
//! message content.
//!
//! Fenced code blocks may carry a language tag, a filename, and a line
//! range after the opening backticks; Cline-style `<file_content>` tags and
//! FIM path hints are additional filename sources. Imports are pulled with
//! per-language grammars, manifests with per-format parsers.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CodeSnippet {
    pub code: String,
    pub language: Option<String>,
    pub filepath: Option<String>,
    pub libraries: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Pypi,
    Npm,
    Go,
    Maven,
    Crates,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Pypi => "pypi",
            Ecosystem::Npm => "npm",
            Ecosystem::Go => "go",
            Ecosystem::Maven => "maven",
            Ecosystem::Crates => "crates",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pypi" => Some(Ecosystem::Pypi),
            "npm" => Some(Ecosystem::Npm),
            "go" => Some(Ecosystem::Go),
            "maven" => Some(Ecosystem::Maven),
            "crates" => Some(Ecosystem::Crates),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageLocation {
    CodeImport,
    Manifest,
    FreeText,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedPackage {
    /// `None` for free-text mentions, where the ecosystem is unknown.
    pub ecosystem: Option<Ecosystem>,
    pub name: String,
    pub location: PackageLocation,
}

static CODE_BLOCK_RE: Lazy<Regex> = Lazy::new(|| {
    // ```lang filename (10-20)\n …code… ```
    // Language must be followed by whitespace when a filename is present;
    // a lone token is disambiguated after the match.
    Regex::new(
        r"(?s)```([a-zA-Z0-9_+-]+[ \t]+)?([^\s(`\n]+)?([ \t]+\([0-9]+-[0-9]+\))?[ \t]*\n(.*?)```",
    )
    .expect("code block pattern")
});

static CLINE_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<file_content\s+path="([^"]+)">(.*?)</file_content>"#)
        .expect("cline pattern")
});

static PATH_HINT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\w~./\\-]+\.(?:py|pyi|js|jsx|ts|tsx|go|rs|java|kt|rb|c|h|cpp|hpp|cs|yaml|yml|toml|json|md)\b")
        .expect("path hint pattern")
});

const KNOWN_LANGUAGES: &[&str] = &[
    "python", "py", "javascript", "js", "typescript", "ts", "tsx", "jsx", "go", "golang", "rust",
    "java", "kotlin", "ruby", "c", "cpp", "csharp", "bash", "sh", "shell", "sql", "yaml", "json",
    "toml", "html", "css", "text", "diff",
];

fn language_for_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "py" | "pyi" => Some("python"),
        "js" | "jsx" => Some("javascript"),
        "ts" | "tsx" => Some("typescript"),
        "go" => Some("go"),
        "rs" => Some("rust"),
        "java" => Some("java"),
        "rb" => Some("ruby"),
        "c" | "h" => Some("c"),
        "cpp" | "hpp" | "cc" => Some("cpp"),
        _ => None,
    }
}

/// All code snippets in a message: fenced blocks plus Cline file tags.
pub fn extract_snippets(text: &str) -> Vec<CodeSnippet> {
    let mut snippets = Vec::new();

    for caps in CODE_BLOCK_RE.captures_iter(text) {
        let mut language = caps
            .get(1)
            .map(|m| m.as_str().trim().to_lowercase())
            .filter(|s| !s.is_empty());
        let mut filepath = caps.get(2).map(|m| m.as_str().to_string());

        // A lone token after the backticks is a language, not a filename,
        // when it has no extension and is a name we know.
        if language.is_none() {
            if let Some(token) = &filepath {
                let lowered = token.to_lowercase();
                if !token.contains('.') && KNOWN_LANGUAGES.contains(&lowered.as_str()) {
                    language = Some(lowered);
                    filepath = None;
                }
            }
        }

        if language.is_none() {
            if let Some(path) = &filepath {
                if let Some(ext) = path.rsplit('.').next() {
                    language = language_for_extension(ext).map(|s| s.to_string());
                }
            }
        }

        let code = caps.get(4).map(|m| m.as_str()).unwrap_or("").to_string();
        let libraries = match language.as_deref() {
            Some(lang) => extract_imports(lang, &code)
                .into_iter()
                .map(|p| p.name)
                .collect(),
            None => Vec::new(),
        };

        snippets.push(CodeSnippet {
            code,
            language,
            filepath,
            libraries,
        });
    }

    for caps in CLINE_FILE_RE.captures_iter(text) {
        let filepath = caps.get(1).map(|m| m.as_str().to_string());
        let code = caps.get(2).map(|m| m.as_str()).unwrap_or("").to_string();
        let language = filepath
            .as_deref()
            .and_then(|p| p.rsplit('.').next())
            .and_then(language_for_extension)
            .map(|s| s.to_string());
        let libraries = match language.as_deref() {
            Some(lang) => extract_imports(lang, &code)
                .into_iter()
                .map(|p| p.name)
                .collect(),
            None => Vec::new(),
        };
        snippets.push(CodeSnippet {
            code,
            language,
            filepath,
            libraries,
        });
    }

    snippets
}

/// Unique file paths mentioned by a message: snippet headers, Cline tags,
/// and bare path hints (FIM prompts carry these).
pub fn extract_filenames(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for snippet in extract_snippets(text) {
        if let Some(path) = snippet.filepath {
            if seen.insert(path.clone()) {
                out.push(path);
            }
        }
    }
    for m in PATH_HINT_RE.find_iter(text) {
        let path = m.as_str().to_string();
        if seen.insert(path.clone()) {
            out.push(path);
        }
    }
    out
}

/// Import/require/use identifiers for a language.
pub fn extract_imports(language: &str, code: &str) -> Vec<ExtractedPackage> {
    let (ecosystem, names) = match language {
        "python" | "py" => (Ecosystem::Pypi, python_imports(code)),
        "javascript" | "js" | "typescript" | "ts" | "jsx" | "tsx" => {
            (Ecosystem::Npm, js_imports(code))
        }
        "go" | "golang" => (Ecosystem::Go, go_imports(code)),
        "java" | "kotlin" => (Ecosystem::Maven, java_imports(code)),
        "rust" => (Ecosystem::Crates, rust_imports(code)),
        _ => return Vec::new(),
    };
    names
        .into_iter()
        .map(|name| ExtractedPackage {
            ecosystem: Some(ecosystem),
            name,
            location: PackageLocation::CodeImport,
        })
        .collect()
}

static PYTHON_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][\w.]*)").expect("python import pattern")
});

fn python_imports(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    PYTHON_IMPORT_RE
        .captures_iter(code)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().split('.').next().unwrap_or("").to_string())
        .filter(|name| !name.is_empty() && seen.insert(name.clone()))
        .collect()
}

static JS_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?:import\s+(?:[\w{}\s,*$]+\s+from\s+)?|require\s*\(\s*)["']([^"']+)["']"#,
    )
    .expect("js import pattern")
});

fn js_imports(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    JS_IMPORT_RE
        .captures_iter(code)
        .filter_map(|c| c.get(1))
        .filter_map(|m| npm_package_name(m.as_str()))
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// `@scope/name/deep/path` → `@scope/name`; `name/deep` → `name`.
/// Relative specifiers are not packages.
fn npm_package_name(specifier: &str) -> Option<String> {
    if specifier.starts_with('.') || specifier.starts_with('/') {
        return None;
    }
    let mut parts = specifier.split('/');
    let first = parts.next()?;
    if first.starts_with('@') {
        let second = parts.next()?;
        Some(format!("{first}/{second}"))
    } else {
        Some(first.to_string())
    }
}

static GO_IMPORT_SINGLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^\s*import\s+(?:\w+\s+)?"([^"]+)""#).expect("go import"));
static GO_IMPORT_BLOCK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)import\s*\((.*?)\)").expect("go import block"));
static GO_QUOTED_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("go quoted"));

fn go_imports(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in GO_IMPORT_SINGLE_RE.captures_iter(code) {
        let name = caps[1].to_string();
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    for block in GO_IMPORT_BLOCK_RE.captures_iter(code) {
        for caps in GO_QUOTED_RE.captures_iter(&block[1]) {
            let name = caps[1].to_string();
            if seen.insert(name.clone()) {
                out.push(name);
            }
        }
    }
    out
}

static JAVA_IMPORT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*import\s+(?:static\s+)?([\w.]+)\s*;").expect("java import")
});

fn java_imports(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    JAVA_IMPORT_RE
        .captures_iter(code)
        .filter_map(|c| c.get(1))
        .map(|m| {
            // Keep the group-ish prefix, drop class names: first three
            // dotted segments at most.
            m.as_str()
                .split('.')
                .take(3)
                .collect::<Vec<_>>()
                .join(".")
        })
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

static RUST_USE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:pub\s+)?use\s+([a-zA-Z_][a-zA-Z0-9_]*)").expect("rust use")
});
static RUST_EXTERN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*extern\s+crate\s+([a-zA-Z_][a-zA-Z0-9_]*)").expect("rust extern"));

fn rust_imports(code: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for caps in RUST_USE_RE.captures_iter(code).chain(RUST_EXTERN_RE.captures_iter(code)) {
        let name = caps[1].to_string();
        if matches!(name.as_str(), "std" | "core" | "alloc" | "crate" | "self" | "super") {
            continue;
        }
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

/// Package-manifest entries, selected by filename.
pub fn extract_manifest(filename: &str, content: &str) -> Vec<ExtractedPackage> {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (ecosystem, names) = match base {
        "requirements.txt" => (Ecosystem::Pypi, requirements_entries(content)),
        "pyproject.toml" => (Ecosystem::Pypi, pyproject_entries(content)),
        "package.json" => (Ecosystem::Npm, package_json_entries(content)),
        "go.mod" => (Ecosystem::Go, go_mod_entries(content)),
        "Cargo.toml" => (Ecosystem::Crates, cargo_toml_entries(content)),
        _ => return Vec::new(),
    };
    names
        .into_iter()
        .map(|name| ExtractedPackage {
            ecosystem: Some(ecosystem),
            name,
            location: PackageLocation::Manifest,
        })
        .collect()
}

fn requirements_entries(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with('-'))
        .filter_map(|l| {
            let name: String = l
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
                .collect();
            (!name.is_empty()).then(|| name.to_lowercase())
        })
        .collect()
}

static PYPROJECT_DEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""([A-Za-z0-9_.-]+)\s*[><=~!\[]"#).expect("pyproject dep"));

fn pyproject_entries(content: &str) -> Vec<String> {
    PYPROJECT_DEP_RE
        .captures_iter(content)
        .map(|c| c[1].to_lowercase())
        .collect()
}

fn package_json_entries(content: &str) -> Vec<String> {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(content) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for key in ["dependencies", "devDependencies", "peerDependencies"] {
        if let Some(deps) = json.get(key).and_then(|v| v.as_object()) {
            out.extend(deps.keys().cloned());
        }
    }
    out
}

static GO_MOD_REQUIRE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*(?:require\s+)?([\w.-]+(?:/[\w.-]+)+)\s+v[\w.-]+").expect("go.mod require")
});

fn go_mod_entries(content: &str) -> Vec<String> {
    GO_MOD_REQUIRE_RE
        .captures_iter(content)
        .map(|c| c[1].to_string())
        .collect()
}

static CARGO_DEP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?m)^([a-zA-Z0-9_-]+)\s*=\s*(?:\{|")"#).expect("cargo dep"));

fn cargo_toml_entries(content: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut in_deps = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('[') {
            in_deps = trimmed.contains("dependencies");
            continue;
        }
        if in_deps {
            if let Some(caps) = CARGO_DEP_RE.captures(trimmed) {
                out.push(caps[1].to_string());
            }
        }
    }
    out
}

/// Remove fenced blocks and file tags, leaving only prose. The free-text
/// package scan runs over this so an `import` inside code is not mistaken
/// for the user asking about a package.
pub fn strip_code_blocks(text: &str) -> String {
    let without_fences = CODE_BLOCK_RE.replace_all(text, " ");
    CLINE_FILE_RE.replace_all(&without_fences, " ").into_owned()
}

const FREE_TEXT_STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "can", "you", "use", "using", "with", "this", "that", "what",
    "how", "why", "not", "but", "its", "has", "have", "will", "from", "import", "install",
    "package", "library", "module", "safe", "please", "help", "code", "file", "does", "should",
    "would", "could", "there", "here", "about", "want", "need",
];

static FREE_TEXT_TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z][A-Za-z0-9_.-]{2,}").expect("token pattern"));

/// Candidate package names mentioned in prose. The vector index decides
/// which of these are real packages; this only filters obvious non-names.
pub fn free_text_candidates(text: &str) -> Vec<ExtractedPackage> {
    let mut seen = HashSet::new();
    FREE_TEXT_TOKEN_RE
        .find_iter(text)
        .map(|m| m.as_str().trim_matches('.').to_lowercase())
        .filter(|t| t.len() >= 3 && !FREE_TEXT_STOPWORDS.contains(&t.as_str()))
        .filter(|t| seen.insert(t.clone()))
        .map(|name| ExtractedPackage {
            ecosystem: None,
            name,
            location: PackageLocation::FreeText,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_block_with_language() {
        let text = "look:\n```python\nimport requests\nprint(1)\n```\ndone";
        let snippets = extract_snippets(text);
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].language.as_deref(), Some("python"));
        assert_eq!(snippets[0].libraries, vec!["requests"]);
    }

    #[test]
    fn fenced_block_with_language_and_filename() {
        let text = "```python app/main.py (1-20)\nimport flask\n```";
        let snippets = extract_snippets(text);
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].language.as_deref(), Some("python"));
        assert_eq!(snippets[0].filepath.as_deref(), Some("app/main.py"));
    }

    #[test]
    fn filename_only_block_infers_language() {
        let text = "```src/index.ts\nimport express from 'express'\n```";
        let snippets = extract_snippets(text);
        assert_eq!(snippets[0].language.as_deref(), Some("typescript"));
        assert_eq!(snippets[0].filepath.as_deref(), Some("src/index.ts"));
        assert_eq!(snippets[0].libraries, vec!["express"]);
    }

    #[test]
    fn cline_file_content_extracted() {
        let text = r#"<file_content path="src/app.py">import numpy as np</file_content>"#;
        let snippets = extract_snippets(text);
        assert_eq!(snippets.len(), 1);
        assert_eq!(snippets[0].filepath.as_deref(), Some("src/app.py"));
        assert_eq!(snippets[0].libraries, vec!["numpy"]);
    }

    #[test]
    fn filenames_deduplicated() {
        let text = "edit src/main.rs and also ```rust src/main.rs\nfn main() {}\n```";
        let filenames = extract_filenames(text);
        assert_eq!(filenames, vec!["src/main.rs"]);
    }

    #[test]
    fn python_from_import_takes_top_module() {
        let imports = extract_imports("python", "from requests.adapters import HTTPAdapter");
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].name, "requests");
        assert_eq!(imports[0].ecosystem, Some(Ecosystem::Pypi));
    }

    #[test]
    fn js_scoped_package_kept_whole() {
        let code = "import { z } from '@angular/core/testing';\nconst lib = require('lodash/fp');";
        let imports = extract_imports("javascript", code);
        let names: Vec<_> = imports.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["@angular/core", "lodash"]);
    }

    #[test]
    fn js_relative_imports_ignored() {
        let imports = extract_imports("javascript", "import x from './local'");
        assert!(imports.is_empty());
    }

    #[test]
    fn go_import_block() {
        let code = "import (\n\t\"fmt\"\n\t\"github.com/gin-gonic/gin\"\n)";
        let imports = extract_imports("go", code);
        let names: Vec<_> = imports.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"github.com/gin-gonic/gin"));
    }

    #[test]
    fn rust_use_skips_std() {
        let code = "use std::collections::HashMap;\nuse tokio::sync::Mutex;";
        let imports = extract_imports("rust", code);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].name, "tokio");
    }

    #[test]
    fn requirements_txt_parsed() {
        let content = "requests==2.31.0\n# comment\nflask>=2\n-r other.txt\n";
        let packages = extract_manifest("requirements.txt", content);
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["requests", "flask"]);
        assert!(packages.iter().all(|p| p.location == PackageLocation::Manifest));
    }

    #[test]
    fn package_json_parsed() {
        let content = r#"{"dependencies": {"left-pad": "^1.0.0"}, "devDependencies": {"jest": "*"}}"#;
        let packages = extract_manifest("package.json", content);
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"left-pad"));
        assert!(names.contains(&"jest"));
    }

    #[test]
    fn go_mod_parsed() {
        let content = "module example.com/app\n\nrequire (\n\tgithub.com/pkg/errors v0.9.1\n)\n";
        let packages = extract_manifest("go.mod", content);
        assert_eq!(packages[0].name, "github.com/pkg/errors");
    }

    #[test]
    fn cargo_toml_parsed() {
        let content = "[package]\nname = \"x\"\n\n[dependencies]\nserde = \"1\"\ntokio = { version = \"1\" }\n";
        let packages = extract_manifest("Cargo.toml", content);
        let names: Vec<_> = packages.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["serde", "tokio"]);
    }

    #[test]
    fn strip_code_blocks_leaves_prose() {
        let text = "review this\n```python\nimport invokehttp\n```\nthanks";
        let stripped = strip_code_blocks(text);
        assert!(stripped.contains("review this"));
        assert!(stripped.contains("thanks"));
        assert!(!stripped.contains("invokehttp"));
    }

    #[test]
    fn free_text_candidates_filter_stopwords() {
        let candidates = free_text_candidates("Is it safe to use invokehttp?");
        let names: Vec<_> = candidates.iter().map(|p| p.name.as_str()).collect();
        assert!(names.contains(&"invokehttp"));
        assert!(!names.contains(&"safe"));
        assert!(!names.contains(&"use"));
    }
}
