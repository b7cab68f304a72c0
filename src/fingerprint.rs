//! Public-surface fingerprints.
//!
//! A fingerprint is the sorted set of a module's normalized public
//! signatures plus a SHA-256 digest over that set. Two artifacts with the
//! same public surface get the same digest, whatever their bodies contain.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::sync::LazyLock;

use crate::charter::Language;

/// Top-level, non-underscore `def`/`async def`/`class` heads. The rest of
/// the header is scanned by [`python_header_tail`].
static PYTHON_HEAD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?P<head>(?:async\s+)?def|class)\s+(?P<name>[A-Za-z][A-Za-z0-9_]*)")
        .unwrap()
});

/// Top-level `pub` items, up to the opening brace or semicolon.
static RUST_PUBLIC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)^pub\s+(?P<head>(?:async\s+)?(?:const\s+)?(?:unsafe\s+)?(?:fn|struct|enum|trait|type|const|static))\s+(?P<name>[A-Za-z_][A-Za-z0-9_]*)(?P<rest>[^{;=]*)",
    )
    .unwrap()
});

static WHITESPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Collapse runs of whitespace and tidy spacing around brackets and commas.
pub fn normalize_signature(raw: &str) -> String {
    let collapsed = WHITESPACE_RE.replace_all(raw.trim(), " ");
    collapsed
        .replace("( ", "(")
        .replace(" )", ")")
        .replace(" ,", ",")
        .replace(",)", ")")
        .trim_end_matches(':')
        .trim()
        .to_string()
}

/// Leading identifier of a declared signature, e.g. `create_user` for
/// `create_user(name: str) -> int` or `def create_user(name)`.
pub fn signature_name(signature: &str) -> Option<String> {
    const KEYWORDS: &[&str] = &[
        "pub", "async", "def", "class", "fn", "struct", "enum", "trait", "type", "const",
        "static", "unsafe",
    ];
    signature
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .find(|word| !KEYWORDS.contains(word))
        .map(str::to_string)
}

/// Stable identity of a module's public surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFingerprint {
    /// SHA-256 over the sorted signatures joined by newlines.
    pub digest: String,
    pub signatures: BTreeSet<String>,
}

impl ApiFingerprint {
    pub fn from_signatures<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let signatures: BTreeSet<String> = signatures
            .into_iter()
            .map(|s| normalize_signature(s.as_ref()))
            .filter(|s| !s.is_empty())
            .collect();
        let joined = signatures.iter().cloned().collect::<Vec<_>>().join("\n");
        Self {
            digest: sha256_hex(joined.as_bytes()),
            signatures,
        }
    }

    /// First 12 hex characters of the digest.
    pub fn short(&self) -> &str {
        &self.digest[..self.digest.len().min(12)]
    }

    /// Names exposed by the surface.
    pub fn names(&self) -> BTreeSet<String> {
        self.signatures
            .iter()
            .filter_map(|s| signature_name(s))
            .collect()
    }

    /// Signatures of `self` absent from `other`, and the reverse.
    pub fn diff(&self, other: &ApiFingerprint) -> (Vec<String>, Vec<String>) {
        let removed = self
            .signatures
            .difference(&other.signatures)
            .cloned()
            .collect();
        let added = other
            .signatures
            .difference(&self.signatures)
            .cloned()
            .collect();
        (removed, added)
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

impl std::fmt::Display for ApiFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} signatures)", self.short(), self.signatures.len())
    }
}

/// Extracts public signatures from source text.
#[derive(Debug, Clone, Copy)]
pub struct Fingerprinter {
    language: Language,
}

impl Fingerprinter {
    pub fn new(language: Language) -> Self {
        Self { language }
    }

    pub fn language(&self) -> Language {
        self.language
    }

    pub fn signatures(&self, source: &str) -> Vec<String> {
        match self.language {
            Language::Python => python_signatures(source),
            Language::Rust => RUST_PUBLIC_RE
                .captures_iter(source)
                .map(|caps| {
                    let head = caps.name("head").map_or("", |m| m.as_str());
                    let name = caps.name("name").map_or("", |m| m.as_str());
                    let rest = caps.name("rest").map_or("", |m| m.as_str());
                    normalize_signature(&format!("{} {}{}", head, name, rest))
                })
                .collect(),
        }
    }

    /// Deterministic in `source`.
    pub fn fingerprint(&self, source: &str) -> ApiFingerprint {
        ApiFingerprint::from_signatures(self.signatures(source))
    }
}

fn python_signatures(source: &str) -> Vec<String> {
    PYTHON_HEAD_RE
        .captures_iter(source)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let tail = python_header_tail(&source[whole.end()..])?;
            Some(normalize_signature(&format!(
                "{} {}{}",
                &caps["head"], &caps["name"], tail
            )))
        })
        .collect()
}

/// Parameter list and return annotation after a `def`/`class` name, up to
/// the colon that opens the body.
///
/// Brackets are balanced and string literals skipped, so defaults such as
/// `x=dict()` or `p=(1, 2)` stay in the signature. Comments are dropped.
/// `None` when no body colon follows, i.e. the match was not a header.
fn python_header_tail(rest: &str) -> Option<String> {
    let mut tail = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            tail.push(c);
            if c == '\\' {
                tail.extend(chars.next());
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '#' => {
                // Rest of the line is comment.
                if chars.by_ref().any(|n| n == '\n') {
                    if depth == 0 {
                        return None;
                    }
                    tail.push(' ');
                }
                continue;
            }
            '\\' if depth == 0 => {
                // Explicit line continuation.
                chars.next();
                tail.push(' ');
                continue;
            }
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth = depth.checked_sub(1)?,
            ':' if depth == 0 => return Some(tail),
            '\n' if depth == 0 => return None,
            _ => {}
        }
        tail.push(c);
    }
    None
}
