//! Taxonomy codes and store tags.
//!
//! Free text from forms arrives romanized, snake or kebab cased, or already
//! canonical. Everything is folded onto the canonical labels below. Unknown
//! codes pass through trimmed so a new category does not need a deploy.
use std::sync::LazyLock;

use regex::Regex;

use crate::error::AppError;

/// Canonical label and the sanitized spellings that map onto it.
const INDUSTRIES: &[(&str, &[&str])] = &[
    ("デリヘル", &["deriheru", "delivery health"]),
    ("ホテヘル", &["hoteheru", "hotel health"]),
    ("箱ヘル", &["hakoheru", "hako heru", "hako health"]),
    ("ソープ", &["sopu", "soap"]),
    ("DC", &["dc"]),
    ("風エス", &["huesu", "fuesu"]),
    ("メンエス", &["menesu", "mensu", "mens es"]),
];

pub const ALLOWED_TAGS: &[&str] = &["個室", "半個室", "裏", "講習無", "店泊可", "雑費無料"];

static SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[_\-]").expect("separator pattern"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space pattern"));

/// Lowercased, separators as single spaces. Non-ASCII text is kept as is.
pub fn sanitize(input: &str) -> String {
    let s = SEPARATORS.replace_all(input.trim(), " ");
    SPACES.replace_all(s.trim(), " ").to_lowercase()
}

/// Empty for blank input.
pub fn canonical_industry(input: &str) -> String {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let key = sanitize(trimmed);
    INDUSTRIES
        .iter()
        .find(|(label, aliases)| *label == trimmed || aliases.contains(&key.as_str()))
        .map(|(label, _)| label.to_string())
        .unwrap_or_else(|| trimmed.to_string())
}

/// Canonical, deduplicated, input order kept. At least one code is required.
pub fn normalize_industries<S: AsRef<str>>(codes: &[S]) -> Result<Vec<String>, AppError> {
    let mut result: Vec<String> = Vec::with_capacity(codes.len());

    for code in codes {
        let canonical = canonical_industry(code.as_ref());
        if !canonical.is_empty() && !result.contains(&canonical) {
            result.push(canonical);
        }
    }

    if result.is_empty() {
        return Err(AppError::invalid("at least one taxonomy code is required"));
    }

    Ok(result)
}

pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Result<Vec<String>, AppError> {
    let mut result: Vec<String> = Vec::with_capacity(tags.len());

    for tag in tags {
        let tag = tag.as_ref().trim();
        if tag.is_empty() {
            continue;
        }
        if !ALLOWED_TAGS.contains(&tag) {
            return Err(AppError::invalid(format!("invalid tag: {tag}")));
        }
        if !result.iter().any(|t| t == tag) {
            result.push(tag.to_string());
        }
    }

    Ok(result)
}
