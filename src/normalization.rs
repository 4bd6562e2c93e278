//! Token and text normalization used throughout matching (spec §4.1).

use once_cell::sync::Lazy;
use std::collections::HashSet;
use unicode_normalization::UnicodeNormalization;

pub const HEAD_TAIL_WORD_LIMIT: usize = 30;
const MIN_TOKEN_LENGTH_DESCRIPTION: usize = 6;
const MIN_WORD_TOKEN_LENGTH: usize = 3;
const MIN_CODE_TOKEN_LENGTH: usize = 4;

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "per", "con", "dei", "del", "dalla", "dallo", "dalle", "dagli", "alla", "allo", "alle",
        "agli", "nella", "nello", "nelle", "negli", "sulla", "sullo", "sulle", "sugli", "della",
        "dello", "delle", "degli", "una", "uno", "gli", "le", "il", "lo", "la", "di", "da", "in",
        "su", "a", "e", "o", "ma", "se", "che", "the", "of", "and", "or", "for", "with", "from",
        "to", "on", "at", "by",
    ]
    .into_iter()
    .collect()
});

/// Strips accents and keeps only alphanumerics, lowercased. Returns `None`
/// for empty input, mirroring the Python helper returning `None` for falsy
/// strings.
pub fn normalize_token(value: Option<&str>) -> Option<String> {
    let value = value?;
    if value.is_empty() {
        return None;
    }
    let cleaned: String = value
        .nfkd()
        .filter(|c| c.is_alphanumeric())
        .flat_map(|c| c.to_lowercase())
        .collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Uppercase, strip anything outside `[A-Z0-9]`.
pub fn normalize_code_token(code: Option<&str>) -> String {
    let Some(code) = code else {
        return String::new();
    };
    code.to_uppercase()
        .chars()
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// Lowercase, strip combining marks, collapse whitespace.
pub fn normalize_description_token(text: Option<&str>) -> String {
    let Some(text) = text else {
        return String::new();
    };
    let without_marks: String = text.nfkd().filter(|c| !is_combining(*c)).collect();
    let lowered = without_marks.to_lowercase();
    collapse_whitespace(&lowered)
}

fn is_combining(c: char) -> bool {
    matches!(c as u32, 0x0300..=0x036F | 0x1AB0..=0x1AFF | 0x1DC0..=0x1DFF | 0x20D0..=0x20FF)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Alphanumeric words, lowercase, accents stripped.
pub fn tokenize_words(text: &str) -> Vec<String> {
    let without_marks: String = text.nfkd().filter(|c| !is_combining(*c)).collect();
    let lowered = without_marks.to_lowercase();
    let mut words = Vec::new();
    let mut current = String::new();
    for c in lowered.chars() {
        if c.is_ascii_alphanumeric() {
            current.push(c);
        } else if !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}

fn split_non_alphanumeric(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Full normalized string (if long enough), each normalized line, and words
/// >= 3 chars outside the stopword set.
pub fn extract_description_tokens(text: Option<&str>) -> HashSet<String> {
    let Some(text) = text else {
        return HashSet::new();
    };
    let mut tokens = HashSet::new();
    let normalized_text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut segments = vec![normalized_text.as_str()];
    segments.extend(normalized_text.split('\n').map(str::trim).filter(|s| !s.is_empty()));

    for segment in segments {
        if let Some(token) = normalize_token(Some(segment)) {
            if token.chars().count() >= MIN_TOKEN_LENGTH_DESCRIPTION {
                tokens.insert(token);
            }
        }
    }

    for word in split_non_alphanumeric(text) {
        if word.chars().count() >= MIN_WORD_TOKEN_LENGTH && !STOPWORDS.contains(word.to_lowercase().as_str()) {
            tokens.insert(word.to_lowercase());
        }
    }

    tokens
}

/// Same rules as [`extract_description_tokens`] — this is the set used for
/// Jaccard similarity during alignment.
pub fn descr_tokens(text: Option<&str>) -> HashSet<String> {
    extract_description_tokens(text)
}

/// Full code token plus progressive prefixes, e.g. `"ABC-123"` ->
/// `{"abc123", "abc"}`.
pub fn collect_code_tokens(code: Option<&str>) -> HashSet<String> {
    let Some(code) = code else {
        return HashSet::new();
    };
    let mut tokens = HashSet::new();
    let Some(normalized) = normalize_token(Some(code)) else {
        return tokens;
    };
    tokens.insert(normalized);

    let mut builder = String::new();
    for segment in split_non_alphanumeric(code) {
        if let Some(cleaned) = normalize_token(Some(segment)) {
            builder.push_str(&cleaned);
            tokens.insert(builder.clone());
        }
    }
    tokens
}

/// Full text (if long enough) plus individual segments >= 4 chars, for
/// indexing rather than Jaccard comparison.
pub fn collect_description_tokens(text: Option<&str>) -> HashSet<String> {
    let Some(text) = text else {
        return HashSet::new();
    };
    let mut tokens = HashSet::new();
    let normalized_text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut segments = vec![normalized_text.as_str()];
    segments.extend(normalized_text.split('\n').map(str::trim).filter(|s| !s.is_empty()));

    for segment in segments {
        if let Some(token) = normalize_token(Some(segment)) {
            if token.chars().count() >= MIN_TOKEN_LENGTH_DESCRIPTION {
                tokens.insert(token);
            }
        }
    }

    for segment in split_non_alphanumeric(text) {
        if let Some(token) = normalize_token(Some(segment)) {
            if token.chars().count() >= MIN_CODE_TOKEN_LENGTH {
                tokens.insert(token);
            }
        }
    }

    tokens
}

/// Head/tail n-gram signatures (first/last `limit` words), used as secondary
/// keys when the full signature misses.
pub fn build_head_tail_signatures(description: Option<&str>, limit: usize) -> (String, String) {
    let Some(description) = description else {
        return (String::new(), String::new());
    };
    let tokens = tokenize_words(description);
    if tokens.is_empty() {
        return (String::new(), String::new());
    }
    let head: Vec<&str> = tokens.iter().take(limit).map(String::as_str).collect();
    let tail: Vec<&str> = if tokens.len() > limit {
        tokens[tokens.len() - limit..].iter().map(String::as_str).collect()
    } else {
        tokens.iter().map(String::as_str).collect()
    };
    (head.join(" "), tail.join(" "))
}

/// Only the normalized description token is used today; `unit`/`wbs6_code`
/// are accepted for future tightening but not read.
pub fn description_signature(
    description: Option<&str>,
    _unit: Option<&str>,
    _wbs6_code: Option<&str>,
) -> Option<String> {
    let token = normalize_description_token(description);
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// A non-empty field from an ordered candidate list, normalized.
fn first_normalized<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    for candidate in candidates {
        if let Some(token) = normalize_token(candidate) {
            return Some(token);
        }
    }
    None
}

/// A voce's WBS levels as `(level, code, description)`, used by the
/// `*_from_parsed` key builders.
pub struct WbsLevelRef<'a> {
    pub level: u8,
    pub code: Option<&'a str>,
    pub description: Option<&'a str>,
}

/// `"{primary}|{secondary}"`: primary is the first non-empty of
/// `(wbs6_code, wbs6_desc, wbs5_code, wbs5_desc)`, secondary the first
/// non-empty of `(wbs7_code, wbs7_desc, description)`. May collapse to a
/// single token if one side is empty.
#[allow(clippy::too_many_arguments)]
pub fn wbs_key_from_model(
    wbs6_code: Option<&str>,
    wbs6_description: Option<&str>,
    wbs5_code: Option<&str>,
    wbs5_description: Option<&str>,
    wbs7_code: Option<&str>,
    wbs7_description: Option<&str>,
    description: Option<&str>,
) -> Option<String> {
    let primary = first_normalized([wbs6_code, wbs6_description, wbs5_code, wbs5_description]);
    let secondary = first_normalized([wbs7_code, wbs7_description, description]);

    match (primary, secondary) {
        (Some(p), Some(s)) => Some(format!("{p}|{s}")),
        (None, Some(s)) => Some(s),
        (Some(p), None) => Some(p),
        (None, None) => None,
    }
}

/// Like [`wbs_key_from_model`] but also appends `description_token` as a
/// third segment when it adds specificity, per parsed (not yet persisted)
/// rows.
pub fn wbs_key_from_parsed(
    levels: &[WbsLevelRef],
    code: Option<&str>,
    description: Option<&str>,
) -> Option<String> {
    let description_token = normalize_token(description);

    let mut primary = None;
    let mut secondary = None;
    for level in levels {
        if level.level == 6 && primary.is_none() {
            primary = normalize_token(level.code).or_else(|| normalize_token(level.description));
        }
        if level.level == 7 && secondary.is_none() {
            secondary = normalize_token(level.code).or_else(|| normalize_token(level.description));
        }
    }
    if secondary.is_none() {
        secondary = normalize_token(code).or_else(|| normalize_token(description));
    }

    if let (Some(p), Some(s)) = (&primary, &secondary) {
        return match &description_token {
            Some(d) => Some(format!("{p}|{s}|{d}")),
            None => Some(format!("{p}|{s}")),
        };
    }

    if let (Some(s), Some(d)) = (&secondary, &description_token) {
        if s != d {
            return Some(format!("{s}|{d}"));
        }
    }

    description_token.or(secondary).or(primary)
}

/// Like [`wbs_key_from_parsed`] but omits the description segment.
pub fn wbs_base_key_from_parsed(
    levels: &[WbsLevelRef],
    code: Option<&str>,
    description: Option<&str>,
) -> Option<String> {
    let mut primary = None;
    let mut secondary = None;
    for level in levels {
        if level.level == 6 && primary.is_none() {
            primary = normalize_token(level.code).or_else(|| normalize_token(level.description));
        }
        if level.level == 7 && secondary.is_none() {
            secondary = normalize_token(level.code).or_else(|| normalize_token(level.description));
        }
    }
    if secondary.is_none() {
        secondary = normalize_token(code).or_else(|| normalize_token(description));
    }

    match (primary, secondary) {
        (Some(p), Some(s)) => Some(format!("{p}|{s}")),
        (None, Some(s)) => Some(s),
        (Some(p), None) => Some(p),
        (None, None) => None,
    }
}

/// Splits a WBS key into `(primary, secondary)`.
pub fn split_wbs_key(key: Option<&str>) -> (Option<String>, Option<String>) {
    let Some(key) = key else {
        return (None, None);
    };
    if let Some((primary, secondary)) = key.split_once('|') {
        let primary = if primary.is_empty() { None } else { Some(primary.to_string()) };
        let secondary = if secondary.is_empty() { None } else { Some(secondary.to_string()) };
        (primary, secondary)
    } else {
        (None, Some(key.to_string()))
    }
}

/// Extracts the `primary|secondary` part of a key, dropping any trailing
/// description segment.
pub fn base_wbs_key_from_key(key: Option<&str>) -> Option<String> {
    let (primary, secondary) = split_wbs_key(key);
    match (primary, secondary) {
        (Some(p), Some(s)) => {
            let s = s.split_once('|').map(|(head, _)| head.to_string()).unwrap_or(s);
            Some(format!("{p}|{s}"))
        }
        (Some(p), None) => Some(p),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

/// `^[A-Za-z]\d{3}$` after whitespace removal, uppercased.
pub fn is_valid_wbs6_code(code: &str) -> bool {
    let cleaned: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    let rest: String = chars.collect();
    rest.len() == 3 && rest.chars().all(|c| c.is_ascii_digit())
}

/// `^[A-Za-z]\d{3}[.\s_-]?\d{3}$`, canonicalized as `L###.###`.
pub fn normalize_wbs7_code(code: &str) -> Option<String> {
    let chars: Vec<char> = code.chars().collect();
    if chars.is_empty() || !chars[0].is_ascii_alphabetic() {
        return None;
    }
    let letter = chars[0].to_ascii_uppercase();
    let mut rest: Vec<char> = chars[1..].to_vec();
    if rest.len() == 7 && matches!(rest[3], '.' | ' ' | '_' | '-') {
        rest.remove(3);
    }
    if rest.len() != 6 || !rest.iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let digits: String = rest.into_iter().collect();
    Some(format!("{}{}.{}", letter, &digits[0..3], &digits[3..6]))
}

/// Jaccard similarity between two token sets; 0.0 if either is empty.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_token_strips_accents_and_lowercases() {
        assert_eq!(normalize_token(Some("Città")), Some("citta".to_string()));
        assert_eq!(normalize_token(Some("")), None);
        assert_eq!(normalize_token(None), None);
    }

    #[test]
    fn test_normalize_code_token_keeps_only_upper_alnum() {
        assert_eq!(normalize_code_token(Some("a-004.010")), "A004010");
    }

    #[test]
    fn test_normalize_description_token_collapses_whitespace() {
        assert_eq!(
            normalize_description_token(Some("Controsoffitto   doppia  lastra")),
            "controsoffitto doppia lastra"
        );
    }

    #[test]
    fn test_extract_description_tokens_includes_full_and_words() {
        let tokens = extract_description_tokens(Some("Controsoffitto doppia lastra in cartongesso"));
        assert!(tokens.contains("controsoffittodoppialastraincartongesso"));
        assert!(tokens.contains("doppia"));
        assert!(!tokens.contains("in"));
    }

    #[test]
    fn test_jaccard_similarity() {
        let a: HashSet<String> = ["foo", "bar"].iter().map(|s| s.to_string()).collect();
        let b: HashSet<String> = ["foo", "baz"].iter().map(|s| s.to_string()).collect();
        assert!((jaccard_similarity(&a, &b) - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(jaccard_similarity(&HashSet::new(), &b), 0.0);
    }

    #[test]
    fn test_wbs6_code_validation() {
        assert!(is_valid_wbs6_code("A004"));
        assert!(is_valid_wbs6_code("A 004"));
        assert!(!is_valid_wbs6_code("A0040"));
        assert!(!is_valid_wbs6_code("4004"));
    }

    #[test]
    fn test_wbs7_code_normalization() {
        assert_eq!(normalize_wbs7_code("A004.010"), Some("A004.010".to_string()));
        assert_eq!(normalize_wbs7_code("A004010"), Some("A004.010".to_string()));
        assert_eq!(normalize_wbs7_code("A004"), None);
    }

    #[test]
    fn test_wbs_key_from_model_collapses_when_one_side_empty() {
        let key = wbs_key_from_model(Some("A004"), None, None, None, None, None, Some("desc"));
        assert_eq!(key, Some("a004|desc".to_string()));

        let key_no_primary = wbs_key_from_model(None, None, None, None, None, None, Some("desc"));
        assert_eq!(key_no_primary, Some("desc".to_string()));
    }

    #[test]
    fn test_description_signature_ignores_unit_and_wbs6() {
        let a = description_signature(Some("Massetto"), Some("mq"), Some("A004"));
        let b = description_signature(Some("Massetto"), Some("mc"), Some("B005"));
        assert_eq!(a, b);
    }

    #[test]
    fn test_head_tail_signatures_use_word_limit() {
        let words: Vec<String> = (0..40).map(|i| format!("w{i}")).collect();
        let description = words.join(" ");
        let (head, tail) = build_head_tail_signatures(Some(&description), HEAD_TAIL_WORD_LIMIT);
        assert_eq!(head.split(' ').count(), 30);
        assert_eq!(tail.split(' ').count(), 30);
        assert_ne!(head, tail);
    }
}
