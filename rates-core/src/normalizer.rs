//! Price canonicalization and display-name repair

use crate::sources::RawValue;

/// Canonical "no real price known" value
pub const SENTINEL: &str = "0";

/// Double-decoded UTF-8 sequences seen in upstream names, with the
/// character they were meant to be. Latin-1 and Windows-1252 variants.
const ENCODING_FIXES: &[(&str, &str)] = &[
    ("Ã\u{9c}", "Ü"),
    ("Ãœ", "Ü"),
    ("Ã¼", "ü"),
    ("Ã\u{96}", "Ö"),
    ("Ã–", "Ö"),
    ("Ã¶", "ö"),
    ("Ã\u{87}", "Ç"),
    ("Ã‡", "Ç"),
    ("Ã§", "ç"),
    ("Ä\u{9e}", "Ğ"),
    ("Äž", "Ğ"),
    ("Ä\u{9f}", "ğ"),
    ("ÄŸ", "ğ"),
    ("Ä°", "İ"),
    ("Ä±", "ı"),
    ("Å\u{9e}", "Ş"),
    ("Åž", "Ş"),
    ("Å\u{9f}", "ş"),
    ("ÅŸ", "ş"),
];

/// Canonical string form of a raw price.
///
/// Anything that is not a non-empty, non-zero representation collapses to
/// [`SENTINEL`]. Real values keep their upstream spelling, trimmed.
pub fn normalize(raw: &RawValue) -> String {
    match raw {
        RawValue::Absent | RawValue::Null => SENTINEL.to_string(),
        RawValue::Number(n) if !n.is_finite() || *n == 0.0 => SENTINEL.to_string(),
        RawValue::Number(n) => n.to_string(),
        RawValue::Text(s) => normalize_text(s),
    }
}

/// [`normalize`] for values already stored as strings
pub fn normalize_text(s: &str) -> String {
    let trimmed = s.trim();
    if has_nonzero_digit(trimmed) {
        trimmed.to_string()
    } else {
        SENTINEL.to_string()
    }
}

pub fn is_sentinel(value: &str) -> bool {
    value == SENTINEL
}

fn has_nonzero_digit(s: &str) -> bool {
    s.chars().any(|c| c.is_ascii_digit() && c != '0')
}

/// Rewrite known mis-decoded character sequences in a display name
pub fn fix_encoding(name: &str) -> String {
    if name.is_ascii() {
        return name.to_string();
    }
    ENCODING_FIXES
        .iter()
        .fold(name.to_string(), |fixed, (broken, intended)| fixed.replace(broken, intended))
}
