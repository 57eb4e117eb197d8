//! Deterministic cleanup applied to every page text, OCR or text layer.
//!
//! Rules, in order:
//! 1. Normalise line endings (CRLF / CR → LF)
//! 2. Strip invisible Unicode (zero-width spaces, BOM, soft hyphens)
//! 3. Trim trailing whitespace per line
//! 4. Drop blank-only lines
//! 5. Trim leading/trailing newlines of the whole text

use once_cell::sync::Lazy;
use regex::Regex;

/// Apply all cleanup rules.
pub fn clean_text(input: &str) -> String {
    let s = normalise_line_endings(input);
    let s = remove_invisible_chars(&s);
    let s = trim_trailing_whitespace(&s);
    let s = strip_blank_lines(&s);
    s.trim_matches('\n').to_string()
}

/// Count of non-whitespace characters, used to decide whether a PDF text
/// layer is worth keeping.
pub fn visible_chars(input: &str) -> usize {
    input.chars().filter(|c| !c.is_whitespace()).count()
}

// ── Rule 1 ───────────────────────────────────────────────────────────────────

fn normalise_line_endings(input: &str) -> String {
    input.replace("\r\n", "\n").replace('\r', "\n")
}

// ── Rule 2 ───────────────────────────────────────────────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input.replace(
        ['\u{200B}', '\u{FEFF}', '\u{00AD}', '\u{200C}', '\u{200D}', '\u{2060}'],
        "",
    )
}

// ── Rule 3 ───────────────────────────────────────────────────────────────────

static RE_TRAILING_WS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)[ \t\x0B\x0C\u{A0}]+$").unwrap());

fn trim_trailing_whitespace(input: &str) -> String {
    RE_TRAILING_WS.replace_all(input, "").into_owned()
}

// ── Rule 4 ───────────────────────────────────────────────────────────────────

// After rule 3 a blank-only line is an empty line.
static RE_BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\n+").unwrap());

fn strip_blank_lines(input: &str) -> String {
    RE_BLANK_LINES.replace_all(input, "").into_owned()
}
