// ABOUTME: Normalizes stderr output into a short, stable failure signature
// ABOUTME: Numbers, addresses and paths are canonicalized so reruns of one bug share a signature

use std::sync::LazyLock;

use regex::Regex;

/// Longest signature kept, in characters
pub const MAX_SIGNATURE_LEN: usize = 200;

/// Signature used when a failure produced no stderr
pub const EMPTY_SIGNATURE: &str = "<no stderr>";

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(^[A-Za-z_][\w.$]*(Error|Exception|Exit|Interrupt)\b|^Exception in thread|\berror\b|^Segmentation fault|^Killed\b|^panic|\bfatal\b)",
    )
    .expect("error line pattern is valid")
});

static HEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"0[xX][0-9a-fA-F]+").expect("hex pattern is valid"));

static PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[A-Za-z]:)?(?:[\\/][\w.\-]+)+[\\/]?"#).expect("path pattern is valid")
});

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(\.\d+)?\b").expect("number pattern is valid"));

/// Reduce stderr to the signature of its most specific error line.
///
/// The last line that looks like an error wins; if none does, the last
/// non-empty line is used.
pub fn trace_signature(stderr: &str) -> String {
    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let chosen = lines
        .iter()
        .rev()
        .find(|line| ERROR_LINE.is_match(line))
        .or_else(|| lines.last());

    match chosen {
        Some(line) => normalize_line(line),
        None => EMPTY_SIGNATURE.to_string(),
    }
}

fn normalize_line(line: &str) -> String {
    let line = HEX.replace_all(line, "0xADDR");
    let line = PATH.replace_all(&line, "<path>");
    let line = NUMBER.replace_all(&line, "N");
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(MAX_SIGNATURE_LEN).collect()
}
