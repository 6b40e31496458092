//! Extracting a usable frame (file, line, language) from raw stack-trace text.

use std::sync::LazyLock;

use regex::Regex;

use crate::types::{Language, StackFrame};

/// Tried in order; the first capture group is the file path.
static FILE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(/[^:\s]+\.php):\d+",
        r"in (/[^:\s]+\.php) on line \d+",
        r"(/app/[^:\s]+\.php)",
        r#"File "([^"]+)""#,
        r"File '([^']+)'",
        r"at .* \(([^)]+):\d+:\d+\)",
        r"at ([^:\s()]+):\d+:\d+",
        r"([^:\s]+\.[a-zA-Z]{2,4}):\d+",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Tried in order; the first capture group is the line number.
static LINE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"line (\d+)",
        r":(\d+):\d+",
        r"\.php:(\d+)",
        r"\.py:(\d+)",
        r"\.js:(\d+)",
        r"\.[a-zA-Z]{2,4}:(\d+)",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Guess the language from file extensions mentioned in a trace or path.
pub fn detect_language(text: Option<&str>) -> Language {
    let Some(text) = text else {
        return Language::Unknown;
    };
    let lower = text.to_lowercase();
    if lower.contains(".php") {
        Language::Php
    } else if lower.contains(".py") {
        Language::Python
    } else if lower.contains(".js") || lower.contains(".ts") {
        Language::JavaScript
    } else if lower.contains(".java") {
        Language::Java
    } else {
        Language::Unknown
    }
}

pub fn extract_file(trace: &str) -> Option<String> {
    FILE_PATTERNS
        .iter()
        .find_map(|re| re.captures(trace))
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_line(trace: &str) -> Option<u32> {
    LINE_PATTERNS
        .iter()
        .find_map(|re| re.captures(trace))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Build a frame from raw trace text. `None` when no file path can be found.
pub fn parse_frame(trace: &str) -> Option<StackFrame> {
    let file = extract_file(trace)?;
    let line = extract_line(trace).unwrap_or(0);
    Some(StackFrame {
        language: detect_language(Some(&file)),
        file,
        line,
        context_line: None,
    })
}

/// Repository-relative spellings of a reported path, most specific first.
///
/// Container deployments report `/app/...` or other absolute paths; the
/// working copy only knows relative ones.
pub fn relative_candidates(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    if !path.starts_with('/') {
        out.push(path.to_string());
        return out;
    }
    if let Some(rest) = path.strip_prefix("/app/") {
        out.push(format!("app/{rest}"));
        out.push(rest.to_string());
    }
    if let Some(rest) = path.strip_prefix("/public/") {
        out.push(format!("public/{rest}"));
    }
    let stripped = path.trim_start_matches('/').to_string();
    if !out.contains(&stripped) {
        out.push(stripped);
    }
    out
}
