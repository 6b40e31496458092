//! Applying a candidate's textual edit to file contents.

/// How far (in lines) from the reported line the original snippet may have drifted.
pub const SEARCH_WINDOW: u32 = 10;

/// 1-based line number of byte offset `at`.
fn line_of(content: &str, at: usize) -> u32 {
    content[..at].matches('\n').count() as u32 + 1
}

/// Re-indent continuation lines of a multi-line replacement to `indent`.
fn indent_continuation(replacement: &str, indent: &str, eol: &str) -> String {
    let mut out = String::new();
    for (i, line) in replacement.lines().enumerate() {
        if i > 0 {
            out.push_str(eol);
            if !line.trim().is_empty() {
                out.push_str(indent);
            }
        }
        out.push_str(line);
    }
    out
}

/// Replace the occurrence of `original` closest to `line` (within
/// [`SEARCH_WINDOW`]) with `replacement`.
///
/// Returns `None` when the snippet is not found near the line, i.e. the file
/// changed since the candidate was produced. Everything outside the replaced
/// range, including the trailing newline, is left as is.
pub fn apply_edit(content: &str, original: &str, replacement: &str, line: u32) -> Option<String> {
    if original.is_empty() {
        return None;
    }
    let target = i64::from(line.max(1));
    let (at, _) = content
        .match_indices(original)
        .map(|(at, _)| (at, (i64::from(line_of(content, at)) - target).abs()))
        .filter(|(_, distance)| *distance <= i64::from(SEARCH_WINDOW))
        .min_by_key(|(_, distance)| *distance)?;

    let line_start = content[..at].rfind('\n').map_or(0, |i| i + 1);
    let indent: String = content[line_start..]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect();
    let eol = if content.contains("\r\n") { "\r\n" } else { "\n" };

    let mut out = String::with_capacity(content.len() + replacement.len());
    out.push_str(&content[..at]);
    out.push_str(&indent_continuation(replacement, &indent, eol));
    out.push_str(&content[at + original.len()..]);
    Some(out)
}
