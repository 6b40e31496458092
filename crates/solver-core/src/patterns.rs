//! Known error signatures and the source edits that address them.
//!
//! Patterns are plain data: a matcher over (exception, message, language) and
//! a textual search/replace template. The registry is an ordered list and
//! matching is first-match-wins, so adding a pattern never changes how issues
//! matched by an earlier one are handled.
//!
//! Template placeholders:
//! - `{m1}`, `{m2}`, …: capture groups of the message regex. Inside `search`
//!   they are regex-escaped; inside `replacement` they are inserted verbatim.
//! - `{s1}`, `{s2}`, …: capture groups of the search regex, usable in
//!   `replacement`.

use anyhow::{Context, Result};
use regex::Regex;

use crate::types::{Issue, Language, MatchSpecificity};

#[derive(Debug, Clone)]
pub enum MessageMatch {
    Any,
    Exact(String),
    Contains(String),
    Regex(Regex),
}

#[derive(Debug, Clone)]
pub struct Matcher {
    /// Any of these (case-insensitive) in the exception type or title.
    pub exceptions: Vec<String>,
    pub message: MessageMatch,
    pub language: Option<Language>,
}

#[derive(Debug, Clone)]
pub struct FixTemplate {
    pub search: String,
    pub replacement: String,
    pub explanation: String,
    /// Source text assumed at the reported line when the tracker sent no context line.
    pub canonical: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FixPattern {
    pub id: String,
    pub matcher: Matcher,
    pub template: FixTemplate,
    pub base_weight: f64,
}

/// Result of a matcher accepting an issue.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    pub specificity: MatchSpecificity,
    /// Message regex captures; index 0 is group 1.
    pub captures: Vec<String>,
}

impl FixPattern {
    pub fn new(id: &str, base_weight: f64) -> Self {
        Self {
            id: id.to_string(),
            matcher: Matcher {
                exceptions: Vec::new(),
                message: MessageMatch::Any,
                language: None,
            },
            template: FixTemplate {
                search: String::new(),
                replacement: String::new(),
                explanation: String::new(),
                canonical: None,
            },
            base_weight,
        }
    }

    pub fn exception(mut self, name: &str) -> Self {
        self.matcher.exceptions.push(name.to_string());
        self
    }

    pub fn language(mut self, language: Language) -> Self {
        self.matcher.language = Some(language);
        self
    }

    pub fn message_exact(mut self, text: &str) -> Self {
        self.matcher.message = MessageMatch::Exact(text.to_string());
        self
    }

    pub fn message_contains(mut self, text: &str) -> Self {
        self.matcher.message = MessageMatch::Contains(text.to_string());
        self
    }

    pub fn message_regex(mut self, re: &str) -> Result<Self> {
        let compiled = Regex::new(re)
            .with_context(|| format!("invalid message regex for pattern {}", self.id))?;
        self.matcher.message = MessageMatch::Regex(compiled);
        Ok(self)
    }

    pub fn edit(mut self, search: &str, replacement: &str, explanation: &str) -> Self {
        self.template.search = search.to_string();
        self.template.replacement = replacement.to_string();
        self.template.explanation = explanation.to_string();
        self
    }

    pub fn canonical(mut self, snippet: &str) -> Self {
        self.template.canonical = Some(snippet.to_string());
        self
    }

    /// Evaluate the matcher against an issue.
    pub fn matches(&self, issue: &Issue) -> Option<MatchOutcome> {
        if let Some(lang) = self.matcher.language {
            if issue.language() != lang {
                return None;
            }
        }

        let exception_text = format!("{} {}", issue.exception, issue.title).to_lowercase();
        if !self.matcher.exceptions.is_empty()
            && !self
                .matcher
                .exceptions
                .iter()
                .any(|e| exception_text.contains(&e.to_lowercase()))
        {
            return None;
        }

        let message = if issue.message.trim().is_empty() {
            issue.title.as_str()
        } else {
            issue.message.as_str()
        };

        match &self.matcher.message {
            MessageMatch::Any => Some(MatchOutcome {
                specificity: MatchSpecificity::Category,
                captures: Vec::new(),
            }),
            MessageMatch::Exact(text) => message
                .trim()
                .eq_ignore_ascii_case(text.trim())
                .then(|| MatchOutcome {
                    specificity: MatchSpecificity::Exact,
                    captures: Vec::new(),
                }),
            MessageMatch::Contains(text) => message
                .to_lowercase()
                .contains(&text.to_lowercase())
                .then(|| MatchOutcome {
                    specificity: MatchSpecificity::Substring,
                    captures: Vec::new(),
                }),
            MessageMatch::Regex(re) => [message, issue.title.as_str()]
                .iter()
                .find_map(|text| re.captures(text))
                .map(|caps| MatchOutcome {
                    specificity: MatchSpecificity::Pattern,
                    captures: caps
                        .iter()
                        .skip(1)
                        .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                        .collect(),
                }),
        }
    }
}

/// Substitute `{<prefix>N}` placeholders with `values[N-1]`.
pub(crate) fn fill(template: &str, prefix: char, values: &[String], escape: bool) -> String {
    let mut out = template.to_string();
    // Highest index first so `{m1}` never clobbers the head of `{m10}`.
    for (i, value) in values.iter().enumerate().rev() {
        let key = format!("{{{prefix}{}}}", i + 1);
        let value = if escape {
            regex::escape(value)
        } else {
            value.clone()
        };
        out = out.replace(&key, &value);
    }
    out
}

/// Ordered pattern list; first match wins.
#[derive(Debug, Clone, Default)]
pub struct PatternRegistry {
    patterns: Vec<FixPattern>,
}

impl PatternRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pattern: FixPattern) {
        self.patterns.push(pattern);
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FixPattern> {
        self.patterns.iter()
    }

    /// First pattern whose matcher accepts the issue.
    pub fn find(&self, issue: &Issue) -> Option<(&FixPattern, MatchOutcome)> {
        self.patterns
            .iter()
            .find_map(|p| p.matches(issue).map(|m| (p, m)))
    }

    pub fn builtin() -> Result<Self> {
        let mut r = Self::new();

        r.push(
            FixPattern::new("gcp-service-exception", 0.75)
                .exception("ServiceException")
                .language(Language::Php)
                .edit(
                    r"logs\('gcp'\)->(\w+)\((.*)\);",
                    "try {\n    if (config('logging.gcp.enabled', false)) {\n        logs('gcp')->{s1}({s2});\n    }\n} catch (\\Exception $e) {\n    \\Log::{s1}('GCP logging failed: ' . $e->getMessage());\n}",
                    "Wraps GCP logging in a try/catch guarded by the logging.gcp.enabled flag so service outages fall back to the default logger",
                )
                .canonical("logs('gcp')->error($message, $context);"),
        );
        r.push(
            FixPattern::new("gcp-bad-request", 0.70)
                .exception("BadRequestException")
                .language(Language::Php)
                .edit(
                    r"logs\('gcp'\)->(\w+)\((.*)\);",
                    "try {\n    logs('gcp')->{s1}($this->sanitizeForGcp({s2}));\n} catch (\\Exception $e) {\n    \\Log::{s1}('GCP logging failed, using default logger', ['error' => $e->getMessage()]);\n}",
                    "Sanitizes the payload before sending it to GCP and falls back to the default logger on bad requests",
                )
                .canonical("logs('gcp')->info($data);"),
        );
        r.push(
            FixPattern::new("carbon-invalid-format", 0.80)
                .exception("InvalidFormatException")
                .language(Language::Php)
                .edit(
                    r"Carbon::parse\(([^()]*)\)",
                    "rescue(fn () => Carbon::parse({s1}), fn () => Carbon::now(), false)",
                    "Falls back to the current time when Carbon cannot parse the input date",
                )
                .canonical("Carbon::parse($dateString);"),
        );
        r.push(
            FixPattern::new("py-attribute-error", 0.65)
                .exception("AttributeError")
                .language(Language::Python)
                .message_regex(r"'(\w+)' object has no attribute '(\w+)'")?
                .edit(
                    r"\b(\w+)\.{m2}\b",
                    "getattr({s1}, '{m2}', None)",
                    "Uses getattr with a default so a missing '{m2}' attribute on {m1} no longer raises",
                ),
        );
        r.push(
            FixPattern::new("py-key-error", 0.70)
                .exception("KeyError")
                .language(Language::Python)
                .message_regex(r"'(\w+)'")?
                .edit(
                    r#"\b(\w+)\[['"]{m1}['"]\]"#,
                    "{s1}.get('{m1}')",
                    "Uses dict.get so a missing '{m1}' key yields None instead of raising",
                ),
        );
        r.push(
            FixPattern::new("py-index-error", 0.55)
                .exception("IndexError")
                .language(Language::Python)
                .message_contains("index out of range")
                .edit(
                    r"\b(\w+)\[(\w+)\]",
                    "({s1}[{s2}] if -len({s1}) <= {s2} < len({s1}) else None)",
                    "Adds a bounds check before indexing",
                ),
        );
        r.push(
            FixPattern::new("py-none-type-error", 0.60)
                .exception("TypeError")
                .language(Language::Python)
                .message_contains("NoneType")
                .edit(
                    r"\b(\w+)\.(\w+)\(([^()]*)\)",
                    "({s1}.{s2}({s3}) if {s1} is not None else None)",
                    "Adds a None check before the method call",
                ),
        );
        r.push(
            FixPattern::new("py-import-error", 0.55)
                .exception("ImportError")
                .exception("ModuleNotFoundError")
                .language(Language::Python)
                .message_regex(r"No module named '(\w+)'")?
                .edit(
                    r"\bimport {m1}\b",
                    "try:\n    import {m1}\nexcept ImportError:\n    {m1} = None",
                    "Makes the optional '{m1}' module import tolerant of its absence",
                ),
        );
        r.push(
            FixPattern::new("py-name-error", 0.40)
                .exception("NameError")
                .language(Language::Python)
                .message_regex(r"name '(\w+)' is not defined")?
                .edit(
                    r"\b{m1}\b",
                    "(locals().get('{m1}') or globals().get('{m1}'))",
                    "Looks '{m1}' up defensively instead of referencing an undefined name",
                ),
        );
        r.push(
            FixPattern::new("js-property-of-undefined", 0.55)
                .exception("TypeError")
                .language(Language::JavaScript)
                .message_regex(r"Cannot read propert(?:y|ies)\b.*?'(\w+)'")?
                .edit(
                    r"\b(\w+)\.{m1}\b",
                    "{s1}?.{m1}",
                    "Uses optional chaining so reading '{m1}' from undefined yields undefined",
                ),
        );
        r.push(
            FixPattern::new("js-not-a-function", 0.50)
                .exception("TypeError")
                .language(Language::JavaScript)
                .message_regex(r"([\w.]+) is not a function")?
                .edit(
                    r"\b{m1}\(",
                    "{m1}?.(",
                    "Only calls {m1} when it is actually a function",
                ),
        );
        r.push(
            FixPattern::new("js-reference-error", 0.50)
                .exception("ReferenceError")
                .language(Language::JavaScript)
                .message_regex(r"(\w+) is not defined")?
                .edit(
                    r"\b{m1}\b",
                    "(typeof {m1} !== 'undefined' ? {m1} : undefined)",
                    "Checks that '{m1}' is defined before use",
                ),
        );

        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IssueStatus, Severity, StackFrame};
    use chrono::Utc;

    fn issue(exception: &str, message: &str, file: &str) -> Issue {
        Issue {
            id: "1".into(),
            project: "proj".into(),
            title: format!("{exception}: {message}"),
            exception: exception.into(),
            message: message.into(),
            culprit: String::new(),
            permalink: String::new(),
            level: Severity::Error,
            status: IssueStatus::Unresolved,
            count: 1,
            first_seen: Utc::now(),
            last_seen: Utc::now(),
            environment: None,
            frame: Some(StackFrame {
                file: file.into(),
                line: 3,
                language: crate::stacktrace::detect_language(Some(file)),
                context_line: None,
            }),
            stack_trace: None,
        }
    }

    #[test]
    fn builtin_registry_compiles() {
        let r = PatternRegistry::builtin().unwrap();
        assert!(r.len() >= 12);
    }

    #[test]
    fn key_error_captures_key() {
        let r = PatternRegistry::builtin().unwrap();
        let (p, m) = r.find(&issue("KeyError", "'user_id'", "src/views.py")).unwrap();
        assert_eq!(p.id, "py-key-error");
        assert_eq!(m.specificity, MatchSpecificity::Pattern);
        assert_eq!(m.captures, vec!["user_id".to_string()]);
    }

    #[test]
    fn language_gates_matching() {
        let r = PatternRegistry::builtin().unwrap();
        let (p, _) = r
            .find(&issue("TypeError", "foo is not a function", "src/app.js"))
            .unwrap();
        assert_eq!(p.id, "js-not-a-function");
        assert!(r
            .find(&issue("TypeError", "foo is not a function", "src/app.py"))
            .is_none());
    }

    #[test]
    fn first_match_wins() {
        let mut r = PatternRegistry::new();
        r.push(FixPattern::new("first", 0.5).exception("ValueError"));
        r.push(
            FixPattern::new("second", 0.9)
                .exception("ValueError")
                .message_exact("bad value"),
        );
        let (p, m) = r.find(&issue("ValueError", "bad value", "src/x.py")).unwrap();
        assert_eq!(p.id, "first");
        assert_eq!(m.specificity, MatchSpecificity::Category);
    }

    #[test]
    fn exact_message_match_is_case_insensitive() {
        let p = FixPattern::new("p", 0.5)
            .exception("ValueError")
            .message_exact("Bad Value");
        let m = p.matches(&issue("ValueError", " bad value ", "src/x.py")).unwrap();
        assert_eq!(m.specificity, MatchSpecificity::Exact);
        assert!(p.matches(&issue("ValueError", "bad value!", "src/x.py")).is_none());
    }

    #[test]
    fn unknown_exception_matches_nothing() {
        let r = PatternRegistry::builtin().unwrap();
        assert!(r
            .find(&issue("SegmentationFault", "boom", "src/x.py"))
            .is_none());
    }

    #[test]
    fn fill_escapes_only_when_asked() {
        let vals = vec!["a.b".to_string()];
        assert_eq!(fill(r"{m1}\(", 'm', &vals, true), r"a\.b\(");
        assert_eq!(fill("{m1}?.(", 'm', &vals, false), "a.b?.(");
    }
}
