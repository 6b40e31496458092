//! Pure translation between Sentry's REST JSON and the core types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solver_core::filter::IssueFilter;
use solver_core::stacktrace::detect_language;
use solver_core::tracker::TrackerError;
use solver_core::{Issue, IssueStatus, Severity, StackFrame};

/// Search query for the issues endpoint, mirroring the local filter so the
/// server does most of the narrowing.
pub fn build_query(filter: &IssueFilter) -> String {
    let mut parts = vec!["is:unresolved".to_string()];

    match filter.levels().as_slice() {
        [] => {}
        [only] => parts.push(format!("level:{}", only.as_str())),
        levels => parts.push(format!(
            "({})",
            levels
                .iter()
                .map(|l| format!("level:{}", l.as_str()))
                .collect::<Vec<_>>()
                .join(" OR ")
        )),
    }

    if let Some(envs) = &filter.environments {
        match envs.as_slice() {
            [] => {}
            [only] => parts.push(format!("environment:{only}")),
            envs => parts.push(format!(
                "({})",
                envs.iter()
                    .map(|e| format!("environment:{e}"))
                    .collect::<Vec<_>>()
                    .join(" OR ")
            )),
        }
    }

    if filter.min_occurrences > 1 {
        parts.push(format!("times_seen:>={}", filter.min_occurrences));
    }
    if let Some(days) = filter.max_age_days {
        parts.push(format!("lastSeen:-{days}d"));
    }
    parts.join(" ")
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v.get(key).and_then(Value::as_str).unwrap_or_default()
}

fn parse_time(v: &Value, key: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(str_field(v, key))
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Sentry sends `count` as a string.
fn parse_count(v: &Value) -> u64 {
    match v.get("count") {
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        Some(Value::Number(n)) => n.as_u64().unwrap_or(0),
        _ => 0,
    }
}

/// One element of `GET /projects/{org}/{project}/issues/`.
pub fn parse_issue(project: &str, v: &Value) -> Result<Issue, TrackerError> {
    let id = str_field(v, "id");
    if id.is_empty() {
        return Err(TrackerError::Decode("issue without id".into()));
    }
    let title = str_field(v, "title").to_string();
    let metadata = v.get("metadata").cloned().unwrap_or(Value::Null);
    let mut exception = str_field(&metadata, "type").to_string();
    let mut message = str_field(&metadata, "value").to_string();
    if exception.is_empty() {
        if let Some((head, tail)) = title.split_once(':') {
            exception = head.trim().to_string();
            if message.is_empty() {
                message = tail.trim().to_string();
            }
        }
    }

    let now = Utc::now();
    let last_seen = parse_time(v, "lastSeen").unwrap_or(now);
    Ok(Issue {
        id: id.to_string(),
        project: project.to_string(),
        title,
        exception,
        message,
        culprit: str_field(v, "culprit").to_string(),
        permalink: str_field(v, "permalink").to_string(),
        level: Severity::parse(str_field(v, "level")).unwrap_or(Severity::Error),
        status: if str_field(v, "status") == "resolved" {
            IssueStatus::Resolved
        } else {
            IssueStatus::Unresolved
        },
        count: parse_count(v),
        first_seen: parse_time(v, "firstSeen").unwrap_or(last_seen),
        last_seen,
        environment: None,
        frame: None,
        stack_trace: None,
    })
}

fn exception_values(event: &Value) -> Vec<&Value> {
    event
        .get("entries")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(|e| str_field(e, "type") == "exception")
        .filter_map(|e| e.pointer("/data/values").and_then(Value::as_array))
        .flatten()
        .collect()
}

fn frame_file(frame: &Value) -> &str {
    match str_field(frame, "absPath") {
        "" => str_field(frame, "filename"),
        abs => abs,
    }
}

/// Apply `filter` to list entries before their events are fetched. The
/// environment is only known from the event, so it is left to the query.
pub fn preselect(
    filter: &IssueFilter,
    issues: Vec<Issue>,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<Issue> {
    let listed = IssueFilter {
        environments: None,
        ..filter.clone()
    };
    listed.select(issues, now, limit.max(1))
}

/// Fill environment, exception details, the innermost in-app frame and a
/// rendered trace from `GET /issues/{id}/events/latest/`.
pub fn apply_event(issue: &mut Issue, event: &Value) {
    if let Some(env) = event
        .get("tags")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|t| str_field(t, "key") == "environment")
        .map(|t| str_field(t, "value"))
        .filter(|e| !e.is_empty())
    {
        issue.environment = Some(env.to_string());
    }

    // Sentry lists chained exceptions cause-first; the last one was raised.
    let Some(exc) = exception_values(event).into_iter().last() else {
        return;
    };
    if let Some(t) = exc.get("type").and_then(Value::as_str).filter(|t| !t.is_empty()) {
        issue.exception = t.to_string();
    }
    if let Some(m) = exc.get("value").and_then(Value::as_str).filter(|m| !m.is_empty()) {
        issue.message = m.to_string();
    }

    let frames: Vec<&Value> = exc
        .pointer("/stacktrace/frames")
        .and_then(Value::as_array)
        .map(|f| f.iter().collect())
        .unwrap_or_default();
    if frames.is_empty() {
        return;
    }

    // Frames are ordered outermost first.
    let mut trace = format!("{}: {}\n", issue.exception, issue.message);
    for f in frames.iter().rev() {
        trace.push_str(&format!(
            "  at {} ({}:{})\n",
            str_field(f, "function"),
            frame_file(f),
            f.get("lineNo").and_then(Value::as_u64).unwrap_or(0)
        ));
    }
    issue.stack_trace = Some(trace);

    let chosen = frames
        .iter()
        .rev()
        .find(|f| f.get("inApp").and_then(Value::as_bool).unwrap_or(false))
        .or_else(|| frames.last());
    if let Some(f) = chosen {
        let file = frame_file(f);
        if file.is_empty() {
            return;
        }
        issue.frame = Some(StackFrame {
            file: file.to_string(),
            line: f
                .get("lineNo")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
            language: detect_language(Some(file)),
            context_line: f
                .get("context")
                .and_then(Value::as_array)
                .and_then(|ctx| {
                    let line = f.get("lineNo").and_then(Value::as_u64)?;
                    ctx.iter().find_map(|pair| {
                        let pair = pair.as_array()?;
                        (pair.first()?.as_u64()? == line)
                            .then(|| pair.get(1)?.as_str().map(str::to_string))
                            .flatten()
                    })
                })
                .or_else(|| {
                    f.get("contextLine")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                }),
        });
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SentryProject {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub platform: String,
    pub status: String,
}

/// Projects with a slug, from one page of `GET /organizations/{org}/projects/`.
pub fn parse_projects(page: &Value) -> Vec<SentryProject> {
    page.as_array()
        .into_iter()
        .flatten()
        .filter(|p| !str_field(p, "slug").is_empty())
        .map(|p| {
            let slug = str_field(p, "slug").to_string();
            SentryProject {
                id: match p.get("id") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => String::new(),
                },
                name: match str_field(p, "name") {
                    "" => slug.clone(),
                    n => n.to_string(),
                },
                platform: str_field(p, "platform").to_string(),
                status: match str_field(p, "status") {
                    "" => "active".to_string(),
                    s => s.to_string(),
                },
                slug,
            }
        })
        .collect()
}

/// URL of the next page from a `Link` header. Sentry always advertises a
/// `next` link and marks the end with `results="false"`.
pub fn next_page(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        let (url, params) = part.trim().split_once(';')?;
        if !params.contains("rel=\"next\"") || params.contains("results=\"false\"") {
            return None;
        }
        Some(url.trim().trim_start_matches('<').trim_end_matches('>').to_string())
    })
}

/// Map a non-success response onto the tracker error taxonomy.
pub fn status_error(status: u16, body: &str, retry_after: Option<&str>) -> TrackerError {
    match status {
        401 | 403 => TrackerError::Unauthorized,
        404 => TrackerError::NotFound(truncate(body, 200)),
        429 => TrackerError::RateLimited {
            retry_after_s: retry_after.and_then(|v| v.trim().parse().ok()),
        },
        _ => TrackerError::Http {
            status,
            body: truncate(body, 200),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let head: String = s.chars().take(max).collect();
    format!("{head}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use solver_core::Language;

    #[test]
    fn query_mirrors_filter() {
        let f = IssueFilter {
            min_severity: Some(Severity::Error),
            environments: Some(vec!["production".into(), "staging".into()]),
            min_occurrences: 5,
            max_age_days: Some(30),
        };
        assert_eq!(
            build_query(&f),
            "is:unresolved (level:error OR level:fatal) \
             (environment:production OR environment:staging) times_seen:>=5 lastSeen:-30d"
        );
    }

    #[test]
    fn open_filter_only_asks_for_unresolved() {
        let f = IssueFilter {
            min_occurrences: 1,
            ..Default::default()
        };
        assert_eq!(build_query(&f), "is:unresolved");

        let f = IssueFilter {
            min_severity: Some(Severity::Fatal),
            environments: Some(vec!["production".into()]),
            ..Default::default()
        };
        assert_eq!(build_query(&f), "is:unresolved level:fatal environment:production");
    }

    #[test]
    fn preselect_caps_before_events_are_fetched() {
        let entries: Vec<Issue> = (0..40)
            .map(|n| {
                parse_issue(
                    "web",
                    &json!({
                        "id": n.to_string(),
                        "title": "KeyError: 'user'",
                        "level": "error",
                        "count": n,
                        "lastSeen": format!("2024-03-{:02}T10:00:00Z", n % 28 + 1),
                    }),
                )
                .unwrap()
            })
            .collect();
        let f = IssueFilter {
            environments: Some(vec!["production".into()]),
            min_occurrences: 10,
            ..Default::default()
        };
        let now = "2024-04-01T00:00:00Z".parse().unwrap();
        let picked = preselect(&f, entries, now, 5);
        assert_eq!(picked.len(), 5);
        assert!(picked.iter().all(|i| i.count >= 10 && i.environment.is_none()));
    }

    #[test]
    fn issue_from_list_entry() {
        let v = json!({
            "id": "12345",
            "title": "BadRequestException: invalid payload",
            "culprit": "App\\Services\\Audit::log",
            "permalink": "https://acme.sentry.io/issues/12345/",
            "level": "error",
            "status": "unresolved",
            "count": "15",
            "firstSeen": "2024-03-01T10:00:00Z",
            "lastSeen": "2024-03-09T14:05:07.123Z",
            "metadata": {"type": "BadRequestException", "value": "invalid payload"}
        });
        let issue = parse_issue("web", &v).unwrap();
        assert_eq!(issue.id, "12345");
        assert_eq!(issue.project, "web");
        assert_eq!(issue.count, 15);
        assert_eq!(issue.exception, "BadRequestException");
        assert_eq!(issue.message, "invalid payload");
        assert_eq!(issue.level, Severity::Error);
        assert!(issue.first_seen < issue.last_seen);
    }

    #[test]
    fn title_fills_missing_metadata() {
        let v = json!({"id": "9", "title": "KeyError: 'user'", "count": 3, "level": "warning"});
        let issue = parse_issue("web", &v).unwrap();
        assert_eq!(issue.exception, "KeyError");
        assert_eq!(issue.message, "'user'");
        assert_eq!(issue.count, 3);
        assert_eq!(issue.level, Severity::Warning);
        assert!(parse_issue("web", &json!({"title": "x"})).is_err());
    }

    #[test]
    fn event_supplies_in_app_frame() {
        let mut issue = parse_issue("web", &json!({"id": "1", "title": "KeyError: 'user'"})).unwrap();
        let event = json!({
            "tags": [{"key": "level", "value": "error"}, {"key": "environment", "value": "production"}],
            "entries": [{
                "type": "exception",
                "data": {"values": [{
                    "type": "KeyError",
                    "value": "'user'",
                    "stacktrace": {"frames": [
                        {"filename": "src/views.py", "absPath": "/app/src/views.py", "lineNo": 12,
                         "function": "handle", "inApp": true,
                         "context": [[11, "def handle(payload):"], [12, "    name = payload['user']"]]},
                        {"filename": "django/core/handlers.py", "lineNo": 80,
                         "function": "dispatch", "inApp": false,
                         "contextLine": "    return view(request)"}
                    ]}
                }]}
            }]
        });
        apply_event(&mut issue, &event);

        assert_eq!(issue.environment.as_deref(), Some("production"));
        let frame = issue.frame.expect("frame");
        assert_eq!(frame.file, "/app/src/views.py");
        assert_eq!(frame.line, 12);
        assert_eq!(frame.language, Language::Python);
        assert_eq!(frame.context_line.as_deref(), Some("    name = payload['user']"));
        let trace = issue.stack_trace.expect("trace");
        assert!(trace.starts_with("KeyError: 'user'\n  at dispatch"));
    }

    #[test]
    fn event_without_exception_keeps_issue() {
        let mut issue = parse_issue("web", &json!({"id": "1", "title": "Timeout"})).unwrap();
        apply_event(&mut issue, &json!({"entries": [{"type": "message", "data": {}}]}));
        assert!(issue.frame.is_none());
        assert!(issue.stack_trace.is_none());
    }

    #[test]
    fn projects_need_a_slug() {
        let page = json!([
            {"id": "1", "slug": "web", "name": "Web", "platform": "php", "status": null},
            {"id": 2, "slug": "", "name": "Broken"},
            {"id": 3, "slug": "api"}
        ]);
        let projects = parse_projects(&page);
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[0].status, "active");
        assert_eq!(projects[1].id, "3");
        assert_eq!(projects[1].name, "api");
    }

    #[test]
    fn link_header_pagination() {
        let more = r#"<https://sentry.io/api/0/organizations/acme/projects/?&cursor=0:0:1>; rel="previous"; results="false"; cursor="0:0:1", <https://sentry.io/api/0/organizations/acme/projects/?&cursor=0:100:0>; rel="next"; results="true"; cursor="0:100:0""#;
        assert_eq!(
            next_page(more).as_deref(),
            Some("https://sentry.io/api/0/organizations/acme/projects/?&cursor=0:100:0")
        );
        let done = r#"<https://sentry.io/x?cursor=a>; rel="previous"; results="true", <https://sentry.io/x?cursor=b>; rel="next"; results="false""#;
        assert!(next_page(done).is_none());
    }

    #[test]
    fn statuses_map_to_distinct_errors() {
        assert!(matches!(status_error(401, "", None), TrackerError::Unauthorized));
        assert!(matches!(status_error(403, "", None), TrackerError::Unauthorized));
        assert!(matches!(status_error(404, "gone", None), TrackerError::NotFound(_)));
        assert!(matches!(
            status_error(429, "", Some("30")),
            TrackerError::RateLimited { retry_after_s: Some(30) }
        ));
        let e = status_error(503, "down", None);
        assert!(matches!(e, TrackerError::Http { status: 503, .. }));
        assert!(e.is_transient());
    }
}
