use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

use crate::types::{
    AppliedFix, FixCandidate, FixRow, ResolutionRecord, ResolutionState, RunSession, RunStatus, RunTrigger,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

pub struct Db {
    conn: Mutex<Connection>,
}

// ── Timestamp helpers ─────────────────────────────────────────────────────

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn parse_ts(s: &str) -> DateTime<Utc> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .map(|ndt| ndt.and_utc())
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.as_deref().map(parse_ts)
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn now_str() -> String {
    fmt_ts(&Utc::now())
}

// ── Row mappers ───────────────────────────────────────────────────────────

const RECORD_COLUMNS: &str = "project, issue_id, state, confidence, pattern_id, branch, \
     commit_hash, attempts, last_error, title, level, occurrences, analyzed_at, applied_at, \
     resolved_at, created_at, updated_at";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<ResolutionRecord> {
    let state: String = row.get(2)?;
    let occurrences: i64 = row.get(11)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;
    Ok(ResolutionRecord {
        project: row.get(0)?,
        issue_id: row.get(1)?,
        state: ResolutionState::parse(&state).unwrap_or(ResolutionState::New),
        confidence: row.get(3)?,
        pattern_id: row.get(4)?,
        branch: row.get(5)?,
        commit_hash: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        title: row.get(9)?,
        level: row.get(10)?,
        occurrences: occurrences.max(0) as u64,
        analyzed_at: parse_opt_ts(row.get(12)?),
        applied_at: parse_opt_ts(row.get(13)?),
        resolved_at: parse_opt_ts(row.get(14)?),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const SESSION_COLUMNS: &str = "id, project, trigger_kind, started_at, ended_at, issues_seen, \
     applied, resolved, skipped, failed, status, error";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunSession> {
    let trigger: String = row.get(2)?;
    let started_at: String = row.get(3)?;
    let status: String = row.get(10)?;
    Ok(RunSession {
        id: row.get(0)?,
        project: row.get(1)?,
        trigger: RunTrigger::parse(&trigger),
        started_at: parse_ts(&started_at),
        ended_at: parse_opt_ts(row.get(4)?),
        issues_seen: row.get(5)?,
        applied: row.get(6)?,
        resolved: row.get(7)?,
        skipped: row.get(8)?,
        failed: row.get(9)?,
        status: RunStatus::parse(&status),
        error: row.get(11)?,
    })
}

fn row_to_fix(row: &rusqlite::Row<'_>) -> rusqlite::Result<FixRow> {
    let created_at: String = row.get(14)?;
    Ok(FixRow {
        id: row.get(0)?,
        project: row.get(1)?,
        issue_id: row.get(2)?,
        pattern_id: row.get(3)?,
        file_path: row.get(4)?,
        line_number: row.get(5)?,
        original_code: row.get(6)?,
        fixed_code: row.get(7)?,
        explanation: row.get(8)?,
        confidence: row.get(9)?,
        branch: row.get(10)?,
        commit_hash: row.get(11)?,
        pr_title: row.get(12)?,
        pr_body: row.get(13)?,
        created_at: parse_ts(&created_at),
    })
}

impl Db {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open SQLite database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&mut self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema migrations")?;

        // ALTER TABLE fails if the column already exists; ignore that error.
        let alters = [
            "ALTER TABLE fixes ADD COLUMN pr_title TEXT NOT NULL DEFAULT ''",
            "ALTER TABLE fixes ADD COLUMN pr_body TEXT NOT NULL DEFAULT ''",
        ];
        for sql in alters {
            let _ = conn.execute(sql, []);
        }
        Ok(())
    }

    // ── Resolution records ────────────────────────────────────────────────

    pub fn get_record(&self, project: &str, issue_id: &str) -> Result<Option<ResolutionRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM resolution_records WHERE project = ?1 AND issue_id = ?2"
        );
        let result = conn
            .query_row(&sql, params![project, issue_id], row_to_record)
            .optional()
            .context("get_record")?;
        Ok(result)
    }

    pub fn upsert_record(&self, record: &ResolutionRecord) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO resolution_records (project, issue_id, state, confidence, pattern_id, \
             branch, commit_hash, attempts, last_error, title, level, occurrences, analyzed_at, \
             applied_at, resolved_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17) \
             ON CONFLICT(project, issue_id) DO UPDATE SET \
             state = excluded.state, confidence = excluded.confidence, \
             pattern_id = excluded.pattern_id, branch = excluded.branch, \
             commit_hash = excluded.commit_hash, attempts = excluded.attempts, \
             last_error = excluded.last_error, title = excluded.title, level = excluded.level, \
             occurrences = excluded.occurrences, analyzed_at = excluded.analyzed_at, \
             applied_at = excluded.applied_at, resolved_at = excluded.resolved_at, \
             updated_at = excluded.updated_at",
            params![
                record.project,
                record.issue_id,
                record.state.as_str(),
                record.confidence,
                record.pattern_id,
                record.branch,
                record.commit_hash,
                record.attempts,
                record.last_error,
                record.title,
                record.level,
                i64::try_from(record.occurrences).unwrap_or(i64::MAX),
                record.analyzed_at.as_ref().map(fmt_ts),
                record.applied_at.as_ref().map(fmt_ts),
                record.resolved_at.as_ref().map(fmt_ts),
                fmt_ts(&record.created_at),
                fmt_ts(&record.updated_at),
            ],
        )
        .with_context(|| format!("upsert_record {}/{}", record.project, record.issue_id))?;
        Ok(())
    }

    /// Records for a project, most recently updated first.
    pub fn list_records(&self, project: &str) -> Result<Vec<ResolutionRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM resolution_records WHERE project = ?1 \
             ORDER BY updated_at DESC, issue_id"
        );
        let mut stmt = conn.prepare(&sql).context("list_records prepare")?;
        let rows = stmt
            .query_map(params![project], row_to_record)
            .context("list_records")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_records row")?;
        Ok(rows)
    }

    /// Number of records per state for a project.
    pub fn record_counts(&self, project: &str) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT state, COUNT(*) FROM resolution_records WHERE project = ?1 \
                 GROUP BY state ORDER BY state",
            )
            .context("record_counts prepare")?;
        let rows = stmt
            .query_map(params![project], |row| Ok((row.get(0)?, row.get(1)?)))
            .context("record_counts")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("record_counts row")?;
        Ok(rows)
    }

    // ── Fixes ─────────────────────────────────────────────────────────────

    pub fn insert_fix(
        &self,
        project: &str,
        candidate: &FixCandidate,
        applied: &AppliedFix,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO fixes (project, issue_id, pattern_id, file_path, line_number, \
             original_code, fixed_code, explanation, confidence, branch, commit_hash, \
             pr_title, pr_body, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                project,
                candidate.issue_id,
                candidate.pattern_id,
                applied.file,
                candidate.line,
                candidate.original,
                candidate.replacement,
                candidate.explanation,
                candidate.confidence,
                applied.branch,
                applied.commit,
                applied.pr_title,
                applied.pr_body,
                now_str(),
            ],
        )
        .context("insert_fix")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_fixes(&self, project: &str, issue_id: &str) -> Result<Vec<FixRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn
            .prepare(
                "SELECT id, project, issue_id, pattern_id, file_path, line_number, original_code, \
                 fixed_code, explanation, confidence, branch, commit_hash, pr_title, pr_body, \
                 created_at FROM fixes WHERE project = ?1 AND issue_id = ?2 ORDER BY id DESC",
            )
            .context("list_fixes prepare")?;
        let rows = stmt
            .query_map(params![project, issue_id], row_to_fix)
            .context("list_fixes")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_fixes row")?;
        Ok(rows)
    }

    // ── Run sessions ──────────────────────────────────────────────────────

    /// Persist a finished session. Returns its id.
    pub fn record_run_session(&self, session: &RunSession) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO run_sessions (project, trigger_kind, started_at, ended_at, issues_seen, \
             applied, resolved, skipped, failed, status, error) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                session.project,
                session.trigger.as_str(),
                fmt_ts(&session.started_at),
                session.ended_at.as_ref().map(fmt_ts),
                session.issues_seen,
                session.applied,
                session.resolved,
                session.skipped,
                session.failed,
                session.status.as_str(),
                session.error,
            ],
        )
        .context("record_run_session")?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn list_sessions(&self, project: &str, limit: i64) -> Result<Vec<RunSession>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM run_sessions WHERE project = ?1 ORDER BY id DESC LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql).context("list_sessions prepare")?;
        let rows = stmt
            .query_map(params![project, limit], row_to_session)
            .context("list_sessions")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_sessions row")?;
        Ok(rows)
    }

    pub fn latest_session(&self, project: &str) -> Result<Option<RunSession>> {
        Ok(self.list_sessions(project, 1)?.into_iter().next())
    }

    // ── Config ────────────────────────────────────────────────────────────

    pub fn get_config(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("get_config")?;
        Ok(result)
    }

    /// Insert `key` only if it has no value yet.
    pub fn seed_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, now_str()],
        )
        .context("seed_config")?;
        Ok(())
    }

    pub fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now_str()],
        )
        .context("set_config")?;
        Ok(())
    }
}
