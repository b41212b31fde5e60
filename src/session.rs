//! Session state and its on-disk store.
//!
//! A [`Session`] is an explicit object passed into each pipeline call:
//! conversation history, the names of ingested documents, and the
//! session's vector index. Nothing lives in ambient globals, and every
//! durable artifact is namespaced by session id: transcripts under
//! `sessions/<id>.json`, index snapshots under `indexes/<id>.sqlite`,
//! saved reports under `reports/<id>.json`. One session can never
//! observe another's uploads.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::index::VectorIndex;
use crate::models::{ConversationTurn, Role};

/// Live state for one user session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Append-only conversation history, strictly ordered by arrival.
    pub history: Vec<ConversationTurn>,
    /// Names of documents ingested into this session's index.
    pub documents: Vec<String>,
    pub index: Option<VectorIndex>,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            history: Vec::new(),
            documents: Vec::new(),
            index: None,
        }
    }

    pub fn append_turn(&mut self, role: Role, content: impl Into<String>) {
        self.history.push(ConversationTurn::new(role, content));
    }

    /// Clear history, documents, and the index. The on-disk snapshot is
    /// removed separately by [`SessionStore::reset`].
    pub fn reset(&mut self) {
        self.history.clear();
        self.documents.clear();
        self.index = None;
    }

    pub fn has_index_content(&self) -> bool {
        self.index.as_ref().map(|ix| !ix.is_empty()).unwrap_or(false)
    }

    pub fn record_document(&mut self, name: &str) {
        if !self.documents.iter().any(|d| d == name) {
            self.documents.push(name.to_string());
        }
    }
}

/// Serialized transcript: one flat file per saved session.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub saved_at: DateTime<Utc>,
    pub documents: Vec<String>,
    pub turns: Vec<ConversationTurn>,
}

/// Listing row for `nexus sessions list`.
#[derive(Debug)]
pub struct SessionSummary {
    pub id: String,
    pub saved_at: DateTime<Utc>,
    pub documents: usize,
    pub turns: usize,
}

/// A saved audit or comparison report.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub body: String,
}

impl ReportRecord {
    pub fn new(kind: &str, title: impl Into<String>, body: impl Into<String>) -> Self {
        // Short id in the archive style: AUD-3f2a, CMP-91c0.
        let prefix = match kind {
            "audit" => "AUD",
            "compare" => "CMP",
            _ => "RPT",
        };
        let suffix = &Uuid::new_v4().simple().to_string()[..4];
        Self {
            id: format!("{}-{}", prefix, suffix),
            kind: kind.to_string(),
            title: title.into(),
            created_at: Utc::now(),
            body: body.into(),
        }
    }
}

/// Per-session namespaced storage rooted at the configured data dir.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("indexes")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    /// Create the storage layout. Idempotent.
    pub fn init(&self) -> Result<()> {
        std::fs::create_dir_all(self.sessions_dir())?;
        std::fs::create_dir_all(self.indexes_dir())?;
        std::fs::create_dir_all(self.reports_dir())?;
        Ok(())
    }

    pub fn session_path(&self, id: &str) -> PathBuf {
        self.sessions_dir().join(format!("{}.json", id))
    }

    pub fn index_path(&self, id: &str) -> PathBuf {
        self.indexes_dir().join(format!("{}.sqlite", id))
    }

    fn report_path(&self, id: &str) -> PathBuf {
        self.reports_dir().join(format!("{}.json", id))
    }

    /// Write the session transcript as one JSON file.
    pub fn save_transcript(&self, session: &Session) -> Result<()> {
        validate_id(&session.id)?;
        self.init()?;
        let record = SessionRecord {
            id: session.id.clone(),
            created_at: session.created_at,
            saved_at: Utc::now(),
            documents: session.documents.clone(),
            turns: session.history.clone(),
        };
        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(self.session_path(&session.id), json)
            .with_context(|| format!("Failed to write session {}", session.id))?;
        Ok(())
    }

    /// Snapshot the session's index (no-op when there is none).
    pub async fn persist_index(&self, session: &Session) -> Result<()> {
        validate_id(&session.id)?;
        if let Some(ref index) = session.index {
            index.persist(&self.index_path(&session.id)).await?;
        }
        Ok(())
    }

    /// Load a session by id, restoring its transcript and index
    /// snapshot. An unknown id yields a fresh session; a corrupt or
    /// dimension-mismatched snapshot is an error, not a silent fallback.
    pub async fn load(&self, id: &str) -> Result<Session> {
        validate_id(id)?;
        let mut session = match self.read_record(id)? {
            Some(record) => Session {
                id: record.id,
                created_at: record.created_at,
                history: record.turns,
                documents: record.documents,
                index: None,
            },
            None => Session::new(id),
        };

        let index_path = self.index_path(id);
        if index_path.exists() {
            session.index = Some(VectorIndex::load(&index_path).await?);
        }

        Ok(session)
    }

    fn read_record(&self, id: &str) -> Result<Option<SessionRecord>> {
        let path = self.session_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session {}", id))?;
        let record: SessionRecord = serde_json::from_str(&content)
            .with_context(|| format!("Session file is corrupt: {}", path.display()))?;
        Ok(Some(record))
    }

    /// List saved sessions, most recently saved first.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut summaries = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match std::fs::read_to_string(&path) {
                Ok(c) => c,
                Err(_) => continue,
            };
            if let Ok(record) = serde_json::from_str::<SessionRecord>(&content) {
                summaries.push(SessionSummary {
                    id: record.id,
                    saved_at: record.saved_at,
                    documents: record.documents.len(),
                    turns: record.turns.len(),
                });
            }
        }
        summaries.sort_by(|a, b| b.saved_at.cmp(&a.saved_at));
        Ok(summaries)
    }

    /// Destroy a session: transcript and index snapshot are removed.
    pub fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        remove_if_exists(&self.session_path(id))?;
        self.remove_index_files(id)?;
        Ok(())
    }

    /// Reset a session in place: clear its live state, drop the index
    /// snapshot, and rewrite the (now empty) transcript.
    pub fn reset(&self, session: &mut Session) -> Result<()> {
        session.reset();
        self.remove_index_files(&session.id)?;
        self.save_transcript(session)?;
        Ok(())
    }

    fn remove_index_files(&self, id: &str) -> Result<()> {
        let index_path = self.index_path(id);
        remove_if_exists(&index_path)?;
        // WAL sidecar files from the SQLite snapshot.
        remove_if_exists(&index_path.with_extension("sqlite-wal"))?;
        remove_if_exists(&index_path.with_extension("sqlite-shm"))?;
        Ok(())
    }

    pub fn save_report(&self, report: &ReportRecord) -> Result<()> {
        self.init()?;
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(self.report_path(&report.id), json)
            .with_context(|| format!("Failed to write report {}", report.id))?;
        Ok(())
    }

    pub fn load_report(&self, id: &str) -> Result<ReportRecord> {
        let path = self.report_path(id);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Report not found: {}", id))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// List saved reports, newest first.
    pub fn list_reports(&self) -> Result<Vec<ReportRecord>> {
        let dir = self.reports_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut reports = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                if let Ok(report) = serde_json::from_str::<ReportRecord>(&content) {
                    reports.push(report);
                }
            }
        }
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(reports)
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

/// Session ids become file names; restrict them to a path-safe alphabet.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 64 {
        bail!("session id must be 1-64 characters");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        bail!("session id may only contain letters, digits, '-', '_', '.'");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let tmp = TempDir::new().unwrap();
        let store = SessionStore::new(tmp.path());
        store.init().unwrap();
        (tmp, store)
    }

    #[tokio::test]
    async fn transcript_roundtrip() {
        let (_tmp, store) = store();
        let mut session = Session::new("alpha");
        session.record_document("contract.pdf");
        session.append_turn(Role::User, "what is the refund policy?");
        session.append_turn(Role::Assistant, "Refunds are available within 30 days.");
        store.save_transcript(&session).unwrap();

        let loaded = store.load("alpha").await.unwrap();
        assert_eq!(loaded.id, "alpha");
        assert_eq!(loaded.documents, vec!["contract.pdf"]);
        assert_eq!(loaded.history.len(), 2);
        assert_eq!(loaded.history[0].content, "what is the refund policy?");
        assert_eq!(loaded.history[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn unknown_id_yields_fresh_session() {
        let (_tmp, store) = store();
        let session = store.load("brand-new").await.unwrap();
        assert!(session.history.is_empty());
        assert!(session.index.is_none());
    }

    #[tokio::test]
    async fn reset_clears_state_and_snapshot() {
        let (_tmp, store) = store();
        let mut session = Session::new("beta");
        session.append_turn(Role::User, "hello");
        session.index = Some(crate::index::VectorIndex::new("m", 2));
        store.save_transcript(&session).unwrap();
        store.persist_index(&session).await.unwrap();
        assert!(store.index_path("beta").exists());

        store.reset(&mut session).unwrap();
        assert!(session.history.is_empty());
        assert!(session.index.is_none());
        assert!(!store.index_path("beta").exists());

        let loaded = store.load("beta").await.unwrap();
        assert!(loaded.history.is_empty());
    }

    #[tokio::test]
    async fn delete_removes_all_session_files() {
        let (_tmp, store) = store();
        let mut session = Session::new("gamma");
        session.append_turn(Role::User, "hi");
        store.save_transcript(&session).unwrap();
        assert!(store.session_path("gamma").exists());

        store.delete("gamma").unwrap();
        assert!(!store.session_path("gamma").exists());

        let listed = store.list().unwrap();
        assert!(listed.iter().all(|s| s.id != "gamma"));
    }

    #[test]
    fn list_orders_by_save_time() {
        let (_tmp, store) = store();
        let mut first = Session::new("first");
        first.append_turn(Role::User, "a");
        store.save_transcript(&first).unwrap();
        let second = Session::new("second");
        store.save_transcript(&second).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, "second");
        assert_eq!(listed[1].turns, 1);
    }

    #[test]
    fn invalid_ids_rejected() {
        let (_tmp, store) = store();
        let session = Session::new("../escape");
        assert!(store.save_transcript(&session).is_err());
        assert!(store.delete("a/b").is_err());
    }

    #[test]
    fn report_roundtrip_and_ordering() {
        let (_tmp, store) = store();
        let audit = ReportRecord::new("audit", "contract.pdf", "Findings ...");
        store.save_report(&audit).unwrap();
        let compare = ReportRecord::new("compare", "a.pdf vs b.pdf", "Differences ...");
        store.save_report(&compare).unwrap();

        let loaded = store.load_report(&audit.id).unwrap();
        assert_eq!(loaded.body, "Findings ...");
        assert!(audit.id.starts_with("AUD-"));
        assert!(compare.id.starts_with("CMP-"));

        let listed = store.list_reports().unwrap();
        assert_eq!(listed.len(), 2);
    }

    #[test]
    fn session_reset_clears_live_state() {
        let mut session = Session::new("x");
        session.append_turn(Role::User, "q");
        session.record_document("d.pdf");
        session.record_document("d.pdf");
        assert_eq!(session.documents.len(), 1);
        session.reset();
        assert!(session.history.is_empty());
        assert!(session.documents.is_empty());
        assert!(!session.has_index_content());
    }
}
