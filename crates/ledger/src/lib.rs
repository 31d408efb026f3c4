//! The export ledger: relational persistence of per-(project, study)
//! export state. Transitions are optimistic compare-and-set on the state
//! column; a CAS miss surfaces as `LedgerError::Conflict` and the caller
//! decides whether that means duplicate work or a real race.

use chrono::{DateTime, Utc};
use models::ExportState;
use std::collections::HashMap;
use std::sync::Mutex;

mod postgres;
pub use postgres::{connect, PgLedger};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("no ledger row for ({project}, {key})")]
    Missing { project: String, key: String },
    #[error("state of ({project}, {key}) is {actual}, expected {expected}")]
    Conflict {
        project: String,
        key: String,
        expected: ExportState,
        actual: ExportState,
    },
    #[error("database failure")]
    Db(#[from] sqlx::Error),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub project_slug: String,
    pub source_study_uid: String,
    pub anon_study_uid: Option<String>,
    pub pseudo_patient_id: Option<String>,
    pub state: ExportState,
    pub error: Option<String>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Per-project tallies for the CLI status surface.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectCounts {
    pub project_slug: String,
    pub pending: i64,
    pub anonymised: i64,
    pub exported: i64,
    pub failed: i64,
}

#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, project: &str, key: &str) -> Result<Option<ExportRecord>, LedgerError>;

    /// Create the row as `pending` if absent; return the current row either
    /// way.
    async fn ensure_pending(&self, project: &str, key: &str) -> Result<ExportRecord, LedgerError>;

    /// Compare-and-set the state, recording an error string for failures.
    async fn transition(
        &self,
        project: &str,
        key: &str,
        from: ExportState,
        to: ExportState,
        error: Option<&str>,
    ) -> Result<(), LedgerError>;

    /// `pending` -> `anonymised`, recording the anonymised study UID and
    /// pseudonymised patient ID alongside.
    async fn record_anonymised(
        &self,
        project: &str,
        key: &str,
        anon_study_uid: &str,
        pseudo_patient_id: &str,
    ) -> Result<(), LedgerError>;

    async fn counts(&self) -> Result<Vec<ProjectCounts>, LedgerError>;
}

/// In-memory ledger with the same CAS semantics; backs tests.
#[derive(Default)]
pub struct MemoryLedger {
    rows: Mutex<HashMap<(String, String), ExportRecord>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, project: &str, key: &str) -> Result<Option<ExportRecord>, LedgerError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows.get(&(project.to_string(), key.to_string())).cloned())
    }

    async fn ensure_pending(&self, project: &str, key: &str) -> Result<ExportRecord, LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        let now = Utc::now();
        let record = rows
            .entry((project.to_string(), key.to_string()))
            .or_insert_with(|| ExportRecord {
                project_slug: project.to_string(),
                source_study_uid: key.to_string(),
                anon_study_uid: None,
                pseudo_patient_id: None,
                state: ExportState::Pending,
                error: None,
                created: now,
                updated: now,
            });
        Ok(record.clone())
    }

    async fn transition(
        &self,
        project: &str,
        key: &str,
        from: ExportState,
        to: ExportState,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        let record = rows
            .get_mut(&(project.to_string(), key.to_string()))
            .ok_or_else(|| LedgerError::Missing {
                project: project.to_string(),
                key: key.to_string(),
            })?;
        if record.state != from {
            return Err(LedgerError::Conflict {
                project: project.to_string(),
                key: key.to_string(),
                expected: from,
                actual: record.state,
            });
        }
        record.state = to;
        record.error = error.map(str::to_string);
        record.updated = Utc::now();
        Ok(())
    }

    async fn record_anonymised(
        &self,
        project: &str,
        key: &str,
        anon_study_uid: &str,
        pseudo_patient_id: &str,
    ) -> Result<(), LedgerError> {
        let mut rows = self.rows.lock().unwrap();
        let record = rows
            .get_mut(&(project.to_string(), key.to_string()))
            .ok_or_else(|| LedgerError::Missing {
                project: project.to_string(),
                key: key.to_string(),
            })?;
        if record.state != ExportState::Pending {
            return Err(LedgerError::Conflict {
                project: project.to_string(),
                key: key.to_string(),
                expected: ExportState::Pending,
                actual: record.state,
            });
        }
        record.state = ExportState::Anonymised;
        record.anon_study_uid = Some(anon_study_uid.to_string());
        record.pseudo_patient_id = Some(pseudo_patient_id.to_string());
        record.error = None;
        record.updated = Utc::now();
        Ok(())
    }

    async fn counts(&self) -> Result<Vec<ProjectCounts>, LedgerError> {
        let rows = self.rows.lock().unwrap();
        let mut by_project: HashMap<&str, ProjectCounts> = HashMap::new();
        for record in rows.values() {
            let counts = by_project
                .entry(record.project_slug.as_str())
                .or_insert_with(|| ProjectCounts {
                    project_slug: record.project_slug.clone(),
                    ..Default::default()
                });
            match record.state {
                ExportState::Pending => counts.pending += 1,
                ExportState::Anonymised => counts.anonymised += 1,
                ExportState::Exported => counts.exported += 1,
                ExportState::Failed => counts.failed += 1,
            }
        }
        let mut all: Vec<ProjectCounts> = by_project.into_values().collect();
        all.sort_by(|a, b| a.project_slug.cmp(&b.project_slug));
        Ok(all)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn rows_are_created_pending_exactly_once() {
        let ledger = MemoryLedger::new();
        let first = ledger.ensure_pending("p1", "1.2.3").await.unwrap();
        assert_eq!(first.state, ExportState::Pending);

        ledger
            .transition("p1", "1.2.3", ExportState::Pending, ExportState::Failed, Some("NotFound"))
            .await
            .unwrap();

        // A duplicate message must see the failed row, not reset it.
        let again = ledger.ensure_pending("p1", "1.2.3").await.unwrap();
        assert_eq!(again.state, ExportState::Failed);
        assert_eq!(again.error.as_deref(), Some("NotFound"));
    }

    #[tokio::test]
    async fn cas_misses_conflict() {
        let ledger = MemoryLedger::new();
        ledger.ensure_pending("p1", "k").await.unwrap();
        ledger
            .record_anonymised("p1", "k", "2.9.9", "pseudo")
            .await
            .unwrap();

        let clash = ledger
            .transition("p1", "k", ExportState::Pending, ExportState::Failed, None)
            .await;
        assert!(matches!(clash, Err(LedgerError::Conflict { .. })));

        ledger
            .transition("p1", "k", ExportState::Anonymised, ExportState::Exported, None)
            .await
            .unwrap();
        let record = ledger.get("p1", "k").await.unwrap().unwrap();
        assert_eq!(record.state, ExportState::Exported);
        assert_eq!(record.anon_study_uid.as_deref(), Some("2.9.9"));
    }

    #[tokio::test]
    async fn missing_rows_are_distinguished_from_conflicts() {
        let ledger = MemoryLedger::new();
        let result = ledger
            .transition("p1", "absent", ExportState::Pending, ExportState::Failed, None)
            .await;
        assert!(matches!(result, Err(LedgerError::Missing { .. })));
    }

    #[tokio::test]
    async fn counts_tally_per_project() {
        let ledger = MemoryLedger::new();
        ledger.ensure_pending("p1", "a").await.unwrap();
        ledger.ensure_pending("p1", "b").await.unwrap();
        ledger.ensure_pending("p2", "c").await.unwrap();
        ledger
            .transition("p1", "a", ExportState::Pending, ExportState::Failed, Some("NotFound"))
            .await
            .unwrap();

        let counts = ledger.counts().await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].project_slug, "p1");
        assert_eq!(counts[0].pending, 1);
        assert_eq!(counts[0].failed, 1);
        assert_eq!(counts[1].project_slug, "p2");
        assert_eq!(counts[1].pending, 1);
    }
}
