use crate::{ExportRecord, Ledger, LedgerError, ProjectCounts};
use chrono::{DateTime, Utc};
use models::ExportState;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::time::Duration;

/// Connection attempts before database loss becomes fatal.
const CONNECT_ATTEMPTS: u32 = 5;

/// Connect to the ledger database and apply pending migrations (unless
/// skipped). Connection failures are retried with capped backoff and only
/// surface (fatally) once the retry budget is spent. Migrations are
/// forward-only.
pub async fn connect(dsn: &str, skip_migrations: bool) -> Result<PgPool, LedgerError> {
    let backoff = exponential_backoff::Backoff::new(
        CONNECT_ATTEMPTS,
        Duration::from_millis(500),
        Some(Duration::from_secs(10)),
    );

    let mut attempt = 0;
    let pool = loop {
        attempt += 1;
        match PgPoolOptions::new().max_connections(8).connect(dsn).await {
            Ok(pool) => break pool,
            Err(err) => match backoff.next(attempt) {
                Some(delay) if attempt < CONNECT_ATTEMPTS => {
                    tracing::warn!(attempt, error = %err, "database connection failed, backing off");
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(LedgerError::Db(err)),
            },
        }
    };

    if skip_migrations {
        tracing::warn!("skipping ledger schema migrations");
    } else {
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|err| LedgerError::Corrupt(format!("migration failed: {err}")))?;
    }
    Ok(pool)
}

pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        PgLedger { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ExportRow {
    project_slug: String,
    source_study_uid: String,
    anon_study_uid: Option<String>,
    pseudo_patient_id: Option<String>,
    state: String,
    error: Option<String>,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl TryFrom<ExportRow> for ExportRecord {
    type Error = LedgerError;

    fn try_from(row: ExportRow) -> Result<Self, LedgerError> {
        let state = row
            .state
            .parse::<ExportState>()
            .map_err(LedgerError::Corrupt)?;
        Ok(ExportRecord {
            project_slug: row.project_slug,
            source_study_uid: row.source_study_uid,
            anon_study_uid: row.anon_study_uid,
            pseudo_patient_id: row.pseudo_patient_id,
            state,
            error: row.error,
            created: row.created,
            updated: row.updated,
        })
    }
}

const SELECT_ROW: &str = r#"
    SELECT project_slug, source_study_uid, anon_study_uid, pseudo_patient_id,
           state, error, created, updated
    FROM export
    WHERE project_slug = $1 AND source_study_uid = $2
"#;

#[async_trait::async_trait]
impl Ledger for PgLedger {
    async fn get(&self, project: &str, key: &str) -> Result<Option<ExportRecord>, LedgerError> {
        let row: Option<ExportRow> = sqlx::query_as(SELECT_ROW)
            .bind(project)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ExportRecord::try_from).transpose()
    }

    async fn ensure_pending(&self, project: &str, key: &str) -> Result<ExportRecord, LedgerError> {
        sqlx::query(
            r#"
            INSERT INTO export (project_slug, source_study_uid, state)
            VALUES ($1, $2, 'pending')
            ON CONFLICT (project_slug, source_study_uid) DO NOTHING
            "#,
        )
        .bind(project)
        .bind(key)
        .execute(&self.pool)
        .await?;

        self.get(project, key).await?.ok_or_else(|| LedgerError::Missing {
            project: project.to_string(),
            key: key.to_string(),
        })
    }

    async fn transition(
        &self,
        project: &str,
        key: &str,
        from: ExportState,
        to: ExportState,
        error: Option<&str>,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE export
            SET state = $1, error = $2, updated = now()
            WHERE project_slug = $3 AND source_study_uid = $4 AND state = $5
            "#,
        )
        .bind(to.as_str())
        .bind(error)
        .bind(project)
        .bind(key)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(project, key).await? {
            None => Err(LedgerError::Missing {
                project: project.to_string(),
                key: key.to_string(),
            }),
            Some(actual) => Err(LedgerError::Conflict {
                project: project.to_string(),
                key: key.to_string(),
                expected: from,
                actual: actual.state,
            }),
        }
    }

    async fn record_anonymised(
        &self,
        project: &str,
        key: &str,
        anon_study_uid: &str,
        pseudo_patient_id: &str,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE export
            SET state = 'anonymised', anon_study_uid = $1, pseudo_patient_id = $2,
                error = NULL, updated = now()
            WHERE project_slug = $3 AND source_study_uid = $4 AND state = 'pending'
            "#,
        )
        .bind(anon_study_uid)
        .bind(pseudo_patient_id)
        .bind(project)
        .bind(key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(project, key).await? {
            None => Err(LedgerError::Missing {
                project: project.to_string(),
                key: key.to_string(),
            }),
            Some(actual) => Err(LedgerError::Conflict {
                project: project.to_string(),
                key: key.to_string(),
                expected: ExportState::Pending,
                actual: actual.state,
            }),
        }
    }

    async fn counts(&self) -> Result<Vec<ProjectCounts>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT project_slug, state, COUNT(*) AS total
            FROM export
            GROUP BY project_slug, state
            ORDER BY project_slug
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut all: Vec<ProjectCounts> = Vec::new();
        for row in rows {
            let project: String = row.try_get("project_slug")?;
            let state: String = row.try_get("state")?;
            let total: i64 = row.try_get("total")?;

            if all.last().map(|c| c.project_slug.as_str()) != Some(project.as_str()) {
                all.push(ProjectCounts {
                    project_slug: project.clone(),
                    ..Default::default()
                });
            }
            let counts = all.last_mut().expect("just pushed");
            match state.parse::<ExportState>().map_err(LedgerError::Corrupt)? {
                ExportState::Pending => counts.pending = total,
                ExportState::Anonymised => counts.anonymised = total,
                ExportState::Exported => counts.exported = total,
                ExportState::Failed => counts.failed = total,
            }
        }
        Ok(all)
    }
}
