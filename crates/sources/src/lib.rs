//! Query/retrieve client for one DICOM source (primary or secondary).
//!
//! Wraps C-ECHO, C-FIND and C-MOVE as issued through the raw store's
//! modality gateway, adding per-operation timeouts, capped exponential
//! backoff with jitter, and a per-source circuit breaker. While the breaker
//! is open requests fail fast so the scheduler can route to the fallback
//! queue instead of queueing work behind a dead source.

use models::{SourceKind, StudyQuery};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stores::{DicomStore, Level, StoreError};
use tokio_util::sync::CancellationToken;

mod breaker;
pub use breaker::CircuitBreaker;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("circuit open for {0} source")]
    CircuitOpen(SourceKind),
    #[error("{operation} against {kind} source timed out after {after:?}")]
    Timeout {
        kind: SourceKind,
        operation: &'static str,
        after: Duration,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("operation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// The modality alias the raw store knows this source by.
    pub modality: String,
    pub query_timeout: Duration,
    pub transfer_timeout: Duration,
    /// Attempts per operation, including the first.
    pub max_attempts: u32,
    pub breaker_threshold: u32,
    pub breaker_cooldown: Duration,
}

impl SourceConfig {
    pub fn new(kind: SourceKind, modality: impl Into<String>) -> Self {
        SourceConfig {
            kind,
            modality: modality.into(),
            query_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(600),
            max_attempts: 3,
            breaker_threshold: 5,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}

/// A study matched by C-FIND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundStudy {
    pub study_uid: String,
    /// Instance count advertised by the source, when reported.
    pub expected_instances: Option<u32>,
}

pub struct SourceClient {
    store: Arc<dyn DicomStore>,
    config: SourceConfig,
    breaker: CircuitBreaker,
}

impl SourceClient {
    pub fn new(store: Arc<dyn DicomStore>, config: SourceConfig) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold, config.breaker_cooldown);
        SourceClient {
            store,
            config,
            breaker,
        }
    }

    pub fn kind(&self) -> SourceKind {
        self.config.kind
    }

    pub async fn echo(&self, cancel: &CancellationToken) -> Result<(), SourceError> {
        self.with_retry("C-ECHO", self.config.query_timeout, cancel, || {
            self.store.echo(&self.config.modality)
        })
        .await
    }

    /// Study-level C-FIND. An empty result is a miss, not an error.
    pub async fn find_study(
        &self,
        query: &StudyQuery,
        cancel: &CancellationToken,
    ) -> Result<Vec<FoundStudy>, SourceError> {
        let identifier = identifier_for(query);
        let answers = self
            .with_retry("C-FIND", self.config.query_timeout, cancel, || {
                self.store
                    .query(&self.config.modality, Level::Study, &identifier)
            })
            .await?;

        let mut found: Vec<FoundStudy> = answers
            .iter()
            .filter_map(|answer| {
                let study_uid = answer.study_instance_uid()?.to_string();
                Some(FoundStudy {
                    study_uid,
                    expected_instances: answer.number_of_instances(),
                })
            })
            .collect();
        found.sort_by(|a, b| a.study_uid.cmp(&b.study_uid));
        found.dedup_by(|a, b| a.study_uid == b.study_uid);
        Ok(found)
    }

    /// Image-level C-FIND: the SOPInstanceUIDs the source holds for a study.
    pub async fn find_instance_uids(
        &self,
        study_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, SourceError> {
        let identifier = BTreeMap::from([
            ("StudyInstanceUID".to_string(), study_uid.to_string()),
            ("SOPInstanceUID".to_string(), String::new()),
        ]);
        let answers = self
            .with_retry("C-FIND", self.config.query_timeout, cancel, || {
                self.store
                    .query(&self.config.modality, Level::Instance, &identifier)
            })
            .await?;
        Ok(answers
            .iter()
            .filter_map(|answer| answer.get("SOPInstanceUID").map(str::to_string))
            .collect())
    }

    /// Study-level C-MOVE into the raw cache.
    pub async fn retrieve_study(
        &self,
        study_uid: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        let keys = BTreeMap::from([("StudyInstanceUID".to_string(), study_uid.to_string())]);
        self.with_retry("C-MOVE", self.config.transfer_timeout, cancel, || {
            self.store.retrieve(&self.config.modality, Level::Study, &keys)
        })
        .await
    }

    /// Image-level C-MOVE of specific instances; used for repair.
    pub async fn retrieve_instances(
        &self,
        study_uid: &str,
        sop_uids: &[String],
        cancel: &CancellationToken,
    ) -> Result<(), SourceError> {
        for sop_uid in sop_uids {
            let keys = BTreeMap::from([
                ("StudyInstanceUID".to_string(), study_uid.to_string()),
                ("SOPInstanceUID".to_string(), sop_uid.clone()),
            ]);
            self.with_retry("C-MOVE", self.config.transfer_timeout, cancel, || {
                self.store
                    .retrieve(&self.config.modality, Level::Instance, &keys)
            })
            .await?;
        }
        Ok(())
    }

    async fn with_retry<T, F, Fut>(
        &self,
        operation: &'static str,
        timeout: Duration,
        cancel: &CancellationToken,
        run: F,
    ) -> Result<T, SourceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
    {
        if !self.breaker.allow() {
            return Err(SourceError::CircuitOpen(self.config.kind));
        }

        let backoff = exponential_backoff::Backoff::new(
            self.config.max_attempts,
            Duration::from_millis(250),
            Some(Duration::from_secs(10)),
        );

        let mut attempt = 0;
        loop {
            attempt += 1;

            let outcome = tokio::select! {
                () = cancel.cancelled() => return Err(SourceError::Cancelled),
                outcome = tokio::time::timeout(timeout, run()) => outcome,
            };

            let error = match outcome {
                Ok(Ok(value)) => {
                    self.breaker.on_success();
                    return Ok(value);
                }
                Ok(Err(err)) => SourceError::Store(err),
                Err(_elapsed) => SourceError::Timeout {
                    kind: self.config.kind,
                    operation,
                    after: timeout,
                },
            };

            self.breaker.on_failure();
            match backoff.next(attempt) {
                Some(delay) if attempt < self.config.max_attempts => {
                    tracing::warn!(
                        source = %self.config.kind,
                        operation,
                        attempt,
                        error = %error,
                        "source operation failed, backing off",
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Err(SourceError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                _ => return Err(error),
            }
        }
    }
}

fn identifier_for(query: &StudyQuery) -> BTreeMap<String, String> {
    match query {
        StudyQuery::StudyUid(uid) => {
            BTreeMap::from([("StudyInstanceUID".to_string(), uid.clone())])
        }
        StudyQuery::MrnAccession {
            mrn,
            accession_number,
        } => BTreeMap::from([
            ("PatientID".to_string(), mrn.clone()),
            ("AccessionNumber".to_string(), accession_number.clone()),
        ]),
    }
}
