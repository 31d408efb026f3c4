//! Clients for the two DICOM stores (raw cache and anon staging).
//!
//! Both stores are Orthanc-style servers driven over their HTTP APIs. The
//! raw store additionally owns the DIMSE associations to the primary and
//! secondary modalities, so C-ECHO / C-FIND / C-MOVE are issued through its
//! modality endpoints and completed transfers land in the raw cache itself.

use std::collections::BTreeMap;

pub mod fixtures;
mod http;
mod memory;

pub use http::{HttpStore, HttpStoreConfig};
pub use memory::{MemoryStore, RemoteStudy};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status} for {context}")]
    Status { status: u16, context: String },
    #[error("failed to decode store response")]
    Decode(#[source] anyhow::Error),
    #[error("unknown modality {0:?}")]
    UnknownModality(String),
    #[error("{0:?} not found in store")]
    NotFound(String),
}

/// Query/retrieve level of a C-FIND or C-MOVE issued through the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Study,
    Instance,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Study => "Study",
            Level::Instance => "Instance",
        }
    }
}

/// One C-FIND answer, keyed by DICOM keyword (e.g. `StudyInstanceUID`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryAnswer {
    pub tags: BTreeMap<String, String>,
}

impl QueryAnswer {
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.tags.get(keyword).map(String::as_str)
    }

    pub fn study_instance_uid(&self) -> Option<&str> {
        self.get("StudyInstanceUID")
    }

    /// The advertised instance count, when the modality reports one.
    pub fn number_of_instances(&self) -> Option<u32> {
        self.get("NumberOfStudyRelatedInstances")
            .and_then(|v| v.trim().parse().ok())
    }
}

/// A study resident in a store.
#[derive(Debug, Clone)]
pub struct StudyInfo {
    pub id: String,
    pub study_uid: String,
    /// No new instance has arrived within the store's quiescence window.
    pub is_stable: bool,
    pub instance_count: u32,
}

/// An instance resident in a store.
#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub id: String,
    pub sop_uid: String,
    pub series_uid: String,
    pub series_number: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub total_disk_size_mb: u64,
}

/// The store gateway contract the pipeline consumes. `HttpStore` implements
/// it against a live store; `MemoryStore` backs tests.
#[async_trait::async_trait]
pub trait DicomStore: Send + Sync {
    /// C-ECHO the named modality.
    async fn echo(&self, modality: &str) -> Result<(), StoreError>;

    /// C-FIND against the named modality at the given level.
    async fn query(
        &self,
        modality: &str,
        level: Level,
        query: &BTreeMap<String, String>,
    ) -> Result<Vec<QueryAnswer>, StoreError>;

    /// C-MOVE matching resources from the named modality into this store.
    async fn retrieve(
        &self,
        modality: &str,
        level: Level,
        keys: &BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Resolve a locally-stored study by StudyInstanceUID.
    async fn find_study(&self, study_uid: &str) -> Result<Option<String>, StoreError>;

    /// Identifiers of every locally-stored study.
    async fn list_studies(&self) -> Result<Vec<String>, StoreError>;

    async fn study_info(&self, id: &str) -> Result<StudyInfo, StoreError>;

    async fn study_instances(&self, id: &str) -> Result<Vec<InstanceInfo>, StoreError>;

    async fn instance_bytes(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    async fn delete_study(&self, id: &str) -> Result<(), StoreError>;

    async fn statistics(&self) -> Result<Statistics, StoreError>;

    /// Ingest one instance (the HTTP equivalent of a C-STORE). Duplicate
    /// SOPInstanceUIDs overwrite, never error.
    async fn store_instance(&self, bytes: Vec<u8>) -> Result<(), StoreError>;
}
