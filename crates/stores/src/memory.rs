use crate::{DicomStore, InstanceInfo, Level, QueryAnswer, Statistics, StoreError, StudyInfo};
use dicom::dictionary_std::tags;
use dicom::object::DefaultDicomObject;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// A study as known to a fake modality: its C-FIND answer tags plus the
/// part-10 instances a C-MOVE would deliver.
#[derive(Debug, Clone, Default)]
pub struct RemoteStudy {
    pub tags: BTreeMap<String, String>,
    pub instances: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct StoredInstance {
    bytes: Vec<u8>,
    series_uid: String,
    series_number: Option<i64>,
}

#[derive(Debug, Default)]
struct LocalStudy {
    instances: BTreeMap<String, StoredInstance>,
    stable: bool,
    last_touch: u64,
}

#[derive(Default)]
struct State {
    modalities: HashMap<String, Vec<RemoteStudy>>,
    down: HashMap<String, bool>,
    /// Number of trailing instances silently dropped from study retrieves,
    /// per modality; exercises missing-instance repair.
    drop_tail: HashMap<String, usize>,
    local: BTreeMap<String, LocalStudy>,
    clock: u64,
    queries: Vec<(String, BTreeMap<String, String>)>,
    retrieves: Vec<(String, Level, BTreeMap<String, String>)>,
    instant_stable: bool,
    /// When set, `statistics` reports this many MB per stored instance
    /// instead of real (tiny) byte counts; exercises eviction.
    instance_size_mb: Option<u64>,
}

/// An in-memory store gateway for tests: fake modalities on the query side,
/// a fake cache on the storage side. Behaviour mirrors the HTTP store's
/// contract, including idempotent ingestion and stability reporting.
pub struct MemoryStore {
    state: Mutex<State>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            state: Mutex::new(State {
                instant_stable: true,
                ..State::default()
            }),
        }
    }

    /// When false, ingested studies stay unstable until `set_stable`.
    pub fn with_instant_stable(self, instant: bool) -> Self {
        self.state.lock().unwrap().instant_stable = instant;
        self
    }

    pub fn add_remote_study(
        &self,
        modality: &str,
        tags: BTreeMap<String, String>,
        instances: Vec<Vec<u8>>,
    ) {
        let mut state = self.state.lock().unwrap();
        state
            .modalities
            .entry(modality.to_string())
            .or_default()
            .push(RemoteStudy { tags, instances });
    }

    /// Register a modality with no studies.
    pub fn add_modality(&self, modality: &str) {
        self.state
            .lock()
            .unwrap()
            .modalities
            .entry(modality.to_string())
            .or_default();
    }

    pub fn set_modality_down(&self, modality: &str, down: bool) {
        self.state
            .lock()
            .unwrap()
            .down
            .insert(modality.to_string(), down);
    }

    pub fn set_drop_tail(&self, modality: &str, drop: usize) {
        self.state
            .lock()
            .unwrap()
            .drop_tail
            .insert(modality.to_string(), drop);
    }

    pub fn set_instance_size_mb(&self, size: u64) {
        self.state.lock().unwrap().instance_size_mb = Some(size);
    }

    pub fn set_stable(&self, study_uid: &str, stable: bool) {
        if let Some(study) = self.state.lock().unwrap().local.get_mut(study_uid) {
            study.stable = stable;
        }
    }

    pub fn queries_issued(&self) -> usize {
        self.state.lock().unwrap().queries.len()
    }

    pub fn retrieves_issued(&self) -> usize {
        self.state.lock().unwrap().retrieves.len()
    }

    pub fn local_study_uids(&self) -> Vec<String> {
        self.state.lock().unwrap().local.keys().cloned().collect()
    }

    pub fn stored_sop_uids(&self, study_uid: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .local
            .get(study_uid)
            .map(|s| s.instances.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn ingest(state: &mut State, bytes: Vec<u8>) -> Result<(), StoreError> {
        let object = read_part10(&bytes)?;
        let study_uid = string_tag(&object, tags::STUDY_INSTANCE_UID)
            .ok_or_else(|| StoreError::NotFound("StudyInstanceUID".to_string()))?;
        let sop_uid = string_tag(&object, tags::SOP_INSTANCE_UID)
            .ok_or_else(|| StoreError::NotFound("SOPInstanceUID".to_string()))?;
        let series_uid = string_tag(&object, tags::SERIES_INSTANCE_UID).unwrap_or_default();
        let series_number =
            string_tag(&object, tags::SERIES_NUMBER).and_then(|n| n.trim().parse().ok());

        state.clock += 1;
        let clock = state.clock;
        let instant_stable = state.instant_stable;
        let study = state.local.entry(study_uid).or_default();
        // Duplicate SOPInstanceUIDs overwrite.
        study.instances.insert(
            sop_uid,
            StoredInstance {
                bytes,
                series_uid,
                series_number,
            },
        );
        study.stable = instant_stable;
        study.last_touch = clock;
        Ok(())
    }

    fn matches(tags: &BTreeMap<String, String>, query: &BTreeMap<String, String>) -> bool {
        query.iter().all(|(key, wanted)| {
            wanted.is_empty() || tags.get(key).is_some_and(|have| have == wanted)
        })
    }
}

fn read_part10(bytes: &[u8]) -> Result<DefaultDicomObject, StoreError> {
    // Part-10 files carry a 128-byte preamble before the "DICM" magic;
    // `from_reader` expects the stream to begin at the magic itself.
    let data = if bytes.len() > 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    };
    dicom::object::from_reader(std::io::Cursor::new(data))
        .map_err(|err| StoreError::Decode(err.into()))
}

fn string_tag(object: &DefaultDicomObject, tag: dicom::core::Tag) -> Option<String> {
    object
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .filter(|value| !value.is_empty())
}

#[async_trait::async_trait]
impl DicomStore for MemoryStore {
    async fn echo(&self, modality: &str) -> Result<(), StoreError> {
        let state = self.state.lock().unwrap();
        if state.down.get(modality).copied().unwrap_or(false) {
            return Err(StoreError::Status {
                status: 502,
                context: format!("modalities/{modality}/echo"),
            });
        }
        if state.modalities.contains_key(modality) {
            Ok(())
        } else {
            Err(StoreError::UnknownModality(modality.to_string()))
        }
    }

    async fn query(
        &self,
        modality: &str,
        level: Level,
        query: &BTreeMap<String, String>,
    ) -> Result<Vec<QueryAnswer>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.down.get(modality).copied().unwrap_or(false) {
            return Err(StoreError::Status {
                status: 502,
                context: format!("modalities/{modality}/query"),
            });
        }
        state.queries.push((modality.to_string(), query.clone()));
        let studies = state
            .modalities
            .get(modality)
            .ok_or_else(|| StoreError::UnknownModality(modality.to_string()))?;

        match level {
            Level::Study => Ok(studies
                .iter()
                .filter(|study| Self::matches(&study.tags, query))
                .map(|study| {
                    let mut tags = study.tags.clone();
                    tags.entry("NumberOfStudyRelatedInstances".to_string())
                        .or_insert_with(|| study.instances.len().to_string());
                    QueryAnswer { tags }
                })
                .collect()),
            Level::Instance => {
                let mut answers = Vec::new();
                for study in studies {
                    for bytes in &study.instances {
                        let object = read_part10(bytes)?;
                        let mut tags = BTreeMap::new();
                        for keyword in [
                            ("StudyInstanceUID", tags::STUDY_INSTANCE_UID),
                            ("SeriesInstanceUID", tags::SERIES_INSTANCE_UID),
                            ("SOPInstanceUID", tags::SOP_INSTANCE_UID),
                        ] {
                            if let Some(value) = string_tag(&object, keyword.1) {
                                tags.insert(keyword.0.to_string(), value);
                            }
                        }
                        if Self::matches(&tags, query) {
                            answers.push(QueryAnswer { tags });
                        }
                    }
                }
                Ok(answers)
            }
        }
    }

    async fn retrieve(
        &self,
        modality: &str,
        level: Level,
        keys: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if state.down.get(modality).copied().unwrap_or(false) {
            return Err(StoreError::Status {
                status: 502,
                context: format!("modalities/{modality}/move"),
            });
        }
        state
            .retrieves
            .push((modality.to_string(), level, keys.clone()));

        let studies = state
            .modalities
            .get(modality)
            .ok_or_else(|| StoreError::UnknownModality(modality.to_string()))?
            .clone();
        let drop_tail = state.drop_tail.get(modality).copied().unwrap_or(0);

        for study in studies {
            match level {
                Level::Study => {
                    if !Self::matches(&study.tags, keys) {
                        continue;
                    }
                    let keep = study.instances.len().saturating_sub(drop_tail);
                    for bytes in study.instances.into_iter().take(keep) {
                        Self::ingest(&mut state, bytes)?;
                    }
                }
                Level::Instance => {
                    let wanted_sop = keys.get("SOPInstanceUID").cloned().unwrap_or_default();
                    for bytes in study.instances {
                        let object = read_part10(&bytes)?;
                        let sop = string_tag(&object, tags::SOP_INSTANCE_UID).unwrap_or_default();
                        if sop == wanted_sop {
                            Self::ingest(&mut state, bytes)?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn find_study(&self, study_uid: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.local.contains_key(study_uid).then(|| study_uid.to_string()))
    }

    async fn list_studies(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.local.keys().cloned().collect())
    }

    async fn study_info(&self, id: &str) -> Result<StudyInfo, StoreError> {
        let state = self.state.lock().unwrap();
        let study = state
            .local
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(StudyInfo {
            id: id.to_string(),
            study_uid: id.to_string(),
            is_stable: study.stable,
            instance_count: study.instances.len() as u32,
        })
    }

    async fn study_instances(&self, id: &str) -> Result<Vec<InstanceInfo>, StoreError> {
        let state = self.state.lock().unwrap();
        let study = state
            .local
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        Ok(study
            .instances
            .iter()
            .map(|(sop_uid, instance)| InstanceInfo {
                id: format!("{id}|{sop_uid}"),
                sop_uid: sop_uid.clone(),
                series_uid: instance.series_uid.clone(),
                series_number: instance.series_number,
            })
            .collect())
    }

    async fn instance_bytes(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let state = self.state.lock().unwrap();
        let (study_id, sop_uid) = id
            .split_once('|')
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        state
            .local
            .get(study_id)
            .and_then(|study| study.instances.get(sop_uid))
            .map(|instance| instance.bytes.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn delete_study(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .local
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn statistics(&self) -> Result<Statistics, StoreError> {
        let state = self.state.lock().unwrap();
        let count: u64 = state
            .local
            .values()
            .map(|study| study.instances.len() as u64)
            .sum();
        let total_disk_size_mb = match state.instance_size_mb {
            Some(size) => count * size,
            None => {
                let total_bytes: u64 = state
                    .local
                    .values()
                    .flat_map(|study| study.instances.values())
                    .map(|instance| instance.bytes.len() as u64)
                    .sum();
                total_bytes / (1024 * 1024)
            }
        };
        Ok(Statistics { total_disk_size_mb })
    }

    async fn store_instance(&self, bytes: Vec<u8>) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        Self::ingest(&mut state, bytes)
    }
}
