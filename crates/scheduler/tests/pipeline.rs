//! End-to-end scheduler scenarios over in-memory collaborators: fake
//! modalities behind a fake store gateway, an in-memory ledger and secret
//! store, and capturing uploaders.

use deident::AnonymisedStudy;
use export::{TabularFile, UploadError, UploadReceipt, Uploader};
use ledger::{Ledger, MemoryLedger};
use limits::{Limits, RateParams};
use models::{
    DestinationSpec, DicomDestination, ExportState, ExtractRequest, Priority, SourceKind,
};
use registry::Registry;
use scheduler::{process, Disposition, Runtime, Settings, UploaderFactory};
use secrets::{LocalSecrets, SecretResolver};
use sources::{SourceClient, SourceConfig};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use stores::fixtures::InstanceSpec;
use stores::{DicomStore, MemoryStore};
use tokio_util::sync::CancellationToken;

const PRIMARY: &str = "PRIMARY";
const SECONDARY: &str = "SECONDARY";

struct MockUploader {
    uploads: Arc<Mutex<Vec<(String, AnonymisedStudy)>>>,
}

#[async_trait::async_trait]
impl Uploader for MockUploader {
    async fn upload_study(
        &self,
        project: &str,
        study: &AnonymisedStudy,
    ) -> Result<UploadReceipt, UploadError> {
        self.uploads
            .lock()
            .unwrap()
            .push((project.to_string(), study.clone()));
        Ok(UploadReceipt {
            location: format!("{project}/{}.zip", study.pseudo_patient_id),
            bytes: study.instances.iter().map(|i| i.bytes.len() as u64).sum(),
        })
    }

    async fn upload_tabular(
        &self,
        _project: &str,
        _extract_datetime: &chrono::DateTime<chrono::Utc>,
        _files: &[TabularFile],
    ) -> Result<UploadReceipt, UploadError> {
        unimplemented!("tabular uploads are not part of these scenarios")
    }

    async fn close(&self) -> Result<(), UploadError> {
        Ok(())
    }
}

struct MockFactory {
    uploads: Arc<Mutex<Vec<(String, AnonymisedStudy)>>>,
}

#[async_trait::async_trait]
impl UploaderFactory for MockFactory {
    async fn dicom_uploader(
        &self,
        spec: &DestinationSpec,
        _alias: &str,
    ) -> Result<Option<Box<dyn Uploader>>, UploadError> {
        if spec.dicom == DicomDestination::None {
            return Ok(None);
        }
        Ok(Some(Box::new(MockUploader {
            uploads: self.uploads.clone(),
        })))
    }

    async fn tabular_uploader(
        &self,
        _spec: &DestinationSpec,
        _alias: &str,
    ) -> Result<Option<Box<dyn Uploader>>, UploadError> {
        Ok(None)
    }
}

struct Harness {
    rt: Arc<Runtime>,
    raw: Arc<MemoryStore>,
    staging: Arc<MemoryStore>,
    uploads: Arc<Mutex<Vec<(String, AnonymisedStudy)>>>,
    cancel: CancellationToken,
    _config_dir: tempfile::TempDir,
    _secret_dir: tempfile::TempDir,
}

fn write_file(dir: &std::path::Path, rel: &str, contents: &str) {
    let path = dir.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    let mut f = std::fs::File::create(path).unwrap();
    f.write_all(contents.as_bytes()).unwrap();
}

fn seed_config(dir: &std::path::Path) {
    write_file(
        dir,
        "tag-operations/base.yaml",
        r#"
- name: study date
  group: 0x0008
  element: 0x0020
  op: date-shift
- name: study time
  group: 0x0008
  element: 0x0030
  op: keep
- name: modality
  group: 0x0008
  element: 0x0060
  op: keep
- name: manufacturer
  group: 0x0008
  element: 0x0070
  op: keep
- name: series description
  group: 0x0008
  element: 0x103E
  op: keep
- name: patient name
  group: 0x0010
  element: 0x0010
  op: secure-hash
- name: series number
  group: 0x0020
  element: 0x0011
  op: keep
"#,
    );
    write_file(
        dir,
        "p1.yaml",
        r#"
project:
  name: p1
  azure_kv_alias: p1-alias
  modalities: [CT, MR]
tag_operation_files:
  base: [tag-operations/base.yaml]
min_instances_per_series: 1
series_filters: [localizer]
destination:
  dicom: ftps
  parquet: none
"#,
    );
}

fn rate_limited_harness(rate: f64, burst: f64) -> Harness {
    let config_dir = tempfile::tempdir().unwrap();
    seed_config(config_dir.path());
    let registry = Arc::new(Registry::load(config_dir.path()).unwrap());

    let secret_dir = tempfile::tempdir().unwrap();
    let secrets: Arc<dyn SecretResolver> = Arc::new(LocalSecrets::new(secret_dir.path()));

    let raw = Arc::new(MemoryStore::new());
    raw.add_modality(PRIMARY);
    raw.add_modality(SECONDARY);
    let staging = Arc::new(MemoryStore::new());

    let store: Arc<dyn DicomStore> = raw.clone();
    let primary = Arc::new(SourceClient::new(
        store.clone(),
        SourceConfig::new(SourceKind::Primary, PRIMARY),
    ));
    let secondary = Arc::new(SourceClient::new(
        store,
        SourceConfig::new(SourceKind::Secondary, SECONDARY),
    ));

    let uploads: Arc<Mutex<Vec<(String, AnonymisedStudy)>>> = Arc::new(Mutex::new(Vec::new()));
    let rt = Arc::new(Runtime {
        registry,
        ledger: Arc::new(MemoryLedger::new()),
        limits: Arc::new(Limits::new(4, 2, RateParams::new(rate, burst))),
        raw_cache: Arc::new(cache::RawCache::new(
            raw.clone(),
            cache::CacheConfig::default(),
        )),
        primary,
        secondary,
        staging: staging.clone(),
        secrets,
        uploaders: Arc::new(MockFactory {
            uploads: uploads.clone(),
        }),
        settings: Settings::default(),
    });

    Harness {
        rt,
        raw,
        staging,
        uploads,
        cancel: CancellationToken::new(),
        _config_dir: config_dir,
        _secret_dir: secret_dir,
    }
}

fn harness() -> Harness {
    rate_limited_harness(100.0, 100.0)
}

fn remote_tags(study_uid: &str, mrn: &str, accession: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("StudyInstanceUID".to_string(), study_uid.to_string()),
        ("PatientID".to_string(), mrn.to_string()),
        ("AccessionNumber".to_string(), accession.to_string()),
    ])
}

fn study_instances(study_uid: &str, mrn: &str, accession: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| {
            let mut spec = InstanceSpec::new(
                study_uid,
                &format!("{study_uid}.1"),
                &format!("{study_uid}.1.{i}"),
            );
            spec.patient_id = mrn.to_string();
            spec.accession_number = accession.to_string();
            spec.encode()
        })
        .collect()
}

fn request(mrn: &str, accession: &str, priority: u8) -> ExtractRequest {
    use chrono::TimeZone;
    ExtractRequest {
        mrn: mrn.to_string(),
        accession_number: accession.to_string(),
        study_uid: None,
        study_date: chrono::Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap(),
        project_name: "p1".to_string(),
        extract_datetime: chrono::Utc.with_ymd_and_hms(2023, 6, 1, 12, 0, 0).unwrap(),
        priority: Priority::new(priority).unwrap(),
    }
}

#[tokio::test]
async fn primary_hit_exports_an_anonymised_study() {
    let h = harness();
    h.raw.add_remote_study(
        PRIMARY,
        remote_tags("1.2.3", "M1", "A1"),
        study_instances("1.2.3", "M1", "A1", 3),
    );

    let disposition = process(&h.rt, SourceKind::Primary, &request("M1", "A1", 1), &h.cancel).await;
    assert!(matches!(disposition, Disposition::Ack));

    // Ledger row is exported with a regenerated study UID.
    let record = h.rt.ledger.get("p1", "M1:A1").await.unwrap().unwrap();
    assert_eq!(record.state, ExportState::Exported);
    let anon_uid = record.anon_study_uid.clone().unwrap();
    assert_ne!(anon_uid, "1.2.3");

    // The pseudonymised patient ID is the keyed hash of the MRN under the
    // project salt the resolver minted.
    let salt = h.rt.secrets.salt("p1-alias").await.unwrap();
    assert_eq!(
        record.pseudo_patient_id.as_deref().unwrap(),
        deident::hashing::pseudo_patient_id(&salt, "M1")
    );

    // Exactly one upload with all three instances under one new UID.
    let uploads = h.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    let (project, study) = &uploads[0];
    assert_eq!(project, "p1");
    assert_eq!(study.study_uid, anon_uid);
    assert_eq!(study.instances.len(), 3);

    // Anonymised instances were staged before export.
    assert_eq!(h.staging.local_study_uids(), vec![anon_uid]);
}

#[tokio::test]
async fn primary_miss_falls_back_to_secondary() {
    let h = harness();
    h.raw.add_remote_study(
        SECONDARY,
        remote_tags("1.2.9", "M2", "A2"),
        study_instances("1.2.9", "M2", "A2", 2),
    );

    let first = process(&h.rt, SourceKind::Primary, &request("M2", "A2", 2), &h.cancel).await;
    let routed = match first {
        Disposition::RouteSecondary(request) => request,
        other => panic!("expected secondary routing, got {other:?}"),
    };
    assert_eq!(routed.priority, Priority::new(2).unwrap());

    let second = process(&h.rt, SourceKind::Secondary, &routed, &h.cancel).await;
    assert!(matches!(second, Disposition::Ack));

    let record = h.rt.ledger.get("p1", "M2:A2").await.unwrap().unwrap();
    assert_eq!(record.state, ExportState::Exported);
    assert_eq!(h.uploads.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn absent_studies_fail_with_not_found() {
    let h = harness();

    let first = process(&h.rt, SourceKind::Primary, &request("M3", "A3", 1), &h.cancel).await;
    let routed = match first {
        Disposition::RouteSecondary(request) => request,
        other => panic!("expected secondary routing, got {other:?}"),
    };
    let second = process(&h.rt, SourceKind::Secondary, &routed, &h.cancel).await;
    assert!(matches!(second, Disposition::Ack));

    let record = h.rt.ledger.get("p1", "M3:A3").await.unwrap().unwrap();
    assert_eq!(record.state, ExportState::Failed);
    assert_eq!(record.error.as_deref(), Some("NotFound"));
    assert!(h.uploads.lock().unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_messages_are_acked_without_rework() {
    let h = harness();
    h.raw.add_remote_study(
        PRIMARY,
        remote_tags("1.2.3", "M1", "A1"),
        study_instances("1.2.3", "M1", "A1", 3),
    );

    let message = request("M1", "A1", 1);
    assert!(matches!(
        process(&h.rt, SourceKind::Primary, &message, &h.cancel).await,
        Disposition::Ack
    ));
    let queries_after_first = h.raw.queries_issued();

    // Republishing the same message must short-circuit at the ledger.
    assert!(matches!(
        process(&h.rt, SourceKind::Primary, &message, &h.cancel).await,
        Disposition::Ack
    ));
    assert_eq!(h.uploads.lock().unwrap().len(), 1);
    assert_eq!(h.raw.queries_issued(), queries_after_first);
}

#[tokio::test]
async fn filtered_series_stay_out_of_the_export() {
    let h = harness();
    let mut instances = study_instances("1.2.3", "M1", "A1", 2);
    instances.push({
        let mut spec = InstanceSpec::new("1.2.3", "1.2.3.99", "1.2.3.99.0");
        spec.patient_id = "M1".to_string();
        spec.accession_number = "A1".to_string();
        spec.series_description = "3-plane LOCALIZER".to_string();
        spec.encode()
    });
    h.raw
        .add_remote_study(PRIMARY, remote_tags("1.2.3", "M1", "A1"), instances);

    let disposition = process(&h.rt, SourceKind::Primary, &request("M1", "A1", 1), &h.cancel).await;
    assert!(matches!(disposition, Disposition::Ack));

    let uploads = h.uploads.lock().unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].1.instances.len(), 2);
    assert_eq!(uploads[0].1.skipped.len(), 1);
}

#[tokio::test]
async fn study_uid_messages_bypass_mrn_matching() {
    let h = harness();
    h.raw.add_remote_study(
        PRIMARY,
        remote_tags("1.2.77", "M9", "A9"),
        study_instances("1.2.77", "M9", "A9", 1),
    );

    let mut message = request("M9", "A9", 1);
    message.study_uid = Some("1.2.77".to_string());
    assert!(matches!(
        process(&h.rt, SourceKind::Primary, &message, &h.cancel).await,
        Disposition::Ack
    ));

    // The ledger key is the study UID when one is present.
    let record = h.rt.ledger.get("p1", "1.2.77").await.unwrap().unwrap();
    assert_eq!(record.state, ExportState::Exported);
}

#[tokio::test]
async fn unknown_projects_dead_letter() {
    let h = harness();
    let mut message = request("M1", "A1", 1);
    message.project_name = "nope".to_string();
    assert!(matches!(
        process(&h.rt, SourceKind::Primary, &message, &h.cancel).await,
        Disposition::DeadLetter
    ));
}

#[tokio::test(start_paused = true)]
async fn query_initiation_is_rate_limited() {
    let h = rate_limited_harness(1.0, 1.0);
    for (i, (mrn, accession)) in [("M1", "A1"), ("M2", "A2"), ("M3", "A3")]
        .into_iter()
        .enumerate()
    {
        let uid = format!("1.5.{i}");
        h.raw.add_remote_study(
            PRIMARY,
            remote_tags(&uid, mrn, accession),
            study_instances(&uid, mrn, accession, 1),
        );
    }

    let started = tokio::time::Instant::now();
    for (mrn, accession) in [("M1", "A1"), ("M2", "A2"), ("M3", "A3")] {
        let disposition =
            process(&h.rt, SourceKind::Primary, &request(mrn, accession, 1), &h.cancel).await;
        assert!(matches!(disposition, Disposition::Ack));
    }

    // Three token acquisitions at 1/s with burst 1: the second and third
    // wait a full second each.
    assert!(started.elapsed() >= std::time::Duration::from_secs(2));
    assert_eq!(h.uploads.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn failed_rows_are_reopened_by_redelivery() {
    let h = harness();

    // First pass fails NotFound on the secondary.
    let routed = match process(&h.rt, SourceKind::Primary, &request("M5", "A5", 1), &h.cancel).await
    {
        Disposition::RouteSecondary(request) => request,
        other => panic!("expected secondary routing, got {other:?}"),
    };
    process(&h.rt, SourceKind::Secondary, &routed, &h.cancel).await;
    assert_eq!(
        h.rt.ledger.get("p1", "M5:A5").await.unwrap().unwrap().state,
        ExportState::Failed
    );

    // The study appears later; a redelivered message retries and succeeds.
    h.raw.add_remote_study(
        PRIMARY,
        remote_tags("1.6.1", "M5", "A5"),
        study_instances("1.6.1", "M5", "A5", 1),
    );
    assert!(matches!(
        process(&h.rt, SourceKind::Primary, &request("M5", "A5", 1), &h.cancel).await,
        Disposition::Ack
    ));
    assert_eq!(
        h.rt.ledger.get("p1", "M5:A5").await.unwrap().unwrap().state,
        ExportState::Exported
    );
}
