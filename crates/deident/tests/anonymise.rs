use deident::{anonymise_study, hashing, read_instance, DeidentError};
use dicom::core::Tag;
use dicom::core::VR;
use dicom::dictionary_std::tags;
use models::{
    DicomDestination, ManufacturerRule, ParquetDestination, ProjectConfig, TagDirective, TagKey,
    TagOperation, TagScheme,
};
use std::collections::BTreeMap;
use stores::fixtures::InstanceSpec;

const SALT: &[u8] = b"unit-test-salt";
const ORG_ROOT: &str = "1.2.826.0.1.3680043.10.888";

fn directive(tag: TagKey, op: TagOperation) -> (TagKey, TagDirective) {
    (
        tag,
        TagDirective {
            name: format!("op-{tag}"),
            tag,
            op,
        },
    )
}

fn base_scheme() -> TagScheme {
    let base: BTreeMap<TagKey, TagDirective> = [
        directive(TagKey::new(0x0008, 0x0020), TagOperation::DateShift), // StudyDate
        directive(TagKey::new(0x0008, 0x0030), TagOperation::Keep),     // StudyTime
        directive(TagKey::new(0x0008, 0x0060), TagOperation::Keep),     // Modality
        directive(TagKey::new(0x0008, 0x0070), TagOperation::Keep),     // Manufacturer
        directive(TagKey::new(0x0008, 0x103E), TagOperation::Keep),     // SeriesDescription
        directive(TagKey::new(0x0010, 0x0010), TagOperation::SecureHash), // PatientName
        directive(TagKey::new(0x0020, 0x0011), TagOperation::Keep),     // SeriesNumber
        directive(TagKey::new(0x0020, 0x0052), TagOperation::ReplaceUid), // FrameOfReference
    ]
    .into_iter()
    .collect();
    TagScheme {
        base,
        overrides: Vec::new(),
    }
}

fn project() -> ProjectConfig {
    ProjectConfig {
        slug: "p1".to_string(),
        kv_alias: "p1-alias".to_string(),
        modalities: ["CT", "MR"].into_iter().map(String::from).collect(),
        series_filters: vec!["localizer".to_string()],
        min_instances_per_series: 1,
        allowed_manufacturers: Vec::new(),
        tag_scheme: base_scheme(),
        dicom_destination: DicomDestination::Ftps,
        parquet_destination: ParquetDestination::None,
        xnat_options: None,
    }
}

fn spec(study: &str, series: &str, sop: &str) -> InstanceSpec {
    InstanceSpec::new(study, series, sop)
        .with(Tag(0x0020, 0x0052), VR::UI, "1.9.8.7")
        .with(Tag(0x0008, 0x0080), VR::LO, "General Hospital")
}

fn study_instances(study: &str, count: usize) -> Vec<Vec<u8>> {
    (0..count)
        .map(|i| spec(study, &format!("{study}.10"), &format!("{study}.10.{i}")).encode())
        .collect()
}

fn tag_of(bytes: &[u8], tag: Tag) -> Option<String> {
    let object = read_instance(bytes).unwrap();
    object
        .element(tag)
        .ok()
        .and_then(|e| e.to_str().ok())
        .map(|v| v.trim_end_matches('\0').trim().to_string())
        .filter(|v| !v.is_empty())
}

#[test]
fn instances_share_one_regenerated_study_uid() {
    let anon = anonymise_study(&project(), SALT, ORG_ROOT, None, &study_instances("1.2.3", 3))
        .unwrap();

    assert_eq!(anon.instances.len(), 3);
    assert_ne!(anon.study_uid, "1.2.3");
    for instance in &anon.instances {
        assert_eq!(
            tag_of(&instance.bytes, tags::STUDY_INSTANCE_UID).unwrap(),
            anon.study_uid
        );
        assert_ne!(instance.sop_uid, "");
    }

    // Distinct SOP UIDs, all regenerated.
    let mut sops: Vec<&str> = anon.instances.iter().map(|i| i.sop_uid.as_str()).collect();
    sops.sort();
    sops.dedup();
    assert_eq!(sops.len(), 3);
}

#[test]
fn patient_identity_is_pseudonymised() {
    let anon = anonymise_study(&project(), SALT, ORG_ROOT, None, &study_instances("1.2.3", 2))
        .unwrap();

    let expected = hashing::pseudo_patient_id(SALT, "M1");
    assert_eq!(anon.pseudo_patient_id, expected);
    for instance in &anon.instances {
        assert_eq!(tag_of(&instance.bytes, tags::PATIENT_ID).unwrap(), expected);
        // PatientName is secure-hashed, so the original never survives.
        let name = tag_of(&instance.bytes, tags::PATIENT_NAME).unwrap();
        assert_ne!(name, "DOE^JANE");
    }
}

#[test]
fn dates_shift_consistently_by_the_study_offset() {
    let anon = anonymise_study(&project(), SALT, ORG_ROOT, None, &study_instances("1.2.3", 3))
        .unwrap();

    let offset = hashing::date_shift_days(SALT, "1.2.3");
    let expected = deident::dates::shift(VR::DA, "20230102", offset).unwrap();
    for instance in &anon.instances {
        assert_eq!(tag_of(&instance.bytes, tags::STUDY_DATE).unwrap(), expected);
    }
}

#[test]
fn forced_offsets_override_the_derived_one() {
    let anon = anonymise_study(
        &project(),
        SALT,
        ORG_ROOT,
        Some(-7),
        &study_instances("1.2.3", 1),
    )
    .unwrap();
    assert_eq!(
        tag_of(&anon.instances[0].bytes, tags::STUDY_DATE).unwrap(),
        "20221226"
    );
}

#[test]
fn unlisted_and_private_attributes_are_dropped() {
    let raw = vec![spec("1.2.3", "1.2.3.10", "1.2.3.10.0")
        .with(Tag(0x0009, 0x0010), VR::LO, "VENDOR SECRET")
        .encode()];
    let anon = anonymise_study(&project(), SALT, ORG_ROOT, None, &raw).unwrap();

    let bytes = &anon.instances[0].bytes;
    // InstitutionName is not listed in the scheme.
    assert_eq!(tag_of(bytes, Tag(0x0008, 0x0080)), None);
    // The private attribute is not listed either.
    assert_eq!(tag_of(bytes, Tag(0x0009, 0x0010)), None);
    // AccessionNumber and StudyTime: only listed attributes survive.
    assert_eq!(tag_of(bytes, tags::ACCESSION_NUMBER), None);
    assert_eq!(tag_of(bytes, tags::STUDY_TIME).unwrap(), "101500");
}

#[test]
fn explicitly_listed_private_attributes_survive() {
    let mut project = project();
    let key = TagKey::new(0x0009, 0x0010);
    let (_, d) = directive(key, TagOperation::Keep);
    project.tag_scheme.base.insert(key, d);

    let raw = vec![spec("1.2.3", "1.2.3.10", "1.2.3.10.0")
        .with(Tag(0x0009, 0x0010), VR::LO, "KEEP ME")
        .encode()];
    let anon = anonymise_study(&project, SALT, ORG_ROOT, None, &raw).unwrap();
    assert_eq!(
        tag_of(&anon.instances[0].bytes, Tag(0x0009, 0x0010)).unwrap(),
        "KEEP ME"
    );
}

#[test]
fn uid_rewrites_are_stable_within_a_project() {
    let raw = study_instances("1.2.3", 2);
    let first = anonymise_study(&project(), SALT, ORG_ROOT, None, &raw).unwrap();
    let second = anonymise_study(&project(), SALT, ORG_ROOT, None, &raw).unwrap();

    // Same inputs, same outputs, across runs.
    assert_eq!(first.study_uid, second.study_uid);
    let frames_first: Vec<_> = first
        .instances
        .iter()
        .map(|i| tag_of(&i.bytes, Tag(0x0020, 0x0052)).unwrap())
        .collect();
    let frames_second: Vec<_> = second
        .instances
        .iter()
        .map(|i| tag_of(&i.bytes, Tag(0x0020, 0x0052)).unwrap())
        .collect();
    assert_eq!(frames_first, frames_second);
    // Every occurrence of the same source UID maps identically.
    assert!(frames_first.windows(2).all(|w| w[0] == w[1]));
    assert_ne!(frames_first[0], "1.9.8.7");
}

#[test]
fn multiple_source_studies_merge_under_one_uid() {
    let mut raw = study_instances("1.2.8", 1);
    raw.extend(study_instances("1.2.4", 1));
    let anon = anonymise_study(&project(), SALT, ORG_ROOT, None, &raw).unwrap();

    // Anchored on the smallest source UID, independent of input order.
    assert_eq!(
        anon.study_uid,
        hashing::regenerate_uid(ORG_ROOT, SALT, "1.2.4")
    );
    for instance in &anon.instances {
        assert_eq!(
            tag_of(&instance.bytes, tags::STUDY_INSTANCE_UID).unwrap(),
            anon.study_uid
        );
    }
}

#[test]
fn filtered_series_are_skipped_not_failed() {
    let mut raw = study_instances("1.2.3", 2);
    raw.push({
        let mut s = spec("1.2.3", "1.2.3.99", "1.2.3.99.0");
        s.series_description = "3-plane LOCALIZER".to_string();
        s.encode()
    });

    let anon = anonymise_study(&project(), SALT, ORG_ROOT, None, &raw).unwrap();
    assert_eq!(anon.instances.len(), 2);
    assert_eq!(anon.skipped.len(), 1);
    assert!(anon.skipped[0].contains("localizer"));
}

#[test]
fn disallowed_modalities_and_manufacturers_are_skipped() {
    let mut project = project();
    project.allowed_manufacturers = vec![ManufacturerRule {
        pattern: regex_lite("(?i)siemens"),
        exclude_series_numbers: vec![9],
    }];

    let raw = vec![
        spec("1.2.3", "1.2.3.10", "1.2.3.10.0").encode(),
        {
            let mut s = spec("1.2.3", "1.2.3.11", "1.2.3.11.0");
            s.modality = "US".to_string();
            s.series_number = 2;
            s.encode()
        },
        {
            let mut s = spec("1.2.3", "1.2.3.12", "1.2.3.12.0");
            s.manufacturer = "GE MEDICAL".to_string();
            s.series_number = 3;
            s.encode()
        },
        {
            let mut s = spec("1.2.3", "1.2.3.13", "1.2.3.13.0");
            s.series_number = 9;
            s.encode()
        },
    ];

    let anon = anonymise_study(&project, SALT, ORG_ROOT, None, &raw).unwrap();
    assert_eq!(anon.instances.len(), 1);
    assert_eq!(anon.skipped.len(), 3);
}

#[test]
fn thin_series_are_skipped_at_study_level() {
    let mut project = project();
    project.min_instances_per_series = 2;

    let mut raw = study_instances("1.2.3", 2);
    raw.push(spec("1.2.3", "1.2.3.20", "1.2.3.20.0").encode());

    let anon = anonymise_study(&project, SALT, ORG_ROOT, None, &raw).unwrap();
    assert_eq!(anon.instances.len(), 2);
    assert!(anon.skipped[0].contains("fewer than 2"));
}

#[test]
fn fully_filtered_studies_are_unusable() {
    let mut project = project();
    project.modalities.clear();
    let result = anonymise_study(&project, SALT, ORG_ROOT, None, &study_instances("1.2.3", 2));
    assert!(matches!(result, Err(DeidentError::NoUsableInstances)));
}

#[test]
fn introduced_validation_errors_fail_the_study() {
    // Hashing a DA attribute produces a malformed date; the validator must
    // catch what the scheme let through.
    let mut project = project();
    let key = TagKey::new(0x0008, 0x0020);
    project.tag_scheme.base.insert(
        key,
        TagDirective {
            name: "bad-hash".to_string(),
            tag: key,
            op: TagOperation::SecureHash,
        },
    );

    let result = anonymise_study(&project, SALT, ORG_ROOT, None, &study_instances("1.2.3", 1));
    assert!(matches!(result, Err(DeidentError::Validation { .. })));
}

#[test]
fn num_range_clips_kept_numerics() {
    let mut project = project();
    let key = TagKey::new(0x0020, 0x0011);
    project.tag_scheme.base.insert(
        key,
        TagDirective {
            name: "clip-series-number".to_string(),
            tag: key,
            op: TagOperation::NumRange { min: 0.0, max: 5.0 },
        },
    );

    let mut s = spec("1.2.3", "1.2.3.10", "1.2.3.10.0");
    s.series_number = 40;
    let anon = anonymise_study(&project, SALT, ORG_ROOT, None, &[s.encode()]).unwrap();
    assert_eq!(
        tag_of(&anon.instances[0].bytes, tags::SERIES_NUMBER).unwrap(),
        "5"
    );
}

fn regex_lite(pattern: &str) -> regex::Regex {
    regex::Regex::new(pattern).unwrap()
}
