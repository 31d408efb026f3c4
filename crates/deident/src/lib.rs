//! The anonymisation engine.
//!
//! Rewrites the instances of one study into an anonymised study that
//! satisfies the project's tag scheme, is internally consistent across
//! instances, and passes dictionary-based validation. Rewriting is a
//! dispatch over a closed set of operations resolved per attribute at
//! configuration-load time; nothing here is reflective or per-element
//! dynamic.

use dicom::core::value::{DataSetSequence, Value};
use dicom::core::{DataElement, PrimitiveValue, VR};
use dicom::dictionary_std::tags;
use dicom::object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use models::{ProjectConfig, ResolvedScheme, TagKey, TagOperation};
use std::collections::HashMap;

pub mod dates;
pub mod hashing;
mod skip;
pub mod validate;
pub mod vr;

pub use skip::SkipReason;

/// DICOM transfer syntax every anonymised instance is re-emitted in.
pub const EXPLICIT_VR_LE: &str = "1.2.840.10008.1.2.1";

#[derive(Debug, thiserror::Error)]
pub enum DeidentError {
    #[error("failed to decode instance: {0}")]
    Malformed(String),
    #[error("no usable instances remain after applying project policy")]
    NoUsableInstances,
    #[error("anonymisation introduced validation errors: {summary}")]
    Validation { summary: String },
    #[error("anonymisation failed: {0}")]
    Failed(String),
}

/// Identity attributes of a source instance, read before rewriting.
#[derive(Debug, Clone)]
pub struct InstanceMeta {
    pub study_uid: String,
    pub series_uid: String,
    pub sop_uid: String,
    pub sop_class_uid: String,
    pub modality: String,
    pub series_description: String,
    pub manufacturer: String,
    pub series_number: Option<i64>,
    pub patient_id: String,
}

#[derive(Debug, Clone)]
pub struct AnonymisedInstance {
    pub sop_uid: String,
    pub series_uid: String,
    /// Source series number; used for export layout, never emitted.
    pub series_number: Option<i64>,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct AnonymisedStudy {
    pub study_uid: String,
    pub pseudo_patient_id: String,
    pub instances: Vec<AnonymisedInstance>,
    /// Human-readable reasons for instances left out by project policy.
    pub skipped: Vec<String>,
}

/// Parse one part-10 instance, tolerating the optional 128-byte preamble.
pub fn read_instance(bytes: &[u8]) -> Result<FileDicomObject<InMemDicomObject>, DeidentError> {
    let data = if bytes.len() > 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    };
    dicom::object::from_reader(std::io::Cursor::new(data))
        .map_err(|err| DeidentError::Malformed(err.to_string()))
}

fn string_value(dataset: &InMemDicomObject, tag: dicom::core::Tag) -> Option<String> {
    dataset
        .element(tag)
        .ok()
        .and_then(|element| element.to_str().ok())
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_meta(dataset: &InMemDicomObject) -> Result<InstanceMeta, DeidentError> {
    let required = |tag, name: &str| {
        string_value(dataset, tag)
            .ok_or_else(|| DeidentError::Malformed(format!("instance is missing {name}")))
    };
    Ok(InstanceMeta {
        study_uid: required(tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?,
        series_uid: required(tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?,
        sop_uid: required(tags::SOP_INSTANCE_UID, "SOPInstanceUID")?,
        sop_class_uid: required(tags::SOP_CLASS_UID, "SOPClassUID")?,
        modality: string_value(dataset, tags::MODALITY).unwrap_or_default(),
        series_description: string_value(dataset, tags::SERIES_DESCRIPTION).unwrap_or_default(),
        manufacturer: string_value(dataset, tags::MANUFACTURER).unwrap_or_default(),
        series_number: string_value(dataset, tags::SERIES_NUMBER)
            .and_then(|n| n.trim().parse().ok()),
        patient_id: string_value(dataset, tags::PATIENT_ID).unwrap_or_default(),
    })
}

struct StudyContext<'a> {
    salt: &'a [u8],
    org_root: &'a str,
    offset_days: i64,
    uid_map: HashMap<String, String>,
}

impl StudyContext<'_> {
    fn map_uid(&mut self, original: &str) -> String {
        if let Some(mapped) = self.uid_map.get(original) {
            return mapped.clone();
        }
        let fresh = hashing::regenerate_uid(self.org_root, self.salt, original);
        self.uid_map.insert(original.to_string(), fresh.clone());
        fresh
    }
}

/// Anonymise every instance of one study (or of several source studies
/// being merged under one regenerated StudyInstanceUID).
///
/// `forced_offset_days` pins the date-shift offset; when `None` the offset
/// is derived from the project salt and the smallest source StudyInstanceUID
/// so that re-runs are reproducible.
pub fn anonymise_study(
    project: &ProjectConfig,
    salt: &[u8],
    org_root: &str,
    forced_offset_days: Option<i64>,
    raw_instances: &[Vec<u8>],
) -> Result<AnonymisedStudy, DeidentError> {
    let mut parsed = Vec::with_capacity(raw_instances.len());
    for bytes in raw_instances {
        let object = read_instance(bytes)?;
        let meta = read_meta(&object)?;
        parsed.push((object, meta));
    }

    let metas: Vec<InstanceMeta> = parsed.iter().map(|(_, meta)| meta.clone()).collect();
    let (usable, skipped) = skip::partition(project, &metas);
    let skipped: Vec<String> = skipped
        .into_iter()
        .map(|(index, reason)| {
            tracing::info!(
                project = %project.slug,
                sop_uid = %metas[index].sop_uid,
                reason = %reason,
                "skipping instance",
            );
            format!("{}: {reason}", metas[index].sop_uid)
        })
        .collect();
    if usable.is_empty() {
        return Err(DeidentError::NoUsableInstances);
    }

    // The smallest source study UID anchors the merge, so the result does
    // not depend on delivery order.
    let primary_uid = usable
        .iter()
        .map(|&index| metas[index].study_uid.as_str())
        .min()
        .expect("usable is non-empty")
        .to_string();
    let offset_days =
        forced_offset_days.unwrap_or_else(|| hashing::date_shift_days(salt, &primary_uid));

    let mut ctx = StudyContext {
        salt,
        org_root,
        offset_days,
        uid_map: HashMap::new(),
    };
    let merged_study_uid = ctx.map_uid(&primary_uid);
    for &index in &usable {
        ctx.uid_map
            .insert(metas[index].study_uid.clone(), merged_study_uid.clone());
    }

    let pseudo_patient_id =
        hashing::pseudo_patient_id(salt, &metas[usable[0]].patient_id);

    // Deterministic processing order keyed by hashed SOPInstanceUID, so UID
    // regeneration is reproducible across re-runs regardless of arrival
    // order.
    let mut ordered: Vec<usize> = usable;
    ordered.sort_by_key(|&index| hashing::mac(salt, metas[index].sop_uid.as_bytes()));

    let mut instances = Vec::with_capacity(ordered.len());
    for index in ordered {
        let (object, meta) = &parsed[index];
        let scheme = project.tag_scheme.resolve(&meta.manufacturer);
        let instance = anonymise_instance(
            object,
            meta,
            &scheme,
            &mut ctx,
            &merged_study_uid,
            &pseudo_patient_id,
        )?;
        instances.push(instance);
    }

    Ok(AnonymisedStudy {
        study_uid: merged_study_uid,
        pseudo_patient_id,
        instances,
        skipped,
    })
}

fn anonymise_instance(
    object: &FileDicomObject<InMemDicomObject>,
    meta: &InstanceMeta,
    scheme: &ResolvedScheme,
    ctx: &mut StudyContext<'_>,
    merged_study_uid: &str,
    pseudo_patient_id: &str,
) -> Result<AnonymisedInstance, DeidentError> {
    let source: &InMemDicomObject = object;
    let before = validate::validate(source);

    let mut output = rewrite_dataset(source, scheme, ctx)?;

    // Identity attributes are always present and always regenerated,
    // whatever the scheme says: the output must be a coherent study.
    let new_sop_uid = ctx.map_uid(&meta.sop_uid);
    let new_series_uid = ctx.map_uid(&meta.series_uid);
    let put_ui = |output: &mut InMemDicomObject, tag, value: &str| {
        output.put(DataElement::new(tag, VR::UI, PrimitiveValue::from(value)));
    };
    put_ui(&mut output, tags::SOP_CLASS_UID, &meta.sop_class_uid);
    put_ui(&mut output, tags::SOP_INSTANCE_UID, &new_sop_uid);
    put_ui(&mut output, tags::STUDY_INSTANCE_UID, merged_study_uid);
    put_ui(&mut output, tags::SERIES_INSTANCE_UID, &new_series_uid);
    output.put(DataElement::new(
        tags::PATIENT_ID,
        VR::LO,
        PrimitiveValue::from(pseudo_patient_id),
    ));

    let after = validate::validate(&output);
    let introduced = validate::introduced(&before, &after);
    let errors: Vec<&validate::ValidationIssue> = introduced
        .iter()
        .filter(|issue| issue.severity >= validate::Severity::Error)
        .collect();
    if !errors.is_empty() {
        let summary = errors
            .iter()
            .map(|issue| issue.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        return Err(DeidentError::Validation { summary });
    }

    let file = output
        .with_meta(
            FileMetaTableBuilder::new()
                .transfer_syntax(EXPLICIT_VR_LE)
                .media_storage_sop_class_uid(meta.sop_class_uid.as_str())
                .media_storage_sop_instance_uid(new_sop_uid.as_str()),
        )
        .map_err(|err| DeidentError::Failed(format!("building file meta: {err}")))?;
    let mut bytes = Vec::new();
    file.write_all(&mut bytes)
        .map_err(|err| DeidentError::Failed(format!("encoding instance: {err}")))?;

    Ok(AnonymisedInstance {
        sop_uid: new_sop_uid,
        series_uid: new_series_uid,
        series_number: meta.series_number,
        bytes,
    })
}

fn rewrite_dataset(
    source: &InMemDicomObject,
    scheme: &ResolvedScheme,
    ctx: &mut StudyContext<'_>,
) -> Result<InMemDicomObject, DeidentError> {
    let mut output = InMemDicomObject::new_empty();

    for element in source {
        let header = element.header();
        let tag = header.tag;
        let key = TagKey::new(tag.group(), tag.element());
        let vr = header.vr;
        // Unlisted attributes are deleted; this covers private creators and
        // their blocks unless a scheme lists them explicitly.
        let op = scheme.operation(key);

        match op {
            TagOperation::Delete => continue,
            TagOperation::Keep => {
                if vr == VR::SQ {
                    if let Value::Sequence(sequence) = element.value() {
                        let mut items = Vec::with_capacity(sequence.items().len());
                        for item in sequence.items() {
                            items.push(rewrite_dataset(item, scheme, ctx)?);
                        }
                        output.put(DataElement::new(tag, VR::SQ, DataSetSequence::from(items)));
                        continue;
                    }
                }
                output.put(element.clone());
            }
            TagOperation::Replace { value } => {
                let text = value
                    .as_deref()
                    .unwrap_or_else(|| vr::default_replacement(vr));
                let primitive = vr::parse_for(vr, text)
                    .map_err(|err| DeidentError::Failed(err.to_string()))?;
                output.put(DataElement::new(tag, vr, primitive));
            }
            TagOperation::ReplaceUid => {
                let original = element_text(element)?;
                if original.is_empty() {
                    output.put(DataElement::new(tag, vr, PrimitiveValue::from("")));
                    continue;
                }
                let mapped = ctx.map_uid(&original);
                output.put(DataElement::new(tag, vr, PrimitiveValue::from(mapped)));
            }
            TagOperation::SecureHash => {
                let original = element_text(element)?;
                let hashed =
                    hashing::secure_hash_value(ctx.salt, key, &original, vr::max_len(vr));
                output.put(DataElement::new(tag, vr, PrimitiveValue::from(hashed)));
            }
            TagOperation::DateShift => {
                let original = element_text(element)?;
                let shifted = dates::shift(vr, &original, ctx.offset_days)
                    .map_err(|err| DeidentError::Failed(err.to_string()))?;
                output.put(DataElement::new(tag, vr, PrimitiveValue::from(shifted)));
            }
            TagOperation::DateFloor => {
                let original = element_text(element)?;
                let floored = dates::floor(vr, &original)
                    .map_err(|err| DeidentError::Failed(err.to_string()))?;
                output.put(DataElement::new(tag, vr, PrimitiveValue::from(floored)));
            }
            TagOperation::NumRange { min, max } => {
                let original = element_text(element)?;
                let clipped = clip_components(&original, *min, *max)
                    .ok_or_else(|| DeidentError::Failed(format!("{key}: non-numeric value")))?;
                if matches!(vr, VR::IS | VR::DS) {
                    output.put(DataElement::new(tag, vr, PrimitiveValue::from(clipped)));
                } else {
                    let first: f64 = clipped
                        .split('\\')
                        .next()
                        .and_then(|c| c.parse().ok())
                        .unwrap_or(*min);
                    let primitive = vr::number_for(vr, first)
                        .map_err(|err| DeidentError::Failed(err.to_string()))?;
                    output.put(DataElement::new(tag, vr, primitive));
                }
            }
        }
    }

    Ok(output)
}

fn element_text(
    element: &dicom::object::mem::InMemElement<dicom::dictionary_std::StandardDataDictionary>,
) -> Result<String, DeidentError> {
    element
        .to_str()
        .map(|value| value.trim_end_matches('\0').trim().to_string())
        .map_err(|err| DeidentError::Failed(format!("unreadable element value: {err}")))
}

fn clip_components(value: &str, min: f64, max: f64) -> Option<String> {
    if value.is_empty() {
        return Some(String::new());
    }
    let clipped: Option<Vec<String>> = value
        .split('\\')
        .map(|component| {
            component.trim().parse::<f64>().ok().map(|number| {
                let number = number.clamp(min, max);
                if number.fract() == 0.0 {
                    format!("{}", number as i64)
                } else {
                    format!("{number}")
                }
            })
        })
        .collect();
    clipped.map(|parts| parts.join("\\"))
}
