//! Dictionary-based validation of DICOM datasets.
//!
//! The anonymiser runs this before and after a rewrite and fails the study
//! when the rewrite *introduced* issues of Error severity. Pre-existing
//! issues in source data are reported but never block.

use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::core::value::Value;
use dicom::core::VR;
use dicom::dictionary_std::{tags, StandardDataDictionary};
use dicom::object::InMemDicomObject;
use models::TagKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub tag: TagKey,
    pub message: String,
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let severity = match self.severity {
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        write!(f, "{severity} at {}: {}", self.tag, self.message)
    }
}

/// Identifiers every instance must carry (DICOM type 1 for composite IODs).
const REQUIRED_UIDS: [(dicom::core::Tag, &str); 4] = [
    (tags::SOP_CLASS_UID, "SOPClassUID"),
    (tags::SOP_INSTANCE_UID, "SOPInstanceUID"),
    (tags::STUDY_INSTANCE_UID, "StudyInstanceUID"),
    (tags::SERIES_INSTANCE_UID, "SeriesInstanceUID"),
];

/// VRs where a dictionary disagreement is unambiguous enough to flag.
fn strict_vr(vr: VR) -> bool {
    matches!(vr, VR::UI | VR::DA | VR::TM | VR::DT | VR::PN | VR::SQ)
}

pub fn validate(object: &InMemDicomObject) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    validate_dataset(object, true, &mut issues);
    issues
}

/// The issues present in `after` but not in `before`.
pub fn introduced(before: &[ValidationIssue], after: &[ValidationIssue]) -> Vec<ValidationIssue> {
    after
        .iter()
        .filter(|issue| !before.contains(issue))
        .cloned()
        .collect()
}

fn validate_dataset(object: &InMemDicomObject, root: bool, issues: &mut Vec<ValidationIssue>) {
    if root {
        for (tag, name) in REQUIRED_UIDS {
            let present = object
                .element(tag)
                .ok()
                .and_then(|element| element.to_str().ok())
                .map(|value| !value.trim().trim_end_matches('\0').is_empty())
                .unwrap_or(false);
            if !present {
                issues.push(ValidationIssue {
                    severity: Severity::Error,
                    tag: TagKey::new(tag.group(), tag.element()),
                    message: format!("missing required identifier {name}"),
                });
            }
        }
    }

    let dictionary = StandardDataDictionary;
    for element in object {
        let header = element.header();
        let tag = header.tag;
        let key = TagKey::new(tag.group(), tag.element());
        let vr = header.vr;

        match dictionary.by_tag(tag) {
            Some(entry) => {
                let expected = entry.vr().relaxed();
                if expected != vr
                    && vr != VR::UN
                    && (strict_vr(expected) || strict_vr(vr))
                {
                    issues.push(ValidationIssue {
                        severity: Severity::Error,
                        tag: key,
                        message: format!("VR {vr:?} does not match dictionary VR {expected:?}"),
                    });
                }
            }
            None if !key.is_private() => {
                issues.push(ValidationIssue {
                    severity: Severity::Warning,
                    tag: key,
                    message: "attribute not in the standard dictionary".to_string(),
                });
            }
            None => {}
        }

        if let Value::Sequence(sequence) = element.value() {
            for item in sequence.items() {
                validate_dataset(item, false, issues);
            }
            continue;
        }

        if let Ok(text) = element.to_str() {
            let text = text.trim().trim_end_matches('\0');
            check_text(vr, key, text, issues);
        }
    }
}

fn check_text(vr: VR, tag: TagKey, text: &str, issues: &mut Vec<ValidationIssue>) {
    if text.is_empty() {
        return;
    }
    let mut error = |message: String| {
        issues.push(ValidationIssue {
            severity: Severity::Error,
            tag,
            message,
        })
    };

    match vr {
        VR::UI => {
            if text.len() > 64 || !text.chars().all(|c| c.is_ascii_digit() || c == '.') {
                error(format!("malformed UID {text:?}"));
            }
        }
        VR::DA => {
            if crate::dates::parse_da(text).is_none() {
                error(format!("malformed DA {text:?}"));
            }
        }
        VR::DT => {
            if text.len() < 8 || crate::dates::parse_da(&text[..8.min(text.len())]).is_none() {
                error(format!("malformed DT {text:?}"));
            }
        }
        VR::TM => {
            let digits = text.split('.').next().unwrap_or("");
            if digits.len() < 2 || !digits.bytes().all(|b| b.is_ascii_digit()) {
                error(format!("malformed TM {text:?}"));
            }
        }
        _ => {
            if let Some(limit) = crate::vr::max_len(vr) {
                if text.len() > limit {
                    issues.push(ValidationIssue {
                        severity: Severity::Warning,
                        tag,
                        message: format!("value exceeds the {limit}-byte bound of {vr:?}"),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use dicom::core::{DataElement, PrimitiveValue};

    fn minimal() -> InMemDicomObject {
        let mut object = InMemDicomObject::new_empty();
        for (tag, uid) in [
            (tags::SOP_CLASS_UID, "1.2.840.10008.5.1.4.1.1.7"),
            (tags::SOP_INSTANCE_UID, "1.2.3.1"),
            (tags::STUDY_INSTANCE_UID, "1.2.3"),
            (tags::SERIES_INSTANCE_UID, "1.2.3.0"),
        ] {
            object.put(DataElement::new(tag, VR::UI, PrimitiveValue::from(uid)));
        }
        object
    }

    #[test]
    fn minimal_object_is_clean() {
        assert!(validate(&minimal()).is_empty());
    }

    #[test]
    fn missing_identifiers_are_errors() {
        let object = InMemDicomObject::new_empty();
        let issues = validate(&object);
        assert_eq!(issues.len(), 4);
        assert!(issues.iter().all(|i| i.severity == Severity::Error));
    }

    #[test]
    fn malformed_uids_and_dates_are_errors() {
        let mut object = minimal();
        object.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from("not-a-date"),
        ));
        object.put(DataElement::new(
            tags::FRAME_OF_REFERENCE_UID,
            VR::UI,
            PrimitiveValue::from("1.2.banana"),
        ));
        let issues = validate(&object);
        assert_eq!(
            issues
                .iter()
                .filter(|i| i.severity == Severity::Error)
                .count(),
            2
        );
    }

    #[test]
    fn introduced_reports_only_new_issues() {
        let before = validate(&InMemDicomObject::new_empty());
        let mut broken = InMemDicomObject::new_empty();
        broken.put(DataElement::new(
            tags::STUDY_DATE,
            VR::DA,
            PrimitiveValue::from("99999999"),
        ));
        let after = validate(&broken);

        let fresh = introduced(&before, &after);
        assert_eq!(fresh.len(), 1);
        assert!(fresh[0].message.contains("malformed DA"));
    }
}
