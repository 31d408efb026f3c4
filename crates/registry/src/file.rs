//! On-disk schema of project and tag-operation files.

use models::{DicomDestination, ParquetDestination, TagOperation, XnatDestination, XnatOverwrite};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectFile {
    pub project: ProjectSection,
    pub tag_operation_files: TagOperationFiles,
    #[serde(default)]
    pub allowed_manufacturers: Vec<ManufacturerEntry>,
    #[serde(default = "default_min_instances")]
    pub min_instances_per_series: u32,
    #[serde(default)]
    pub series_filters: Vec<String>,
    pub destination: DestinationSection,
    #[serde(default)]
    pub xnat_destination_options: Option<XnatOptionsFile>,
}

fn default_min_instances() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProjectSection {
    pub name: String,
    pub azure_kv_alias: String,
    pub modalities: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagOperationFiles {
    pub base: Vec<String>,
    #[serde(default)]
    pub manufacturer_overrides: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManufacturerEntry {
    pub regex: String,
    #[serde(default)]
    pub exclude_series_numbers: Vec<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DestinationSection {
    pub dicom: DicomDestination,
    pub parquet: ParquetDestination,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XnatOptionsFile {
    #[serde(default)]
    pub overwrite: Option<XnatOverwrite>,
    #[serde(default)]
    pub destination: Option<XnatDestination>,
}

impl From<XnatOptionsFile> for models::XnatOptions {
    fn from(file: XnatOptionsFile) -> Self {
        let defaults = models::XnatOptions::default();
        models::XnatOptions {
            overwrite: file.overwrite.unwrap_or(defaults.overwrite),
            destination: file.destination.unwrap_or(defaults.destination),
        }
    }
}

/// One row of a tag-operation file.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TagRow {
    pub name: String,
    #[serde(deserialize_with = "de_tag_number")]
    pub group: u16,
    #[serde(deserialize_with = "de_tag_number")]
    pub element: u16,
    pub op: OpName,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl TagRow {
    pub fn operation(&self) -> Result<TagOperation, String> {
        let no_payload = |op: TagOperation| {
            if self.value.is_some() || self.min.is_some() || self.max.is_some() {
                Err(format!("op {:?} takes no value/min/max", self.op))
            } else {
                Ok(op)
            }
        };
        match self.op {
            OpName::Keep => no_payload(TagOperation::Keep),
            OpName::Delete => no_payload(TagOperation::Delete),
            OpName::ReplaceUid => no_payload(TagOperation::ReplaceUid),
            OpName::SecureHash => no_payload(TagOperation::SecureHash),
            OpName::DateShift => no_payload(TagOperation::DateShift),
            OpName::DateFloor => no_payload(TagOperation::DateFloor),
            OpName::Replace => {
                if self.min.is_some() || self.max.is_some() {
                    Err("op \"replace\" takes no min/max".to_string())
                } else {
                    Ok(TagOperation::Replace {
                        value: self.value.clone(),
                    })
                }
            }
            OpName::NumRange => match (self.min, self.max) {
                (Some(min), Some(max)) => Ok(TagOperation::NumRange { min, max }),
                _ => Err("op \"num-range\" requires min and max".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub enum OpName {
    #[serde(rename = "keep")]
    Keep,
    #[serde(rename = "delete")]
    Delete,
    #[serde(rename = "replace")]
    Replace,
    #[serde(rename = "replace_UID")]
    ReplaceUid,
    #[serde(rename = "secure-hash")]
    SecureHash,
    #[serde(rename = "date-shift")]
    DateShift,
    #[serde(rename = "date-floor")]
    DateFloor,
    #[serde(rename = "num-range")]
    NumRange,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManufacturerOverrideFile {
    pub manufacturer: String,
    pub tags: Vec<TagRow>,
}

/// Tag numbers appear as YAML integers (`16`), hex integers (`0x0010`), or
/// strings (`"0x0010"`, `"0010"`); strings are always read as hex.
fn de_tag_number<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    struct NumberVisitor;

    impl serde::de::Visitor<'_> for NumberVisitor {
        type Value = u16;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a DICOM group/element number")
        }

        fn visit_u64<E: Error>(self, value: u64) -> Result<u16, E> {
            u16::try_from(value).map_err(|_| E::custom(format!("{value:#x} exceeds 16 bits")))
        }

        fn visit_i64<E: Error>(self, value: i64) -> Result<u16, E> {
            u16::try_from(value).map_err(|_| E::custom(format!("{value} exceeds 16 bits")))
        }

        fn visit_str<E: Error>(self, value: &str) -> Result<u16, E> {
            let digits = value
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X");
            u16::from_str_radix(digits, 16)
                .map_err(|_| E::custom(format!("{value:?} is not a hex tag number")))
        }
    }

    deserializer.deserialize_any(NumberVisitor)
}
