use crate::tags::TagScheme;
use std::collections::BTreeSet;

/// Destination kind for anonymised DICOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DicomDestination {
    None,
    Ftps,
    Dicomweb,
    Xnat,
}

/// Destination kind for tabular (parquet) extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParquetDestination {
    None,
    Ftps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XnatOverwrite {
    None,
    Append,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XnatDestination {
    Archive,
    Prearchive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct XnatOptions {
    pub overwrite: XnatOverwrite,
    pub destination: XnatDestination,
}

impl Default for XnatOptions {
    fn default() -> Self {
        XnatOptions {
            overwrite: XnatOverwrite::None,
            destination: XnatDestination::Archive,
        }
    }
}

/// Where one project's outputs go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationSpec {
    pub dicom: DicomDestination,
    pub parquet: ParquetDestination,
    pub xnat: Option<XnatOptions>,
}

/// One allowed-manufacturer rule: instances whose Manufacturer matches
/// `pattern` are eligible, except for series numbers in the exclusion list.
#[derive(Debug, Clone)]
pub struct ManufacturerRule {
    pub pattern: regex::Regex,
    pub exclude_series_numbers: Vec<i64>,
}

/// The immutable, validated policy of one research project.
#[derive(Debug, Clone)]
pub struct ProjectConfig {
    pub slug: String,
    pub kv_alias: String,
    /// Modality codes (2-4 chars) eligible for extraction.
    pub modalities: BTreeSet<String>,
    /// Case-insensitive substrings of SeriesDescription that cause a skip.
    pub series_filters: Vec<String>,
    pub min_instances_per_series: u32,
    /// Empty means every manufacturer is allowed.
    pub allowed_manufacturers: Vec<ManufacturerRule>,
    pub tag_scheme: TagScheme,
    pub dicom_destination: DicomDestination,
    pub parquet_destination: ParquetDestination,
    pub xnat_options: Option<XnatOptions>,
}

impl ProjectConfig {
    pub fn destination(&self) -> DestinationSpec {
        DestinationSpec {
            dicom: self.dicom_destination,
            parquet: self.parquet_destination,
            xnat: self.xnat_options,
        }
    }

    pub fn allows_modality(&self, modality: &str) -> bool {
        self.modalities.contains(modality)
    }

    /// The first series filter matching `description`, if any.
    pub fn matching_series_filter(&self, description: &str) -> Option<&str> {
        let lowered = description.to_lowercase();
        self.series_filters
            .iter()
            .find(|f| lowered.contains(f.as_str()))
            .map(|f| f.as_str())
    }

    /// Whether `manufacturer` is allowed, and if so, whether `series_number`
    /// is excluded under the matching rule.
    pub fn manufacturer_allowed(&self, manufacturer: &str, series_number: Option<i64>) -> bool {
        if self.allowed_manufacturers.is_empty() {
            return true;
        }
        self.allowed_manufacturers.iter().any(|rule| {
            rule.pattern.is_match(manufacturer)
                && !series_number.is_some_and(|n| rule.exclude_series_numbers.contains(&n))
        })
    }
}
