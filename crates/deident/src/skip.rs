//! Project-policy skip rules, evaluated per study before any per-instance
//! rewriting happens. A skip is not an error: excluded instances are simply
//! left out of the anonymised study.

use crate::InstanceMeta;
use models::ProjectConfig;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    SeriesFilter {
        series_uid: String,
        filter: String,
    },
    Modality {
        modality: String,
    },
    Manufacturer {
        manufacturer: String,
        series_number: Option<i64>,
    },
    TooFewInstances {
        series_uid: String,
        count: usize,
        minimum: u32,
    },
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::SeriesFilter { series_uid, filter } => {
                write!(f, "series {series_uid} matches filter {filter:?}")
            }
            SkipReason::Modality { modality } => {
                write!(f, "modality {modality:?} is not in the project allowlist")
            }
            SkipReason::Manufacturer {
                manufacturer,
                series_number,
            } => match series_number {
                Some(n) => write!(
                    f,
                    "manufacturer {manufacturer:?} excludes series number {n}"
                ),
                None => write!(f, "manufacturer {manufacturer:?} is not allowed"),
            },
            SkipReason::TooFewInstances {
                series_uid,
                count,
                minimum,
            } => write!(
                f,
                "series {series_uid} has {count} usable instances, fewer than {minimum}"
            ),
        }
    }
}

/// Partition instance indexes into usable and skipped. The series-level
/// minimum-instance rule is evaluated last, over the instances that survive
/// the per-instance rules.
pub fn partition(
    project: &ProjectConfig,
    metas: &[InstanceMeta],
) -> (Vec<usize>, Vec<(usize, SkipReason)>) {
    let mut usable = Vec::new();
    let mut skipped = Vec::new();

    for (index, meta) in metas.iter().enumerate() {
        if let Some(filter) = project.matching_series_filter(&meta.series_description) {
            skipped.push((
                index,
                SkipReason::SeriesFilter {
                    series_uid: meta.series_uid.clone(),
                    filter: filter.to_string(),
                },
            ));
            continue;
        }
        if !project.allows_modality(&meta.modality) {
            skipped.push((
                index,
                SkipReason::Modality {
                    modality: meta.modality.clone(),
                },
            ));
            continue;
        }
        if !project.manufacturer_allowed(&meta.manufacturer, meta.series_number) {
            skipped.push((
                index,
                SkipReason::Manufacturer {
                    manufacturer: meta.manufacturer.clone(),
                    series_number: meta.series_number,
                },
            ));
            continue;
        }
        usable.push(index);
    }

    if project.min_instances_per_series > 1 {
        let mut per_series: HashMap<&str, usize> = HashMap::new();
        for &index in &usable {
            *per_series.entry(metas[index].series_uid.as_str()).or_insert(0) += 1;
        }
        let minimum = project.min_instances_per_series;
        let (kept, thin): (Vec<usize>, Vec<usize>) = usable.into_iter().partition(|&index| {
            per_series[metas[index].series_uid.as_str()] >= minimum as usize
        });
        for index in thin {
            skipped.push((
                index,
                SkipReason::TooFewInstances {
                    series_uid: metas[index].series_uid.clone(),
                    count: per_series[metas[index].series_uid.as_str()],
                    minimum,
                },
            ));
        }
        usable = kept;
    }

    (usable, skipped)
}
