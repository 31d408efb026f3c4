//! The project configuration registry.
//!
//! Reads a directory of per-project YAML policies once at startup and again
//! on demand (SIGHUP), validates each against the schema and the DICOM
//! dictionary, resolves tag-operation file references, and indexes the
//! resulting immutable `ProjectConfig`s by slug. Lookups see an atomic
//! snapshot; a failed reload keeps the previous snapshot.

use dicom::core::dictionary::{DataDictionary, DataDictionaryEntry};
use dicom::dictionary_std::StandardDataDictionary;
use models::{
    DestinationSpec, ManufacturerRule, ProjectConfig, TagDirective, TagKey, TagScheme,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

mod file;
use file::{ManufacturerOverrideFile, ProjectFile, TagRow};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid project configuration in {path}: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error("unknown project {0:?}")]
    UnknownProject(String),
}

pub struct Registry {
    dir: PathBuf,
    index: RwLock<Arc<HashMap<String, Arc<ProjectConfig>>>>,
}

impl Registry {
    /// Load every project file in `dir` (non-recursively; referenced
    /// tag-operation files live in subdirectories). Any invalid file fails
    /// the whole load.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dir = dir.into();
        let index = load_index(&dir)?;
        tracing::info!(
            dir = %dir.display(),
            projects = index.len(),
            "loaded project configuration",
        );
        Ok(Registry {
            dir,
            index: RwLock::new(Arc::new(index)),
        })
    }

    /// Re-read the directory and swap the snapshot. On failure the previous
    /// snapshot stays in place and the error is returned for logging.
    pub fn reload(&self) -> Result<(), ConfigError> {
        let fresh = load_index(&self.dir)?;
        tracing::info!(projects = fresh.len(), "reloaded project configuration");
        *self.index.write().unwrap() = Arc::new(fresh);
        Ok(())
    }

    pub fn project(&self, slug: &str) -> Result<Arc<ProjectConfig>, ConfigError> {
        self.index
            .read()
            .unwrap()
            .get(slug)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProject(slug.to_string()))
    }

    pub fn destination(&self, slug: &str) -> Result<DestinationSpec, ConfigError> {
        Ok(self.project(slug)?.destination())
    }

    pub fn slugs(&self) -> Vec<String> {
        let mut slugs: Vec<String> = self.index.read().unwrap().keys().cloned().collect();
        slugs.sort();
        slugs
    }
}

fn load_index(dir: &Path) -> Result<HashMap<String, Arc<ProjectConfig>>, ConfigError> {
    let entries = std::fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut index = HashMap::new();
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.is_file()
                && matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
        })
        .collect();
    paths.sort();

    for path in paths {
        let config = load_project(dir, &path)?;
        let slug = config.slug.clone();
        if index.insert(slug.clone(), Arc::new(config)).is_some() {
            return Err(ConfigError::Invalid {
                path,
                message: format!("duplicate project slug {slug:?}"),
            });
        }
    }
    Ok(index)
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&raw).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn load_project(dir: &Path, path: &Path) -> Result<ProjectConfig, ConfigError> {
    let file: ProjectFile = read_yaml(path)?;
    let invalid = |message: String| ConfigError::Invalid {
        path: path.to_path_buf(),
        message,
    };

    let slug = file.project.name.trim().to_string();
    if slug.is_empty() || slug.contains(char::is_whitespace) || slug.contains('/') {
        return Err(invalid(format!("invalid project slug {slug:?}")));
    }

    let mut modalities = std::collections::BTreeSet::new();
    for modality in &file.project.modalities {
        if !(2..=4).contains(&modality.len()) {
            return Err(invalid(format!(
                "modality code {modality:?} must be 2-4 characters"
            )));
        }
        modalities.insert(modality.clone());
    }

    if file.min_instances_per_series < 1 {
        return Err(invalid(
            "min_instances_per_series must be at least 1".to_string(),
        ));
    }

    let mut allowed_manufacturers = Vec::new();
    for entry in &file.allowed_manufacturers {
        let pattern = regex::Regex::new(&entry.regex)
            .map_err(|err| invalid(format!("manufacturer regex {:?}: {err}", entry.regex)))?;
        allowed_manufacturers.push(ManufacturerRule {
            pattern,
            exclude_series_numbers: entry.exclude_series_numbers.clone(),
        });
    }

    let mut base = BTreeMap::new();
    for reference in &file.tag_operation_files.base {
        let rows: Vec<TagRow> = read_yaml(&dir.join(reference))?;
        for row in rows {
            let directive = build_directive(path, &row)?;
            // Later files and rows win for the same attribute.
            base.insert(directive.tag, directive);
        }
    }

    let mut overrides = Vec::new();
    for reference in &file.tag_operation_files.manufacturer_overrides {
        let patches: Vec<ManufacturerOverrideFile> = read_yaml(&dir.join(reference))?;
        for patch in patches {
            let manufacturer = regex::Regex::new(&patch.manufacturer).map_err(|err| {
                invalid(format!("override regex {:?}: {err}", patch.manufacturer))
            })?;
            let mut tags = BTreeMap::new();
            for row in &patch.tags {
                let directive = build_directive(path, row)?;
                tags.insert(directive.tag, directive);
            }
            overrides.push(models::ManufacturerOverride { manufacturer, tags });
        }
    }

    Ok(ProjectConfig {
        slug,
        kv_alias: file.project.azure_kv_alias.clone(),
        modalities,
        series_filters: file
            .series_filters
            .iter()
            .map(|f| f.to_lowercase())
            .collect(),
        min_instances_per_series: file.min_instances_per_series,
        allowed_manufacturers,
        tag_scheme: TagScheme { base, overrides },
        dicom_destination: file.destination.dicom,
        parquet_destination: file.destination.parquet,
        xnat_options: file.xnat_destination_options.map(Into::into),
    })
}

fn build_directive(path: &Path, row: &TagRow) -> Result<TagDirective, ConfigError> {
    let tag = TagKey::new(row.group, row.element);
    let op = row.operation().map_err(|message| ConfigError::Invalid {
        path: path.to_path_buf(),
        message: format!("tag {tag}: {message}"),
    })?;

    // Validate VR compatibility now, against the standard dictionary, so
    // rewriting never re-checks per element. Private and retired tags are
    // not in the dictionary; their operations go through unchecked.
    let dictionary = StandardDataDictionary;
    if let Some(entry) = dictionary.by_tag(dicom::core::Tag(tag.group, tag.element)) {
        deident::vr::check_operation(entry.vr().relaxed(), &op).map_err(|err| ConfigError::Invalid {
            path: path.to_path_buf(),
            message: format!("tag {tag} ({}): {err}", row.name),
        })?;
    }

    Ok(TagDirective {
        name: row.name.clone(),
        tag,
        op,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use models::TagOperation;
    use std::io::Write;

    fn write_file(dir: &Path, rel: &str, contents: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    const BASE_TAGS: &str = r#"
- name: study date
  group: 0x0008
  element: 0x0020
  op: date-shift
- name: patient name
  group: 0x0010
  element: 0x0010
  op: secure-hash
- name: modality
  group: 0x0008
  element: 0x0060
  op: keep
- name: series description
  group: 0x0008
  element: 0x103E
  op: keep
- name: frame of reference
  group: 0x0020
  element: 0x0052
  op: replace_UID
"#;

    const OVERRIDE_TAGS: &str = r#"
- manufacturer: "(?i)acme"
  tags:
    - name: series description
      group: 0x0008
      element: 0x103E
      op: delete
"#;

    fn project_yaml(slug: &str) -> String {
        format!(
            r#"
project:
  name: {slug}
  azure_kv_alias: {slug}-alias
  modalities: [CT, MR]
tag_operation_files:
  base: [tag-operations/base.yaml]
  manufacturer_overrides: [tag-operations/overrides.yaml]
allowed_manufacturers:
  - regex: "(?i)siemens|acme"
    exclude_series_numbers: [99]
min_instances_per_series: 1
series_filters: [LOCALIZER, scout]
destination:
  dicom: ftps
  parquet: none
"#
        )
    }

    fn seed(dir: &Path) {
        write_file(dir, "tag-operations/base.yaml", BASE_TAGS);
        write_file(dir, "tag-operations/overrides.yaml", OVERRIDE_TAGS);
        write_file(dir, "p1.yaml", &project_yaml("p1"));
    }

    #[test]
    fn loads_and_indexes_projects() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());

        let registry = Registry::load(tmp.path()).unwrap();
        assert_eq!(registry.slugs(), vec!["p1".to_string()]);

        let project = registry.project("p1").unwrap();
        assert_eq!(project.kv_alias, "p1-alias");
        assert!(project.allows_modality("MR"));
        // Series filters are folded to lower case at load time.
        assert_eq!(project.matching_series_filter("a LOCALIZER b"), Some("localizer"));

        let resolved = project.tag_scheme.resolve("SIEMENS");
        assert_eq!(
            resolved.operation(TagKey::new(0x0008, 0x0020)),
            &TagOperation::DateShift
        );
        assert_eq!(
            resolved.operation(TagKey::new(0x0008, 0x103E)),
            &TagOperation::Keep
        );

        // Manufacturer overrides win.
        let acme = project.tag_scheme.resolve("ACME Imaging");
        assert_eq!(
            acme.operation(TagKey::new(0x0008, 0x103E)),
            &TagOperation::Delete
        );

        assert!(matches!(
            registry.project("p2"),
            Err(ConfigError::UnknownProject(_))
        ));
    }

    #[test]
    fn later_rows_win_within_the_base_scheme() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(
            tmp.path(),
            "tag-operations/base.yaml",
            r#"
- name: modality first
  group: 0x0008
  element: 0x0060
  op: keep
- name: modality second
  group: 0x0008
  element: 0x0060
  op: delete
"#,
        );
        write_file(tmp.path(), "tag-operations/overrides.yaml", "[]");
        write_file(tmp.path(), "p1.yaml", &project_yaml("p1"));

        let registry = Registry::load(tmp.path()).unwrap();
        let project = registry.project("p1").unwrap();
        assert_eq!(
            project.tag_scheme.resolve("X").operation(TagKey::new(0x0008, 0x0060)),
            &TagOperation::Delete
        );
    }

    #[test]
    fn vr_incompatible_operations_fail_the_load() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(
            tmp.path(),
            "tag-operations/base.yaml",
            r#"
- name: shifting a person name
  group: 0x0010
  element: 0x0010
  op: date-shift
"#,
        );
        write_file(tmp.path(), "tag-operations/overrides.yaml", "[]");
        write_file(tmp.path(), "p1.yaml", &project_yaml("p1"));

        assert!(matches!(
            Registry::load(tmp.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn missing_tag_operation_files_fail_the_load() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(tmp.path(), "p1.yaml", &project_yaml("p1"));
        assert!(matches!(
            Registry::load(tmp.path()),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn num_range_requires_bounds() {
        let tmp = tempfile::tempdir().unwrap();
        write_file(
            tmp.path(),
            "tag-operations/base.yaml",
            r#"
- name: series number
  group: 0x0020
  element: 0x0011
  op: num-range
"#,
        );
        write_file(tmp.path(), "tag-operations/overrides.yaml", "[]");
        write_file(tmp.path(), "p1.yaml", &project_yaml("p1"));
        assert!(matches!(
            Registry::load(tmp.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn reload_keeps_the_old_snapshot_on_failure() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        let registry = Registry::load(tmp.path()).unwrap();

        write_file(tmp.path(), "p2.yaml", "not: [valid");
        assert!(registry.reload().is_err());
        assert_eq!(registry.slugs(), vec!["p1".to_string()]);

        write_file(tmp.path(), "p2.yaml", &project_yaml("p2"));
        registry.reload().unwrap();
        assert_eq!(registry.slugs(), vec!["p1".to_string(), "p2".to_string()]);
    }

    #[test]
    fn duplicate_slugs_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        seed(tmp.path());
        write_file(tmp.path(), "other.yaml", &project_yaml("p1"));
        assert!(matches!(
            Registry::load(tmp.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }
}
