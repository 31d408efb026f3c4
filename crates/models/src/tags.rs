use std::collections::BTreeMap;

/// A (group, element) pair addressing one DICOM attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TagKey {
    pub group: u16,
    pub element: u16,
}

impl TagKey {
    pub const fn new(group: u16, element: u16) -> Self {
        TagKey { group, element }
    }

    /// Odd-group tags are private per the DICOM standard.
    pub fn is_private(&self) -> bool {
        self.group % 2 == 1
    }
}

impl std::fmt::Display for TagKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:04x},{:04x})", self.group, self.element)
    }
}

/// One directive of a tag scheme: the operation applied to a DICOM element.
///
/// Operations form a closed set; payloads are carried on the variant and are
/// validated against the attribute's VR when project configuration loads,
/// never per element.
#[derive(Debug, Clone, PartialEq)]
pub enum TagOperation {
    /// Retain the value unmodified. For sequences, recurse into items.
    Keep,
    /// Remove the element, including any sequence items.
    Delete,
    /// Overwrite with a fixed anonymous value. `None` uses the VR default.
    Replace { value: Option<String> },
    /// Deterministically regenerate a UID via the per-project rewrite map.
    ReplaceUid,
    /// Keyed-hash the value, salted per project.
    SecureHash,
    /// Shift DA/DT values by the study's date-shift offset.
    DateShift,
    /// Truncate DT/TM values to the start of the day.
    DateFloor,
    /// Clip a numeric value into an inclusive range.
    NumRange { min: f64, max: f64 },
}

impl TagOperation {
    pub fn name(&self) -> &'static str {
        match self {
            TagOperation::Keep => "keep",
            TagOperation::Delete => "delete",
            TagOperation::Replace { .. } => "replace",
            TagOperation::ReplaceUid => "replace_UID",
            TagOperation::SecureHash => "secure-hash",
            TagOperation::DateShift => "date-shift",
            TagOperation::DateFloor => "date-floor",
            TagOperation::NumRange { .. } => "num-range",
        }
    }
}

/// A named directive bound to one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct TagDirective {
    pub name: String,
    pub tag: TagKey,
    pub op: TagOperation,
}

/// A manufacturer-specific patch over the base scheme.
#[derive(Debug, Clone)]
pub struct ManufacturerOverride {
    pub manufacturer: regex::Regex,
    pub tags: BTreeMap<TagKey, TagDirective>,
}

/// The ordered tag scheme of one project: a base mapping plus
/// manufacturer-specific overrides. Per attribute only one final operation
/// applies: manufacturer overrides win, then last-specified wins (the maps
/// are built in file order, so later inserts already replaced earlier ones).
#[derive(Debug, Clone, Default)]
pub struct TagScheme {
    pub base: BTreeMap<TagKey, TagDirective>,
    pub overrides: Vec<ManufacturerOverride>,
}

impl TagScheme {
    /// Resolve the effective scheme for an instance's manufacturer string.
    pub fn resolve(&self, manufacturer: &str) -> ResolvedScheme {
        let mut ops = self.base.clone();
        for patch in &self.overrides {
            if patch.manufacturer.is_match(manufacturer) {
                for (tag, directive) in &patch.tags {
                    ops.insert(*tag, directive.clone());
                }
            }
        }
        ResolvedScheme { ops }
    }
}

/// The effective per-attribute operations after override resolution.
#[derive(Debug, Clone)]
pub struct ResolvedScheme {
    ops: BTreeMap<TagKey, TagDirective>,
}

impl ResolvedScheme {
    pub fn from_ops(ops: BTreeMap<TagKey, TagDirective>) -> Self {
        ResolvedScheme { ops }
    }

    /// The operation for `tag`. Unlisted attributes are deleted, private
    /// attributes doubly so unless explicitly listed.
    pub fn operation(&self, tag: TagKey) -> &TagOperation {
        self.ops
            .get(&tag)
            .map(|d| &d.op)
            .unwrap_or(&TagOperation::Delete)
    }

    pub fn directives(&self) -> impl Iterator<Item = &TagDirective> {
        self.ops.values()
    }
}
