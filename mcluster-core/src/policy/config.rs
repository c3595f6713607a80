use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{
    rules::{
        DeletionProtection, ImmutableFields, IntegerRange, ObjectName, RequiredFields,
        DELETION_PROTECTION_ANNOTATION,
    },
    EvaluationMode, PolicyEngine,
};
use crate::object::FieldPath;

/// Failed to load a [`PolicyConfig`].
#[derive(Debug, Error)]
pub enum PolicyConfigError {
    /// The policy file could not be read
    #[error("failed to read policy file {path}: {source}")]
    Read {
        /// Location of the file
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// The policy document is not valid YAML or has unknown keys
    #[error("failed to parse policy: {0}")]
    Parse(#[source] serde_yaml::Error),

    /// A range has no bounds, or its lower bound exceeds its upper bound
    #[error("invalid range for field {0}")]
    InvalidRange(FieldPath),

    /// A `metadata` path names a field that is not read from objects
    #[error("unsupported metadata field {0}")]
    UnsupportedField(FieldPath),
}

/// Inclusive bounds on an integer field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RangeConfig {
    /// The bounded field
    pub field: FieldPath,
    /// Lowest accepted value
    #[serde(default)]
    pub min: Option<i64>,
    /// Highest accepted value
    #[serde(default)]
    pub max: Option<i64>,
}

/// Which built-in rules run, loaded once at startup.
///
/// ```yaml
/// mode: collectAll
/// requiredFields: [spec, spec.version]
/// immutableFields: [spec.region]
/// ranges:
///   - field: spec.replicas
///     min: 1
///     max: 7
/// validateName: true
/// deletionProtectionAnnotation: mcluster.io/deletion-protection
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyConfig {
    /// Whether to stop at the first denial
    #[serde(default)]
    pub mode: EvaluationMode,
    /// Fields that must be present on CREATE and UPDATE
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<FieldPath>,
    /// Fields that may not change on UPDATE
    #[serde(default)]
    pub immutable_fields: Vec<FieldPath>,
    /// Integer bounds checked on CREATE and UPDATE
    #[serde(default)]
    pub ranges: Vec<RangeConfig>,
    /// Whether new objects must have an RFC 1123 label as name
    #[serde(default = "default_true")]
    pub validate_name: bool,
    /// Annotation that blocks DELETE; `null` turns the check off
    #[serde(default = "default_deletion_protection")]
    pub deletion_protection_annotation: Option<String>,
}

fn default_required_fields() -> Vec<FieldPath> {
    vec![FieldPath::from_segments(&["spec"])]
}

fn default_true() -> bool {
    true
}

fn default_deletion_protection() -> Option<String> {
    Some(DELETION_PROTECTION_ANNOTATION.to_string())
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            mode: EvaluationMode::default(),
            required_fields: default_required_fields(),
            immutable_fields: Vec::new(),
            ranges: Vec::new(),
            validate_name: true,
            deletion_protection_annotation: default_deletion_protection(),
        }
    }
}

impl PolicyConfig {
    /// Parse and validate a YAML policy document
    pub fn from_yaml(doc: &str) -> Result<Self, PolicyConfigError> {
        let config: Self = serde_yaml::from_str(doc).map_err(PolicyConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML policy file
    pub fn load(path: &Path) -> Result<Self, PolicyConfigError> {
        let doc = std::fs::read_to_string(path).map_err(|source| PolicyConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&doc)
    }

    fn validate(&self) -> Result<(), PolicyConfigError> {
        let paths = self
            .required_fields
            .iter()
            .chain(&self.immutable_fields)
            .chain(self.ranges.iter().map(|r| &r.field));
        for path in paths {
            if !path.is_resolvable() {
                return Err(PolicyConfigError::UnsupportedField(path.clone()));
            }
        }
        for range in &self.ranges {
            let valid = match (range.min, range.max) {
                (None, None) => false,
                (Some(min), Some(max)) => min <= max,
                _ => true,
            };
            if !valid {
                return Err(PolicyConfigError::InvalidRange(range.field.clone()));
            }
        }
        Ok(())
    }
}

impl PolicyEngine {
    /// Build the engine described by a policy.
    ///
    /// Rules are registered as: name, required fields, ranges, immutable fields,
    /// deletion protection.
    pub fn from_config(config: &PolicyConfig) -> Self {
        let mut engine = PolicyEngine::new().with_mode(config.mode);
        if config.validate_name {
            engine = engine.with_rule(ObjectName);
        }
        if !config.required_fields.is_empty() {
            engine = engine.with_rule(RequiredFields::new(config.required_fields.iter().cloned()));
        }
        for range in &config.ranges {
            engine = engine.with_rule(IntegerRange::new(range.field.clone(), range.min, range.max));
        }
        if !config.immutable_fields.is_empty() {
            engine = engine.with_rule(ImmutableFields::new(config.immutable_fields.iter().cloned()));
        }
        if let Some(annotation) = &config.deletion_protection_annotation {
            engine = engine.with_rule(DeletionProtection::new(annotation));
        }
        engine
    }
}
