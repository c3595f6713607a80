//! Built-in rules for the `MCluster` resource.
//!
//! Each rule is a small, configurable check; [`PolicyConfig`](super::PolicyConfig)
//! decides which of them an engine runs.
use super::{Denial, RuleContext, RuleError, ValidationRule, Verdict};
use crate::{admission::Operation, object::FieldPath};

/// Annotation that blocks deletion of an object while set to `"true"`.
pub const DELETION_PROTECTION_ANNOTATION: &str = "mcluster.io/deletion-protection";

/// Longest name accepted by an RFC 1123 subdomain.
const MAX_SUBDOMAIN_LENGTH: usize = 253;

/// Denies CREATE and UPDATE when any of the listed fields is absent or `null`.
#[derive(Debug, Clone)]
pub struct RequiredFields {
    fields: Vec<FieldPath>,
}

impl RequiredFields {
    /// Require every field in `fields`
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }
}

impl ValidationRule for RequiredFields {
    fn name(&self) -> &str {
        "required-fields"
    }

    fn applies_to(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError> {
        let obj = ctx.object()?;
        let missing: Vec<&FieldPath> = self.fields.iter().filter(|f| obj.field(f).is_none()).collect();
        let Some(first) = missing.first() else {
            return Ok(Verdict::Allow);
        };
        let reason = if missing.len() == 1 {
            format!("missing required field {first}")
        } else {
            let names = missing.iter().map(|f| f.to_string()).collect::<Vec<_>>();
            format!("missing required fields {}", names.join(", "))
        };
        Ok(Verdict::Deny(
            Denial::new(self.name(), reason).on_field((*first).clone()),
        ))
    }
}

/// Denies UPDATE when any of the listed fields changed.
#[derive(Debug, Clone)]
pub struct ImmutableFields {
    fields: Vec<FieldPath>,
}

impl ImmutableFields {
    /// Freeze every field in `fields` after creation
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }
}

impl ValidationRule for ImmutableFields {
    fn name(&self) -> &str {
        "immutable-fields"
    }

    fn applies_to(&self, operation: Operation) -> bool {
        operation == Operation::Update
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError> {
        let new = ctx.object()?;
        let old = ctx
            .old_object
            .ok_or_else(|| RuleError::Other("update request does not contain the existing object".into()))?;

        for field in &self.fields {
            if old.field(field) != new.field(field) {
                return Ok(Verdict::Deny(
                    Denial::new(self.name(), format!("field {field} is immutable")).on_field(field.clone()),
                ));
            }
        }
        Ok(Verdict::Allow)
    }
}

/// Denies CREATE and UPDATE when an integer field falls outside an inclusive range.
///
/// An absent field passes; pair with [`RequiredFields`] to insist on it.
#[derive(Debug, Clone)]
pub struct IntegerRange {
    name: String,
    field: FieldPath,
    min: Option<i64>,
    max: Option<i64>,
}

impl IntegerRange {
    /// Bound `field` by `min` and/or `max`
    pub fn new(field: FieldPath, min: Option<i64>, max: Option<i64>) -> Self {
        Self {
            name: format!("range:{field}"),
            field,
            min,
            max,
        }
    }
}

impl ValidationRule for IntegerRange {
    fn name(&self) -> &str {
        &self.name
    }

    fn applies_to(&self, operation: Operation) -> bool {
        matches!(operation, Operation::Create | Operation::Update)
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError> {
        let Some(value) = ctx.object()?.field(&self.field) else {
            return Ok(Verdict::Allow);
        };
        let n = value.as_i64().ok_or_else(|| RuleError::InvalidField {
            field: self.field.clone(),
            expected: "an integer".into(),
        })?;

        let reason = match (self.min, self.max) {
            (Some(min), _) if n < min => format!("field {} must be at least {min}, got {n}", self.field),
            (_, Some(max)) if n > max => format!("field {} must be at most {max}, got {n}", self.field),
            _ => return Ok(Verdict::Allow),
        };
        Ok(Verdict::Deny(
            Denial::new(&self.name, reason).on_field(self.field.clone()),
        ))
    }
}

/// Denies CREATE when `metadata.name` is not a valid RFC 1123 subdomain,
/// the naming rule the API server applies to custom resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectName;

impl ValidationRule for ObjectName {
    fn name(&self) -> &str {
        "object-name"
    }

    fn applies_to(&self, operation: Operation) -> bool {
        operation == Operation::Create
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError> {
        let meta = &ctx.object()?.metadata;
        let name = meta.name.as_deref().unwrap_or_default();
        // the apiserver fills in the name after admission
        if name.is_empty() && meta.generate_name.is_some() {
            return Ok(Verdict::Allow);
        }
        let field = FieldPath::from_segments(&["metadata", "name"]);
        Ok(match subdomain_violation(name) {
            None => Verdict::Allow,
            Some(problem) => Verdict::Deny(
                Denial::new(self.name(), format!("invalid name {name:?}: {problem}")).on_field(field),
            ),
        })
    }
}

fn subdomain_violation(name: &str) -> Option<&'static str> {
    if name.is_empty() {
        return Some("a name is required");
    }
    if name.len() > MAX_SUBDOMAIN_LENGTH {
        return Some("must be no more than 253 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Some("must consist of lower case alphanumeric characters, '-' or '.'");
    }
    let well_formed = name.split('.').all(|part| {
        part.starts_with(|c: char| c.is_ascii_alphanumeric()) && part.ends_with(|c: char| c.is_ascii_alphanumeric())
    });
    if !well_formed {
        return Some("must start and end with an alphanumeric character");
    }
    None
}

/// Denies DELETE of objects carrying a protection annotation set to `"true"`.
#[derive(Debug, Clone)]
pub struct DeletionProtection {
    annotation: String,
}

impl DeletionProtection {
    /// Protect objects annotated with `annotation: "true"`
    pub fn new(annotation: &str) -> Self {
        Self {
            annotation: annotation.to_string(),
        }
    }
}

impl Default for DeletionProtection {
    fn default() -> Self {
        Self::new(DELETION_PROTECTION_ANNOTATION)
    }
}

impl ValidationRule for DeletionProtection {
    fn name(&self) -> &str {
        "deletion-protection"
    }

    fn applies_to(&self, operation: Operation) -> bool {
        operation == Operation::Delete
    }

    fn needs_object(&self) -> bool {
        false
    }

    fn validate(&self, ctx: &RuleContext<'_>) -> Result<Verdict, RuleError> {
        let Some(old) = ctx.old_object else {
            return Ok(Verdict::Allow);
        };
        if old.metadata.annotation(&self.annotation) != Some("true") {
            return Ok(Verdict::Allow);
        }
        Ok(Verdict::deny(
            self.name(),
            format!(
                "{} {:?} is protected from deletion; remove the {} annotation first",
                ctx.kind.kind,
                old.name_any(),
                self.annotation
            ),
        ))
    }
}
