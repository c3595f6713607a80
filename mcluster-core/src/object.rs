//! The object payloads carried by a review.
use std::{borrow::Cow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::metadata::{ObjectMeta, TypeMeta};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid field path {0:?}: paths are dot separated and segments must not be empty")]
/// Failed to parse a [`FieldPath`].
pub struct ParseFieldPathError(pub String);

/// A dynamic representation of a kubernetes object
///
/// Reviews carry the candidate and prior objects as raw documents; rules read the
/// parts they understand and ignore the rest.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: Value,
}

impl DynamicObject {
    /// Create a DynamicObject with a name and type information.
    #[must_use]
    pub fn new(name: &str, types: TypeMeta) -> Self {
        Self {
            types: Some(types),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: Value::Object(Default::default()),
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// The object name, or an empty string when the server will generate one
    pub fn name_any(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Resolve a field of the object.
    ///
    /// Paths starting with `metadata` are resolved against the modelled
    /// [`ObjectMeta`] fields, every other path against the object body. Missing
    /// intermediate keys, out of range indices and explicit `null`s all resolve
    /// to `None`.
    pub fn field(&self, path: &FieldPath) -> Option<Cow<'_, Value>> {
        if path.is_metadata() {
            let metadata = serde_json::to_value(&self.metadata).ok()?;
            return lookup(&metadata, path.segments().skip(1))
                .cloned()
                .map(Cow::Owned);
        }
        lookup(&self.data, path.segments()).map(Cow::Borrowed)
    }
}

fn lookup<'v, 's>(root: &'v Value, mut segments: impl Iterator<Item = &'s str>) -> Option<&'v Value> {
    segments
        .try_fold(root, |value, segment| match value {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
        .filter(|v| !v.is_null())
}

/// A dotted path to a field in an object body, e.g. `spec.nodes.0.name`.
///
/// Numeric segments index into arrays. The rendering matches the `field` of a
/// Kubernetes status cause.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Build a path from segments known to be non-empty
    pub(crate) fn from_segments(segments: &[&str]) -> Self {
        Self(segments.iter().map(|s| s.to_string()).collect())
    }

    /// Iterate over the path segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// Whether the path points into `metadata`
    pub fn is_metadata(&self) -> bool {
        self.0.first().is_some_and(|s| s == "metadata")
    }

    /// Whether the path can resolve at all: a `metadata` path must name a
    /// field [`ObjectMeta`] models.
    pub fn is_resolvable(&self) -> bool {
        !self.is_metadata() || self.0.get(1).is_some_and(|f| ObjectMeta::FIELDS.contains(&f.as_str()))
    }
}

impl FromStr for FieldPath {
    type Err = ParseFieldPathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let segments: Vec<String> = s.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(ParseFieldPathError(s.to_string()));
        }
        Ok(Self(segments))
    }
}

impl TryFrom<String> for FieldPath {
    type Error = ParseFieldPathError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

#[cfg(test)]
mod test {
    use super::{DynamicObject, FieldPath, ParseFieldPathError};
    use crate::metadata::TypeMeta;
    use serde_json::json;

    fn cluster() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "mcluster.io/v1alpha1",
            "kind": "MCluster",
            "metadata": { "name": "east", "namespace": "infra", "somethingNew": true },
            "spec": {
                "replicas": 3,
                "version": null,
                "nodes": [{ "name": "a" }, { "name": "b" }]
            }
        }))
        .unwrap()
    }

    #[test]
    fn splits_types_metadata_and_body() {
        let obj = cluster();
        let types = obj.types.as_ref().unwrap();
        assert_eq!(types.kind, "MCluster");
        assert_eq!(obj.metadata.namespace.as_deref(), Some("infra"));
        assert!(obj.data.get("metadata").is_none());
        assert!(obj.data.get("kind").is_none());
        assert!(obj.data.get("spec").is_some());
    }

    #[test]
    fn resolves_nested_fields() {
        let obj = cluster();
        let path = |s: &str| s.parse::<FieldPath>().unwrap();
        assert_eq!(obj.field(&path("spec.replicas")).as_deref(), Some(&json!(3)));
        assert_eq!(obj.field(&path("spec.nodes.1.name")).as_deref(), Some(&json!("b")));
        assert_eq!(obj.field(&path("spec.nodes.7.name")), None);
        assert_eq!(obj.field(&path("spec.nodes.x")), None);
        assert_eq!(obj.field(&path("spec.version")), None);
        assert_eq!(obj.field(&path("status.phase")), None);
    }

    #[test]
    fn resolves_metadata_fields() {
        let mut obj = DynamicObject::new("east", TypeMeta::new("mcluster.io/v1alpha1", "MCluster"))
            .within("infra")
            .data(json!({"spec": {"replicas": 3}}));
        obj.metadata.labels = Some([("team".to_string(), "storage".to_string())].into());
        let path = |s: &str| s.parse::<FieldPath>().unwrap();

        assert_eq!(obj.field(&path("metadata.name")).as_deref(), Some(&json!("east")));
        assert_eq!(obj.field(&path("metadata.namespace")).as_deref(), Some(&json!("infra")));
        assert_eq!(
            obj.field(&path("metadata.labels")).as_deref(),
            Some(&json!({"team": "storage"}))
        );
        assert_eq!(obj.field(&path("metadata.labels.team")).as_deref(), Some(&json!("storage")));
        assert_eq!(obj.field(&path("metadata.labels.owner")), None);
        assert_eq!(obj.field(&path("metadata.annotations")), None);
        assert_eq!(obj.field(&path("spec.replicas")).as_deref(), Some(&json!(3)));

        assert!(path("metadata.labels.team").is_resolvable());
        assert!(path("spec.anything").is_resolvable());
        assert!(!path("metadata.somethingNew").is_resolvable());
        assert!(!path("metadata").is_resolvable());
    }

    #[test]
    fn builders_serialize_like_a_decoded_object() {
        let built = DynamicObject::new("east", TypeMeta::new("mcluster.io/v1alpha1", "MCluster"))
            .within("infra")
            .data(json!({"spec": {"replicas": 3}}));
        let decoded: DynamicObject = serde_json::from_value(serde_json::to_value(&built).unwrap()).unwrap();
        assert_eq!(decoded, built);
        assert_eq!(decoded.name_any(), "east");
    }

    #[test]
    fn field_paths_round_trip_through_strings() {
        let path: FieldPath = "spec.nodes.0".parse().unwrap();
        assert_eq!(path.to_string(), "spec.nodes.0");
        assert_eq!(
            "spec..replicas".parse::<FieldPath>(),
            Err(ParseFieldPathError("spec..replicas".into()))
        );
        assert!("".parse::<FieldPath>().is_err());
        assert!(serde_json::from_value::<FieldPath>(json!("a.")).is_err());
    }
}
