//! Contains the `AdmissionReview` wire types and the review codec.
//!
//! For more information on admission webhooks, see:
//! <https://kubernetes.io/docs/reference/access-authn-authz/extensible-admission-controllers/>
//! <https://github.com/kubernetes/api/blob/master/admission/v1/types.go>

use crate::{
    gvk::{GroupVersion, GroupVersionKind, GroupVersionResource},
    metadata::TypeMeta,
    object::DynamicObject,
    response::Status,
};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The `kind` field in [`TypeMeta`].
pub const META_KIND: &str = "AdmissionReview";
/// The API group of the `AdmissionReview` envelope.
pub const META_GROUP: &str = "admission.k8s.io";
/// The `api_version` field in [`TypeMeta`] on the v1 version.
pub const META_API_VERSION_V1: &str = "admission.k8s.io/v1";
/// The `api_version` field in [`TypeMeta`] on the v1beta1 version.
pub const META_API_VERSION_V1BETA1: &str = "admission.k8s.io/v1beta1";

/// Reason used when a denial is encoded without a message of its own.
pub const DEFAULT_DENY_REASON: &str = "denied by mcluster admission policy";

/// Failed to decode an incoming `AdmissionReview` body.
///
/// Every variant describes a malformed request; a webhook answers them with `400 Bad Request`.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The body is not JSON, or does not have the shape of an `AdmissionReview`.
    #[error("malformed AdmissionReview: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The envelope declares a kind other than `AdmissionReview`.
    #[error("unexpected kind {0:?}, expected \"AdmissionReview\"")]
    UnexpectedKind(String),

    /// The envelope declares an apiVersion this webhook does not speak.
    #[error("unsupported AdmissionReview apiVersion {0:?}")]
    UnsupportedVersion(String),

    /// The envelope carries no `request`.
    #[error("AdmissionReview does not contain a request")]
    MissingRequest,
}

#[cfg(feature = "jsonpatch")]
#[derive(Debug, Error)]
#[error("failed to serialize patch")]
/// Failed to serialize patch.
pub struct SerializePatchError(#[source] serde_json::Error);

/// The top level struct used for Serializing and Deserializing AdmissionReview
/// requests and responses.
///
/// This is both the input type received by the webhook, and the output type
/// it returns.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    /// Contains the API version and type of the request.
    #[serde(flatten)]
    pub types: TypeMeta,
    /// Describes the attributes for the admission request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<AdmissionRequest>,
    /// Describes the attributes for the admission response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<AdmissionResponse>,
}

impl AdmissionReview {
    /// Serialize the envelope into a JSON body.
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

impl TryFrom<AdmissionReview> for AdmissionRequest {
    type Error = DecodeError;

    fn try_from(review: AdmissionReview) -> Result<Self, Self::Error> {
        if review.types.kind != META_KIND {
            return Err(DecodeError::UnexpectedKind(review.types.kind));
        }
        if !is_supported_version(&review.types.api_version) {
            return Err(DecodeError::UnsupportedVersion(review.types.api_version));
        }
        match review.request {
            Some(mut req) => {
                req.types = review.types;
                Ok(req)
            }
            None => Err(DecodeError::MissingRequest),
        }
    }
}

fn is_supported_version(api_version: &str) -> bool {
    match api_version.parse::<GroupVersion>() {
        Ok(gv) => gv.group == META_GROUP && matches!(gv.version.as_str(), "v1" | "v1beta1"),
        Err(_) => false,
    }
}

/// An incoming [`AdmissionReview`] request.
///
/// Built from a raw body with [`AdmissionRequest::decode`]. Based on its contents a
/// webhook constructs an [`AdmissionResponse`] using:
///
/// - [`AdmissionResponse::from`] for the happy path
/// - [`AdmissionResponse::deny`] for rejected requests
/// - [`AdmissionResponse::invalid`] for bodies that could not be read
///
/// then wraps it with [`AdmissionResponse::into_review`].
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    /// Copied from the containing [`AdmissionReview`] and used to specify a
    /// response type and version when constructing an [`AdmissionResponse`].
    #[serde(skip)]
    pub types: TypeMeta,
    /// An identifier for the individual request/response. It is meant to track the
    /// round trip between the API server and the webhook, and is echoed back verbatim.
    pub uid: String,
    /// The fully-qualified type of object being submitted.
    pub kind: GroupVersionKind,
    /// The fully-qualified resource being requested.
    pub resource: GroupVersionResource,
    /// The subresource being requested, if any (for example, "status" or "scale").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_resource: Option<String>,
    /// The fully-qualified type of the original API request, when it was converted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_kind: Option<GroupVersionKind>,
    /// The fully-qualified resource of the original API request, when it was converted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_resource: Option<GroupVersionResource>,
    /// The subresource of the original API request, when it was converted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_sub_resource: Option<String>,
    /// The name of the object as presented in the request. Empty on CREATE when
    /// the server generates the name.
    #[serde(default)]
    pub name: String,
    /// The namespace associated with the request (if any).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// The operation being performed.
    pub operation: Operation,
    /// Information about the requesting user.
    #[serde(default)]
    pub user_info: UserInfo,
    /// The object from the incoming request. It's `None` for [`DELETE`](Operation::Delete) operations.
    #[serde(default)]
    pub object: Option<DynamicObject>,
    /// The existing object. Only populated for DELETE and UPDATE requests.
    #[serde(default)]
    pub old_object: Option<DynamicObject>,
    /// Specifies that modifications will definitely not be persisted for this request.
    #[serde(default)]
    pub dry_run: bool,
    /// The operation option structure of the operation being performed,
    /// e.g. `meta.k8s.io/v1.CreateOptions`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

impl AdmissionRequest {
    /// Decode a raw HTTP body into the request it carries.
    ///
    /// Rejects bodies that are not JSON, envelopes of an unknown kind or version,
    /// and envelopes whose request lacks `uid`, `kind` or `operation`.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let review: AdmissionReview = serde_json::from_slice(body).map_err(DecodeError::Malformed)?;
        review.try_into()
    }
}

/// The operation specified in an [`AdmissionRequest`].
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// An operation that creates a resource.
    Create,
    /// An operation that updates a resource.
    Update,
    /// An operation that deletes a resource.
    Delete,
    /// An operation that connects to a resource.
    Connect,
}

/// Information about the user submitting the request.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    /// The name that uniquely identifies this user among all active users.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// A unique value that identifies this user across time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    /// The names of groups this user is a part of.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<String>>,
    /// Any additional information provided by the authenticator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<BTreeMap<String, Vec<String>>>,
}

/// An outgoing [`AdmissionReview`] response. Constructed from the corresponding
/// [`AdmissionRequest`].
///
/// ```
/// use mcluster_core::admission::{AdmissionRequest, AdmissionResponse};
///
/// let body = br#"{
///     "apiVersion": "admission.k8s.io/v1",
///     "kind": "AdmissionReview",
///     "request": {
///         "uid": "705ab4f5-6393-11e8-b7cc-42010a800002",
///         "kind": {"group": "mcluster.io", "version": "v1alpha1", "kind": "MCluster"},
///         "resource": {"group": "mcluster.io", "version": "v1alpha1", "resource": "mclusters"},
///         "operation": "DELETE"
///     }
/// }"#;
/// let req = AdmissionRequest::decode(body).unwrap();
///
/// // A normal response with no side effects.
/// let review = AdmissionResponse::from(&req).into_review();
/// assert_eq!(review.types.api_version, "admission.k8s.io/v1");
///
/// // A response rejecting the request with a provided reason.
/// let denied = AdmissionResponse::from(&req).deny("cluster is protected");
/// assert!(!denied.allowed);
/// assert_eq!(denied.uid, req.uid);
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct AdmissionResponse {
    /// Copied from the corresponding constructing [`AdmissionRequest`].
    #[serde(skip)]
    pub types: TypeMeta,
    /// Identifier for the individual request/response. This must be copied over
    /// from the corresponding AdmissionRequest.
    pub uid: String,
    /// Indicates whether or not the admission request was permitted.
    pub allowed: bool,
    /// Extra details into why an admission request was denied. This field IS NOT
    /// consulted in any way if "Allowed" is "true".
    #[serde(rename = "status")]
    pub result: Status,
    /// The base64 encoded patch body. Only "JSONPatch" (RFC 6902) is supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    /// The type of Patch. Currently we only allow "JSONPatch".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch_type: Option<PatchType>,
    /// An unstructured key value map added to the audit log entry of this request.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub audit_annotations: BTreeMap<String, String>,
    /// A list of warning messages to return to the requesting API client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
}

impl From<&AdmissionRequest> for AdmissionResponse {
    fn from(req: &AdmissionRequest) -> Self {
        Self {
            types: req.types.clone(),
            uid: req.uid.clone(),
            allowed: true,
            result: Default::default(),
            patch: None,
            patch_type: None,
            audit_annotations: Default::default(),
            warnings: None,
        }
    }
}

impl AdmissionResponse {
    /// Constructs an invalid [`AdmissionResponse`]. It doesn't copy the uid from
    /// the corresponding [`AdmissionRequest`], so should only be used when the
    /// original request cannot be read.
    pub fn invalid<T: ToString>(reason: T) -> Self {
        Self {
            types: TypeMeta::new(META_API_VERSION_V1, META_KIND),
            uid: Default::default(),
            allowed: false,
            result: Status::failure(&reason.to_string(), "BadRequest").with_code(400),
            patch: None,
            patch_type: None,
            audit_annotations: Default::default(),
            warnings: None,
        }
    }

    /// Deny the request with a reason. The reason will be sent to the original caller.
    ///
    /// An empty reason is replaced with [`DEFAULT_DENY_REASON`].
    #[must_use]
    pub fn deny<T: ToString>(mut self, reason: T) -> Self {
        let reason = reason.to_string();
        self.allowed = false;
        self.result.status = Some(crate::response::StatusSummary::Failure);
        self.result.message = if reason.is_empty() {
            DEFAULT_DENY_REASON.to_string()
        } else {
            reason
        };
        if self.result.reason.is_empty() {
            self.result.reason = "Forbidden".to_string();
        }
        if self.result.code == 0 {
            self.result.code = 403;
        }
        self
    }

    /// Replace the status carried by the response.
    #[must_use]
    pub fn with_status(mut self, status: Status) -> Self {
        self.result = status;
        self
    }

    /// Attach a warning for the requesting API client.
    #[must_use]
    pub fn with_warning<T: ToString>(mut self, warning: T) -> Self {
        self.warnings.get_or_insert_with(Vec::new).push(warning.to_string());
        self
    }

    /// Attach an audit annotation to the request's audit log entry.
    #[must_use]
    pub fn with_audit_annotation(mut self, key: &str, value: &str) -> Self {
        self.audit_annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// Add JSON patches to the response, modifying the object from the request.
    #[cfg(feature = "jsonpatch")]
    #[cfg_attr(docsrs, doc(cfg(feature = "jsonpatch")))]
    pub fn with_patch(mut self, patch: json_patch::Patch) -> Result<Self, SerializePatchError> {
        use base64::Engine;
        let raw = serde_json::to_vec(&patch).map_err(SerializePatchError)?;
        self.patch = Some(base64::engine::general_purpose::STANDARD.encode(raw));
        self.patch_type = Some(PatchType::JsonPatch);

        Ok(self)
    }

    /// Converts an [`AdmissionResponse`] into an [`AdmissionReview`] that
    /// can be used as a webhook response.
    ///
    /// The envelope keeps the apiVersion of the request. A denial always leaves
    /// with a non-empty message.
    pub fn into_review(mut self) -> AdmissionReview {
        if !self.allowed && self.result.message.is_empty() {
            self.result.message = DEFAULT_DENY_REASON.to_string();
        }
        AdmissionReview {
            types: self.types.clone(),
            request: None,
            response: Some(self),
        }
    }
}

/// The type of patch returned in an [`AdmissionResponse`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum PatchType {
    /// Specifies the patch body implements JSON Patch under RFC 6902.
    #[serde(rename = "JSONPatch")]
    JsonPatch,
}

#[cfg(test)]
mod test {
    use super::{
        AdmissionRequest, AdmissionResponse, DecodeError, Operation, DEFAULT_DENY_REASON,
        META_API_VERSION_V1BETA1,
    };
    use crate::response::Status;
    use assert_json_diff::assert_json_include;
    use serde_json::{json, Value};

    fn review(api_version: &str, operation: &str) -> Value {
        json!({
            "kind": "AdmissionReview",
            "apiVersion": api_version,
            "request": {
                "uid": "d3ff8ee1-4b59-4a4c-9a4b-7d6c2c1f1a10",
                "kind": {"group": "mcluster.io", "version": "v1alpha1", "kind": "MCluster"},
                "resource": {"group": "mcluster.io", "version": "v1alpha1", "resource": "mclusters"},
                "requestKind": {"group": "mcluster.io", "version": "v1alpha1", "kind": "MCluster"},
                "name": "east",
                "namespace": "infra",
                "operation": operation,
                "userInfo": {
                    "username": "system:serviceaccount:infra:deployer",
                    "groups": ["system:serviceaccounts", "system:authenticated"],
                    "extra": {"authentication.kubernetes.io/pod-name": ["deployer-0"]}
                },
                "object": {
                    "apiVersion": "mcluster.io/v1alpha1",
                    "kind": "MCluster",
                    "metadata": {"name": "east", "namespace": "infra", "managedFields": []},
                    "spec": {"replicas": 3}
                },
                "oldObject": null,
                "dryRun": true,
                "options": {"kind": "CreateOptions", "apiVersion": "meta.k8s.io/v1"}
            }
        })
    }

    fn decode(value: &Value) -> Result<AdmissionRequest, DecodeError> {
        AdmissionRequest::decode(&serde_json::to_vec(value).unwrap())
    }

    #[test]
    fn v1_review_decodes() {
        let req = decode(&review("admission.k8s.io/v1", "CREATE")).unwrap();
        assert_eq!(req.uid, "d3ff8ee1-4b59-4a4c-9a4b-7d6c2c1f1a10");
        assert_eq!(req.operation, Operation::Create);
        assert_eq!(req.kind.kind, "MCluster");
        assert!(req.dry_run);
        assert!(req.old_object.is_none());
        assert_eq!(req.object.unwrap().metadata.name.as_deref(), Some("east"));
        assert_eq!(req.user_info.groups.unwrap().len(), 2);
    }

    #[test]
    fn version_passes_through() {
        let req = decode(&review(META_API_VERSION_V1BETA1, "UPDATE")).unwrap();
        let res = AdmissionResponse::from(&req).into_review();
        assert_eq!(req.types.api_version, META_API_VERSION_V1BETA1);
        assert_eq!(res.types, req.types);

        let encoded: Value = serde_json::from_slice(&res.to_vec().unwrap()).unwrap();
        assert_json_include!(
            actual: encoded,
            expected: json!({
                "apiVersion": META_API_VERSION_V1BETA1,
                "kind": "AdmissionReview",
                "response": {"uid": req.uid, "allowed": true}
            })
        );
    }

    #[test]
    fn rejects_bodies_that_are_not_reviews() {
        assert!(matches!(
            AdmissionRequest::decode(b"{not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            AdmissionRequest::decode(b"[1, 2, 3]"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn rejects_unknown_envelopes() {
        let mut body = review("admission.k8s.io/v2", "CREATE");
        assert!(matches!(decode(&body), Err(DecodeError::UnsupportedVersion(v)) if v == "admission.k8s.io/v2"));

        body["apiVersion"] = json!("apps/v1");
        assert!(matches!(decode(&body), Err(DecodeError::UnsupportedVersion(_))));

        body["apiVersion"] = json!("admission.k8s.io/v1");
        body["kind"] = json!("ConversionReview");
        assert!(matches!(decode(&body), Err(DecodeError::UnexpectedKind(k)) if k == "ConversionReview"));
    }

    #[test]
    fn rejects_requests_missing_required_fields() {
        let mut body = review("admission.k8s.io/v1", "CREATE");
        body.as_object_mut().unwrap().remove("request");
        assert!(matches!(decode(&body), Err(DecodeError::MissingRequest)));

        let mut body = review("admission.k8s.io/v1", "CREATE");
        body["request"].as_object_mut().unwrap().remove("operation");
        assert!(matches!(decode(&body), Err(DecodeError::Malformed(_))));

        let mut body = review("admission.k8s.io/v1", "CREATE");
        body["request"].as_object_mut().unwrap().remove("kind");
        assert!(matches!(decode(&body), Err(DecodeError::Malformed(_))));

        let body = review("admission.k8s.io/v1", "PATCH");
        assert!(matches!(decode(&body), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn denial_carries_message_and_uid() {
        let req = decode(&review("admission.k8s.io/v1", "CREATE")).unwrap();
        let res = AdmissionResponse::from(&req).deny("missing required field spec.version");
        let encoded = serde_json::to_value(res.into_review()).unwrap();
        assert_json_include!(
            actual: encoded,
            expected: json!({
                "response": {
                    "uid": req.uid,
                    "allowed": false,
                    "status": {"message": "missing required field spec.version", "code": 403}
                }
            })
        );
    }

    #[test]
    fn denial_without_reason_still_has_a_message() {
        let req = decode(&review("admission.k8s.io/v1", "CREATE")).unwrap();
        let denied = AdmissionResponse::from(&req).deny("");
        assert_eq!(denied.result.message, DEFAULT_DENY_REASON);

        let mut bare = AdmissionResponse::from(&req).with_status(Status::failure("", "Timeout"));
        bare.allowed = false;
        let review = bare.into_review();
        assert_eq!(review.response.unwrap().result.message, DEFAULT_DENY_REASON);
    }

    #[test]
    fn invalid_response_has_no_uid() {
        let res = AdmissionResponse::invalid("malformed AdmissionReview");
        assert!(res.uid.is_empty());
        assert!(!res.allowed);
        assert_eq!(res.result.code, 400);
        assert_eq!(res.into_review().types.kind, "AdmissionReview");
    }

    #[test]
    fn warnings_and_audit_annotations_are_encoded() {
        let req = decode(&review("admission.k8s.io/v1", "CREATE")).unwrap();
        let res = AdmissionResponse::from(&req)
            .with_warning("spec.replicas is even")
            .with_audit_annotation("mcluster.io/rule", "replicas");
        assert_json_include!(
            actual: serde_json::to_value(&res).unwrap(),
            expected: json!({
                "warnings": ["spec.replicas is even"],
                "auditAnnotations": {"mcluster.io/rule": "replicas"}
            })
        );
    }

    #[cfg(feature = "jsonpatch")]
    #[test]
    fn patch_is_base64_json_patch() {
        let req = decode(&review("admission.k8s.io/v1", "CREATE")).unwrap();
        let patch: json_patch::Patch = serde_json::from_value(json!([
            {"op": "add", "path": "/metadata/labels", "value": {"team": "infra"}}
        ]))
        .unwrap();
        let res = AdmissionResponse::from(&req).with_patch(patch).unwrap();
        let encoded = serde_json::to_value(&res).unwrap();
        assert_eq!(encoded["patchType"], json!("JSONPatch"));
        assert!(encoded["patch"].as_str().unwrap().starts_with("W3"));
    }
}
