//! Types and decision logic for the mcluster validating admission webhook.
//!
//! This crate has no transport of its own. It decodes `AdmissionReview` envelopes
//! into an [`AdmissionRequest`](admission::AdmissionRequest), runs a
//! [`PolicyEngine`](policy::PolicyEngine) over them, and encodes the resulting
//! [`AdmissionResponse`](admission::AdmissionResponse) back into the envelope the
//! API server expects.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod admission;
pub use admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, DecodeError, Operation};

pub mod gvk;
pub use gvk::{GroupVersion, GroupVersionKind, GroupVersionResource};

pub mod metadata;
pub use metadata::{ObjectMeta, TypeMeta};

pub mod object;
pub use object::{DynamicObject, FieldPath};

pub mod policy;
pub use policy::{EvaluationMode, PolicyConfig, PolicyEngine, ValidationRule, Verdict};

pub mod response;
pub use response::Status;
