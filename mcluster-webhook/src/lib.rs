//! HTTPS validating admission webhook for mcluster resources.
//!
//! The webhook receives `AdmissionReview` requests from the Kubernetes API server,
//! evaluates them with a [`PolicyEngine`](mcluster_core::PolicyEngine) and answers
//! with the verdict.
//!
//! - [`config`]: command line flags
//! - [`tls`]: serving certificate, explicit or self-signed
//! - [`handler`]: the review endpoint
//! - [`server`]: listener, routing and graceful shutdown
#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod tls;

pub use error::{Error, Result};
