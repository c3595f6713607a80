//! Error handling in [`mcluster_webhook`][crate]
use std::path::PathBuf;

use mcluster_core::policy::PolicyConfigError;
use thiserror::Error;

/// Failures that stop the webhook from starting or serving.
///
/// Errors that belong to a single review never surface here; those are answered
/// on the wire and the server keeps running.
#[derive(Error, Debug)]
pub enum Error {
    /// The command line describes an unusable configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The policy file could not be loaded
    #[error("failed to load policy: {0}")]
    Policy(#[from] PolicyConfigError),

    /// A PEM file could not be read
    #[error("failed to read {path}: {source}")]
    ReadPem {
        /// Location of the file
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// A certificate file holds no certificates
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// A key file holds no private key
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    /// Generated serving material could not be written
    #[error("failed to write {path}: {source}")]
    WritePem {
        /// Location of the file
        path: PathBuf,
        /// The underlying io error
        #[source]
        source: std::io::Error,
    },

    /// The self-signed fallback certificate could not be generated
    #[error("failed to generate self-signed certificate: {0}")]
    SelfSigned(#[source] rcgen::Error),

    /// A certificate in the client CA bundle was rejected
    #[error("invalid client CA bundle {path}: {source}")]
    ClientCa {
        /// Location of the bundle
        path: PathBuf,
        /// The rejection
        #[source]
        source: rustls::Error,
    },

    /// The client certificate verifier could not be built
    #[error("failed to build client certificate verifier: {0}")]
    ClientVerifier(#[source] rustls::server::VerifierBuilderError),

    /// rustls refused the serving configuration
    #[error("TLS configuration error: {0}")]
    Tls(#[source] rustls::Error),

    /// Binding or serving failed
    #[error("webhook server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
