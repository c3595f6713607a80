//! Command line flags and the configuration built from them.
//!
//! Flags follow the names of the Kubernetes secure serving options. They are parsed
//! once into [`Args`] and turned into an immutable [`Config`] that is handed to the
//! server; nothing reads flags after startup.
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use mcluster_core::PolicyConfig;

use crate::{
    tls::{CertificateSource, TlsSource},
    Error, Result,
};

/// Base name of the self-signed certificate pair, `<cert-dir>/<pair-name>.{crt,key}`.
pub const DEFAULT_PAIR_NAME: &str = "mcluster-vcontroller";
/// Port the webhook listens on unless told otherwise.
pub const DEFAULT_SECURE_PORT: u16 = 8443;
/// Largest accepted review body. UPDATE reviews carry the object twice and
/// objects may approach the 1.5 MiB etcd limit.
pub const DEFAULT_MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024;
/// Rule evaluations allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_REVIEWS: usize = 64;

/// Lowest TLS version the server negotiates.
#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TlsVersion {
    /// TLS 1.2 and 1.3
    #[default]
    #[value(name = "VersionTLS12")]
    Tls12,
    /// TLS 1.3 only
    #[value(name = "VersionTLS13")]
    Tls13,
}

/// Command line flags of the webhook.
#[derive(Parser, Debug, Clone)]
#[command(name = "mcluster-vcontroller", version, about = "Validating admission webhook for mcluster resources")]
pub struct Args {
    /// The IP address on which to listen for the --secure-port port.
    #[arg(long, env = "MCLUSTER_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// The port on which to serve HTTPS.
    #[arg(long, env = "MCLUSTER_SECURE_PORT", default_value_t = DEFAULT_SECURE_PORT)]
    pub secure_port: u16,

    /// File containing the default x509 certificate for HTTPS, followed by any intermediates.
    /// Without it a self-signed certificate is used.
    #[arg(long, env = "MCLUSTER_TLS_CERT_FILE", value_name = "FILE", requires = "tls_private_key_file")]
    pub tls_cert_file: Option<PathBuf>,

    /// File containing the default x509 private key matching --tls-cert-file.
    #[arg(long, env = "MCLUSTER_TLS_PRIVATE_KEY_FILE", value_name = "FILE", requires = "tls_cert_file")]
    pub tls_private_key_file: Option<PathBuf>,

    /// CA bundle used to verify client certificates, when clients present one.
    #[arg(long, env = "MCLUSTER_CLIENT_CA_FILE", value_name = "FILE")]
    pub client_ca_file: Option<PathBuf>,

    /// Directory the self-signed certificate pair is read from or written to.
    /// Ignored when --tls-cert-file is set. Without it the pair lives in memory only.
    #[arg(long, env = "MCLUSTER_CERT_DIR", value_name = "DIR")]
    pub cert_dir: Option<PathBuf>,

    /// Base name of the self-signed certificate pair in --cert-dir.
    #[arg(long, env = "MCLUSTER_PAIR_NAME", default_value = DEFAULT_PAIR_NAME)]
    pub pair_name: String,

    /// Minimum TLS version supported.
    #[arg(long, env = "MCLUSTER_TLS_MIN_VERSION", value_enum, default_value_t)]
    pub tls_min_version: TlsVersion,

    /// Deadline for a single review; a slower review is denied.
    #[arg(long, env = "MCLUSTER_REQUEST_TIMEOUT_SECONDS", default_value_t = 10)]
    pub request_timeout_seconds: u64,

    /// Largest review body accepted, in bytes.
    #[arg(long, env = "MCLUSTER_MAX_REQUEST_BODY_BYTES", default_value_t = DEFAULT_MAX_REQUEST_BODY_BYTES)]
    pub max_request_body_bytes: usize,

    /// Rule evaluations allowed to run at once; further reviews wait within their deadline.
    #[arg(long, env = "MCLUSTER_MAX_CONCURRENT_REVIEWS", default_value_t = DEFAULT_MAX_CONCURRENT_REVIEWS)]
    pub max_concurrent_reviews: usize,

    /// How long in-flight reviews may run after a termination signal.
    #[arg(long, env = "MCLUSTER_SHUTDOWN_GRACE_PERIOD_SECONDS", default_value_t = 20)]
    pub shutdown_grace_period_seconds: u64,

    /// YAML policy file; the built-in mcluster policy is used without it.
    #[arg(long, env = "MCLUSTER_POLICY_CONFIG", value_name = "FILE")]
    pub policy_config: Option<PathBuf>,
}

/// Everything the webhook needs to run, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTPS listener binds
    pub listen: SocketAddr,
    /// Where the serving identity comes from
    pub tls: TlsSource,
    /// Lowest negotiated TLS version
    pub tls_min_version: TlsVersion,
    /// Deadline for a single review
    pub request_timeout: Duration,
    /// Grace period for in-flight reviews on shutdown
    pub shutdown_grace_period: Duration,
    /// Largest accepted review body
    pub max_request_body_bytes: usize,
    /// Rule evaluations allowed to run at once
    pub max_concurrent_reviews: usize,
    /// The rule set to enforce
    pub policy: PolicyConfig,
}

impl Config {
    /// Validate the flags and load the policy they point at.
    pub fn from_args(args: Args) -> Result<Self> {
        if args.request_timeout_seconds == 0 {
            return Err(Error::Config("--request-timeout-seconds must be greater than 0".into()));
        }
        if args.max_request_body_bytes == 0 || args.max_concurrent_reviews == 0 {
            return Err(Error::Config(
                "--max-request-body-bytes and --max-concurrent-reviews must be greater than 0".into(),
            ));
        }
        if args.pair_name.is_empty() || args.pair_name.contains(std::path::is_separator) {
            return Err(Error::Config(format!("invalid --pair-name {:?}", args.pair_name)));
        }

        let certificate = match (args.tls_cert_file, args.tls_private_key_file) {
            (Some(cert), Some(key)) => CertificateSource::Files { cert, key },
            (None, None) => CertificateSource::SelfSigned {
                cert_dir: args.cert_dir,
                pair_name: args.pair_name,
            },
            _ => {
                return Err(Error::Config(
                    "--tls-cert-file and --tls-private-key-file must be set together".into(),
                ))
            }
        };

        let policy = match &args.policy_config {
            Some(path) => PolicyConfig::load(path)?,
            None => PolicyConfig::default(),
        };

        Ok(Self {
            listen: SocketAddr::new(args.bind_address, args.secure_port),
            tls: TlsSource {
                certificate,
                client_ca_file: args.client_ca_file,
                bind_address: args.bind_address,
            },
            tls_min_version: args.tls_min_version,
            request_timeout: Duration::from_secs(args.request_timeout_seconds),
            shutdown_grace_period: Duration::from_secs(args.shutdown_grace_period_seconds),
            max_request_body_bytes: args.max_request_body_bytes,
            max_concurrent_reviews: args.max_concurrent_reviews,
            policy,
        })
    }
}
