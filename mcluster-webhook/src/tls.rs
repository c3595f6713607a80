//! Serving identity of the webhook.
//!
//! The certificate either comes from explicit files or is a self-signed pair
//! generated at startup. A generated pair is written to the certificate directory
//! when one is configured, and reused from there on the next start.
use std::{
    fs,
    io::Write,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use rcgen::{CertificateParams, DnType, KeyPair};
use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
    server::WebPkiClientVerifier,
    RootCertStore, ServerConfig, SupportedProtocolVersion,
};
use tracing::{debug, info};

use crate::{config::TlsVersion, Error, Result};

/// Where the server certificate comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateSource {
    /// PEM files provided by the operator
    Files {
        /// Certificate chain, leaf first
        cert: PathBuf,
        /// Private key matching the leaf
        key: PathBuf,
    },
    /// A self-signed pair, optionally persisted as `<cert_dir>/<pair_name>.{crt,key}`
    SelfSigned {
        /// Directory holding the pair
        cert_dir: Option<PathBuf>,
        /// Base name of the pair
        pair_name: String,
    },
}

/// Inputs for building the [`ServingIdentity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSource {
    /// The server certificate
    pub certificate: CertificateSource,
    /// CA bundle for optional client certificate verification
    pub client_ca_file: Option<PathBuf>,
    /// Listen address; included in the self-signed certificate's names
    pub bind_address: IpAddr,
}

/// Certificate chain, key and client trust roots the server presents.
#[derive(Debug)]
pub struct ServingIdentity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    client_roots: Option<RootCertStore>,
}

impl ServingIdentity {
    /// Resolve the identity described by `source`.
    pub fn load(source: &TlsSource) -> Result<Self> {
        let (cert_chain, key) = match &source.certificate {
            CertificateSource::Files { cert, key } => {
                info!(cert = %cert.display(), "using serving certificate from file");
                (read_certs(cert)?, read_key(key)?)
            }
            CertificateSource::SelfSigned { cert_dir, pair_name } => {
                self_signed(cert_dir.as_deref(), pair_name, source.bind_address)?
            }
        };
        let client_roots = source.client_ca_file.as_deref().map(read_roots).transpose()?;
        Ok(Self {
            cert_chain,
            key,
            client_roots,
        })
    }

    /// The leaf certificate
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.cert_chain.first()
    }

    /// Build the rustls configuration for this identity.
    ///
    /// Client certificates are verified against the client CA bundle when the
    /// client presents one; clients without a certificate are still accepted.
    pub fn server_config(&self, min_version: TlsVersion) -> Result<ServerConfig> {
        static TLS12_AND_UP: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13, &rustls::version::TLS12];
        static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let versions = match min_version {
            TlsVersion::Tls12 => TLS12_AND_UP,
            TlsVersion::Tls13 => TLS13_ONLY,
        };
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)
            .map_err(Error::Tls)?;
        let builder = match &self.client_roots {
            Some(roots) => {
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots.clone()), provider)
                    .allow_unauthenticated()
                    .build()
                    .map_err(Error::ClientVerifier)?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };
        let mut config = builder
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())
            .map_err(Error::Tls)?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }
}

fn pair_paths(dir: &Path, pair_name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{pair_name}.crt")),
        dir.join(format!("{pair_name}.key")),
    )
}

type Pair = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

fn self_signed(cert_dir: Option<&Path>, pair_name: &str, host: IpAddr) -> Result<Pair> {
    if let Some(dir) = cert_dir {
        let (cert_path, key_path) = pair_paths(dir, pair_name);
        if cert_path.is_file() && key_path.is_file() {
            info!(cert = %cert_path.display(), "reusing self-signed serving certificate");
            return Ok((read_certs(&cert_path)?, read_key(&key_path)?));
        }
    }

    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    let host_name = host.to_string();
    if !names.contains(&host_name) {
        names.push(host_name);
    }
    debug!(?names, "generating self-signed serving certificate");

    let mut params = CertificateParams::new(names).map_err(Error::SelfSigned)?;
    let issued_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{host}@{issued_at}"));
    let key_pair = KeyPair::generate().map_err(Error::SelfSigned)?;
    let cert = params.self_signed(&key_pair).map_err(Error::SelfSigned)?;

    match cert_dir {
        Some(dir) => {
            let (cert_path, key_path) = pair_paths(dir, pair_name);
            fs::create_dir_all(dir).map_err(|source| Error::WritePem {
                path: dir.to_path_buf(),
                source,
            })?;
            write_pem(&cert_path, &cert.pem(), false)?;
            write_pem(&key_path, &key_pair.serialize_pem(), true)?;
            info!(cert = %cert_path.display(), "generated self-signed serving certificate");
        }
        None => info!("generated in-memory self-signed serving certificate"),
    }

    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    Ok((vec![cert.der().clone()], key))
}

fn write_pem(path: &Path, pem: &str, private: bool) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    if private {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    #[cfg(not(unix))]
    let _ = private;

    options
        .open(path)
        .and_then(|mut file| file.write_all(pem.as_bytes()))
        .map_err(|source| Error::WritePem {
            path: path.to_path_buf(),
            source,
        })
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| Error::ReadPem {
        path: path.to_path_buf(),
        source,
    })
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_pem(path)?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| Error::ReadPem {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(Error::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_pem(path)?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .map_err(|source| Error::ReadPem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| Error::NoPrivateKey(path.to_path_buf()))
}

fn read_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in read_certs(path)? {
        roots.add(cert).map_err(|source| Error::ClientCa {
            path: path.to_path_buf(),
            source,
        })?;
    }
    Ok(roots)
}
