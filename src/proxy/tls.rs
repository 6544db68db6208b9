//! Certificate identity loading and SNI-driven server certificate
//! selection, plus the TLS client config used to dial real upstreams.

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

const FULLCHAIN_SUFFIX: &str = ".fullchain";
const PRIVKEY_SUFFIX: &str = ".privkey";

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read certificate directory {0}: {1}")]
    ReadDir(PathBuf, #[source] std::io::Error),
    #[error("no usable certificate identities in {0}")]
    NoIdentities(PathBuf),
    #[error("invalid upstream server name {0:?}")]
    InvalidServerName(String),
    #[error("upstream TLS handshake failed: {0}")]
    Handshake(#[source] std::io::Error),
}

struct Identity {
    name: String,
    key: Arc<CertifiedKey>,
}

/// Certificate identities loaded from a directory of
/// `<name>.fullchain` / `<name>.privkey` PEM pairs, where `<name>` is the
/// hostname the pair serves.
pub struct IdentitySet {
    identities: Vec<Identity>,
}

impl IdentitySet {
    /// Scans a directory for certificate pairs. Unreadable or incomplete
    /// pairs are skipped with a warning; a directory yielding no usable
    /// identity is fatal since the TLS listener could never handshake.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, TlsError> {
        let dir = dir.as_ref();
        let entries =
            std::fs::read_dir(dir).map_err(|e| TlsError::ReadDir(dir.to_path_buf(), e))?;

        let mut identities = Vec::new();
        for entry in entries.flatten() {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some(name) = file_name.strip_suffix(FULLCHAIN_SUFFIX) else {
                continue;
            };

            let cert_path = entry.path();
            let key_path = dir.join(format!("{}{}", name, PRIVKEY_SUFFIX));
            match load_identity(&cert_path, &key_path) {
                Ok(key) => {
                    info!("loaded certificate identity {}", name);
                    identities.push(Identity {
                        name: name.to_string(),
                        key: Arc::new(key),
                    });
                }
                Err(e) => warn!("skipping certificate identity {}: {}", name, e),
            }
        }

        if identities.is_empty() {
            return Err(TlsError::NoIdentities(dir.to_path_buf()));
        }
        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { identities })
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Picks the identity for an SNI value: an exact name first, then an
    /// identity whose name is a parent domain of the SNI, then the first
    /// identity as a last resort (also used when the client sent no SNI).
    fn resolve_identity(&self, server_name: Option<&str>) -> Option<&Identity> {
        if let Some(sni) = server_name {
            if let Some(identity) = self.identities.iter().find(|i| i.name == sni) {
                return Some(identity);
            }
            if let Some(identity) = self.identities.iter().find(|i| {
                sni.strip_suffix(&i.name)
                    .map(|prefix| prefix.ends_with('.'))
                    .unwrap_or(false)
            }) {
                return Some(identity);
            }
        }
        self.identities.first()
    }

    pub fn resolve(&self, server_name: Option<&str>) -> Option<Arc<CertifiedKey>> {
        self.resolve_identity(server_name)
            .map(|identity| Arc::clone(&identity.key))
    }
}

fn load_identity(cert_path: &Path, key_path: &Path) -> Result<CertifiedKey, String> {
    let mut reader = BufReader::new(
        File::open(cert_path).map_err(|e| format!("open {}: {}", cert_path.display(), e))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<Result<_, _>>()
        .map_err(|e| format!("parse {}: {}", cert_path.display(), e))?;
    if certs.is_empty() {
        return Err(format!("no certificates in {}", cert_path.display()));
    }

    let mut reader = BufReader::new(
        File::open(key_path).map_err(|e| format!("open {}: {}", key_path.display(), e))?,
    );
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut reader)
        .map_err(|e| format!("parse {}: {}", key_path.display(), e))?
        .ok_or_else(|| format!("no private key in {}", key_path.display()))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| format!("unsupported key type in {}: {}", key_path.display(), e))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Certificate resolver that picks a loaded identity based on SNI.
struct IdentityResolver {
    set: Arc<IdentitySet>,
}

impl fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for IdentityResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name();
        debug!("resolving certificate for SNI: {:?}", sni);
        self.set.resolve(sni)
    }
}

/// Creates a rustls ServerConfig with SNI-based certificate resolution.
pub fn server_config(identities: Arc<IdentitySet>) -> Arc<ServerConfig> {
    let resolver = Arc::new(IdentityResolver { set: identities });
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    Arc::new(config)
}

fn upstream_client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    Arc::clone(CONFIG.get_or_init(|| {
        let root_store = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        )
    }))
}

/// Wraps an established TCP connection in a verified TLS session to the
/// real upstream host.
pub async fn connect_upstream(
    stream: TcpStream,
    host: &str,
) -> Result<TlsStream<TcpStream>, TlsError> {
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|_| TlsError::InvalidServerName(host.to_string()))?;
    let connector = TlsConnector::from(upstream_client_config());
    connector
        .connect(server_name, stream)
        .await
        .map_err(TlsError::Handshake)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_identity(dir: &Path, name: &str) {
        let key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec![name.to_string()])
            .unwrap()
            .self_signed(&key)
            .unwrap();
        fs::write(dir.join(format!("{}{}", name, FULLCHAIN_SUFFIX)), cert.pem()).unwrap();
        fs::write(
            dir.join(format!("{}{}", name, PRIVKEY_SUFFIX)),
            key.serialize_pem(),
        )
        .unwrap();
    }

    #[test]
    fn loads_identities_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path(), "example.com");
        write_identity(dir.path(), "other.test");

        let set = IdentitySet::load_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            IdentitySet::load_dir(dir.path()),
            Err(TlsError::NoIdentities(_))
        ));
    }

    /// A fullchain file without a parsable key pair is skipped, not fatal.
    #[test]
    fn skips_incomplete_pair() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path(), "good.example.com");
        fs::write(dir.path().join("orphan.example.com.fullchain"), "not a cert").unwrap();

        let set = IdentitySet::load_dir(dir.path()).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(
            set.resolve_identity(Some("good.example.com")).unwrap().name,
            "good.example.com"
        );
    }

    #[test]
    fn resolves_by_sni() {
        let dir = tempfile::tempdir().unwrap();
        write_identity(dir.path(), "example.com");
        write_identity(dir.path(), "zz.test");
        let set = IdentitySet::load_dir(dir.path()).unwrap();

        // Exact match.
        assert_eq!(
            set.resolve_identity(Some("zz.test")).unwrap().name,
            "zz.test"
        );
        // Subdomains fall back to the parent-domain identity.
        assert_eq!(
            set.resolve_identity(Some("www.example.com")).unwrap().name,
            "example.com"
        );
        // A lookalike name is not a subdomain; first identity wins.
        assert_eq!(
            set.resolve_identity(Some("notexample.com")).unwrap().name,
            "example.com"
        );
        // No SNI at all.
        assert_eq!(set.resolve_identity(None).unwrap().name, "example.com");
    }
}
