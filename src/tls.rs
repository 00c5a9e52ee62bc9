//! TLS material for the HTTPS listener

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

pub fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open certificate file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to parse certificates from {}: {}", path.display(), e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| anyhow::anyhow!("Failed to open key file {}: {}", path.display(), e))?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse key from {}: {}", path.display(), e))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", path.display()))
}

/// Generate a self-signed certificate for `server_name` and write it as PEM
pub fn generate_self_signed(cert_path: &Path, key_path: &Path, server_name: &str) -> anyhow::Result<()> {
    let mut params = CertificateParams::new(vec![server_name.to_string(), "localhost".to_string()])
        .map_err(|e| anyhow::anyhow!("Invalid certificate name {}: {}", server_name, e))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::OrganizationName, "private server");
    name.push(DnType::CommonName, server_name);
    params.distinguished_name = name;

    let key_pair = KeyPair::generate()
        .map_err(|e| anyhow::anyhow!("Failed to generate key pair: {}", e))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| anyhow::anyhow!("Failed to generate self-signed certificate: {}", e))?;

    for path in [cert_path, key_path] {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
    }

    fs::write(cert_path, cert.pem())
        .map_err(|e| anyhow::anyhow!("Failed to write certificate {}: {}", cert_path.display(), e))?;
    write_private(key_path, key_pair.serialize_pem().as_bytes())
        .map_err(|e| anyhow::anyhow!("Failed to write key {}: {}", key_path.display(), e))?;

    info!(cert = %cert_path.display(), key = %key_path.display(), server_name, "Generated self-signed certificate");
    Ok(())
}

fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(content)
}

pub fn build_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> anyhow::Result<TlsAcceptor> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Certificate and key file names used when the configured paths are not
/// writable: `<dir>/<server_name>.cert` and `<dir>/<server_name>.key`
pub fn fallback_paths(dir: &Path, server_name: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{}.cert", server_name)),
        dir.join(format!("{}.key", server_name)),
    )
}

fn load_pair(cert: &Path, key: &Path) -> anyhow::Result<TlsAcceptor> {
    build_acceptor(load_certs(cert)?, load_key(key)?)
}

/// Load the configured certificate, generating a self-signed one if that fails.
/// Generation targets the configured paths first and `fallback_dir` second.
pub fn load_or_generate(cert: &Path, key: &Path, server_name: &str, fallback_dir: &Path) -> anyhow::Result<TlsAcceptor> {
    let load_error = match load_pair(cert, key) {
        Ok(acceptor) => return Ok(acceptor),
        Err(e) => e,
    };
    warn!(cert = %cert.display(), error = %load_error, "Cannot load TLS certificate, generating one");

    match generate_self_signed(cert, key, server_name) {
        Ok(()) => load_pair(cert, key),
        Err(e) => {
            let (fallback_cert, fallback_key) = fallback_paths(fallback_dir, server_name);
            warn!(
                error = %e,
                cert = %fallback_cert.display(),
                "Cannot write configured TLS paths, using configuration directory"
            );
            if load_pair(&fallback_cert, &fallback_key).is_err() {
                generate_self_signed(&fallback_cert, &fallback_key, server_name)?;
            }
            load_pair(&fallback_cert, &fallback_key)
                .map_err(|e2| anyhow::anyhow!("{}: {}", load_error, e2))
        }
    }
}
