//! Optional TLS termination (§6): rustls configured from a PEM cert/key
//! pair, enforced at TLS 1.2 or above.

use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};

pub fn load_server_config(cert_path: &Path, key_path: &Path) -> eyre::Result<Arc<ServerConfig>> {
    let cert_chain = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)?;

    Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> eyre::Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let raw = std::fs::read(path)?;
    let mut reader = std::io::BufReader::new(raw.as_slice());
    certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| eyre::eyre!("could not parse certificate at {}: {e}", path.display()))
}

fn load_private_key(path: &Path) -> eyre::Result<rustls::pki_types::PrivateKeyDer<'static>> {
    let raw = std::fs::read(path)?;

    let mut reader = std::io::BufReader::new(raw.as_slice());
    if let Some(key) = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| eyre::eyre!("could not parse PKCS8 key at {}: {e}", path.display()))?
    {
        return Ok(key.into());
    }

    let mut reader = std::io::BufReader::new(raw.as_slice());
    if let Some(key) = rsa_private_keys(&mut reader)
        .next()
        .transpose()
        .map_err(|e| eyre::eyre!("could not parse RSA key at {}: {e}", path.display()))?
    {
        return Ok(key.into());
    }

    eyre::bail!("no private key found in {}", path.display())
}
