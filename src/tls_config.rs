// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Builds a `rustls::ServerConfig` from the certificate/key material named
//! by a block's `tls` directive. Shared by every transport that terminates
//! TLS itself (TLS, QUIC, HTTPS, HTTPS/3, gRPC-over-TLS).

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;

use crate::config::block::TlsMaterial;
use crate::error::ListenError;

pub fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, ListenError> {
    let file = File::open(path).map_err(|e| ListenError::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ListenError::Tls(format!("{}: {e}", path.display())))
}

pub fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, ListenError> {
    let file = File::open(path).map_err(|e| ListenError::Tls(format!("{}: {e}", path.display())))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| ListenError::Tls(format!("{}: {e}", path.display())))?
        .ok_or_else(|| ListenError::Tls(format!("{}: no private key found", path.display())))
}

/// Build a server config for ALPN-agnostic transports (plain TLS/DoT).
pub fn server_config(material: &TlsMaterial) -> Result<Arc<ServerConfig>, ListenError> {
    server_config_with_alpn(material, &[])
}

/// Same, but with an explicit ALPN protocol list (`h2`/`http/1.1` for
/// HTTPS, `doq` for QUIC per RFC 9250 §4.1, `h3` for HTTPS/3).
pub fn server_config_with_alpn(
    material: &TlsMaterial,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, ListenError> {
    let certs = load_certs(&material.cert_path)?;
    let key = load_key(&material.key_path)?;
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| ListenError::Tls(e.to_string()))?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}
