/* SCION Forward Proxy (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/


use std::{
    fs,
    net::{IpAddr, Ipv4Addr},
    path::Path,
    sync::Arc,
};

use anyhow::{anyhow, Context, Result};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, SanType, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer};

use crate::config::TlsConfig;

/// Certificate chain and key the listener presents to clients.
#[derive(Debug)]
pub struct TlsIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl TlsIdentity {
    /// Loads the PEM pair from disk, or generates a self-signed identity and writes it there
    /// when both files are absent and generation is allowed.
    pub fn load_or_generate(cfg: &TlsConfig) -> Result<Self> {
        let cert_exists = cfg.cert_path.exists();
        let key_exists = cfg.key_path.exists();

        if cert_exists != key_exists {
            return Err(anyhow!(
                "TLS certificate and key must both exist or both be absent ({} / {})",
                cfg.cert_path.display(),
                cfg.key_path.display()
            ));
        }

        if cert_exists {
            return Self::load(&cfg.cert_path, &cfg.key_path);
        }

        if !cfg.generate_if_missing {
            return Err(anyhow!(
                "TLS certificate {} not found and generation is disabled",
                cfg.cert_path.display()
            ));
        }

        let cert = generate_self_signed()?;
        for path in [&cfg.cert_path, &cfg.key_path] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&cfg.cert_path, cert.serialize_pem()?)?;
        fs::write(&cfg.key_path, cert.serialize_private_key_pem())?;
        tracing::info!(cert = %cfg.cert_path.display(), "generated self-signed listener identity");

        Self::load(&cfg.cert_path, &cfg.key_path)
    }

    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let chain = CertificateDer::pem_file_iter(cert_path)
            .with_context(|| format!("failed to open {}", cert_path.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid PEM certificate in {}", cert_path.display()))?;
        if chain.is_empty() {
            return Err(anyhow!("no certificate found in {}", cert_path.display()));
        }
        let key = PrivateKeyDer::from_pem_file(key_path)
            .with_context(|| format!("invalid PEM key in {}", key_path.display()))?;
        Ok(Self { chain, key })
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// rustls server config advertising h2 and HTTP/1.1.
    pub fn server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())
            .context("listener certificate rejected by rustls")?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn generate_self_signed() -> Result<Certificate> {
    let mut params = CertificateParams::default();
    params.alg = &PKCS_ECDSA_P256_SHA256;
    params.subject_alt_names = vec![
        SanType::DnsName("localhost".into()),
        SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "SCION Forward Proxy");
    params.distinguished_name = dn;
    Ok(Certificate::from_params(params)?)
}
