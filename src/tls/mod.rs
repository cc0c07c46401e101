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


//! TLS material: the listener identity and the client config used toward TLS origins.

mod identity;

pub use identity::TlsIdentity;

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};
use rustls::pki_types::{pem::PemObject, CertificateDer};

/// Client config for origin connections: webpki roots plus an optional PEM bundle, ALPN
/// offering h2 then HTTP/1.1.
pub fn upstream_client_config(ca_bundle: Option<&Path>) -> Result<Arc<rustls::ClientConfig>> {
    let mut store = rustls::RootCertStore::empty();
    store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(bundle) = ca_bundle {
        let certs = CertificateDer::pem_file_iter(bundle)
            .with_context(|| format!("failed to open CA bundle {}", bundle.display()))?
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("invalid PEM in CA bundle {}", bundle.display()))?;
        let (added, ignored) = store.add_parsable_certificates(certs);
        tracing::debug!(added, ignored, bundle = %bundle.display(), "loaded upstream CA bundle");
    }

    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(store)
        .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}
