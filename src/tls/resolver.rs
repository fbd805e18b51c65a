use std::sync::Arc;

use rustls::{server::ClientHello, sign::CertifiedKey, SignatureScheme};

use super::SharedTlsConfig;

/// Resolves to whatever key and chain is configured when the handshake runs.
#[derive(Debug)]
pub(super) struct CurrentCert {
    config: SharedTlsConfig,
}

impl CurrentCert {
    pub(super) fn new(config: SharedTlsConfig) -> Self {
        Self { config }
    }
}

impl rustls::client::ResolvesClientCert for CurrentCert {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.config.certified_key())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

impl rustls::server::ResolvesServerCert for CurrentCert {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.config.certified_key())
    }
}
