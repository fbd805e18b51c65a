//! TLS configuration for tunnels.
//!
//! Tunnels run TLS 1.3 inside QUIC with mandatory client authentication.  rustls only
//! checks that the peer holds the key of the certificate it presents; who the peer is gets
//! decided once the handshake completes, by the [`chain`] verifiers.

use std::sync::{Arc, RwLock};

use nested_enum_utils::common_fields;
use quinn::crypto::rustls::{NoInitialCipherSuite, QuicClientConfig, QuicServerConfig};
use rustls::{
    pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer},
    sign::CertifiedKey,
};
use snafu::{Backtrace, ResultExt, Snafu};

use self::resolver::CurrentCert;
use crate::{connection::ConnectionConfig, key::NodeId};

pub mod certificate;
pub mod chain;
mod resolver;
mod verifier;

/// The ALPN protocol spoken on tunnels.
pub const TUNNEL_ALPN: &[u8] = b"n0/node-proxy/1";

/// The key and certificate chain a proxy presents to its peers.
#[derive(Clone, derive_more::Debug)]
pub struct TlsConfig {
    #[debug(skip)]
    key: Arc<CertifiedKey>,
    node_id: Option<NodeId>,
}

impl TlsConfig {
    /// Creates a new configuration from a private key and the matching certificate chain,
    /// leaf first.
    pub fn new(
        private_key: PrivateKeyDer<'static>,
        certificate_chain: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TlsConfigError> {
        snafu::ensure!(!certificate_chain.is_empty(), EmptyChainSnafu);
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&private_key).context(KeySnafu)?;
        let node_id = chain::leaf_node_id(&certificate_chain);
        Ok(Self {
            key: Arc::new(CertifiedKey::new(certificate_chain, signing_key)),
            node_id,
        })
    }

    /// Creates a new configuration from PEM encoded key and certificate chain.
    pub fn from_pem(private_key: &[u8], certificate_chain: &[u8]) -> Result<Self, TlsConfigError> {
        let private_key = PrivateKeyDer::from_pem_slice(private_key).context(PemSnafu)?;
        let certificate_chain = CertificateDer::pem_slice_iter(certificate_chain)
            .collect::<Result<Vec<_>, _>>()
            .context(PemSnafu)?;
        Self::new(private_key, certificate_chain)
    }

    /// The certificate chain, leaf first.
    pub fn certificate_chain(&self) -> &[CertificateDer<'static>] {
        &self.key.cert
    }

    /// The node id claimed by the leaf certificate.
    pub fn node_id(&self) -> Option<NodeId> {
        self.node_id
    }
}

/// The [`TlsConfig`] shared by the proxy and all of its connections.
///
/// Handshakes read the current value, so replacing it only affects handshakes that start
/// afterwards.
#[derive(Debug, Clone)]
pub(crate) struct SharedTlsConfig(Arc<RwLock<TlsConfig>>);

impl SharedTlsConfig {
    pub(crate) fn new(config: TlsConfig) -> Self {
        Self(Arc::new(RwLock::new(config)))
    }

    pub(crate) fn get(&self) -> TlsConfig {
        self.0.read().expect("poisoned").clone()
    }

    pub(crate) fn set(&self, config: TlsConfig) {
        *self.0.write().expect("poisoned") = config;
    }

    fn certified_key(&self) -> Arc<CertifiedKey> {
        self.0.read().expect("poisoned").key.clone()
    }
}

/// Builds the QUIC transport parameters of a tunnel.
pub(crate) fn transport_config(config: &ConnectionConfig) -> quinn::TransportConfig {
    let mut transport = quinn::TransportConfig::default();
    transport
        .keep_alive_interval(Some(config.keep_alive_interval))
        .max_concurrent_bidi_streams(1u32.into())
        .max_concurrent_uni_streams(0u32.into());
    if let Ok(idle) = quinn::IdleTimeout::try_from(config.keep_alive_timeout) {
        transport.max_idle_timeout(Some(idle));
    }
    transport
}

/// Creates the QUIC client configuration used by forward connections.
pub(crate) fn make_client_config(
    tls: &SharedTlsConfig,
    config: &ConnectionConfig,
) -> Result<quinn::ClientConfig, CreateConfigError> {
    let mut crypto = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(verifier::PROTOCOL_VERSIONS)
    .expect("version supported by ring")
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(verifier::ServerCertificateVerifier::new()))
    .with_client_cert_resolver(Arc::new(CurrentCert::new(tls.clone())));
    crypto.alpn_protocols = vec![TUNNEL_ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(crypto)?;
    let mut client_config = quinn::ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config(config)));
    Ok(client_config)
}

/// Creates the QUIC server configuration used for reverse connections.
pub(crate) fn make_server_config(
    tls: &SharedTlsConfig,
    config: &ConnectionConfig,
) -> Result<quinn::ServerConfig, CreateConfigError> {
    let mut crypto = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_protocol_versions(verifier::PROTOCOL_VERSIONS)
    .expect("fixed config")
    .with_client_cert_verifier(Arc::new(verifier::ClientCertificateVerifier::new()))
    .with_cert_resolver(Arc::new(CurrentCert::new(tls.clone())));
    crypto.alpn_protocols = vec![TUNNEL_ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(crypto)?;
    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    server_config.transport_config(Arc::new(transport_config(config)));
    Ok(server_config)
}

/// Error for loading a [`TlsConfig`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum TlsConfigError {
    #[snafu(display("certificate chain is empty"))]
    EmptyChain {},
    #[snafu(display("unsupported private key"))]
    Key { source: rustls::Error },
    #[snafu(display("invalid PEM"))]
    Pem {
        source: rustls::pki_types::pem::Error,
    },
}

/// Error for generating QUIC configs.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum CreateConfigError {
    #[snafu(display("error creating QUIC config"), context(false))]
    Quic { source: NoInitialCipherSuite },
}
