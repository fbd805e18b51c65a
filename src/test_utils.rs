//! Internal utilities to support testing.
//!
//! Generates node certificates, valid and broken in the ways the verifiers need to see, and
//! a TCP echo server to stand in for a backend service.
use std::net::{Ipv4Addr, SocketAddr};

use ed25519_dalek::{pkcs8::EncodePrivateKey, Signer, SigningKey};
use rcgen::{
    CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;
use tokio::{io::AsyncWriteExt, net::TcpListener};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info_span, Instrument};

use crate::{
    key::NodeId,
    tls::{
        certificate::{encode_node_signature, node_signature_message, NODE_SIGNATURE_OID},
        TlsConfig,
    },
};

/// A node key together with a certificate issued for it.
#[derive(derive_more::Debug)]
pub struct CertifiedNode {
    /// The node's signing key.
    #[debug(skip)]
    pub key: SigningKey,
    /// The node id of [`Self::key`].
    pub node_id: NodeId,
    #[debug(skip)]
    key_pair: KeyPair,
    #[debug(skip)]
    cert: rcgen::Certificate,
}

/// How the node signature extension of a generated certificate is made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeSignatureMode {
    /// Signed by the node key.
    Valid,
    /// Signed by an unrelated key.
    OtherKey,
    /// Not present.
    Missing,
}

/// The subject common name of a generated certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommonName {
    /// The node id of the certificate key.
    NodeId,
    /// No common name at all.
    Missing,
    /// Any string.
    Custom(String),
}

impl CertifiedNode {
    /// A fresh node with a valid self-signed certificate.
    pub fn self_signed() -> Self {
        Self::builder().build()
    }

    /// Starts building a fresh node with a self-signed certificate.
    pub fn builder() -> CertifiedNodeBuilder<'static> {
        CertifiedNodeBuilder {
            issuer: None,
            signer: None,
            node_signature: NodeSignatureMode::Valid,
            common_name: CommonName::NodeId,
            validity: None,
        }
    }

    /// Starts building a fresh node whose certificate is issued by this node.
    pub fn issue(&self) -> CertifiedNodeBuilder<'_> {
        CertifiedNodeBuilder {
            issuer: Some(self),
            ..Self::builder()
        }
    }

    /// The DER encoded certificate.
    pub fn der(&self) -> &CertificateDer<'static> {
        self.cert.der()
    }

    /// The PEM encoded certificate.
    pub fn cert_pem(&self) -> String {
        self.cert.pem()
    }

    /// The PKCS#8 DER encoded private key.
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivatePkcs8KeyDer::from(self.key_pair.serialize_der()).into()
    }

    /// The PKCS#8 PEM encoded private key.
    pub fn key_pem(&self) -> String {
        self.key_pair.serialize_pem()
    }

    /// A TLS configuration presenting just this node's certificate.
    pub fn tls_config(&self) -> TlsConfig {
        self.tls_config_with_chain(vec![self.der().clone()])
    }

    /// A TLS configuration presenting `chain` with this node's key.
    pub fn tls_config_with_chain(&self, chain: Vec<CertificateDer<'static>>) -> TlsConfig {
        TlsConfig::new(self.private_key_der(), chain).expect("valid key")
    }
}

/// Builder for a [`CertifiedNode`].
#[derive(Debug)]
pub struct CertifiedNodeBuilder<'a> {
    issuer: Option<&'a CertifiedNode>,
    signer: Option<&'a CertifiedNode>,
    node_signature: NodeSignatureMode,
    common_name: CommonName,
    validity: Option<(OffsetDateTime, OffsetDateTime)>,
}

impl<'a> CertifiedNodeBuilder<'a> {
    /// Signs an issued certificate with `signer`'s key, still naming the issuer as usual.
    pub fn signed_with(mut self, signer: &'a CertifiedNode) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Sets how the node signature extension is made.
    pub fn node_signature(mut self, mode: NodeSignatureMode) -> Self {
        self.node_signature = mode;
        self
    }

    /// Sets the subject common name.
    pub fn common_name(mut self, common_name: CommonName) -> Self {
        self.common_name = common_name;
        self
    }

    /// Sets the validity period, by default it spans a day around now.
    pub fn validity(mut self, not_before: OffsetDateTime, not_after: OffsetDateTime) -> Self {
        self.validity = Some((not_before, not_after));
        self
    }

    /// Generates the key and the certificate.
    pub fn build(self) -> CertifiedNode {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let node_id = NodeId::from(key.verifying_key());
        let pkcs8 = key.to_pkcs8_der().expect("encodable key");
        let key_pair = KeyPair::try_from(pkcs8.as_bytes()).expect("ed25519 key");

        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        match self.common_name {
            CommonName::NodeId => name.push(DnType::CommonName, node_id.to_string()),
            CommonName::Missing => name.push(DnType::OrganizationName, "node"),
            CommonName::Custom(common_name) => name.push(DnType::CommonName, common_name),
        }
        params.distinguished_name = name;

        let now = OffsetDateTime::now_utc();
        let (not_before, not_after) = self
            .validity
            .unwrap_or((now - time::Duration::DAY, now + time::Duration::DAY));
        params.not_before = not_before;
        params.not_after = not_after;

        // a positive serial without leading zero is encoded as is
        let mut serial: [u8; 16] = rand::random();
        serial[0] = serial[0] % 0x7f + 1;
        params.serial_number = Some(SerialNumber::from(serial.to_vec()));

        let signer = match self.node_signature {
            NodeSignatureMode::Valid => Some(key.clone()),
            NodeSignatureMode::OtherKey => Some(SigningKey::generate(&mut rand::rngs::OsRng)),
            NodeSignatureMode::Missing => None,
        };
        if let Some(signer) = signer {
            let message = node_signature_message(&key_pair.public_key_der(), &serial);
            let content =
                encode_node_signature(&signer.sign(&message)).expect("encodable signature");
            params
                .custom_extensions
                .push(CustomExtension::from_oid_content(&NODE_SIGNATURE_OID, content));
        }

        let cert = match self.issuer {
            Some(issuer) => {
                let signer = self.signer.unwrap_or(issuer);
                params.signed_by(&key_pair, &issuer.cert, &signer.key_pair)
            }
            None => params.self_signed(&key_pair),
        }
        .expect("valid certificate parameters");

        CertifiedNode {
            key,
            node_id,
            key_pair,
            cert,
        }
    }
}

/// Runs a TCP server on localhost which echoes back whatever it receives.
///
/// Each connection is echoed until the client ends its side, then closed.
pub async fn echo_server() -> (SocketAddr, AbortOnDropHandle<()>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind echo server");
    let addr = listener.local_addr().expect("bound");
    let task = tokio::spawn(
        async move {
            loop {
                let Ok((mut stream, peer)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let (mut read, mut write) = stream.split();
                    match tokio::io::copy(&mut read, &mut write).await {
                        Ok(bytes) => debug!(%peer, bytes, "echo finished"),
                        Err(err) => debug!(%peer, "echo failed: {err:#}"),
                    }
                    write.shutdown().await.ok();
                });
            }
        }
        .instrument(info_span!("echo", %addr)),
    );
    (addr, AbortOnDropHandle::new(task))
}
