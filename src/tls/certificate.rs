//! X.509 certificate handling.
//!
//! Every certificate a node presents names its [`NodeId`] as the subject common name and
//! carries a node signature extension.  The extension holds a signature by the subject key
//! over the certificate's public key and serial number, proving that the holder of the
//! node's private key produced this certificate.

use der::{asn1::OctetStringRef, Decode, Sequence};
use nested_enum_utils::common_fields;
use snafu::{Backtrace, ResultExt, Snafu};
use x509_parser::{oid_registry::OID_SIG_ED25519, prelude::*};

use crate::key::NodeId;

/// The node signature extension is a X.509 extension with this Object Identifier.
///
/// The extension is not marked critical, so that generic TLS stacks accept the certificate.
pub const NODE_SIGNATURE_OID: [u64; 9] = [1, 3, 6, 1, 4, 1, 57616, 1, 1];

/// The node signs the concatenation of this prefix, the DER encoded subject public key info
/// and the raw serial number of the certificate.
pub const NODE_SIGNATURE_PREFIX: [u8; 15] = *b"node-signature:";

/// The signature is DER encoded into this structure, which is carried in the node signature
/// extension.
#[derive(Clone, Debug, Eq, PartialEq, Sequence)]
pub(crate) struct NodeSignature<'a> {
    pub(crate) signature: OctetStringRef<'a>,
}

/// Builds the message a node signs for the node signature extension.
pub fn node_signature_message(subject_public_key_info: &[u8], serial: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(
        NODE_SIGNATURE_PREFIX.len() + subject_public_key_info.len() + serial.len(),
    );
    message.extend_from_slice(&NODE_SIGNATURE_PREFIX);
    message.extend_from_slice(subject_public_key_info);
    message.extend_from_slice(serial);
    message
}

/// Encodes the content of the node signature extension.
pub fn encode_node_signature(signature: &ed25519_dalek::Signature) -> Result<Vec<u8>, der::Error> {
    use der::Encode;

    let bytes = signature.to_bytes();
    NodeSignature {
        signature: OctetStringRef::new(&bytes)?,
    }
    .to_der()
}

/// Attempts to parse the provided bytes as a [`NodeCertificate`].
///
/// Parsing checks only the structure, none of the node specific properties.
pub fn parse(der: &[u8]) -> Result<NodeCertificate<'_>, ParseError> {
    let (_rest, x509) = X509Certificate::from_der(der).map_err(|_| ParseSnafu.build())?;
    Ok(NodeCertificate { x509 })
}

/// A parsed X.509 certificate of a node.
#[derive(Debug)]
pub struct NodeCertificate<'a> {
    x509: X509Certificate<'a>,
}

impl NodeCertificate<'_> {
    /// Whether `unix_secs` lies within the validity period of this certificate.
    pub fn is_valid_at(&self, unix_secs: i64) -> bool {
        ASN1Time::from_timestamp(unix_secs)
            .map(|now| self.x509.validity().is_valid_at(now))
            .unwrap_or(false)
    }

    /// The first common name of the subject, if present and readable.
    pub fn common_name(&self) -> Option<&str> {
        self.x509
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
    }

    /// The [`NodeId`] formed by the subject public key.
    pub fn public_key(&self) -> Result<NodeId, VerificationError> {
        let spki = self.x509.public_key();
        snafu::ensure!(
            spki.algorithm.algorithm == OID_SIG_ED25519,
            UnsupportedKeySnafu
        );
        NodeId::try_from(spki.subject_public_key.data.as_ref()).context(InvalidKeySnafu)
    }

    /// Checks the node signature extension against the subject public key.
    pub fn verify_node_signature(&self) -> Result<(), VerificationError> {
        let node_id = self.public_key()?;
        let oid = x509_parser::der_parser::oid::Oid::from(&NODE_SIGNATURE_OID)
            .map_err(|_| MissingExtensionSnafu.build())?;

        let mut extension = None;
        for ext in self.x509.extensions() {
            if ext.oid == oid {
                snafu::ensure!(extension.is_none(), DuplicateExtensionSnafu);
                extension = Some(ext);
            }
        }
        let extension = extension.ok_or_else(|| MissingExtensionSnafu.build())?;
        let content =
            NodeSignature::from_der(extension.value).map_err(|_| MalformedExtensionSnafu.build())?;
        let signature = ed25519_dalek::Signature::from_slice(content.signature.as_bytes())
            .map_err(|_| MalformedExtensionSnafu.build())?;

        let message = node_signature_message(
            self.x509.public_key().raw,
            self.x509.tbs_certificate.raw_serial(),
        );
        node_id
            .verify(&message, &signature)
            .map_err(|_| BadSignatureSnafu.build())
    }

    /// Whether `parent`'s subject is the issuer of this certificate.
    pub fn is_issued_by(&self, parent: &NodeCertificate<'_>) -> bool {
        self.x509.issuer().as_raw() == parent.x509.subject().as_raw()
    }

    /// Whether this certificate carries a valid signature by `parent`'s key.
    pub fn is_verified_by(&self, parent: &NodeCertificate<'_>) -> bool {
        self.x509
            .verify_signature(Some(parent.x509.public_key()))
            .is_ok()
    }
}

/// An error that occurs during certificate parsing.
#[derive(Debug, Snafu)]
#[snafu(display("malformed certificate"))]
pub struct ParseError {
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
}

/// An error that occurs when verifying the node properties of a certificate.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum VerificationError {
    #[snafu(display("subject key is not an Ed25519 key"))]
    UnsupportedKey {},
    #[snafu(display("subject key is invalid"))]
    InvalidKey {
        source: crate::key::KeyParsingError,
    },
    #[snafu(display("node signature extension is missing"))]
    MissingExtension {},
    #[snafu(display("node signature extension is present more than once"))]
    DuplicateExtension {},
    #[snafu(display("node signature extension is malformed"))]
    MalformedExtension {},
    #[snafu(display("node signature does not match the subject key"))]
    BadSignature {},
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CertifiedNode, NodeSignatureMode};

    #[test]
    fn test_parse_node_certificate() {
        let node = CertifiedNode::self_signed();
        let cert = parse(node.der()).unwrap();
        assert_eq!(cert.common_name(), Some(node.node_id.to_string().as_str()));
        assert_eq!(cert.public_key().unwrap(), node.node_id);
        cert.verify_node_signature().unwrap();
        assert!(cert.is_issued_by(&cert));
        assert!(cert.is_verified_by(&cert));
    }

    #[test]
    fn test_node_signature_by_other_key() {
        let node = CertifiedNode::builder()
            .node_signature(NodeSignatureMode::OtherKey)
            .build();
        let cert = parse(node.der()).unwrap();
        assert!(matches!(
            cert.verify_node_signature(),
            Err(VerificationError::BadSignature { .. })
        ));
    }

    #[test]
    fn test_node_signature_missing() {
        let node = CertifiedNode::builder()
            .node_signature(NodeSignatureMode::Missing)
            .build();
        let cert = parse(node.der()).unwrap();
        assert!(matches!(
            cert.verify_node_signature(),
            Err(VerificationError::MissingExtension { .. })
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse(b"definitely not a certificate").is_err());
    }
}
