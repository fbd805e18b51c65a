//! Node identities.

use std::{
    fmt::{self, Debug, Display},
    hash::Hash,
    str::FromStr,
};

use ed25519_dalek::VerifyingKey;
use nested_enum_utils::common_fields;
use serde::{Deserialize, Serialize};
use snafu::{Backtrace, ResultExt, Snafu};

/// The identity of a node.
///
/// A `NodeId` is the Ed25519 public key of the node.  It is verified to decompress into a
/// valid curve point when created.  Its textual form is the lowercase, unpadded base32
/// encoding of the 32 key bytes, which is also what certificates carry as their subject
/// common name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// The length of a `NodeId`, in bytes.
    pub const LENGTH: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

    /// Get this node id as a byte array.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Construct a `NodeId` from the bytes of an Ed25519 public key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, KeyParsingError> {
        let key = VerifyingKey::from_bytes(bytes).context(KeySnafu)?;
        Ok(Self(key.to_bytes()))
    }

    /// Verify a signature on a message with this node's public key.
    pub fn verify(
        &self,
        message: &[u8],
        signature: &ed25519_dalek::Signature,
    ) -> Result<(), ed25519_dalek::SignatureError> {
        VerifyingKey::from_bytes(&self.0)?.verify_strict(message, signature)
    }

    /// Convert to a base32 string limited to the first 5 bytes for a friendly string
    /// representation of the node id.
    pub fn fmt_short(&self) -> String {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0[..5]);
        text.make_ascii_lowercase();
        text
    }
}

impl From<VerifyingKey> for NodeId {
    fn from(key: VerifyingKey) -> Self {
        Self(key.to_bytes())
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = KeyParsingError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: &[u8; 32] = bytes
            .try_into()
            .map_err(|_| DecodeInvalidLengthSnafu.build())?;
        Self::from_bytes(bytes)
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({self})")
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = data_encoding::BASE32_NOPAD.encode(&self.0);
        text.make_ascii_lowercase();
        f.write_str(&text)
    }
}

/// Parses a [`NodeId`] from its base32 encoding, ignoring case.
impl FromStr for NodeId {
    type Err = KeyParsingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = data_encoding::BASE32_NOPAD_NOCASE
            .decode(s.as_bytes())
            .context(DecodeSnafu)?;
        Self::try_from(bytes.as_slice())
    }
}

impl Serialize for NodeId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            Self::from_str(&s).map_err(serde::de::Error::custom)
        } else {
            let data: [u8; 32] = serde::Deserialize::deserialize(deserializer)?;
            Self::from_bytes(&data).map_err(serde::de::Error::custom)
        }
    }
}

/// Error when parsing a [`NodeId`].
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum KeyParsingError {
    /// Error when decoding the base32 text.
    #[snafu(display("invalid encoding"))]
    Decode { source: data_encoding::DecodeError },
    /// The bytes are not a valid Ed25519 public key.
    #[snafu(display("invalid public key"))]
    Key {
        source: ed25519_dalek::SignatureError,
    },
    /// The encoded information had the wrong length.
    #[snafu(display("invalid length"))]
    DecodeInvalidLength {},
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signer, SigningKey};

    use super::*;

    #[test]
    fn test_node_id_text_roundtrip() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let node_id = NodeId::from(key.verifying_key());
        let text = node_id.to_string();
        assert_eq!(text.len(), 52);
        assert_eq!(text, text.to_ascii_lowercase());
        assert_eq!(text.parse::<NodeId>().unwrap(), node_id);
        assert_eq!(text.to_ascii_uppercase().parse::<NodeId>().unwrap(), node_id);
        assert!(text.starts_with(&node_id.fmt_short()));
    }

    #[test]
    fn test_node_id_parse_errors() {
        assert!(matches!(
            "not base32!".parse::<NodeId>(),
            Err(KeyParsingError::Decode { .. })
        ));
        assert!(matches!(
            "aaaa".parse::<NodeId>(),
            Err(KeyParsingError::DecodeInvalidLength { .. })
        ));
    }

    #[test]
    fn test_node_id_serde() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let node_id = NodeId::from(key.verifying_key());
        let toml = toml::to_string(&std::collections::BTreeMap::from([("id", node_id)])).unwrap();
        assert!(toml.contains(&node_id.to_string()));
        let back: std::collections::BTreeMap<String, NodeId> = toml::from_str(&toml).unwrap();
        assert_eq!(back["id"], node_id);
    }

    #[test]
    fn test_node_id_verify() {
        let key = SigningKey::generate(&mut rand::rngs::OsRng);
        let node_id = NodeId::from(key.verifying_key());
        let signature = key.sign(b"hello");
        node_id.verify(b"hello", &signature).unwrap();
        assert!(node_id.verify(b"goodbye", &signature).is_err());
    }
}
