//! Verification of the certificate chains peers present.
//!
//! Chains are ordered from the leaf at index 0 towards the oldest certificate.  A node
//! rotating its key issues its new certificate with its previous key, so that a peer which
//! only knows an old [`NodeId`] can follow the lineage down to the current leaf.

use std::time::{SystemTime, UNIX_EPOCH};

use nested_enum_utils::common_fields;
use rustls::pki_types::CertificateDer;
use snafu::{ensure, Backtrace, OptionExt, Snafu};

use super::certificate::{self, NodeCertificate};
use crate::key::NodeId;

/// Verifies the chain presented by a server, expecting one of `node_ids`.
///
/// Walks the chain from the leaf and stops at the first certificate claiming one of the
/// expected node ids.  Every certificate up to and including that one must be valid, and
/// each of them must be issued and signed by the next.  Returns the claimed [`NodeId`].
pub fn verify_server_chain(
    node_ids: &[NodeId],
    chain: &[CertificateDer<'_>],
) -> Result<NodeId, ChainError> {
    verify_server_chain_at(node_ids, chain, unix_now())
}

/// Like [`verify_server_chain`], with an explicit verification time in seconds since the
/// unix epoch.
pub fn verify_server_chain_at(
    node_ids: &[NodeId],
    chain: &[CertificateDer<'_>],
    now: i64,
) -> Result<NodeId, ChainError> {
    ensure!(!chain.is_empty(), EmptySnafu);
    ensure!(!node_ids.is_empty(), NoCandidatesSnafu);

    let mut parsed = Vec::with_capacity(chain.len());
    let mut claimed = None;
    for (index, der) in chain.iter().enumerate() {
        let cert = parse(index, der)?;
        let node_id = check_certificate(index, &cert, now)?;
        parsed.push(cert);
        if node_ids.contains(&node_id) {
            claimed = Some((index, node_id));
            break;
        }
    }
    let (claim_index, node_id) = claimed.context(UnclaimedSnafu)?;

    for index in (1..=claim_index).rev() {
        let parent = &parsed[index];
        let child = &parsed[index - 1];
        ensure!(
            child.is_issued_by(parent) && child.is_verified_by(parent),
            BrokenSnafu { index: index - 1 }
        );
    }
    Ok(node_id)
}

/// Verifies the chain presented by a client.
///
/// Every certificate must be valid, and each must be issued and signed by the next.  Which
/// node the client is does not matter here; its identity is the [`NodeId`] of the leaf.
pub fn verify_client_chain(chain: &[CertificateDer<'_>]) -> Result<NodeId, ChainError> {
    verify_client_chain_at(chain, unix_now())
}

/// Like [`verify_client_chain`], with an explicit verification time in seconds since the
/// unix epoch.
pub fn verify_client_chain_at(
    chain: &[CertificateDer<'_>],
    now: i64,
) -> Result<NodeId, ChainError> {
    ensure!(!chain.is_empty(), EmptySnafu);

    let mut parsed = Vec::with_capacity(chain.len());
    let mut leaf = None;
    for (index, der) in chain.iter().enumerate() {
        let cert = parse(index, der)?;
        let node_id = check_certificate(index, &cert, now)?;
        leaf.get_or_insert(node_id);
        parsed.push(cert);
    }

    for (index, pair) in parsed.windows(2).enumerate() {
        let (child, parent) = (&pair[0], &pair[1]);
        ensure!(
            child.is_issued_by(parent) && child.is_verified_by(parent),
            BrokenSnafu { index }
        );
    }
    leaf.context(EmptySnafu)
}

/// Returns the [`NodeId`] the leaf certificate of `chain` claims, without any checks.
pub(crate) fn leaf_node_id(chain: &[CertificateDer<'_>]) -> Option<NodeId> {
    let leaf = certificate::parse(chain.first()?).ok()?;
    leaf.common_name()?.parse().ok()
}

fn parse<'a>(index: usize, der: &'a CertificateDer<'_>) -> Result<NodeCertificate<'a>, ChainError> {
    certificate::parse(der).map_err(|_| MalformedSnafu { index }.build())
}

/// Checks date, name, key and node signature of a single certificate.
fn check_certificate(
    index: usize,
    cert: &NodeCertificate<'_>,
    now: i64,
) -> Result<NodeId, ChainError> {
    ensure!(cert.is_valid_at(now), DateInvalidSnafu { index });
    let claimed: NodeId = cert
        .common_name()
        .and_then(|cn| cn.parse().ok())
        .context(NameInvalidSnafu { index })?;
    let key = cert.public_key().map_err(|_| KeyInvalidSnafu { index }.build())?;
    ensure!(key == claimed, KeyInvalidSnafu { index });
    cert.verify_node_signature()
        .map_err(|_| SignatureInvalidSnafu { index }.build())?;
    Ok(claimed)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Failure verifying a certificate chain.
///
/// Indices refer to the position within the presented chain, the leaf being `0`.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum ChainError {
    #[snafu(display("certificate chain is empty"))]
    Empty {},
    #[snafu(display("no expected node ids were given"))]
    NoCandidates {},
    #[snafu(display("certificate {index} is malformed"))]
    Malformed { index: usize },
    #[snafu(display("certificate chain does not claim any of the expected node ids"))]
    Unclaimed {},
    #[snafu(display("certificate {index} is not issued and signed by its successor"))]
    Broken { index: usize },
    #[snafu(display("certificate {index} is expired or not yet valid"))]
    DateInvalid { index: usize },
    #[snafu(display("certificate {index} has no valid node id as common name"))]
    NameInvalid { index: usize },
    #[snafu(display("certificate {index} public key does not match its common name"))]
    KeyInvalid { index: usize },
    #[snafu(display("certificate {index} has an invalid node signature"))]
    SignatureInvalid { index: usize },
}

impl ChainError {
    /// The index of the offending certificate, if the error concerns a single one.
    pub fn index(&self) -> Option<usize> {
        match self {
            ChainError::Malformed { index, .. }
            | ChainError::Broken { index, .. }
            | ChainError::DateInvalid { index, .. }
            | ChainError::NameInvalid { index, .. }
            | ChainError::KeyInvalid { index, .. }
            | ChainError::SignatureInvalid { index, .. } => Some(*index),
            _ => None,
        }
    }
}
