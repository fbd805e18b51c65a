//! Mutually authenticated TCP tunnels between nodes dialed by their [`NodeId`].
//!
//! A [`Proxy`] accepts plain TCP clients on an HTTP `CONNECT` front-end and carries their
//! bytes over QUIC to a peer proxy, which splices them onto a local backend service.  Both
//! ends verify the other's certificate chain against the node identity they expect before
//! a single payload byte is forwarded.
//!
//! The main pieces are:
//!
//! - [`tls::chain`]: the certificate chain verifier binding a peer to its [`NodeId`].
//! - [`ConnectionForward`] and [`ConnectionReverse`]: the per-peer state machines.
//! - [`Proxy`]: the orchestrator owning the listeners and the connection registries.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]
#![cfg_attr(iroh_docsrs, feature(doc_auto_cfg))]

pub mod address;
pub mod config;
pub mod connection;
pub mod defaults;
pub mod key;
mod lock_box;
pub mod proxy;
mod registry;
mod socket;
pub mod tls;

#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(iroh_docsrs, doc(cfg(any(test, feature = "test-utils"))))]
pub mod test_utils;

pub use self::{
    address::{Address, Host, Port},
    config::ProxyConfig,
    connection::{
        ConnectionConfig, ConnectionError, ConnectionForward, ConnectionInfo, ConnectionKind,
        ConnectionReverse, Phase, StartContext, StopReason,
    },
    key::NodeId,
    proxy::{ConnectionEstablished, Proxy, ProxyBuilder, ProxyError},
    tls::{
        chain::{verify_client_chain, verify_server_chain, ChainError},
        TlsConfig,
    },
};
