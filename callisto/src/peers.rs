//! Defines the capabilities required to fetch cache values from remote peers.
//!
//! The group orchestrator itself is transport agnostic. All it needs is a way of determining
//! which remote peer owns a key ([PeerPicker](PeerPicker)) and a way of fetching a value from
//! that peer ([PeerGetter](PeerGetter)). The [transport](crate::transport) module binds both
//! capabilities to a consistent hash ring and a TCP client, but test scenarios are free to
//! provide their own implementations.
use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::{GetRequest, GetResponse};

/// Resolves the remote peer owning a given key.
pub trait PeerPicker: Send + Sync {
    /// Returns the getter of the remote peer owning the given key.
    ///
    /// Returns **None** if the key is owned by the local node (a node must never perform an
    /// RPC against itself) or if no peers are known at all.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>>;
}

/// Fetches a cache value from a single remote peer.
#[async_trait]
pub trait PeerGetter: Send + Sync {
    /// Fetches the value described by the given request from the peer.
    async fn get(&self, request: &GetRequest) -> anyhow::Result<GetResponse>;
}
