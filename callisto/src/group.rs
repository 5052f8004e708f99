//! Implements the cache groups along with their read-through protocol.
//!
//! A [Group](Group) is a named cache namespace bound to a [Loader](Loader) which obtains the
//! authoritative value for a key. A lookup via [Group::get](Group::get) first consults the
//! local cache. On a miss it funnels all concurrent callers for the same key through a
//! [single flight](crate::singleflight::SingleFlight) and then either fetches the value from
//! the peer owning the key (if a [PeerPicker](crate::peers::PeerPicker) has been registered)
//! or invokes the loader locally.
//!
//! Peer failures are soft: they are logged and the group falls back to loading locally within
//! the same flight. Loader failures are hard and propagate to the caller - nothing is cached
//! in that case, so a subsequent lookup retries the source.
//!
//! Only locally loaded values populate the local cache. A value fetched from a peer is already
//! cached by that peer, duplicating it on every node which happens to route a request would
//! multiply the memory footprint without making anything faster.
//!
//! Groups are usually kept in a [Registry](Registry) so that the peer serving layer can
//! resolve them by name. The crate maintains a process-wide default registry, accessible via
//! [new_group](new_group) and [get_group](get_group) - test suites and embedding applications
//! can create their own instead.
//!
//! # Examples
//!
//! ```
//! # use callisto::group::{LoaderFn, Registry};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Registry::new();
//! let group = registry.create_group(
//!     "greetings",
//!     64 * 1024,
//!     LoaderFn::new(|key: &str| Ok(format!("Hello {}!", key).into_bytes())),
//! );
//!
//! assert_eq!(group.get("World").await.unwrap().to_string(), "Hello World!");
//! # }
//! ```
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::byteview::ByteView;
use crate::lru::SharedCache;
use crate::peers::{PeerGetter, PeerPicker};
use crate::protocol::GetRequest;
use crate::singleflight::SingleFlight;

/// Obtains the authoritative value for a key.
///
/// This is the callback invoked whenever a group misses its cache and no remote peer can
/// serve the key. Typical implementations query a database, read a file or compute the value.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Loads the value for the given key from the authoritative source.
    async fn load(&self, key: &str) -> Result<Vec<u8>>;
}

/// Adapts a plain closure to the [Loader](Loader) capability.
///
/// # Examples
/// ```
/// # use callisto::group::{Loader, LoaderFn};
/// let loader = LoaderFn::new(|key: &str| Ok(key.as_bytes().to_vec()));
/// ```
pub struct LoaderFn<F>(F);

impl<F> LoaderFn<F>
where
    F: Fn(&str) -> Result<Vec<u8>> + Send + Sync,
{
    /// Wraps the given closure into a loader.
    pub fn new(callback: F) -> Self {
        LoaderFn(callback)
    }
}

#[async_trait]
impl<F> Loader for LoaderFn<F>
where
    F: Fn(&str) -> Result<Vec<u8>> + Send + Sync,
{
    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        (self.0)(key)
    }
}

/// A named cache namespace with a bound loader.
///
/// See the [module docs](crate::group) for a description of the lookup protocol.
pub struct Group {
    name: String,
    loader: Box<dyn Loader>,
    cache: SharedCache,
    peers: OnceLock<Arc<dyn PeerPicker>>,
    flights: SingleFlight<ByteView>,
}

impl Group {
    fn new(name: &str, cache_bytes: usize, loader: Box<dyn Loader>) -> Self {
        Group {
            name: name.to_owned(),
            loader,
            cache: SharedCache::new(cache_bytes),
            peers: OnceLock::new(),
            flights: SingleFlight::new(),
        }
    }

    /// Returns the name of this group.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Installs the picker used to route keys to their owning peers.
    ///
    /// A group without a picker always loads locally. The picker can only be assigned once,
    /// silently swapping the routing of a live group is almost certainly a bug.
    ///
    /// # Panics
    /// Panics if a picker has already been registered.
    pub fn register_peers(&self, picker: Arc<dyn PeerPicker>) {
        if self.peers.set(picker).is_err() {
            panic!(
                "register_peers was called more than once for group {}!",
                self.name
            );
        }
    }

    /// Returns the cached value for the given key, fetching it on demand.
    ///
    /// On a cache miss the value is either obtained from the peer owning the key or from the
    /// loader bound to this group. Concurrent callers for the same key share a single fetch.
    pub async fn get(&self, key: &str) -> Result<ByteView> {
        if key.is_empty() {
            bail!("A key must not be empty!");
        }

        if let Some(view) = self.cache.get(key) {
            log::debug!("Cache hit for key {} in group {}...", key, self.name);
            return Ok(view);
        }

        self.load(key).await
    }

    /// Obtains a missing value, deduplicating concurrent requests for the same key.
    async fn load(&self, key: &str) -> Result<ByteView> {
        self.flights
            .execute(key, || async move {
                if let Some(picker) = self.peers.get() {
                    if let Some(peer) = picker.pick_peer(key) {
                        match self.fetch_from_peer(peer.as_ref(), key).await {
                            Ok(view) => return Ok(view),
                            Err(error) => log::warn!(
                                "Failed to fetch key {} of group {} from its owning peer: {:#}",
                                key,
                                self.name,
                                error
                            ),
                        }
                    }
                }

                self.load_locally(key).await
            })
            .await
    }

    /// Invokes the loader and populates the local cache with its result.
    async fn load_locally(&self, key: &str) -> Result<ByteView> {
        let bytes = self.loader.load(key).await.with_context(|| {
            format!(
                "Loading key {} of group {} from the authoritative source failed!",
                key, self.name
            )
        })?;

        let view = ByteView::from(bytes);
        self.cache.add(key, view.clone());
        Ok(view)
    }

    /// Fetches the value for the given key from the given remote peer.
    async fn fetch_from_peer(&self, peer: &dyn PeerGetter, key: &str) -> Result<ByteView> {
        let request = GetRequest::new(&self.name, key);
        let response = peer.get(&request).await?;
        Ok(ByteView::from(response.value))
    }
}

/// Keeps track of all groups of a cache node by name.
///
/// Lookups take a shared lock and are therefore cheap, registrations are rare and take an
/// exclusive one.
pub struct Registry {
    groups: RwLock<HashMap<String, Arc<Group>>>,
}

impl Registry {
    /// Creates a new, empty registry.
    pub fn new() -> Self {
        Registry {
            groups: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a group with the given name, cache budget (in bytes) and loader.
    ///
    /// The group is registered so that the peer serving layer can resolve it, and returned so
    /// that the caller can hand out its reference.
    ///
    /// # Panics
    /// Panics if a group with the same name has already been created, as two groups fighting
    /// over one namespace would serve arbitrarily mixed results.
    pub fn create_group(
        &self,
        name: &str,
        cache_bytes: usize,
        loader: impl Loader + 'static,
    ) -> Arc<Group> {
        let mut groups = self.groups.write().unwrap();
        if groups.contains_key(name) {
            panic!("A group named {} has already been registered!", name);
        }

        let group = Arc::new(Group::new(name, cache_bytes, Box::new(loader)));
        let _ = groups.insert(name.to_owned(), group.clone());
        group
    }

    /// Resolves a previously created group by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<Group>> {
        self.groups.read().unwrap().get(name).cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

lazy_static::lazy_static! {
    /// The process-wide default registry used by [new_group](new_group) and
    /// [get_group](get_group).
    static ref GROUPS: Registry = Registry::new();
}

/// Creates a group within the process-wide default registry.
///
/// See [Registry::create_group](Registry::create_group).
pub fn new_group(name: &str, cache_bytes: usize, loader: impl Loader + 'static) -> Arc<Group> {
    GROUPS.create_group(name, cache_bytes, loader)
}

/// Resolves a group from the process-wide default registry.
pub fn get_group(name: &str) -> Option<Arc<Group>> {
    GROUPS.lookup(name)
}

/// Provides access to the process-wide default registry itself.
///
/// This is what a peer serving layer binds to when the embedding application doesn't maintain
/// its own registry.
pub fn default_registry() -> &'static Registry {
    &GROUPS
}
