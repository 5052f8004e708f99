//! Callisto is a library for building distributed in-memory read-through caches.
//!
//! # Introduction
//! **Callisto** organizes cached entries into named **groups**. Each group is bound to an
//! authoritative [Loader](group::Loader) which fetches source data whenever the cache misses.
//! The contents of a group are partitioned across a fixed set of peer nodes using a
//! [consistent hash ring](ring::HashRing): any node may receive a request for any key and will
//! either serve it from its local cache, forward it to the owning peer or fall back to loading
//! the value locally.
//!
//! The heavy lifting is performed by a small set of subsystems which are designed to compose
//! but can also be used on their own:
//!
//! * A size constrained [LRU cache](lru::LruCache) which accounts for the allocated bytes of
//!   each entry and evicts the least recently used ones once its budget is exceeded.
//! * A [consistent hash ring](ring::HashRing) with virtual nodes which maps keys to node names
//!   and supports adding and removing nodes at runtime.
//! * A [request coalescing primitive](singleflight::SingleFlight) which guarantees that
//!   concurrent cache misses for the same key invoke the underlying loader at most once.
//! * The [group orchestrator](group::Group) which wires everything together and implements the
//!   read-through protocol along with peer routing.
//! * A [binary peer protocol](protocol) along with a [TCP transport](transport::PeerPool) so
//!   that a set of nodes can exchange cache values with minimal overhead.
//!
//! # Design
//! Stale reads are accepted by design: a group never propagates writes and never invalidates
//! remote caches. The authoritative source is only consulted on a miss and evicted data simply
//! re-populates on demand. This makes the whole system simple, fast and robust - there is no
//! coordination protocol which could fail in interesting ways.
//!
//! Everything is built on [tokio](https://tokio.rs/) and async/await primitives as provided by
//! Rust. Locks are only held for short, constant time critical sections which neither perform
//! IO nor invoke user code.
//!
//! # Example
//! ```
//! # use callisto::group::{LoaderFn, Registry};
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let registry = Registry::new();
//! let group = registry.create_group(
//!     "squares",
//!     1024,
//!     LoaderFn::new(|key: &str| {
//!         let value: u64 = key.parse()?;
//!         Ok(format!("{}", value * value).into_bytes())
//!     }),
//! );
//!
//! let view = group.get("7").await.unwrap();
//! assert_eq!(view.to_string(), "49");
//! # }
//! ```
#![deny(
    warnings,
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces,
    unused_results
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod byteview;
pub mod config;
pub mod group;
pub mod lru;
pub mod peers;
pub mod protocol;
pub mod ring;
pub mod signals;
pub mod singleflight;
pub mod transport;

/// Contains the version of the Callisto library.
pub const CALLISTO_VERSION: &str = "DEVELOPMENT-SNAPSHOT";

/// Contains the git commit hash of the Callisto build being used.
pub const CALLISTO_REVISION: &str = "NO-REVISION";

/// Initializes the logging system.
///
/// This sets up **simplelog** to log to stdout, which is all that is needed when running inside
/// a docker container. Invoking this more than once is safe, subsequent calls are ignored.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // We need to do this as otherwise the integration tests might crash as the logging system
    // is initialized several times...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            panic!("Failed to initialize logging system: {}", error);
        }
    });
}

/// Provides a simple macro to execute an async lambda within `tokio::spawn`.
///
/// Note that this also applies std::mem::drop on the returned closure to make
/// clippy happy.
///
/// # Example
/// ```rust
/// # #[macro_use] extern crate callisto;
/// # #[tokio::main]
/// # async fn main() {
/// spawn!(async move {
///     // perform some async stuff here...
/// });
/// # }
/// ```
#[macro_export]
macro_rules! spawn {
    ($e:expr) => {{
        std::mem::drop(tokio::spawn($e));
    }};
}
