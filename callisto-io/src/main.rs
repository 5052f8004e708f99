use std::panic::{set_hook, take_hook};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use callisto::group::{Loader, Registry};
use callisto::transport::PeerPool;

/// Serves the files below a base directory as cache values: the key is the file name, the
/// value its contents.
struct FileLoader {
    base: PathBuf,
}

#[async_trait]
impl Loader for FileLoader {
    async fn load(&self, key: &str) -> Result<Vec<u8>> {
        // Keys are plain file names - anything which could escape the data directory is
        // rejected before we touch the file system.
        if key.contains('/') || key.contains('\\') || key.starts_with('.') {
            return Err(anyhow!("Invalid key: {}", key));
        }

        tokio::fs::read(self.base.join(key))
            .await
            .with_context(|| format!("There is no data file for key {}!", key))
    }
}

#[tokio::main]
async fn main() {
    // Installs a panic handler which crashes the whole process instead of trying to survive
    // with a missing tokio background thread. Having a panic in a tokio thread is quite ugly,
    // as the server seems to be healthy from the outside but won't handle any incoming
    // commands.
    //
    // Therefore we crash the whole process on purpose and hope for an external watchdog like
    // docker-compose to create a new container which is in a sane and consistent state.
    let original_panic_handler = take_hook();
    set_hook(Box::new(move |panic_info| {
        original_panic_handler(panic_info);
        eprintln!("PROGRAM ALARM: A panic occurred in a thread. Crashing the whole process to enable a clean restart...");
        std::process::exit(-1);
    }));

    callisto::init_logging();
    log::info!(
        "||. CALLISTO (v {} - rev {}) starting up...",
        callisto::CALLISTO_VERSION,
        callisto::CALLISTO_REVISION
    );

    let config = callisto::config::install("config/settings.yml").await;

    // Read the identity of this node along with the settings of the served group...
    let handle = config.current();
    let self_address = handle.config()["peer"]["self"]
        .as_str()
        .unwrap_or("127.0.0.1:2420")
        .to_owned();
    let group_name = handle.config()["cache"]["group"]
        .as_str()
        .unwrap_or("data")
        .to_owned();
    let cache_bytes = handle.config()["cache"]["max_memory"]
        .as_i64()
        .filter(|bytes| bytes >= &0)
        .unwrap_or(64 * 1024 * 1024) as usize;
    drop(handle);

    // Set up the group which serves the contents of the "data" directory...
    let registry = Arc::new(Registry::new());
    let group = registry.create_group(
        &group_name,
        cache_bytes,
        FileLoader {
            base: PathBuf::from("data"),
        },
    );

    // ...wire it to its peers...
    let pool = PeerPool::new(&self_address, registry.clone());
    group.register_peers(pool.clone());

    // ...and serve until a signal arrives.
    callisto::signals::install(pool.clone());
    pool.event_loop(&config).await;

    log::info!("Node {} has shut down.", pool.self_address());
}
