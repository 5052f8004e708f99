//! Installs a signal handler which shuts the peer pool down on CTRL+C or SIGHUP.
//!
//! Forks an async task which waits for either **CTRL+C** or **SIGHUP** and then invokes
//! [PeerPool::shutdown](crate::transport::PeerPool::shutdown) on the given pool, so that its
//! serving loop drains and the process can exit cleanly.
use std::sync::Arc;

use tokio::signal::unix::SignalKind;

use crate::spawn;
use crate::transport::PeerPool;

/// Installs a signal handler which awaits either a **CTRL+C** or **SIGHUP**.
pub fn install(pool: Arc<PeerPool>) {
    spawn!(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sig_hup = tokio::signal::unix::signal(SignalKind::hangup()).unwrap();

        tokio::select! {
            _ = ctrl_c => {
                log::info!("Received CTRL-C. Shutting down...");
                pool.shutdown();
            },
            _ = sig_hup.recv() => {
                log::info!("Received SIGHUP. Shutting down...");
                pool.shutdown();
            }
        }
    });
}
