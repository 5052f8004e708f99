//! Connects a set of cache nodes via the binary peer protocol.
//!
//! The [PeerPool](PeerPool) is the one component every node runs: it keeps the consistent hash
//! ring along with one [PeerClient](PeerClient) per known peer, implements the
//! [PeerPicker](crate::peers::PeerPicker) capability for the local groups and serves incoming
//! peer requests on a TCP endpoint.
//!
//! The bind address (**peer.host** / **peer.port**) and the node set (**peer.nodes**) are read
//! from the config. Note that in order to achieve zero downtime, the pool will periodically
//! try to bind the socket to the selected port, therefore a "new" instance can be started and
//! the "old" one can bleed out and the port will be "handed through" with minimal downtime.
//! Also, this will listen to change events of the config and will relocate to another port or
//! host if changed - and re-apply the node set, as ring changes simply re-populate on demand.
//!
//! # Config
//!
//! ```yaml
//! peer:
//!     # The address to bind the peer endpoint to.
//!     host: 0.0.0.0
//!     port: 2420
//!
//!     # The identity of this node as listed in "nodes". Keys routed to this identity are
//!     # served locally, all others are fetched from the listed peer.
//!     self: "192.168.1.15:2420"
//!     nodes:
//!         - "192.168.1.15:2420"
//!         - "192.168.1.16:2420"
//!         - "192.168.1.17:2420"
//! ```
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use callisto::group::Registry;
//! # use callisto::transport::PeerPool;
//! #[tokio::main]
//! async fn main() {
//!     let config = callisto::config::install("config/settings.yml").await;
//!     let registry = Arc::new(Registry::new());
//!
//!     // Create groups here and register the pool as their peer picker...
//!
//!     let pool = PeerPool::new("192.168.1.15:2420", registry);
//!     pool.event_loop(&config).await;
//! }
//! ```
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::byteview::ByteView;
use crate::config::Config;
use crate::group::Registry;
use crate::peers::{PeerGetter, PeerPicker};
use crate::protocol::{GetRequest, GetResponse};
use crate::ring::HashRing;
use crate::spawn;

/// Contains the number of virtual points each node occupies on the ring.
pub const DEFAULT_REPLICAS: usize = 50;

/// Specifies the timeout when waiting for incoming data on a peer connection.
///
/// When waiting for incoming data we need to interrupt this every once in a while to check
/// if the pool is being shut down.
const READ_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Specifies the timeout when waiting for a new incoming connection.
///
/// When waiting for a new connection we need to interrupt this every once in a while so that
/// we can check if the pool has been shut down.
const CONNECT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Limits the total duration of a single call to a remote peer.
///
/// A peer which fails to answer within this period is treated as failed, the calling group
/// then falls back to its local loader.
const PEER_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Determines the pre-allocated buffer size for requests and responses. Most frames will /
/// should fit into this buffer so that no additional allocations are required.
const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Contains the ring and the clients derived from the currently installed node set.
struct RoutingTable {
    ring: HashRing,
    clients: HashMap<String, Arc<PeerClient>>,
}

/// Binds the local groups to their peers.
///
/// See the [module docs](crate::transport) for an overview and a config example.
pub struct PeerPool {
    self_address: String,
    replicas: usize,
    registry: Arc<Registry>,
    routes: Mutex<RoutingTable>,
    running: AtomicBool,
    listening: AtomicBool,
}

impl PeerPool {
    /// Creates a new pool which identifies itself as **self_address** within the node set.
    ///
    /// Requests for groups are resolved against the given registry.
    pub fn new(self_address: &str, registry: Arc<Registry>) -> Arc<Self> {
        PeerPool::with_replicas(self_address, registry, DEFAULT_REPLICAS)
    }

    /// Creates a new pool which places the given number of virtual points per node on its ring.
    ///
    /// All nodes of a cluster must agree on this number, otherwise they route keys differently
    /// and flood each other with misdirected requests.
    pub fn with_replicas(self_address: &str, registry: Arc<Registry>, replicas: usize) -> Arc<Self> {
        Arc::new(PeerPool {
            self_address: self_address.to_owned(),
            replicas,
            registry,
            routes: Mutex::new(RoutingTable {
                ring: HashRing::new(replicas),
                clients: HashMap::new(),
            }),
            running: AtomicBool::new(true),
            listening: AtomicBool::new(false),
        })
    }

    /// Returns the identity of this node within the node set.
    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Installs the given node set, replacing the previous one.
    ///
    /// This rebuilds the ring along with the per-peer clients. Cached data is not moved
    /// around: keys which are now owned by another node simply re-populate over there on
    /// demand.
    pub fn set_peers<I>(&self, nodes: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let mut ring = HashRing::new(self.replicas);
        let mut clients = HashMap::new();
        for node in nodes {
            let node = node.as_ref();
            ring.add([node]);
            let _ = clients.insert(node.to_owned(), Arc::new(PeerClient::new(node)));
        }

        log::info!(
            "Installing a node set of {} peer(s) on {}...",
            clients.len(),
            self.self_address
        );

        *self.routes.lock().unwrap() = RoutingTable { ring, clients };
    }

    /// Determines if the pool is still running or if [shutdown](PeerPool::shutdown) has
    /// already been called.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Shuts the pool down.
    ///
    /// The serving loop along with all its connections will exit shortly after.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Determines the bind address based on the current configuration.
    ///
    /// If no, an invalid or a partial config is present, fallback values are used. By default
    /// we use port 2420 and bind to "0.0.0.0".
    fn address(config: &Config) -> String {
        let handle = config.current();
        format!(
            "{}:{}",
            handle.config()["peer"]["host"].as_str().unwrap_or("0.0.0.0"),
            handle.config()["peer"]["port"]
                .as_i64()
                .filter(|port| port > &0 && port <= &(u16::MAX as i64))
                .unwrap_or(2420)
        )
    }

    /// Installs the node set listed in the current configuration.
    ///
    /// If the config doesn't list any nodes, the currently installed set is left untouched.
    /// This prevents an accidental or partial config change from disbanding a running cluster.
    fn apply_peer_config(&self, config: &Config) {
        let handle = config.current();
        if let Some(nodes) = handle.config()["peer"]["nodes"].as_vec() {
            let nodes: Vec<&str> = nodes.iter().filter_map(|node| node.as_str()).collect();
            if !nodes.is_empty() {
                self.set_peers(nodes);
            }
        }
    }

    /// Tries to open a server socket on the configured address to serve peer requests.
    ///
    /// The task of this loop is to bind the server socket. Once this was successful, we enter
    /// the [server_loop](PeerPool::server_loop) to actually handle incoming connections. Once
    /// this loop returns, either the pool was shut down and we should exit, or the config has
    /// changed and we should try to bind the socket to the new address.
    pub async fn event_loop(self: &Arc<Self>, config: &Arc<Config>) {
        let mut address = String::new();
        let mut last_bind_error_reported = Instant::now();

        while self.is_running() {
            // If the pool is started for the first time or if it has been restarted due to a
            // config change, we need to reload the address and the node set...
            if !self.listening.load(Ordering::Acquire) {
                address = PeerPool::address(config);
                self.apply_peer_config(config);
                self.listening.store(true, Ordering::Release);
            }

            // Bind and hopefully enter the server_loop...
            if let Ok(listener) = TcpListener::bind(&address).await {
                log::info!("Opened peer endpoint on {}...", &address);
                self.server_loop(&listener, &address, config).await;
                log::info!("Closing peer endpoint on {}.", &address);
            } else {
                // If we were unable to bind the socket, we log this every once in a while
                // (every 5s). Otherwise we would jam the log as we retry every 500ms.
                if Instant::now()
                    .duration_since(last_bind_error_reported)
                    .as_secs()
                    > 5
                {
                    log::error!(
                        "Cannot open peer endpoint on: {}. Retrying every 500ms...",
                        &address
                    );
                    last_bind_error_reported = Instant::now();
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    /// Runs the main server loop which processes incoming peer connections.
    ///
    /// This also listens on config changes and exits to the event_loop if necessary (bind
    /// address changed...).
    async fn server_loop(self: &Arc<Self>, listener: &TcpListener, address: &str, config: &Arc<Config>) {
        let mut config_changed_flag = config.notifier();

        while self.is_running() && self.listening.load(Ordering::Acquire) {
            tokio::select! {
                // We use a timeout here so that the while condition is checked every once in
                // a while...
                timeout_stream = tokio::time::timeout(CONNECT_WAIT_TIMEOUT, listener.accept()) => {
                    // We're only interested in a positive result here, as an Err simply
                    // indicates that the timeout was hit - in this case we do nothing as the
                    // while condition is all that needs to be checked...
                    if let Ok(stream) = timeout_stream {
                        if let Ok((stream, _)) = stream {
                            self.handle_new_connection(stream);
                        } else {
                            // The socket has been closed, therefore we exit to the event_loop
                            // which will either completely exit or try to re-create it.
                            return;
                        }
                    }
                }
                _ = config_changed_flag.recv() => {
                    // A config change might carry a new node set...
                    self.apply_peer_config(config);

                    // ...and might also move the endpoint to another address.
                    let new_address = PeerPool::address(config);
                    if address != new_address {
                        log::info!("Peer endpoint address has changed. Restarting socket...");

                        // Force the event_loop to re-evaluate the expected address...
                        self.listening.store(false, Ordering::Release);
                        return;
                    }
                }
            }
        }
    }

    /// Handles a new incoming peer connection.
    ///
    /// This forks a task which executes the protocol loop for this connection.
    fn handle_new_connection(self: &Arc<Self>, stream: TcpStream) {
        let pool = self.clone();
        spawn!(async move {
            // Mark the connection as nodelay, as we already optimize all writes as far as
            // possible.
            let _ = stream.set_nodelay(true);

            let peer_address = stream
                .peer_addr()
                .map(|addr| addr.to_string())
                .unwrap_or_else(|_| "<unknown>".to_owned());
            log::debug!("Opened peer connection from {}...", peer_address);

            if let Err(error) = pool.connection_loop(stream).await {
                log::debug!(
                    "An IO error occurred in peer connection {}: {}",
                    peer_address,
                    error
                );
            }

            log::debug!("Closing peer connection to {}...", peer_address);
        });
    }

    /// Executed per connection to process incoming request frames.
    async fn connection_loop(&self, mut stream: TcpStream) -> Result<()> {
        // Pre-allocate a buffer for incoming requests. This will only be re-allocated if a
        // request was larger than 8 kB...
        let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        let (mut reader, mut writer) = stream.split();

        while self.is_running() {
            // We apply a timeout here, so that the condition of the while loop is checked
            // every once in a while...
            match tokio::time::timeout(READ_WAIT_TIMEOUT, reader.read_buf(&mut input_buffer)).await
            {
                // Best case, we read some bytes from the socket...
                Ok(Ok(bytes_read)) if bytes_read > 0 => {
                    match GetRequest::parse(&input_buffer) {
                        // ...and we were able to parse a request frame from the data...
                        Ok(Some((request, frame_len))) => {
                            log::debug!(
                                "Received a request for key {} of group {}",
                                request.key,
                                request.group
                            );

                            let mut output_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
                            match self.serve(&request).await {
                                Ok(view) => {
                                    GetResponse::new(view.byte_slice().into()).encode(&mut output_buffer)
                                }
                                Err(error) => {
                                    log::debug!(
                                        "Failed to serve key {} of group {}: {:#}",
                                        request.key,
                                        request.group,
                                        error
                                    );
                                    GetResponse::encode_error(
                                        &format!("{:#}", error),
                                        &mut output_buffer,
                                    );
                                }
                            }

                            writer.write_all(output_buffer.as_ref()).await?;
                            writer.flush().await?;

                            input_buffer = clear_input_buffer(input_buffer, frame_len);
                        }
                        Err(error) => {
                            // We received malformed data - report the problem and close the
                            // connection as it might be in an inconsistent state...
                            let mut output_buffer = BytesMut::new();
                            GetResponse::encode_error(
                                &format!("A malformed request frame was received: {:#}", error),
                                &mut output_buffer,
                            );
                            writer.write_all(output_buffer.as_ref()).await?;
                            writer.flush().await?;
                            return Ok(());
                        }
                        // A partial frame is present - do nothing so that we keep on reading...
                        _ => (),
                    }
                }

                // Reading from the peer returned a zero length result -> the peer wants to
                // close the connection. We therefore return from this loop.
                Ok(Ok(0)) => return Ok(()),

                // An IO error occurred while reading - notify our caller and abort...
                Ok(Err(error)) => {
                    return Err(anyhow!(
                        "An error occurred while reading from the peer: {}",
                        error
                    ));
                }

                // The timeout elapsed before any data was read => do nothing, all we want to
                // do is to re-evaluate our while condition anyway...
                _ => (),
            }
        }

        Ok(())
    }

    /// Resolves the requested group and performs the lookup on behalf of the calling peer.
    async fn serve(&self, request: &GetRequest) -> Result<ByteView> {
        let group = self
            .registry
            .lookup(&request.group)
            .ok_or_else(|| anyhow!("No group named {} is registered on this node!", request.group))?;

        group.get(&request.key).await
    }
}

impl PeerPicker for PeerPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerGetter>> {
        let routes = self.routes.lock().unwrap();
        match routes.ring.get(key) {
            Some(owner) if owner != self.self_address => {
                log::debug!("Routing key {} to peer {}...", key, owner);
                routes.clients.get(owner).map(|client| {
                    let client: Arc<dyn PeerGetter> = client.clone();
                    client
                })
            }
            _ => None,
        }
    }
}

/// Fetches values from a single remote peer via the binary protocol.
pub struct PeerClient {
    address: String,
}

impl PeerClient {
    /// Creates a new client for the peer at the given address.
    pub fn new(address: &str) -> Self {
        PeerClient {
            address: address.to_owned(),
        }
    }

    /// Performs a single request / response exchange with the peer.
    async fn exchange(&self, request: &GetRequest) -> Result<GetResponse> {
        let mut stream = TcpStream::connect(&self.address)
            .await
            .with_context(|| format!("Failed to connect to peer {}!", self.address))?;
        let _ = stream.set_nodelay(true);

        let mut output_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        request.encode(&mut output_buffer);
        stream.write_all(output_buffer.as_ref()).await?;
        stream.flush().await?;

        let mut input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);
        loop {
            let bytes_read = stream.read_buf(&mut input_buffer).await?;
            if let Some(response) = GetResponse::parse(&input_buffer)? {
                return Ok(response);
            }
            if bytes_read == 0 {
                return Err(anyhow!(
                    "Peer {} closed the connection before sending a complete response!",
                    self.address
                ));
            }
        }
    }
}

#[async_trait]
impl PeerGetter for PeerClient {
    async fn get(&self, request: &GetRequest) -> Result<GetResponse> {
        tokio::time::timeout(PEER_CALL_TIMEOUT, self.exchange(request))
            .await
            .map_err(|_| anyhow!("The call to peer {} timed out!", self.address))?
    }
}

/// Prepares the input buffer for the next request frame.
fn clear_input_buffer(mut input_buffer: BytesMut, frame_len: usize) -> BytesMut {
    // If the input buffer has grown in order to accommodate a large request, we shrink it here
    // again. Otherwise we clear the buffer to make room for the next request...
    if input_buffer.capacity() > DEFAULT_BUFFER_SIZE || input_buffer.len() > frame_len {
        let previous_buffer = input_buffer;
        input_buffer = BytesMut::with_capacity(DEFAULT_BUFFER_SIZE);

        // If the previous buffer contains trailing data, we transfer it to the new buffer.
        if previous_buffer.len() > frame_len {
            input_buffer.put_slice(&previous_buffer[frame_len..]);
        }
    } else {
        input_buffer.truncate(0);
    }

    input_buffer
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use anyhow::anyhow;
    use tokio::net::TcpStream;

    use crate::config::Config;
    use crate::group::{Group, LoaderFn, Registry};
    use crate::peers::{PeerGetter, PeerPicker};
    use crate::protocol::GetRequest;
    use crate::testing::{test_async, SHARED_TEST_RESOURCES};
    use crate::transport::PeerPool;

    /// Builds a node consisting of a registry with a counting "scores" group, a pool and a
    /// config binding the pool to the given localhost port.
    fn test_node(
        port: u16,
        load_counts: Arc<Mutex<HashMap<String, usize>>>,
    ) -> (Arc<Group>, Arc<PeerPool>, Arc<Config>) {
        let registry = Arc::new(Registry::new());
        let group = registry.create_group(
            "scores",
            2 << 10,
            LoaderFn::new(move |key: &str| {
                *load_counts.lock().unwrap().entry(key.to_owned()).or_insert(0) += 1;
                match key {
                    "Tom" => Ok(b"630".to_vec()),
                    "unknown" => Err(anyhow!("{} does not exist", key)),
                    _ => Ok(format!("value-of-{}", key).into_bytes()),
                }
            }),
        );

        let self_address = format!("127.0.0.1:{}", port);
        let pool = PeerPool::new(&self_address, registry);

        let config = Arc::new(Config::new("transport_test.yml"));
        config
            .load_from_string(
                &format!(
                    "
peer:
    host: 127.0.0.1
    port: {}
",
                    port
                ),
                None,
            )
            .unwrap();

        (group, pool, config)
    }

    /// Forks the serving loop of the given pool and waits until its endpoint accepts
    /// connections.
    async fn fork_and_await(pool: &Arc<PeerPool>, config: &Arc<Config>) {
        {
            let pool = pool.clone();
            let config = config.clone();
            crate::spawn!(async move {
                pool.event_loop(&config).await;
            });
        }

        for _ in 0..100 {
            if TcpStream::connect(pool.self_address()).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("The peer endpoint on {} never came up!", pool.self_address());
    }

    #[test]
    fn a_peer_serves_values_over_the_wire() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let load_counts = Arc::new(Mutex::new(HashMap::new()));
            let (_group, pool, config) = test_node(14821, load_counts.clone());
            pool.set_peers(["127.0.0.1:14821"]);
            fork_and_await(&pool, &config).await;

            let client = crate::transport::PeerClient::new("127.0.0.1:14821");

            // A known key is served...
            let response = client.get(&GetRequest::new("scores", "Tom")).await.unwrap();
            assert_eq!(response.value.as_ref(), b"630");
            assert_eq!(load_counts.lock().unwrap()["Tom"], 1);

            // ...an unknown group is reported as error...
            let error = client
                .get(&GetRequest::new("nonexistent", "Tom"))
                .await
                .unwrap_err();
            assert_eq!(format!("{}", error).contains("nonexistent"), true);

            // ...and so is a key which the source doesn't know.
            let error = client
                .get(&GetRequest::new("scores", "unknown"))
                .await
                .unwrap_err();
            assert_eq!(format!("{}", error).contains("unknown"), true);

            pool.shutdown();
        });
    }

    #[test]
    fn a_miss_is_fetched_from_the_owning_peer() {
        let _guard = SHARED_TEST_RESOURCES.lock().unwrap();

        test_async(async {
            let nodes = ["127.0.0.1:14823", "127.0.0.1:14824"];

            let local_counts = Arc::new(Mutex::new(HashMap::new()));
            let (local_group, local_pool, local_config) = test_node(14823, local_counts.clone());
            local_pool.set_peers(nodes);
            local_group.register_peers(local_pool.clone());

            let remote_counts = Arc::new(Mutex::new(HashMap::new()));
            let (remote_group, remote_pool, remote_config) = test_node(14824, remote_counts.clone());
            remote_pool.set_peers(nodes);
            remote_group.register_peers(remote_pool.clone());

            fork_and_await(&local_pool, &local_config).await;
            fork_and_await(&remote_pool, &remote_config).await;

            // Find a key which the ring routes to the remote node...
            let key = (0..64)
                .map(|index| format!("key-{}", index))
                .find(|key| local_pool.pick_peer(key).is_some())
                .expect("the ring routed no key to the remote node");

            // ...fetch it via the local group...
            let view = local_group.get(&key).await.unwrap();
            assert_eq!(view.to_string(), format!("value-of-{}", key));

            // ...and verify that only the remote loader was consulted.
            assert_eq!(local_counts.lock().unwrap().contains_key(&key), false);
            assert_eq!(remote_counts.lock().unwrap()[&key], 1);

            local_pool.shutdown();
            remote_pool.shutdown();
        });
    }

    #[test]
    fn peers_survive_node_set_changes() {
        test_async(async {
            let registry = Arc::new(Registry::new());
            let pool = PeerPool::new("127.0.0.1:14830", registry);

            pool.set_peers(["127.0.0.1:14830", "127.0.0.1:14831"]);
            let picks_before = count_remote_picks(&*pool);
            assert_eq!(picks_before > 0, true);

            // Dropping the other node routes everything to the local node...
            pool.set_peers(["127.0.0.1:14830"]);
            assert_eq!(count_remote_picks(&*pool), 0);

            // ...and re-adding it restores the previous routing.
            pool.set_peers(["127.0.0.1:14830", "127.0.0.1:14831"]);
            assert_eq!(count_remote_picks(&*pool), picks_before);
        });
    }

    /// Counts how many of a fixed key sample are routed to a remote peer.
    fn count_remote_picks(picker: &dyn PeerPicker) -> usize {
        (0..64)
            .filter(|key| picker.pick_peer(&format!("key-{}", key)).is_some())
            .count()
    }
}
