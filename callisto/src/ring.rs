//! Maps cache keys to the nodes owning them using a consistent hash ring.
//!
//! Each real node is represented by a configurable number of virtual points on the ring so
//! that keys spread evenly even for small node sets. A key is owned by the node behind the
//! first virtual point at or after the key's own hash, wrapping around at the end of the
//! hash space.
//!
//! The ring itself is a plain data structure, structural updates have to be serialized by the
//! caller. The [PeerPool](crate::transport::PeerPool) does so by keeping its ring behind a
//! mutex (node set changes are rare).
//!
//! # Examples
//!
//! ```
//! # use callisto::ring::HashRing;
//! let mut ring = HashRing::new(50);
//! ring.add(["cache-1", "cache-2", "cache-3"]);
//!
//! // For a fixed node set, the owner of a key never changes...
//! assert_eq!(ring.get("Tom"), ring.get("Tom"));
//!
//! // ...and removing a node only re-routes the keys it owned.
//! ring.remove("cache-2");
//! assert_eq!(ring.get("Tom").is_some(), true);
//! ```
use std::collections::HashMap;

/// Computes the position of a byte string on the ring.
///
/// The default is CRC32 (IEEE), which is fast, available everywhere and spreads typical cache
/// keys well enough. A custom function can be injected via
/// [with_hasher](HashRing::with_hasher), mainly to make tests deterministic.
pub type HashFn = Box<dyn Fn(&[u8]) -> u32 + Send + Sync>;

/// Maps keys to node names via a ring of virtual points.
pub struct HashRing {
    hash: HashFn,
    replicas: usize,
    points: Vec<u32>,
    owners: HashMap<u32, String>,
}

impl HashRing {
    /// Creates a new ring which represents each node by **replicas** virtual points.
    ///
    /// # Panics
    /// Panics if **replicas** is zero, as such a ring could never own anything.
    pub fn new(replicas: usize) -> Self {
        HashRing::with_hasher(replicas, Box::new(|data| crc32fast::hash(data)))
    }

    /// Creates a new ring using the given hash function instead of CRC32.
    ///
    /// # Panics
    /// Panics if **replicas** is zero.
    pub fn with_hasher(replicas: usize, hash: HashFn) -> Self {
        assert!(
            replicas > 0,
            "A hash ring requires at least one virtual point per node!"
        );

        HashRing {
            hash,
            replicas,
            points: Vec::new(),
            owners: HashMap::new(),
        }
    }

    /// Places the given nodes on the ring.
    ///
    /// For each node, one virtual point is created per replica by hashing the replica index
    /// (in decimal) followed by the node name. If two points collide, the later insertion wins
    /// the ownership of the colliding position - both nodes remain on the ring via their other
    /// points.
    pub fn add<I>(&mut self, nodes: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        for node in nodes {
            let node = node.as_ref();
            for replica in 0..self.replicas {
                let point = (self.hash)(format!("{}{}", replica, node).as_bytes());
                self.points.push(point);
                let _ = self.owners.insert(point, node.to_owned());
            }
        }

        self.points.sort_unstable();
    }

    /// Returns the name of the node owning the given key.
    ///
    /// Returns **None** if no nodes have been placed on the ring yet.
    pub fn get(&self, key: &str) -> Option<&str> {
        if self.points.is_empty() {
            return None;
        }

        let hash = (self.hash)(key.as_bytes());

        // The owner sits on the first point at or after the hash of the key. Past the last
        // point, the ring wraps around to its first one.
        let mut index = self.points.partition_point(|point| *point < hash);
        if index == self.points.len() {
            index = 0;
        }

        self.owners.get(&self.points[index]).map(String::as_str)
    }

    /// Removes the given node along with all its virtual points from the ring.
    ///
    /// Removing a node which was never added is a no-op.
    pub fn remove(&mut self, node: &str) {
        for replica in 0..self.replicas {
            let point = (self.hash)(format!("{}{}", replica, node).as_bytes());
            if let Ok(index) = self.points.binary_search(&point) {
                let _ = self.points.remove(index);
            }
            let _ = self.owners.remove(&point);
        }
    }

    /// Returns the number of virtual points on the ring.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Determines if any nodes have been placed on the ring.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use crate::ring::HashRing;

    /// Builds a ring whose positions can be computed by hand: keys are decimal numbers and
    /// hash to their own value.
    fn numeric_ring() -> HashRing {
        HashRing::with_hasher(
            3,
            Box::new(|data| {
                std::str::from_utf8(data)
                    .expect("numeric ring keys are always UTF-8")
                    .parse()
                    .expect("numeric ring keys are always numbers")
            }),
        )
    }

    #[test]
    fn keys_are_routed_to_the_clockwise_successor() {
        let mut ring = numeric_ring();

        // With 3 replicas this yields the points 2, 4, 6, 12, 14, 16, 22, 24, 26...
        ring.add(["6", "4", "2"]);

        assert_eq!(ring.get("2"), Some("2"));
        assert_eq!(ring.get("11"), Some("2"));
        assert_eq!(ring.get("23"), Some("4"));
        assert_eq!(ring.get("27"), Some("2"));

        // Adding node 8 introduces the points 8, 18, 28 and takes over the keys behind 26...
        ring.add(["8"]);
        assert_eq!(ring.get("27"), Some("8"));
    }

    #[test]
    fn an_empty_ring_owns_nothing() {
        let ring = HashRing::new(50);
        assert_eq!(ring.get("Tom"), None);
        assert_eq!(ring.is_empty(), true);
    }

    #[test]
    fn removing_a_node_restores_the_previous_routing() {
        let mut ring = numeric_ring();
        ring.add(["6", "4", "2"]);

        let before: Vec<Option<String>> = (0..30)
            .map(|key| ring.get(&key.to_string()).map(str::to_owned))
            .collect();
        let points_before = ring.len();

        ring.add(["8"]);
        assert_eq!(ring.len(), points_before + 3);

        ring.remove("8");
        assert_eq!(ring.len(), points_before);

        let after: Vec<Option<String>> = (0..30)
            .map(|key| ring.get(&key.to_string()).map(str::to_owned))
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn crc32_routing_is_stable_across_releases() {
        let mut ring = HashRing::new(50);
        ring.add(["6006", "6005", "6004"]);

        // These owners are frozen fixtures: they must never change as independent nodes rely
        // on computing the same routing for the same node set.
        assert_eq!(ring.get("Tom"), Some("6005"));
        assert_eq!(ring.get("Jack"), Some("6006"));
        assert_eq!(ring.get("Sam"), Some("6004"));
    }

    #[test]
    #[should_panic]
    fn a_ring_without_replicas_is_refused() {
        let _ = HashRing::new(0);
    }
}
