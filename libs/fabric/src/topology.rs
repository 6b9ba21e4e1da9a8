//! In-process topology cache.
//!
//! The kernel is the sole source of truth for interface topology and can
//! change it out-of-band at any time, so the controller never owns this
//! data. [`TopologyGraph`] is a best-effort cache: nodes are interface
//! names, edges are "bridge contains member" and "fake paired-with fake"
//! relations, and every observation carries a timestamp. Readers see an
//! observation only while it is younger than the staleness window; anything
//! older must be re-read from the kernel before a mutating operation
//! trusts it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use vif_wire::InterfaceName;

#[derive(Debug, Clone)]
struct Observation<T> {
    value: T,
    at: Instant,
}

impl<T> Observation<T> {
    fn now(value: T) -> Self {
        Self {
            value,
            at: Instant::now(),
        }
    }

    fn fresh(&self, window: Duration) -> bool {
        self.at.elapsed() <= window
    }
}

/// Cached view of bridge membership and peer attachments.
#[derive(Debug)]
pub struct TopologyGraph {
    window: Duration,
    memberships: HashMap<InterfaceName, Observation<Vec<InterfaceName>>>,
    peers: HashMap<InterfaceName, Observation<Option<InterfaceName>>>,
}

impl TopologyGraph {
    /// Create an empty graph with the given staleness window.
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            memberships: HashMap::new(),
            peers: HashMap::new(),
        }
    }

    /// Record a freshly observed membership snapshot for a bridge.
    pub fn record_membership(&mut self, bridge: InterfaceName, members: Vec<InterfaceName>) {
        self.memberships.insert(bridge, Observation::now(members));
    }

    /// Record a freshly observed peer attachment (or lack of one).
    pub fn record_peer(&mut self, name: InterfaceName, peer: Option<InterfaceName>) {
        self.peers.insert(name, Observation::now(peer));
    }

    /// Fresh membership observation for a bridge, if any.
    pub fn membership(&self, bridge: &InterfaceName) -> Option<&[InterfaceName]> {
        self.memberships
            .get(bridge)
            .filter(|obs| obs.fresh(self.window))
            .map(|obs| obs.value.as_slice())
    }

    /// Fresh peer observation for a fake interface, if any.
    ///
    /// The outer `Option` is cache presence; the inner one is whether a peer
    /// was attached at observation time.
    pub fn peer(&self, name: &InterfaceName) -> Option<Option<&InterfaceName>> {
        self.peers
            .get(name)
            .filter(|obs| obs.fresh(self.window))
            .map(|obs| obs.value.as_ref())
    }

    /// Whether a fresh observation shows `member` attached to `bridge`.
    pub fn contains_member(&self, bridge: &InterfaceName, member: &InterfaceName) -> Option<bool> {
        self.membership(bridge)
            .map(|members| members.contains(member))
    }

    /// Drop every observation touching `name`.
    pub fn invalidate(&mut self, name: &InterfaceName) {
        self.memberships.remove(name);
        self.peers.remove(name);
        for obs in self.memberships.values_mut() {
            obs.value.retain(|member| member != name);
        }
        self.peers.retain(|_, obs| obs.value.as_ref() != Some(name));
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.memberships.clear();
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> InterfaceName {
        InterfaceName::new(s).unwrap()
    }

    #[test]
    fn test_fresh_observations_are_visible() {
        let mut graph = TopologyGraph::new(Duration::from_secs(60));
        graph.record_membership(name("bridge0"), vec![name("feth0")]);
        graph.record_peer(name("feth0"), Some(name("feth1")));

        assert_eq!(graph.contains_member(&name("bridge0"), &name("feth0")), Some(true));
        assert_eq!(graph.contains_member(&name("bridge0"), &name("feth2")), Some(false));
        assert_eq!(graph.peer(&name("feth0")), Some(Some(&name("feth1"))));
        assert_eq!(graph.peer(&name("feth2")), None);
    }

    #[test]
    fn test_zero_window_means_always_stale() {
        let mut graph = TopologyGraph::new(Duration::ZERO);
        graph.record_membership(name("bridge0"), vec![name("feth0")]);
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(graph.membership(&name("bridge0")), None);
    }

    #[test]
    fn test_invalidate_drops_edges_both_ways() {
        let mut graph = TopologyGraph::new(Duration::from_secs(60));
        graph.record_membership(name("bridge0"), vec![name("feth0"), name("feth2")]);
        graph.record_peer(name("feth0"), Some(name("feth1")));
        graph.record_peer(name("feth1"), Some(name("feth0")));

        graph.invalidate(&name("feth0"));

        assert_eq!(
            graph.membership(&name("bridge0")),
            Some(&[name("feth2")][..])
        );
        assert_eq!(graph.peer(&name("feth0")), None);
        // The reverse edge pointed at the invalidated interface.
        assert_eq!(graph.peer(&name("feth1")), None);
    }

    #[test]
    fn test_record_replaces_previous_observation() {
        let mut graph = TopologyGraph::new(Duration::from_secs(60));
        graph.record_peer(name("feth0"), Some(name("feth1")));
        graph.record_peer(name("feth0"), None);
        assert_eq!(graph.peer(&name("feth0")), Some(None));
    }
}
