//! Random peer-to-peer overlays and link latency

use std::collections::{BTreeSet, VecDeque};

use rand::{seq::IteratorRandom, Rng};

use crate::{peer::PeerId, utils::sample_exponential};

/// Link speed in Mbps between two fast peers.
pub const FAST_LINK_MBPS: f64 = 100.0;

/// Link speed in Mbps when at least one end of the link is slow.
pub const SLOW_LINK_MBPS: f64 = 5.0;

/// Size in kilobits of the message whose transmission time is the mean
/// queuing delay of a link.
const QUEUING_KBITS: f64 = 96.0;

/// Bounds of the uniformly distributed propagation delay of a link (ms).
const PROPAGATION_MS: std::ops::RangeInclusive<f64> = 10.0..=500.0;

/// A link from one peer to a neighbour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Link {
    pub peer: PeerId,
    /// Light propagation delay of the link in milliseconds.
    pub propagation: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("cannot create a network of zero peers")]
    NoPeers,
    #[error("no connected overlay found after {0} attempts")]
    Disconnected(usize),
}

/// Undirected overlay connecting all peers of a network.
#[derive(Debug, Clone)]
pub struct Topology {
    adjacency: Vec<Vec<Link>>,
    slow: Vec<bool>,
}

impl Topology {
    pub const MIN_NEIGHBOURS: usize = 4;
    pub const MAX_NEIGHBOURS: usize = 6;
    pub const MAX_ATTEMPTS: usize = 1000;

    /// Creates a random connected overlay over `slow.len()` peers, where
    /// `slow[i]` tells whether peer `i` communicates over slow links.
    ///
    /// Each peer picks between 4 and 6 random neighbours (fewer if the
    /// network is too small). Overlays are drawn until one is connected.
    pub fn random<R: Rng + ?Sized>(
        slow: &[bool],
        rng: &mut R,
    ) -> Result<Self, TopologyError> {
        let n = slow.len();
        if n == 0 {
            return Err(TopologyError::NoPeers);
        }

        for _ in 0..Self::MAX_ATTEMPTS {
            let mut edges = BTreeSet::new();
            for peer in 0..n {
                let count = rng
                    .gen_range(Self::MIN_NEIGHBOURS..=Self::MAX_NEIGHBOURS)
                    .min(n - 1);
                let neighbours = (0..n)
                    .filter(|&other| other != peer)
                    .choose_multiple(rng, count);

                for other in neighbours {
                    edges.insert((peer.min(other), peer.max(other)));
                }
            }

            let mut adjacency = vec![vec![]; n];
            for (a, b) in edges {
                let propagation = rng.gen_range(PROPAGATION_MS);
                adjacency[a].push(Link { peer: PeerId(b), propagation });
                adjacency[b].push(Link { peer: PeerId(a), propagation });
            }

            let topology = Self { adjacency, slow: slow.to_vec() };
            if topology.is_connected() {
                return Ok(topology);
            }
        }

        Err(TopologyError::Disconnected(Self::MAX_ATTEMPTS))
    }

    /// Number of peers in the overlay.
    #[inline]
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    #[inline]
    pub fn neighbours(&self, peer: PeerId) -> &[Link] {
        &self.adjacency[peer.get()]
    }

    #[inline]
    pub fn is_slow(&self, peer: PeerId) -> bool {
        self.slow[peer.get()]
    }

    pub fn link(&self, from: PeerId, to: PeerId) -> Option<&Link> {
        self.neighbours(from).iter().find(|link| link.peer == to)
    }

    /// Number of undirected links.
    pub fn num_links(&self) -> usize {
        self.adjacency.iter().map(Vec::len).sum::<usize>() / 2
    }

    /// Returns true if every peer can reach every other peer.
    pub fn is_connected(&self) -> bool {
        let Some(first) = self.adjacency.first() else {
            return true;
        };

        let mut visited = vec![false; self.len()];
        visited[0] = true;
        let mut queue = VecDeque::from_iter(first.iter().map(|link| link.peer));
        while let Some(peer) = queue.pop_front() {
            if std::mem::replace(&mut visited[peer.get()], true) {
                continue;
            }
            queue.extend(self.neighbours(peer).iter().map(|link| link.peer));
        }

        visited.into_iter().all(|v| v)
    }

    /// Link speed of the link between `from` and `to` in Mbps.
    #[inline]
    pub fn bandwidth(&self, from: PeerId, to: PeerId) -> f64 {
        if self.is_slow(from) || self.is_slow(to) {
            SLOW_LINK_MBPS
        } else {
            FAST_LINK_MBPS
        }
    }

    /// Samples the latency in milliseconds of sending `size_kb` kilobytes
    /// from `from` to its neighbour `to`: propagation delay, plus
    /// transmission time, plus an exponentially distributed queuing delay.
    ///
    /// ## Panics
    /// If `from` and `to` are not neighbours.
    pub fn delay<R: Rng + ?Sized>(
        &self,
        from: PeerId,
        to: PeerId,
        size_kb: usize,
        rng: &mut R,
    ) -> f64 {
        let Some(link) = self.link(from, to) else {
            panic!("{} and {} are not neighbours", from, to)
        };
        let bandwidth = self.bandwidth(from, to);
        let transmission = size_kb as f64 * 8.0 / bandwidth;
        let queuing = sample_exponential(rng, QUEUING_KBITS / bandwidth);

        link.propagation + transmission + queuing
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, SeedableRng};

    use super::{Topology, TopologyError, FAST_LINK_MBPS, SLOW_LINK_MBPS};
    use crate::peer::PeerId;

    #[test]
    fn random_overlay_is_connected_and_undirected() {
        let mut rng = StdRng::seed_from_u64(21);
        let slow = vec![false; 20];
        let topology = Topology::random(&slow, &mut rng).unwrap();

        assert!(topology.is_connected());
        for peer in (0..20).map(PeerId::from) {
            let neighbours = topology.neighbours(peer);
            assert!(neighbours.len() >= Topology::MIN_NEIGHBOURS);
            for link in neighbours {
                assert_ne!(link.peer, peer);
                let back = topology.link(link.peer, peer).unwrap();
                assert_eq!(back.propagation, link.propagation);
                assert!((10.0..=500.0).contains(&link.propagation));
            }
        }
    }

    #[test]
    fn small_networks_are_fully_connected() {
        let mut rng = StdRng::seed_from_u64(3);
        let topology = Topology::random(&[false; 3], &mut rng).unwrap();
        assert_eq!(topology.num_links(), 3);

        let single = Topology::random(&[true], &mut rng).unwrap();
        assert!(single.is_connected());
        assert_eq!(single.num_links(), 0);

        assert!(matches!(
            Topology::random(&[], &mut rng),
            Err(TopologyError::NoPeers)
        ));
    }

    #[test]
    fn slow_ends_limit_bandwidth() {
        let mut rng = StdRng::seed_from_u64(8);
        let topology =
            Topology::random(&[false, false, true], &mut rng).unwrap();
        let (a, b, c) = (PeerId::from(0), PeerId::from(1), PeerId::from(2));

        assert_eq!(topology.bandwidth(a, b), FAST_LINK_MBPS);
        assert_eq!(topology.bandwidth(a, c), SLOW_LINK_MBPS);
        assert_eq!(topology.bandwidth(c, b), SLOW_LINK_MBPS);
    }

    #[test]
    fn delay_is_at_least_propagation_plus_transmission() {
        let mut rng = StdRng::seed_from_u64(9);
        let topology = Topology::random(&[false, true], &mut rng).unwrap();
        let (a, b) = (PeerId::from(0), PeerId::from(1));
        let propagation = topology.link(a, b).unwrap().propagation;

        for _ in 0..100 {
            let delay = topology.delay(a, b, 10, &mut rng);
            assert!(delay >= propagation + 10.0 * 8.0 / SLOW_LINK_MBPS);
        }
    }
}
