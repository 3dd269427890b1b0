//! NUMA topology detection and tiered victim selection.
//!
//! Detection is deliberately conservative: unless the machine is large
//! enough that multiple nodes are likely, everything lands on one synthetic
//! node. Victim selection is a three-tier roll per steal attempt: mostly a
//! sibling on the thief's node, sometimes the remote node with the best
//! bandwidth estimate, rarely anywhere else.

use core_affinity::CoreId;

/// Percentage rolls for the three steal tiers.
const LOCAL_TIER_PCT: u32 = 70;
const PREFERRED_TIER_PCT: u32 = 25;
/// When the thief has no sibling, the local share is redistributed over the
/// remote tiers in their 25:5 ratio.
const LONE_PREFERRED_PCT: u32 = 83;

/// xorshift32; one state word per worker, never shared.
#[inline]
pub(crate) fn xorshift32(state: &mut u32) -> u32 {
    let mut x = *state;
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    *state = x;
    x
}

/// One NUMA domain (or the single synthetic node on small machines).
#[derive(Debug, Clone)]
pub struct TopologyNode {
    pub id: u32,
    /// Workers mapped to this node.
    pub workers: Vec<u32>,
    /// OS cores forming the node's affinity set.
    pub cores: Vec<CoreId>,
    /// Rough share of system memory attributed to the node.
    pub memory_bytes: u64,
    /// Relative bandwidth estimate; remote victims prefer the highest.
    pub bandwidth_score: u32,
}

#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<TopologyNode>,
    worker_node: Vec<u32>,
    /// Per node: the remote node with the best bandwidth estimate.
    preferred_remote: Vec<Option<u32>>,
}

impl Topology {
    /// Probes the machine and maps `worker_count` workers onto nodes.
    /// Probe failures degrade to a single synthetic node covering all
    /// cores; they never fail initialization.
    pub(crate) fn detect(worker_count: usize, numa_aware: bool) -> Topology {
        let cores = core_affinity::get_core_ids().unwrap_or_default();

        let mut sys = sysinfo::System::new();
        sys.refresh_cpu_specifics(sysinfo::CpuRefreshKind::everything());
        sys.refresh_memory();
        let logical = if cores.is_empty() {
            sys.cpus().len().max(1)
        } else {
            cores.len()
        };
        let total_memory = sys.total_memory();

        // Conservative estimate: single node unless the core count makes a
        // multi-socket or multi-die layout plausible.
        let node_count = if numa_aware && logical > 32 {
            (logical / 16).clamp(1, 4)
        } else {
            1
        };

        Self::build(worker_count, node_count, cores, total_memory)
    }

    fn build(
        worker_count: usize,
        node_count: usize,
        cores: Vec<CoreId>,
        total_memory: u64,
    ) -> Topology {
        let node_count = node_count.max(1);
        let per_node = cores.len().div_ceil(node_count).max(1);
        let mut nodes: Vec<TopologyNode> = (0..node_count)
            .map(|id| {
                let node_cores: Vec<CoreId> = cores
                    .iter()
                    .skip(id * per_node)
                    .take(per_node)
                    .copied()
                    .collect();
                TopologyNode {
                    id: id as u32,
                    workers: Vec::new(),
                    memory_bytes: total_memory / node_count as u64,
                    // More cores usually means more memory channels behind
                    // them; good enough to rank remote candidates.
                    bandwidth_score: node_cores.len().max(1) as u32 * 8,
                    cores: node_cores,
                }
            })
            .collect();

        let mut worker_node = Vec::with_capacity(worker_count);
        for worker in 0..worker_count as u32 {
            let node = worker % node_count as u32;
            nodes[node as usize].workers.push(worker);
            worker_node.push(node);
        }

        let preferred_remote = (0..node_count)
            .map(|id| {
                nodes
                    .iter()
                    .filter(|n| n.id != id as u32 && !n.workers.is_empty())
                    .max_by_key(|n| (n.bandwidth_score, std::cmp::Reverse(n.id)))
                    .map(|n| n.id)
            })
            .collect();

        Topology {
            nodes,
            worker_node,
            preferred_remote,
        }
    }

    /// Fixed layout used by tests and by embedders that already know the
    /// hardware.
    pub fn synthetic(workers_per_node: &[usize]) -> Topology {
        let worker_count: usize = workers_per_node.iter().sum();
        let mut topo = Self::build(0, workers_per_node.len(), Vec::new(), 0);
        let mut next = 0u32;
        for (id, &count) in workers_per_node.iter().enumerate() {
            for _ in 0..count {
                topo.nodes[id].workers.push(next);
                topo.worker_node.push(id as u32);
                next += 1;
            }
        }
        debug_assert_eq!(worker_count as u32, next);
        topo.preferred_remote = (0..topo.nodes.len())
            .map(|id| {
                topo.nodes
                    .iter()
                    .filter(|n| n.id != id as u32 && !n.workers.is_empty())
                    .max_by_key(|n| (n.bandwidth_score, std::cmp::Reverse(n.id)))
                    .map(|n| n.id)
            })
            .collect();
        topo
    }

    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }

    pub fn node_of(&self, worker: u32) -> u32 {
        self.worker_node
            .get(worker as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Core the given worker should pin to, when one is available.
    pub(crate) fn pin_core_for(&self, worker: u32) -> Option<CoreId> {
        let node = &self.nodes[self.node_of(worker) as usize];
        if node.cores.is_empty() {
            return None;
        }
        let position = node.workers.iter().position(|&w| w == worker)?;
        Some(node.cores[position % node.cores.len()])
    }

    /// Picks a steal victim for `thief`. Never returns the thief; returns
    /// `None` only when no other worker exists.
    pub(crate) fn select_victim(&self, thief: u32, rng: &mut u32) -> Option<u32> {
        if self.worker_node.len() < 2 {
            return None;
        }
        let my_node = self.node_of(thief);
        let has_sibling = self.nodes[my_node as usize]
            .workers
            .iter()
            .any(|&w| w != thief);

        let roll = xorshift32(rng) % 100;
        let tier = if has_sibling {
            if roll < LOCAL_TIER_PCT {
                Tier::Local
            } else if roll < LOCAL_TIER_PCT + PREFERRED_TIER_PCT {
                Tier::Preferred
            } else {
                Tier::Other
            }
        } else if roll < LONE_PREFERRED_PCT {
            Tier::Preferred
        } else {
            Tier::Other
        };

        self.pick(tier, thief, my_node, rng)
            .or_else(|| self.pick(Tier::Preferred, thief, my_node, rng))
            .or_else(|| self.pick(Tier::Local, thief, my_node, rng))
            .or_else(|| self.pick_any(thief, rng))
    }

    fn pick(&self, tier: Tier, thief: u32, my_node: u32, rng: &mut u32) -> Option<u32> {
        match tier {
            Tier::Local => self.pick_on_node(my_node, thief, rng),
            Tier::Preferred => {
                let node = self.preferred_remote[my_node as usize]?;
                self.pick_on_node(node, thief, rng)
            }
            Tier::Other => {
                let candidates: Vec<u32> = self
                    .nodes
                    .iter()
                    .filter(|n| {
                        n.id != my_node
                            && Some(n.id) != self.preferred_remote[my_node as usize]
                            && !n.workers.is_empty()
                    })
                    .map(|n| n.id)
                    .collect();
                if candidates.is_empty() {
                    return None;
                }
                let node = candidates[(xorshift32(rng) as usize) % candidates.len()];
                self.pick_on_node(node, thief, rng)
            }
        }
    }

    fn pick_on_node(&self, node: u32, thief: u32, rng: &mut u32) -> Option<u32> {
        let workers = &self.nodes[node as usize].workers;
        let eligible = workers.iter().filter(|&&w| w != thief).count();
        if eligible == 0 {
            return None;
        }
        let choice = (xorshift32(rng) as usize) % eligible;
        workers.iter().filter(|&&w| w != thief).nth(choice).copied()
    }

    fn pick_any(&self, thief: u32, rng: &mut u32) -> Option<u32> {
        let count = self.worker_node.len() as u32;
        let mut victim = xorshift32(rng) % count;
        if victim == thief {
            victim = (victim + 1) % count;
        }
        (victim != thief).then_some(victim)
    }
}

#[derive(Clone, Copy)]
enum Tier {
    Local,
    Preferred,
    Other,
}
