use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tracing::{debug, info, trace, warn};

use crate::config::{ClusterConfig, NodeDescriptor};
use crate::error::SelectError;
use crate::types::{Copyset, LogId, NodeId};

/// Health of a storage node as seen by the embedding process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeHealth {
    Healthy,
    /// Being drained for maintenance: keeps its data, takes no new copies.
    Draining,
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct SelectorOptions {
    /// How long a node that failed to acknowledge stays out of selection
    pub graylist_ttl: Duration,
    /// Seed for shuffling; `None` seeds from the OS
    pub seed: Option<u64>,
}

impl Default for SelectorOptions {
    fn default() -> Self {
        Self {
            graylist_ttl: Duration::from_secs(30),
            seed: None,
        }
    }
}

struct SelectorState {
    rng: StdRng,
    health: HashMap<NodeId, NodeHealth>,
    /// node -> graylisted until
    graylist: HashMap<NodeId, Instant>,
}

impl SelectorState {
    fn is_graylisted(&self, node: &NodeId, now: Instant) -> bool {
        self.graylist.get(node).is_some_and(|until| *until > now)
    }

    fn is_healthy(&self, node: &NodeId) -> bool {
        matches!(
            self.health.get(node).copied().unwrap_or(NodeHealth::Healthy),
            NodeHealth::Healthy
        )
    }
}

/// Picks the storage nodes that receive a record's copies.
pub struct CopysetSelector {
    nodes: Vec<NodeDescriptor>,
    options: SelectorOptions,
    state: Mutex<SelectorState>,
}

impl CopysetSelector {
    pub fn new(config: &ClusterConfig, options: SelectorOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            nodes: config.nodes.clone(),
            options,
            state: Mutex::new(SelectorState {
                rng,
                health: HashMap::new(),
                graylist: HashMap::new(),
            }),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.iter().map(|n| &n.id)
    }

    fn domain_of(&self, node: &NodeId) -> &str {
        self.nodes
            .iter()
            .find(|n| &n.id == node)
            .map(|n| n.domain.as_str())
            .unwrap_or("")
    }

    pub fn set_node_health(&self, node: &NodeId, health: NodeHealth) {
        info!("Node {} health set to {:?}", node, health);
        self.state.lock().health.insert(node.clone(), health);
    }

    pub fn node_health(&self, node: &NodeId) -> NodeHealth {
        self.state
            .lock()
            .health
            .get(node)
            .copied()
            .unwrap_or(NodeHealth::Healthy)
    }

    /// Keep `node` out of selection for `graylist_ttl`.
    pub fn report_failure(&self, node: &NodeId) {
        let until = Instant::now() + self.options.graylist_ttl;
        debug!("Graylisting {} for {:?}", node, self.options.graylist_ttl);
        self.state.lock().graylist.insert(node.clone(), until);
    }

    pub fn report_success(&self, node: &NodeId) {
        let mut state = self.state.lock();
        if state.graylist.remove(node).is_some() {
            debug!("{} acknowledged, leaving graylist", node);
        }
    }

    pub fn is_graylisted(&self, node: &NodeId) -> bool {
        self.state.lock().is_graylisted(node, Instant::now())
    }

    fn eligible(
        &self,
        state: &mut SelectorState,
        exclude: &HashSet<&NodeId>,
        respect_graylist: bool,
    ) -> Vec<NodeId> {
        let now = Instant::now();
        state.graylist.retain(|_, until| *until > now);
        self.nodes
            .iter()
            .map(|n| &n.id)
            .filter(|id| !exclude.contains(id))
            .filter(|id| state.is_healthy(id))
            .filter(|id| !respect_graylist || !state.is_graylisted(id, now))
            .cloned()
            .collect()
    }

    /// Healthy candidates, ignoring the graylist only when it alone leaves
    /// fewer than `required`.
    fn candidates(
        &self,
        log: LogId,
        state: &mut SelectorState,
        exclude: &HashSet<&NodeId>,
        required: usize,
    ) -> Result<Vec<NodeId>, SelectError> {
        let candidates = self.eligible(state, exclude, true);
        if candidates.len() >= required {
            return Ok(candidates);
        }

        let fallback = self.eligible(state, exclude, false);
        if fallback.len() >= required {
            warn!(
                "{}: only {} non-graylisted nodes for {} copies, ignoring graylist",
                log,
                candidates.len(),
                required
            );
            return Ok(fallback);
        }
        Err(SelectError::InsufficientNodes {
            available: fallback.len(),
            required,
        })
    }

    /// Choose `r` nodes, spreading them over as many failure domains as possible.
    pub fn select(&self, log: LogId, r: usize) -> Result<Copyset, SelectError> {
        let mut state = self.state.lock();
        let candidates = self.candidates(log, &mut state, &HashSet::new(), r)?;

        let mut by_domain: BTreeMap<&str, Vec<NodeId>> = BTreeMap::new();
        for node in candidates {
            by_domain.entry(self.domain_of(&node)).or_default().push(node);
        }
        let mut domains: Vec<Vec<NodeId>> = by_domain.into_values().collect();
        for group in domains.iter_mut() {
            group.shuffle(&mut state.rng);
        }
        domains.shuffle(&mut state.rng);

        // 按故障域轮转取点，用尽所有域后才复用
        let mut picked = Vec::with_capacity(r);
        let mut round = 0;
        while picked.len() < r {
            for group in domains.iter() {
                if picked.len() == r {
                    break;
                }
                if let Some(node) = group.get(round) {
                    picked.push(node.clone());
                }
            }
            round += 1;
        }

        let copyset = Copyset::new(picked);
        trace!("{}: selected copyset {}", log, copyset);
        Ok(copyset)
    }

    /// A node to stand in for a failed copyset member. Never returns a member
    /// of `current` or of `exclude`; prefers a domain `current` does not use.
    pub fn replacement(
        &self,
        log: LogId,
        current: &Copyset,
        exclude: &[NodeId],
    ) -> Result<NodeId, SelectError> {
        let mut state = self.state.lock();
        let excluded: HashSet<&NodeId> = current.nodes().iter().chain(exclude.iter()).collect();
        let candidates = self.candidates(log, &mut state, &excluded, 1)?;

        let used_domains: HashSet<&str> = current
            .nodes()
            .iter()
            .filter(|n| !exclude.contains(n))
            .map(|n| self.domain_of(n))
            .collect();
        let (mut fresh, mut reused): (Vec<NodeId>, Vec<NodeId>) = candidates
            .into_iter()
            .partition(|n| !used_domains.contains(self.domain_of(n)));

        let pool = if fresh.is_empty() { &mut reused } else { &mut fresh };
        pool.shuffle(&mut state.rng);
        let node = pool.swap_remove(0);
        debug!("{}: replacement {} for copyset {}", log, node, current);
        Ok(node)
    }
}
